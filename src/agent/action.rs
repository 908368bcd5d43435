//! Deterministic, LLM-free steps. They write the same result files as agent
//! steps so the executor routes them identically.

use super::{AgentHost, StepContext};
use crate::errors::{PipelineError, exit};
use crate::pipeline::{Step, StepResult};
use crate::worker::WorkerDir;
use std::time::Instant;

/// `git-sync`: fetch/fast-forward or push, per the step's `mode`.
pub(super) fn git_sync(worker: &WorkerDir, step: &Step) -> Result<StepResult, PipelineError> {
    let workspace = worker.workspace();
    let mode = step.config_str("mode").unwrap_or("fetch");
    let outcome = match mode {
        "push" => crate::gitops::current_branch(&workspace)
            .and_then(|branch| crate::gitops::push_branch(&workspace, &branch)),
        _ => crate::gitops::sync_with_remote(&workspace),
    };
    Ok(match outcome {
        Ok(()) => StepResult::pass(&step.id, &step.agent)
            .with_output("mode", serde_json::json!(mode)),
        Err(e) => StepResult::fail(&step.id, &step.agent, exit::GENERIC, &e.to_string()),
    })
}

/// `batch-wait-turn`: block until this worker's position in its conflict
/// batch is released. Position 0 passes immediately; later positions poll
/// the queue until every earlier member has resolved.
pub(super) async fn batch_wait_turn(
    host: &AgentHost,
    worker: &WorkerDir,
    step: &Step,
    ctx: &StepContext,
) -> Result<StepResult, PipelineError> {
    let Some(batch) = worker.batch_context() else {
        // Not part of a batch: nothing to wait for.
        return Ok(StepResult::new(&step.id, &step.agent, "SKIP", 0));
    };
    let Some(queue) = ctx.conflict_queue.as_ref() else {
        return Ok(StepResult::fail(
            &step.id,
            &step.agent,
            exit::AGENT_PREREQ_MISSING,
            "no conflict queue available to a batched worker",
        ));
    };

    let started = Instant::now();
    loop {
        match queue.next_eligible(&batch.batch_id) {
            Ok(Some(task)) if task == worker.task_id() => {
                return Ok(StepResult::pass(&step.id, &step.agent)
                    .with_output("position", serde_json::json!(batch.position)));
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                // Either the whole batch resolved (and our entry with it) or
                // an earlier member failed; both end the wait.
                return Ok(StepResult::fail(
                    &step.id,
                    &step.agent,
                    exit::GENERIC,
                    "batch closed before this position's turn",
                ));
            }
            Err(e) => {
                return Ok(StepResult::fail(
                    &step.id,
                    &step.agent,
                    exit::GENERIC,
                    &e.to_string(),
                ));
            }
        }
        if started.elapsed() >= host.config.batch_wait_timeout {
            return Ok(StepResult::fail(
                &step.id,
                &step.agent,
                exit::GENERIC,
                "timed out waiting for batch turn",
            ));
        }
        tokio::time::sleep(host.config.batch_poll_interval).await;
    }
}

/// `open-pr`: push the branch and open a pull request for it.
pub(super) async fn open_pr(
    host: &AgentHost,
    worker: &WorkerDir,
    step: &Step,
) -> Result<StepResult, PipelineError> {
    let workspace = worker.workspace();
    let branch = match crate::gitops::current_branch(&workspace) {
        Ok(branch) => branch,
        Err(e) => {
            return Ok(StepResult::fail(
                &step.id,
                &step.agent,
                exit::AGENT_PREREQ_MISSING,
                &format!("workspace has no branch: {}", e),
            ));
        }
    };
    if let Err(e) = crate::gitops::push_branch(&workspace, &branch) {
        return Ok(StepResult::fail(
            &step.id,
            &step.agent,
            exit::GENERIC,
            &format!("push failed: {}", e),
        ));
    }

    let prd = std::fs::read_to_string(worker.prd()).unwrap_or_default();
    let title = prd
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(worker.task_id())
        .trim_start_matches('#')
        .trim()
        .to_string();
    let body = format!("Automated change for task {}.\n\n{}", worker.task_id(), prd);

    match host.github.open_pr(&workspace, &title, &body, &branch).await {
        Ok(pr) => {
            std::fs::write(worker.pr_url_file(), format!("{}\n", pr))
                .map_err(|e| PipelineError::Other(e.into()))?;
            Ok(StepResult::pass(&step.id, &step.agent)
                .with_output("pr", serde_json::json!(pr))
                .with_output("branch", serde_json::json!(branch)))
        }
        Err(e) => Ok(StepResult::fail(
            &step.id,
            &step.agent,
            exit::GENERIC,
            &format!("gh pr create failed: {}", e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::mock_host;
    use crate::runtime::MockBackend;
    use crate::scheduler::conflict::ConflictQueue;
    use crate::worker::BatchContext;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_wait_turn_without_batch_skips() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        let (host, _) = mock_host(MockBackend::always_pass());
        let step = Step::new("wait-turn", "batch-wait-turn");
        let result = batch_wait_turn(&host, &worker, &step, &StepContext::default())
            .await
            .unwrap();
        assert_eq!(result.gate_result, "SKIP");
    }

    #[tokio::test]
    async fn test_wait_turn_position_zero_passes() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        let queue = ConflictQueue::new(dir.path().join("queue.json"));
        queue.add("AB-1", &worker.name(), vec!["a.rs".into()]).unwrap();
        queue.add("AB-2", "w2", vec!["a.rs".into()]).unwrap();
        let batch_id = queue.group_into_batches().unwrap()[0].batch_id.clone();
        worker
            .write_batch_context(&BatchContext {
                batch_id,
                position: 0,
                total: 2,
            })
            .unwrap();

        let (host, _) = mock_host(MockBackend::always_pass());
        let ctx = StepContext {
            conflict_queue: Some(queue),
            ..Default::default()
        };
        let result = batch_wait_turn(
            &host,
            &worker,
            &Step::new("wait-turn", "batch-wait-turn"),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(result.gate_result, "PASS");
    }

    #[tokio::test]
    async fn test_wait_turn_blocks_until_predecessor_resolves() {
        let dir = tempdir().unwrap();
        let workers = dir.path().join("workers");
        let worker = WorkerDir::create(&workers, "AB-2").unwrap();
        let queue = ConflictQueue::new(dir.path().join("queue.json"));
        queue.add("AB-1", "w1", vec!["a.rs".into()]).unwrap();
        queue.add("AB-2", &worker.name(), vec!["a.rs".into()]).unwrap();
        let batch_id = queue.group_into_batches().unwrap()[0].batch_id.clone();
        worker
            .write_batch_context(&BatchContext {
                batch_id: batch_id.clone(),
                position: 1,
                total: 2,
            })
            .unwrap();

        let (host, _) = mock_host(MockBackend::always_pass());
        let ctx = StepContext {
            conflict_queue: Some(queue.clone()),
            ..Default::default()
        };

        // Release position 0 shortly after the wait begins.
        let release = tokio::spawn({
            let queue = queue.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                queue.mark_resolved("AB-1").unwrap();
            }
        });

        let result = batch_wait_turn(
            &host,
            &worker,
            &Step::new("wait-turn", "batch-wait-turn"),
            &ctx,
        )
        .await
        .unwrap();
        release.await.unwrap();
        assert_eq!(result.gate_result, "PASS");
        assert_eq!(result.outputs["position"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_wait_turn_times_out() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-2").unwrap();
        let queue = ConflictQueue::new(dir.path().join("queue.json"));
        queue.add("AB-1", "w1", vec!["a.rs".into()]).unwrap();
        queue.add("AB-2", &worker.name(), vec!["a.rs".into()]).unwrap();
        let batch_id = queue.group_into_batches().unwrap()[0].batch_id.clone();
        worker
            .write_batch_context(&BatchContext {
                batch_id,
                position: 1,
                total: 2,
            })
            .unwrap();

        let (host, _) = mock_host(MockBackend::always_pass());
        let ctx = StepContext {
            conflict_queue: Some(queue),
            ..Default::default()
        };
        // Nobody resolves AB-1; the short test timeout trips.
        let result = batch_wait_turn(
            &host,
            &worker,
            &Step::new("wait-turn", "batch-wait-turn"),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(result.gate_result, "FAIL");
        assert!(result.errors[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_open_pr_requires_git_workspace() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        let (host, _) = mock_host(MockBackend::always_pass());
        let result = open_pr(&host, &worker, &Step::new("pr", "open-pr"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, exit::AGENT_PREREQ_MISSING);
    }
}
