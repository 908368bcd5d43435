//! The per-worker pipeline executor.
//!
//! Walks the declared steps in order, gated by `enabled_by`, invoking each
//! step's handler through the agent host and routing on the gate result in
//! the step's result file. Jump vocabulary: `next`, `prev`, `self`, `abort`,
//! or a literal step id; non-forward jumps are counted and bounded to
//! prevent livelock. Steps with `commit_after` snapshot the workspace and
//! record the commit as a recovery checkpoint.

pub use crate::agent::StepContext;

use super::{Jump, PipelineConfig, StepResult};
use crate::agent::AgentHost;
use crate::agent::checkpoint::record_recovery;
use crate::errors::{PipelineError, exit};
use crate::util::{now_iso, write_json_atomic};
use crate::worker::WorkerDir;
use serde::Serialize;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed,
    Aborted { step_id: String, gate_result: String },
}

/// Marker written before each step so a crash is attributable to one step.
#[derive(Debug, Serialize)]
struct RuntimeCheckpoint<'a> {
    step_id: &'a str,
    step_index: usize,
    timestamp: String,
}

pub struct PipelineExecutor<'a> {
    worker: &'a WorkerDir,
    config: &'a PipelineConfig,
    host: &'a AgentHost,
    max_jumps: u32,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(worker: &'a WorkerDir, config: &'a PipelineConfig, host: &'a AgentHost) -> Self {
        // Generous bound; any real routing loop trips it quickly.
        let max_jumps = (config.pipeline.steps.len() as u32) * 4 + 8;
        Self {
            worker,
            config,
            host,
            max_jumps,
        }
    }

    pub fn with_max_jumps(mut self, max_jumps: u32) -> Self {
        self.max_jumps = max_jumps;
        self
    }

    /// Run the pipeline from its first step, or from `start_step`.
    pub async fn run(
        &self,
        start_step: Option<&str>,
        ctx: &StepContext,
    ) -> Result<PipelineOutcome, PipelineError> {
        let pipeline = &self.config.pipeline;
        let mappings = self.config.effective_mappings();

        let mut index = match start_step {
            Some(id) => pipeline
                .step_index(id)
                .ok_or_else(|| PipelineError::UnknownStep {
                    pipeline: pipeline.name.clone(),
                    step: id.to_string(),
                })?,
            None => 0,
        };
        let mut jumps = 0u32;

        while index < pipeline.steps.len() {
            let step = &pipeline.steps[index];

            if let Some(flag) = &step.enabled_by
                && !ctx.flag(flag)
            {
                tracing::debug!(step = %step.id, flag = %flag, "step disabled, skipping");
                index += 1;
                continue;
            }

            write_json_atomic(
                &self.worker.path().join("checkpoints").join("runtime.json"),
                &RuntimeCheckpoint {
                    step_id: &step.id,
                    step_index: index,
                    timestamp: now_iso(),
                },
            )
            .map_err(PipelineError::Other)?;

            tracing::info!(pipeline = %pipeline.name, step = %step.id, agent = %step.agent, "running step");
            let result = self.run_step_with_retry(step, ctx).await?;

            let jump_raw = step
                .jump_map
                .get(&result.gate_result)
                .cloned()
                .or_else(|| {
                    mappings
                        .get(&result.gate_result)
                        .map(|m| m.default_jump.clone())
                })
                .ok_or_else(|| PipelineError::UnmappedGate {
                    gate: result.gate_result.clone(),
                })?;
            let jump = Jump::parse(&jump_raw);
            tracing::debug!(step = %step.id, gate = %result.gate_result, ?jump, "routing");

            if step.commit_after && !step.readonly && jump == Jump::Next {
                match crate::gitops::snapshot_commit(
                    &self.worker.workspace(),
                    &format!("checkpoint after {}", step.id),
                ) {
                    Ok(sha) => {
                        record_recovery(self.worker, &step.id, &sha)
                            .map_err(PipelineError::Other)?;
                    }
                    Err(e) => {
                        tracing::warn!(step = %step.id, error = %e, "commit_after snapshot failed");
                    }
                }
            }

            match jump {
                Jump::Next => index += 1,
                Jump::Prev => {
                    jumps += 1;
                    index = index.saturating_sub(1);
                }
                Jump::SelfStep => jumps += 1,
                Jump::Abort => {
                    return Ok(PipelineOutcome::Aborted {
                        step_id: step.id.clone(),
                        gate_result: result.gate_result,
                    });
                }
                Jump::To(target) => {
                    jumps += 1;
                    index = pipeline.step_index(&target).ok_or_else(|| {
                        PipelineError::UnknownStep {
                            pipeline: pipeline.name.clone(),
                            step: target.clone(),
                        }
                    })?;
                }
            }

            if jumps > self.max_jumps {
                return Err(PipelineError::JumpBudgetExhausted {
                    pipeline: pipeline.name.clone(),
                    jumps,
                });
            }
        }

        Ok(PipelineOutcome::Completed)
    }

    /// One step, re-run up to `retry_max` times on a retryable exit code.
    /// The result file is the contract: what the handler returned is checked
    /// against disk before routing.
    async fn run_step_with_retry(
        &self,
        step: &super::Step,
        ctx: &StepContext,
    ) -> Result<StepResult, PipelineError> {
        let mut attempts = 0u32;
        loop {
            self.host.execute(self.worker, step, ctx).await?;
            let result = StepResult::latest_for_step(&self.worker.results_dir(), &step.id)
                .ok_or_else(|| PipelineError::ResultMissing {
                    step: step.id.clone(),
                    path: self.worker.results_dir(),
                })?;

            if result.exit_code == exit::BACKEND_RETRYABLE && attempts < step.retry_max() {
                attempts += 1;
                tracing::warn!(step = %step.id, attempts, "retryable step exit, re-running");
                continue;
            }
            return Ok(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::mock_host;
    use crate::pipeline::{Pipeline, Step};
    use crate::runtime::{MockBackend, MockTurn};
    use tempfile::tempdir;

    fn turn(result: &str) -> MockTurn {
        MockTurn::pass(&format!(r#"{{"type":"result","result":"{}"}}"#, result))
    }

    fn review_pipeline() -> PipelineConfig {
        // Two single-shot steps so each backend turn maps to one step run.
        PipelineConfig::new(Pipeline {
            name: "test-pipeline".into(),
            steps: vec![
                Step::new("first", "code-review"),
                Step::new("second", "code-review"),
            ],
        })
    }

    #[tokio::test]
    async fn test_linear_completion() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        let (host, _) = mock_host(MockBackend::new(vec![
            turn("<result>PASS</result>"),
            turn("<result>PASS</result>"),
        ]));

        let config = review_pipeline();
        let executor = PipelineExecutor::new(&worker, &config, &host);
        let outcome = executor.run(None, &StepContext::default()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);

        // Both steps left result files
        assert!(StepResult::latest_for_step(&worker.results_dir(), "first").is_some());
        assert!(StepResult::latest_for_step(&worker.results_dir(), "second").is_some());
    }

    #[tokio::test]
    async fn test_abort_on_fail_gate() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        let (host, backend) = mock_host(MockBackend::new(vec![turn("<result>FAIL</result>")]));

        let config = review_pipeline();
        let executor = PipelineExecutor::new(&worker, &config, &host);
        let outcome = executor.run(None, &StepContext::default()).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Aborted {
                step_id: "first".into(),
                gate_result: "FAIL".into()
            }
        );
        // Second step never ran
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fix_gate_rewinds_to_prev() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        // first PASS, second FIX (-> prev), first PASS, second PASS
        let (host, backend) = mock_host(MockBackend::new(vec![
            turn("<result>PASS</result>"),
            turn("<result>FIX</result>"),
            turn("<result>PASS</result>"),
            turn("<result>PASS</result>"),
        ]));

        let config = review_pipeline();
        let executor = PipelineExecutor::new(&worker, &config, &host);
        let outcome = executor.run(None, &StepContext::default()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(backend.call_count(), 4);
    }

    #[tokio::test]
    async fn test_jump_map_overrides_default() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        // FIX on second jumps to "second" itself once, then PASS.
        let mut config = review_pipeline();
        config.pipeline.steps[1] = Step::new("second", "code-review").jump("FIX", "self");
        let (host, backend) = mock_host(MockBackend::new(vec![
            turn("<result>PASS</result>"),
            turn("<result>FIX</result>"),
            turn("<result>PASS</result>"),
        ]));

        let executor = PipelineExecutor::new(&worker, &config, &host);
        let outcome = executor.run(None, &StepContext::default()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_jump_budget_trips_on_livelock() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        let mut config = review_pipeline();
        config.pipeline.steps[0] = Step::new("first", "code-review").jump("FIX", "self");
        // Endless FIX loop
        let (host, _) = mock_host(MockBackend::new(
            (0..64).map(|_| turn("<result>FIX</result>")).collect(),
        ));

        let executor = PipelineExecutor::new(&worker, &config, &host).with_max_jumps(5);
        let err = executor
            .run(None, &StepContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::JumpBudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_enabled_by_skips_step() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        let mut config = review_pipeline();
        config.pipeline.steps[0] =
            Step::new("first", "code-review").enabled_by("never_set");
        let (host, backend) = mock_host(MockBackend::new(vec![turn("<result>PASS</result>")]));

        let executor = PipelineExecutor::new(&worker, &config, &host);
        let outcome = executor.run(None, &StepContext::default()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        // Only the second step invoked the backend
        assert_eq!(backend.call_count(), 1);
        assert!(StepResult::latest_for_step(&worker.results_dir(), "first").is_none());
    }

    #[tokio::test]
    async fn test_start_step_resumes_midway() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        let (host, backend) = mock_host(MockBackend::new(vec![turn("<result>PASS</result>")]));

        let config = review_pipeline();
        let executor = PipelineExecutor::new(&worker, &config, &host);
        let outcome = executor
            .run(Some("second"), &StepContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(backend.call_count(), 1);
        assert!(StepResult::latest_for_step(&worker.results_dir(), "first").is_none());
    }

    #[tokio::test]
    async fn test_unknown_start_step_errors() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        let (host, _) = mock_host(MockBackend::always_pass());
        let config = review_pipeline();
        let executor = PipelineExecutor::new(&worker, &config, &host);
        let err = executor
            .run(Some("nonexistent"), &StepContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep { .. }));
    }

    #[tokio::test]
    async fn test_unmapped_gate_errors() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();
        let (host, _) = mock_host(MockBackend::new(vec![turn("<result>BANANA</result>")]));

        let config = review_pipeline();
        let executor = PipelineExecutor::new(&worker, &config, &host);
        let err = executor
            .run(None, &StepContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnmappedGate { .. }));
    }
}
