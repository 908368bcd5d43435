//! The iterative work loop: work turn, summary turn, optional supervisor.
//!
//! Each iteration makes one turn-limited backend call, then a summary call
//! (on the same session when the backend has sessions, otherwise a fresh
//! call fed the prior summary), persists a checkpoint with the modified
//! files, and every `supervisor_interval` iterations asks a supervisor to
//! CONTINUE, STOP or RESTART. Restarts archive the run's logs and summaries
//! under `supervisors/run-<k>/` and reset the iteration counter, bounded by
//! `max_restarts`. Completion is a `<result>` tag in the latest work log or
//! iteration exhaustion.

use super::{AgentHost, CheckpointStore, system_prompt};
use crate::errors::{PipelineError, exit};
use crate::pipeline::{Step, StepResult};
use crate::runtime::ExecParams;
use crate::util::epoch_secs;
use crate::worker::WorkerDir;
use regex::Regex;
use std::sync::LazyLock;

static RESULT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<result>\s*([A-Z_]+)\s*</result>").unwrap());
static DECISION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<decision>\s*(CONTINUE|STOP|RESTART)\s*</decision>").unwrap());
static GUIDANCE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<guidance>(.*?)</guidance>").unwrap());

const SUMMARY_PROMPT: &str = "Summarize what you just did in this iteration: \
    files touched, what works, what remains. Plain prose, under 200 words.";

enum SupervisorDecision {
    Continue(String),
    Stop,
    Restart(String),
}

pub(super) async fn run(
    host: &AgentHost,
    worker: &WorkerDir,
    step: &Step,
) -> Result<StepResult, PipelineError> {
    let max_iters = step
        .config_u32("max_iterations")
        .unwrap_or(host.config.max_iters);
    let supervisor_interval = step
        .config_u32("supervisor_interval")
        .unwrap_or(host.config.supervisor_interval);
    let max_restarts = step
        .config_u32("max_restarts")
        .unwrap_or(host.config.max_restarts);
    let prompt_kind = step.config_str("prompt_kind").unwrap_or("execute");
    let system = system_prompt(prompt_kind);
    let prd = std::fs::read_to_string(worker.prd()).unwrap_or_default();

    let run_id = format!("run-{}", epoch_secs());
    let checkpoints = CheckpointStore::for_run(worker, &run_id);
    let workspace = worker.workspace();

    let mut iteration = 0u32;
    let mut restarts = 0u32;
    let mut guidance: Option<String> = None;
    let mut prior_summary: Option<String> = None;

    while iteration < max_iters {
        let epoch = epoch_secs();
        let log_path = worker
            .logs_dir()
            .join(format!("{}-{}-{}.log", step.id, iteration, epoch));
        let before_sha = crate::gitops::head_sha(&workspace);

        // Work turn.
        let user_prompt = work_prompt(&prd, prior_summary.as_deref(), guidance.as_deref());
        let outcome = host
            .runtime
            .exec_once(&ExecParams {
                workspace: &workspace,
                system_prompt: &system,
                user_prompt: &user_prompt,
                log_path: &log_path,
                max_turns: host.config.max_turns,
                wrap: true,
            })
            .await?;
        let work_log = std::fs::read_to_string(&log_path).unwrap_or_default();

        // Summary turn: same session when the backend has one, otherwise a
        // fresh call seeded with the prior summary.
        let summary = summarize(host, worker, step, iteration, outcome.session_id.as_deref())
            .await
            .unwrap_or_default();
        let summary_file = worker
            .summaries_dir()
            .join(format!("{}-{}-summary.txt", step.id, iteration));
        let _ = std::fs::write(&summary_file, &summary);

        // Checkpoint: modified files come from the workspace diff.
        let files_modified: Vec<String> = before_sha
            .as_deref()
            .and_then(|sha| crate::gitops::changed_files_since(&workspace, sha).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        checkpoints
            .write(&step.id, iteration, files_modified, &summary)
            .map_err(PipelineError::Other)?;

        // Completion: the step's result tag decides the gate.
        if let Some(gate) = extract_result_tag(&work_log) {
            tracing::info!(step = %step.id, iteration, gate = %gate, "work loop complete");
            return Ok(StepResult::new(&step.id, &step.agent, &gate, 0)
                .with_output("iterations", serde_json::json!(iteration + 1))
                .with_output("summary", serde_json::json!(summary)));
        }

        // Supervisor review.
        if supervisor_interval > 0 && (iteration + 1) % supervisor_interval == 0 {
            match supervise(host, worker, step, iteration, &summary).await? {
                SupervisorDecision::Continue(g) => guidance = Some(g),
                SupervisorDecision::Stop => {
                    tracing::info!(step = %step.id, iteration, "supervisor stopped the loop");
                    return Ok(StepResult::new(&step.id, &step.agent, "PASS", 0)
                        .with_output("iterations", serde_json::json!(iteration + 1))
                        .with_output("stopped_by", serde_json::json!("supervisor")));
                }
                SupervisorDecision::Restart(g) => {
                    if restarts >= max_restarts {
                        tracing::warn!(step = %step.id, restarts, "restart budget exhausted");
                        return Ok(StepResult::fail(
                            &step.id,
                            &step.agent,
                            exit::AGENT_VALIDATION_FAILED,
                            "supervisor restart budget exhausted",
                        ));
                    }
                    archive_run(worker, restarts).map_err(PipelineError::Other)?;
                    restarts += 1;
                    iteration = 0;
                    guidance = Some(g);
                    prior_summary = None;
                    continue;
                }
            }
        }

        prior_summary = Some(summary);
        iteration += 1;
    }

    Ok(StepResult::fail(
        &step.id,
        &step.agent,
        exit::AGENT_VALIDATION_FAILED,
        "iteration budget exhausted without a result tag",
    ))
}

fn work_prompt(prd: &str, prior_summary: Option<&str>, guidance: Option<&str>) -> String {
    let mut prompt = format!("## TASK\n\n{}", prd);
    if let Some(summary) = prior_summary {
        prompt.push_str("\n\n## PREVIOUS ITERATION\n\n");
        prompt.push_str(summary);
    }
    if let Some(guidance) = guidance {
        prompt.push_str("\n\n## SUPERVISOR GUIDANCE\n\n");
        prompt.push_str(guidance);
    }
    prompt.push_str(
        "\n\nContinue the work. When the task is fully complete, emit \
         <result>PASS</result>.",
    );
    prompt
}

async fn summarize(
    host: &AgentHost,
    worker: &WorkerDir,
    step: &Step,
    iteration: u32,
    session_id: Option<&str>,
) -> Option<String> {
    let log_path = worker
        .logs_dir()
        .join(format!("{}-{}-{}-summary.log", step.id, iteration, epoch_secs()));
    let workspace = worker.workspace();

    if host.runtime.backend().supports_sessions()
        && let Some(session) = session_id
    {
        host.runtime
            .resume(&workspace, session, SUMMARY_PROMPT, &log_path, 5)
            .await
            .ok()?;
    } else {
        let prior = std::fs::read_to_string(
            worker
                .summaries_dir()
                .join(format!("{}-{}-summary.txt", step.id, iteration.saturating_sub(1))),
        )
        .unwrap_or_default();
        let prompt = format!(
            "{}\n\nPrior iteration summary for context:\n{}",
            SUMMARY_PROMPT, prior
        );
        host.runtime
            .exec_once(&ExecParams {
                workspace: &workspace,
                system_prompt: "",
                user_prompt: &prompt,
                log_path: &log_path,
                max_turns: 5,
                wrap: false,
            })
            .await
            .ok()?;
    }
    let log = std::fs::read_to_string(&log_path).ok()?;
    host.runtime.backend().extract_text(&log)
}

async fn supervise(
    host: &AgentHost,
    worker: &WorkerDir,
    step: &Step,
    iteration: u32,
    latest_summary: &str,
) -> Result<SupervisorDecision, PipelineError> {
    let log_path = worker
        .logs_dir()
        .join(format!("{}-{}-{}-supervisor.log", step.id, iteration, epoch_secs()));
    let prompt = format!(
        "You supervise an iterative coding agent. Latest iteration summary:\n\n{}\n\n\
         Decide: <decision>CONTINUE</decision> to keep going (add \
         <guidance>...</guidance>), <decision>STOP</decision> if the work is \
         done, <decision>RESTART</decision> if the approach is wrong and the \
         run should start over with new guidance.",
        latest_summary
    );
    host.runtime
        .exec_once(&ExecParams {
            workspace: &worker.workspace(),
            system_prompt: "",
            user_prompt: &prompt,
            log_path: &log_path,
            max_turns: 5,
            wrap: false,
        })
        .await?;

    let log = std::fs::read_to_string(&log_path).unwrap_or_default();
    let text = host
        .runtime
        .backend()
        .extract_text(&log)
        .unwrap_or(log);
    let guidance = GUIDANCE_TAG
        .captures(&text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();

    Ok(match DECISION_TAG.captures(&text).map(|c| c[1].to_string()) {
        Some(d) if d == "STOP" => SupervisorDecision::Stop,
        Some(d) if d == "RESTART" => SupervisorDecision::Restart(guidance),
        // No decision parses as CONTINUE: the loop is the safe default.
        _ => SupervisorDecision::Continue(guidance),
    })
}

/// Move the current run's logs and summaries under `supervisors/run-<k>/`.
fn archive_run(worker: &WorkerDir, run_index: u32) -> anyhow::Result<()> {
    let dest = worker.supervisors_dir().join(format!("run-{}", run_index));
    for (sub, src) in [("logs", worker.logs_dir()), ("summaries", worker.summaries_dir())] {
        let dest_dir = dest.join(sub);
        std::fs::create_dir_all(&dest_dir)?;
        let Ok(entries) = std::fs::read_dir(&src) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let target = dest_dir.join(entry.file_name());
            std::fs::rename(entry.path(), target)?;
        }
    }
    Ok(())
}

fn extract_result_tag(log: &str) -> Option<String> {
    RESULT_TAG.captures(log).map(|c| c[1].to_string())
}
