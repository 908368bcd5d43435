//! Worker-process runner.
//!
//! A worker is a child process: it owns one worker directory, runs the
//! declared pipeline through the executor, and reports everything upward
//! through result files and lifecycle events. This module is the body of
//! `foreman worker start|resume`; the orchestrator's in-process test double
//! drives the same function, so the two paths cannot drift.

use crate::agent::{AgentHost, StepContext};
use crate::agent::checkpoint::last_recovery_before;
use crate::errors::exit;
use crate::lifecycle::LifecycleEngine;
use crate::pipeline::{PipelineConfig, PipelineExecutor, PipelineOutcome, StepResult};
use crate::resume::{ResumeDecider, ResumeDecision};
use crate::scheduler::conflict::ConflictQueue;
use crate::worker::WorkerDir;
use anyhow::Result;

/// Run one worker to the end of its pipeline. Returns the process exit code.
pub async fn run_worker(
    engine: &LifecycleEngine,
    host: &AgentHost,
    conflict_queue: &ConflictQueue,
    worker: &WorkerDir,
    resume: bool,
) -> Result<i32> {
    // Anything a previous incarnation left pending runs before new work.
    engine.replay_outbox(worker)?;

    let mut start_step: Option<String> = None;
    if resume {
        let decision = ResumeDecider::decide(worker)?;
        ResumeDecider::apply(worker, &decision)?;
        tracing::info!(worker = %worker.name(), decision = %decision.label(), "resume decision");
        match &decision {
            ResumeDecision::Complete => {
                engine.emit_event(
                    worker,
                    "work.done",
                    "resume-decider",
                    &serde_json::json!({"reason": "resume evidence shows completed work"}),
                )?;
                return Ok(exit::RESUME_COMPLETE);
            }
            ResumeDecision::Abort { reason } => {
                engine.emit_event(
                    worker,
                    "work.failed",
                    "resume-decider",
                    &serde_json::json!({"reason": reason}),
                )?;
                return Ok(exit::RESUME_ABORT);
            }
            ResumeDecision::Defer { reason } => {
                tracing::info!(worker = %worker.name(), %reason, "deferred; scheduler will retry after cooldown");
                return Ok(exit::RESUME_DEFER);
            }
            ResumeDecision::Retry {
                step,
                recovery_possible,
                ..
            } => {
                if *recovery_possible {
                    let config = PipelineConfig::load(&worker.pipeline_config())?;
                    let order: Vec<String> = config
                        .pipeline
                        .steps
                        .iter()
                        .map(|s| s.id.clone())
                        .collect();
                    if let Some(checkpoint) = last_recovery_before(worker, &order, step) {
                        tracing::info!(
                            worker = %worker.name(),
                            commit = %checkpoint.commit,
                            "resetting workspace to recovery checkpoint"
                        );
                        if let Err(e) =
                            crate::gitops::reset_hard(&worker.workspace(), &checkpoint.commit)
                        {
                            tracing::warn!(error = %e, "recovery reset failed, resuming in place");
                        }
                    }
                }
                start_step = Some(step.clone());
            }
        }
    }

    let config = PipelineConfig::load(&worker.pipeline_config())?;
    let ctx = StepContext {
        flags: config.flags.clone(),
        conflict_queue: Some(conflict_queue.clone()),
    };

    let executor = PipelineExecutor::new(worker, &config, host);
    let outcome = executor.run(start_step.as_deref(), &ctx).await;

    // A PR opened mid-pipeline becomes lifecycle state regardless of how the
    // run ended.
    if let Some(pr) = StepResult::all(&worker.results_dir())
        .iter()
        .rev()
        .find_map(|r| r.outputs.get("pr").and_then(|v| v.as_u64()))
    {
        engine.emit_event(
            worker,
            "pr.opened",
            "pipeline",
            &serde_json::json!({"pr": pr}),
        )?;
    }

    let (done_event, failed_event) = match config.pipeline.name.as_str() {
        "fix" => ("fix.done", "fix.failed"),
        "resolve" | "multi-pr-resolve" => ("resolve.done", "resolve.failed"),
        _ => ("work.done", "work.failed"),
    };

    match outcome {
        Ok(PipelineOutcome::Completed) => {
            engine.emit_event(worker, done_event, "pipeline", &serde_json::json!({}))?;
            Ok(exit::OK)
        }
        Ok(PipelineOutcome::Aborted {
            step_id,
            gate_result,
        }) => {
            let _ = worker.git_state_store().set_error(&format!(
                "pipeline aborted at {} with {}",
                step_id, gate_result
            ));
            engine.emit_event(
                worker,
                failed_event,
                "pipeline",
                &serde_json::json!({"reason": format!("aborted at {} ({})", step_id, gate_result)}),
            )?;
            Ok(exit::RUN_FAILED)
        }
        Err(e) => {
            tracing::error!(worker = %worker.name(), error = %e, "pipeline error");
            let _ = worker.git_state_store().set_error(&e.to_string());
            engine.emit_event(
                worker,
                failed_event,
                "pipeline",
                &serde_json::json!({"reason": e.to_string()}),
            )?;
            Ok(exit::RUN_FAILED)
        }
    }
}
