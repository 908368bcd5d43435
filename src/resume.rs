//! Resume decider: on restart or failure, inspect a worker's evidence and
//! choose how to proceed.
//!
//! The decider reads `worker.log`, the step result files, `prd.md`
//! checkmarks, `pr_url.txt` and the workspace git log. It never executes
//! project code and never writes to the workspace. The verdict is one of:
//!
//! - `COMPLETE` — the work is demonstrably done;
//! - `RETRY:<pipeline>:<step>` — resume at a step, with a flag saying
//!   whether a committed checkpoint strictly before that step exists;
//! - `DEFER` — a transient external condition (OOM, rate limit); cool down;
//! - `ABORT` — unrecoverable.
//!
//! `apply` records the verdict in resume-state accounting and the worker's
//! result files; `decide` itself is pure inspection.

use crate::agent::checkpoint::last_recovery_before;
use crate::errors::exit;
use crate::pipeline::{GateStatus, PipelineConfig, StepResult, builtin_mappings};
use crate::worker::WorkerDir;
use anyhow::Result;

/// Log fragments that indicate a transient external condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "out of memory",
    "oom-kill",
    "rate limit",
    "rate_limit",
    "429",
    "quota exceeded",
    "temporarily unavailable",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    Complete,
    Retry {
        pipeline: String,
        step: String,
        recovery_possible: bool,
    },
    Defer {
        reason: String,
    },
    Abort {
        reason: String,
    },
}

impl ResumeDecision {
    /// The reserved exit code a standalone decider process reports.
    pub fn exit_code(&self) -> i32 {
        match self {
            ResumeDecision::Complete => exit::RESUME_COMPLETE,
            ResumeDecision::Retry { .. } => exit::OK,
            ResumeDecision::Defer { .. } => exit::RESUME_DEFER,
            ResumeDecision::Abort { .. } => exit::RESUME_ABORT,
        }
    }

    /// Canonical string form (`RETRY:<pipeline>:<step>` etc.).
    pub fn label(&self) -> String {
        match self {
            ResumeDecision::Complete => "COMPLETE".to_string(),
            ResumeDecision::Retry { pipeline, step, .. } => {
                format!("RETRY:{}:{}", pipeline, step)
            }
            ResumeDecision::Defer { .. } => "DEFER".to_string(),
            ResumeDecision::Abort { .. } => "ABORT".to_string(),
        }
    }
}

/// Default cool-down applied on DEFER.
pub const DEFER_COOLDOWN_SECS: u64 = 600;

pub struct ResumeDecider;

impl ResumeDecider {
    /// Inspect the worker and choose. Pure: no state is mutated.
    pub fn decide(worker: &WorkerDir) -> Result<ResumeDecision> {
        let resume_store = worker.resume_state_store();
        let accounting = resume_store.read()?;
        if accounting.terminal {
            return Ok(ResumeDecision::Abort {
                reason: format!("already terminal: {}", accounting.terminal_reason),
            });
        }
        if accounting.attempt_count >= accounting.max_attempts {
            return Ok(ResumeDecision::Abort {
                reason: "resume attempt budget exhausted".into(),
            });
        }

        // Transient conditions trump everything else.
        let log = std::fs::read_to_string(worker.worker_log()).unwrap_or_default();
        let lower = log.to_lowercase();
        if let Some(marker) = TRANSIENT_MARKERS.iter().find(|m| lower.contains(*m)) {
            return Ok(ResumeDecision::Defer {
                reason: format!("transient condition in worker log: {}", marker),
            });
        }

        let Ok(config) = PipelineConfig::load(&worker.pipeline_config()) else {
            return Ok(ResumeDecision::Abort {
                reason: "worker has no readable pipeline config".into(),
            });
        };

        // Completion evidence: every PRD checkmark done plus a PR on record.
        let prd = std::fs::read_to_string(worker.prd()).unwrap_or_default();
        let unchecked = prd.lines().filter(|l| l.trim_start().starts_with("- [ ]")).count();
        let checked = prd.lines().filter(|l| l.trim_start().starts_with("- [x]")).count();
        let pr_open = worker.pr_url_file().exists();
        if pr_open && checked > 0 && unchecked == 0 {
            return Ok(ResumeDecision::Complete);
        }

        // Otherwise: resume at the step after the last passing result.
        let mappings = builtin_mappings();
        let is_success = |result: &StepResult| {
            mappings
                .get(&result.gate_result)
                .map(|m| m.status == GateStatus::Success)
                .unwrap_or(false)
        };
        let steps = &config.pipeline.steps;
        let last_pass = steps
            .iter()
            .enumerate()
            .filter(|(_, step)| {
                StepResult::latest_for_step(&worker.results_dir(), &step.id)
                    .as_ref()
                    .is_some_and(is_success)
            })
            .map(|(i, _)| i)
            .max();

        let resume_index = last_pass.map(|i| i + 1).unwrap_or(0);
        if resume_index >= steps.len() {
            // Every step has a passing result; treat as complete even if the
            // PRD bookkeeping lagged.
            return Ok(ResumeDecision::Complete);
        }

        let step = steps[resume_index].id.clone();
        let order: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        let recovery_possible = last_recovery_before(worker, &order, &step).is_some();

        Ok(ResumeDecision::Retry {
            pipeline: config.pipeline.name.clone(),
            step,
            recovery_possible,
        })
    }

    /// Record a decision: resume-state accounting plus a result file, so the
    /// parent can read the verdict the same way it reads any step outcome.
    pub fn apply(worker: &WorkerDir, decision: &ResumeDecision) -> Result<()> {
        let store = worker.resume_state_store();
        match decision {
            ResumeDecision::Complete => store.set_terminal("completed")?,
            ResumeDecision::Abort { reason } => store.set_terminal(reason)?,
            ResumeDecision::Defer { .. } => store.set_cooldown(DEFER_COOLDOWN_SECS)?,
            ResumeDecision::Retry { pipeline, step, .. } => {
                store.increment("RETRY", pipeline, step, "resume decider")?;
            }
        }

        let (gate, exit_code) = match decision {
            ResumeDecision::Complete => ("PASS", exit::RESUME_COMPLETE),
            ResumeDecision::Retry { .. } => ("PASS", exit::OK),
            ResumeDecision::Defer { .. } => ("SKIP", exit::RESUME_DEFER),
            ResumeDecision::Abort { .. } => ("FAIL", exit::RESUME_ABORT),
        };
        let mut result = StepResult::new("resume-decide", "resume-decide", gate, exit_code)
            .with_output("decision", serde_json::json!(decision.label()));
        if let ResumeDecision::Retry {
            recovery_possible, ..
        } = decision
        {
            result = result.with_output(
                "recovery_possible",
                serde_json::json!(recovery_possible),
            );
        }
        result.write(&worker.results_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::checkpoint::record_recovery;
    use crate::pipeline::Pipeline;
    use tempfile::tempdir;

    fn worker_with_default_pipeline(dir: &std::path::Path) -> WorkerDir {
        let worker = WorkerDir::create(dir, "AB-1").unwrap();
        let config = PipelineConfig::new(Pipeline::builtin("default").unwrap());
        config.save(&worker.pipeline_config()).unwrap();
        worker
    }

    #[test]
    fn test_crash_after_execute_resumes_at_test_with_recovery() {
        let dir = tempdir().unwrap();
        let worker = worker_with_default_pipeline(dir.path());
        std::fs::write(worker.prd(), "- [x] part one\n- [ ] part two\n").unwrap();

        // execute passed and committed; crash before test started
        StepResult::pass("execute", "ralph")
            .write(&worker.results_dir())
            .unwrap();
        record_recovery(&worker, "execute", "abc123").unwrap();

        let decision = ResumeDecider::decide(&worker).unwrap();
        assert_eq!(
            decision,
            ResumeDecision::Retry {
                pipeline: "default".into(),
                step: "test".into(),
                recovery_possible: true,
            }
        );
        assert_eq!(decision.label(), "RETRY:default:test");

        ResumeDecider::apply(&worker, &decision).unwrap();
        let accounting = worker.resume_state_store().read().unwrap();
        assert_eq!(accounting.attempt_count, 1);
        assert!(!accounting.terminal);

        let result =
            StepResult::latest_for_step(&worker.results_dir(), "resume-decide").unwrap();
        assert_eq!(result.outputs["recovery_possible"], serde_json::json!(true));
    }

    #[test]
    fn test_no_evidence_resumes_from_start_without_recovery() {
        let dir = tempdir().unwrap();
        let worker = worker_with_default_pipeline(dir.path());
        let decision = ResumeDecider::decide(&worker).unwrap();
        match decision {
            ResumeDecision::Retry {
                step,
                recovery_possible,
                ..
            } => {
                assert_eq!(step, "plan");
                assert!(!recovery_possible);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_complete_when_checkmarks_done_and_pr_open() {
        let dir = tempdir().unwrap();
        let worker = worker_with_default_pipeline(dir.path());
        std::fs::write(worker.prd(), "- [x] one\n- [x] two\n").unwrap();
        std::fs::write(worker.pr_url_file(), "42\n").unwrap();

        let decision = ResumeDecider::decide(&worker).unwrap();
        assert_eq!(decision, ResumeDecision::Complete);
        assert_eq!(decision.exit_code(), exit::RESUME_COMPLETE);

        ResumeDecider::apply(&worker, &decision).unwrap();
        assert!(worker.resume_state_store().is_terminal());
    }

    #[test]
    fn test_transient_log_condition_defers() {
        let dir = tempdir().unwrap();
        let worker = worker_with_default_pipeline(dir.path());
        std::fs::write(
            worker.worker_log(),
            "iteration 3 failed: API returned 429 rate limit\n",
        )
        .unwrap();

        let decision = ResumeDecider::decide(&worker).unwrap();
        assert!(matches!(decision, ResumeDecision::Defer { .. }));
        assert_eq!(decision.exit_code(), exit::RESUME_DEFER);

        ResumeDecider::apply(&worker, &decision).unwrap();
        assert!(worker.resume_state_store().is_cooling());
        assert!(!worker.resume_state_store().is_terminal());
    }

    #[test]
    fn test_attempt_budget_aborts() {
        let dir = tempdir().unwrap();
        let worker = worker_with_default_pipeline(dir.path());
        let store = worker.resume_state_store();
        let mut state = store.read().unwrap();
        state.max_attempts = 1;
        store.write(&state).unwrap();
        store.increment("RETRY", "default", "execute", "x").unwrap();

        let decision = ResumeDecider::decide(&worker).unwrap();
        assert!(matches!(decision, ResumeDecision::Abort { .. }));
        assert_eq!(decision.exit_code(), exit::RESUME_ABORT);
    }

    #[test]
    fn test_missing_pipeline_config_aborts() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        let decision = ResumeDecider::decide(&worker).unwrap();
        assert!(matches!(decision, ResumeDecision::Abort { .. }));
    }
}
