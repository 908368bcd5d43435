//! Agent host: executes one pipeline step.
//!
//! Three kinds of handler live behind one dispatch point:
//! - the iterative **ralph** loop (work turn, summary turn, supervisor),
//! - **single-shot** agents (code-review, planner, resume-decide),
//! - deterministic **actions** (git-sync, batch-wait-turn, open-pr).
//!
//! Whatever happens inside, every step funnels its outcome into one result
//! file; the executor and the parent orchestrator read nothing else.

pub mod action;
pub mod checkpoint;
pub mod ralph;
pub mod single;

pub use checkpoint::{Checkpoint, CheckpointStore, RecoveryCheckpoint};

use crate::config::Config;
use crate::errors::PipelineError;
use crate::merge::GitHub;
use crate::pipeline::{Step, StepResult};
use crate::runtime::Runtime;
use crate::scheduler::conflict::ConflictQueue;
use crate::worker::WorkerDir;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Host-level tuning, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_iters: u32,
    pub max_turns: u32,
    pub supervisor_interval: u32,
    pub max_restarts: u32,
    pub batch_poll_interval: Duration,
    pub batch_wait_timeout: Duration,
    pub default_branch: String,
}

impl HostConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iters: config.max_iters,
            max_turns: config.max_turns,
            supervisor_interval: config.supervisor_interval,
            max_restarts: config.max_restarts,
            batch_poll_interval: Duration::from_secs(10),
            batch_wait_timeout: config.resolve_worker_timeout,
            default_branch: config.default_branch.clone(),
        }
    }
}

/// Per-run context handed to each step.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    /// Flags consulted by `enabled_by` and by agents (e.g. `batch_lead`).
    pub flags: HashMap<String, bool>,
    /// Shared conflict queue, for batch sequencing steps.
    pub conflict_queue: Option<ConflictQueue>,
}

impl StepContext {
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

pub struct AgentHost {
    pub runtime: Arc<Runtime>,
    pub github: Arc<dyn GitHub>,
    pub config: HostConfig,
}

impl AgentHost {
    pub fn new(runtime: Arc<Runtime>, github: Arc<dyn GitHub>, config: HostConfig) -> Self {
        Self {
            runtime,
            github,
            config,
        }
    }

    /// Execute one step and persist its result file. The agent pid marker is
    /// present exactly while a handler is running.
    pub async fn execute(
        &self,
        worker: &WorkerDir,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<StepResult, PipelineError> {
        let _ = worker.write_agent_pid(std::process::id());
        let result = self.dispatch(worker, step, ctx).await;
        worker.clear_agent_pid();

        let result = result?;
        result
            .write(&worker.results_dir())
            .map_err(PipelineError::Other)?;
        Ok(result)
    }

    async fn dispatch(
        &self,
        worker: &WorkerDir,
        step: &Step,
        ctx: &StepContext,
    ) -> Result<StepResult, PipelineError> {
        match step.agent.as_str() {
            "ralph" => ralph::run(self, worker, step).await,
            "code-review" | "planner" | "resume-decide" => {
                single::run(self, worker, step).await
            }
            "git-sync" => action::git_sync(worker, step),
            "batch-wait-turn" => action::batch_wait_turn(self, worker, step, ctx).await,
            "open-pr" => action::open_pr(self, worker, step).await,
            other => Err(PipelineError::UnknownAgent {
                agent: other.to_string(),
                step: step.id.clone(),
            }),
        }
    }
}

/// Canned system prompts per prompt kind. Deliberately plain: prompt
/// engineering is not this crate's business, the shape is.
pub fn system_prompt(kind: &str) -> String {
    match kind {
        "execute" => {
            "You are implementing one task in an isolated git worktree. \
             Work from the task description, commit nothing yourself, and \
             emit <result>PASS</result> when the task is complete."
        }
        "test" => {
            "Run and repair the project's tests for the current change. \
             Emit <result>PASS</result> when tests pass, <result>FIX</result> \
             if the implementation needs rework."
        }
        "fix" => {
            "Address the review feedback recorded for this task's pull \
             request. Emit <result>PASS</result> when done."
        }
        "resolve" => {
            "Resolve the merge conflicts between this branch and the default \
             branch. Keep both intents where possible. Emit \
             <result>PASS</result> when the tree is conflict-free."
        }
        "apply_plan" => {
            "Apply this branch's portion of the shared conflict-resolution \
             plan. Emit <result>PASS</result> when done."
        }
        "code-review" => {
            "Review the diff of this workspace against its base branch. \
             Emit <result>PASS</result> if it is mergeable or \
             <result>FIX</result> with findings if not."
        }
        "planner" => {
            "Produce a JSON resolution plan for the listed conflicting pull \
             requests: one entry per PR with a short hint describing how its \
             conflicts should be resolved. Output only the JSON object."
        }
        _ => "Complete the requested step and emit <result>PASS</result> when done.",
    }
    .to_string()
}
