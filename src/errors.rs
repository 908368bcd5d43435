//! Typed error hierarchy for the foreman orchestrator.
//!
//! Five top-level enums cover the five subsystems:
//! - `KanbanError` — task-list parsing and atomic update failures
//! - `LifecycleError` — state-machine and effect-outbox failures
//! - `RuntimeError` — AI backend invocation failures (carries retryability)
//! - `PipelineError` — per-step execution and routing failures
//! - `SchedulerError` — pool, conflict-queue and merge-coordination failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the kanban store.
#[derive(Debug, Error)]
pub enum KanbanError {
    #[error("Failed to read kanban file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write kanban file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {id} not found in kanban")]
    TaskNotFound { id: String },

    #[error("Invalid task id '{id}' (expected [A-Z]{{2,10}}-[0-9]{{1,4}})")]
    InvalidTaskId { id: String },

    #[error("Invalid status character '{ch}'")]
    InvalidStatus { ch: char },

    #[error("Timed out acquiring lock on {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the lifecycle engine, git-state store and effect outbox.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Unknown lifecycle state '{state}'")]
    UnknownState { state: String },

    #[error("No transition from state '{state}' on event '{event}'")]
    NoTransition { state: String, event: String },

    #[error("Unknown guard '{guard}' referenced by transition on '{event}'")]
    UnknownGuard { guard: String, event: String },

    #[error("Unknown effect '{effect}' referenced by transition on '{event}'")]
    UnknownEffect { effect: String, event: String },

    #[error("Cannot resolve task id for worker at {worker}: {reason}")]
    TaskIdUnresolvable { worker: PathBuf, reason: String },

    #[error("Failed to load transition spec: {0}")]
    SpecLoad(String),

    #[error("Effect '{effect}' failed: {source}")]
    EffectFailed {
        effect: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("State file error at {path}: {source}")]
    StateFile {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Kanban(#[from] KanbanError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the AI backend runtime.
///
/// `is_retryable()` is the single source of truth the retry wrapper consults;
/// every retryable primitive returns one of these rather than an ad-hoc code.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to spawn backend process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend exited with code {exit_code} (retryable: {retryable})")]
    BackendExit {
        exit_code: i32,
        retryable: bool,
        stderr: String,
    },

    #[error("Backend produced no session id in {log}")]
    SessionIdMissing { log: PathBuf },

    #[error("Backend '{name}' does not support session resume")]
    ResumeUnsupported { name: String },

    #[error("Unknown backend '{name}'")]
    UnknownBackend { name: String },

    #[error("Failed to resolve prompt wrapper '{reference}': {source}")]
    PromptWrapper {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether the retry wrapper may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::BackendExit {
                retryable: true,
                ..
            }
        )
    }

    /// The exit code to propagate when this error ends a step.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::BackendExit { exit_code, .. } => *exit_code,
            _ => exit::BACKEND_ERROR,
        }
    }
}

/// Errors from the pipeline executor and agent host.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline '{pipeline}' has no step '{step}'")]
    UnknownStep { pipeline: String, step: String },

    #[error("Unknown agent handler '{agent}' for step '{step}'")]
    UnknownAgent { agent: String, step: String },

    #[error("Step '{step}' produced no result file at {path}")]
    ResultMissing { step: String, path: PathBuf },

    #[error("Step '{step}' required output missing: {output}")]
    OutputMissing { step: String, output: String },

    #[error("Step '{step}' prerequisite missing: {path}")]
    PrerequisiteMissing { step: String, path: PathBuf },

    #[error("Jump budget exhausted after {jumps} jumps in pipeline '{pipeline}'")]
    JumpBudgetExhausted { pipeline: String, jumps: u32 },

    #[error("Gate result '{gate}' has no mapping and no default jump")]
    UnmappedGate { gate: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the scheduler, worker pools and merge coordinator.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Pool '{pool}' is at capacity ({capacity})")]
    PoolFull { pool: String, capacity: usize },

    #[error("Failed to spawn worker for {task}: {source}")]
    WorkerSpawnFailed {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker directory missing for {task} at {path}")]
    WorkerDirMissing { task: String, path: PathBuf },

    #[error("Conflict queue corrupt at {path}: {reason}")]
    ConflictQueueCorrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Kanban(#[from] KanbanError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reserved process exit codes.
///
/// Ranges: 0 OK; 1 generic; 2 usage; 3-5 init; 10-19 worker start; 20-29
/// run/orchestration; 30-39 validation; 40-49 review; 50-55 clean; 56-63
/// agent lifecycle; 65-68 resume decisions; 70-79 backend service errors;
/// 130/143 signal-conventional.
pub mod exit {
    pub const OK: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const INIT_FAILED: i32 = 3;

    pub const WORKER_START_FAILED: i32 = 10;
    pub const WORKER_TASK_NOT_FOUND: i32 = 14;

    pub const RUN_FAILED: i32 = 20;

    pub const VALIDATION_FAILED: i32 = 30;

    pub const REVIEW_FAILED: i32 = 40;

    pub const CLEAN_FAILED: i32 = 50;

    pub const AGENT_PREREQ_MISSING: i32 = 57;
    pub const AGENT_OUTPUT_MISSING: i32 = 59;
    pub const AGENT_VALIDATION_FAILED: i32 = 61;

    pub const RESUME_ABORT: i32 = 65;
    pub const RESUME_DEFER: i32 = 66;
    pub const RESUME_COMPLETE: i32 = 67;

    pub const BACKEND_ERROR: i32 = 70;
    pub const BACKEND_RETRYABLE: i32 = 72;

    pub const SIGINT: i32 = 130;
    pub const SIGTERM: i32 = 143;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_retryable_flag_drives_is_retryable() {
        let retryable = RuntimeError::BackendExit {
            exit_code: 72,
            retryable: true,
            stderr: "503 service unavailable".into(),
        };
        assert!(retryable.is_retryable());

        let fatal = RuntimeError::BackendExit {
            exit_code: 1,
            retryable: false,
            stderr: "unknown flag".into(),
        };
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn runtime_error_exit_code_propagates_backend_code() {
        let err = RuntimeError::BackendExit {
            exit_code: 5,
            retryable: false,
            stderr: String::new(),
        };
        assert_eq!(err.exit_code(), 5);

        let io = RuntimeError::Io(std::io::Error::other("x"));
        assert_eq!(io.exit_code(), exit::BACKEND_ERROR);
    }

    #[test]
    fn kanban_error_task_not_found_carries_id() {
        let err = KanbanError::TaskNotFound {
            id: "CORE-001".into(),
        };
        assert!(err.to_string().contains("CORE-001"));
    }

    #[test]
    fn lifecycle_error_converts_from_kanban_error() {
        let inner = KanbanError::TaskNotFound { id: "AB-1".into() };
        let err: LifecycleError = inner.into();
        assert!(matches!(
            err,
            LifecycleError::Kanban(KanbanError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn pipeline_error_unmapped_gate_is_matchable() {
        let err = PipelineError::UnmappedGate {
            gate: "WEIRD".into(),
        };
        assert!(matches!(err, PipelineError::UnmappedGate { .. }));
        assert!(err.to_string().contains("WEIRD"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&KanbanError::InvalidStatus { ch: '?' });
        assert_std_error(&LifecycleError::UnknownState { state: "x".into() });
        assert_std_error(&RuntimeError::UnknownBackend { name: "x".into() });
        assert_std_error(&PipelineError::UnmappedGate { gate: "x".into() });
        assert_std_error(&SchedulerError::PoolFull {
            pool: "main".into(),
            capacity: 4,
        });
    }

    #[test]
    fn resume_exit_codes_are_in_reserved_range() {
        assert_eq!(exit::RESUME_ABORT, 65);
        assert_eq!(exit::RESUME_DEFER, 66);
        assert_eq!(exit::RESUME_COMPLETE, 67);
    }
}
