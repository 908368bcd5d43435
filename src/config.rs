//! Runtime configuration for the foreman orchestrator.
//!
//! All tuning knobs live in one `Config` value built from the environment
//! once at startup and passed by reference; nothing else reads env vars at
//! run time. Recognized variables:
//!
//! - Execution: `MAX_WORKERS`, `RESOLVE_WORKER_TIMEOUT`, `MAX_MERGE_ATTEMPTS`,
//!   `STUCK_WORKER_THRESHOLD`, `ERROR_LOG_MAX_AGE`
//! - Retry: `CLAUDE_MAX_RETRIES`, `CLAUDE_INITIAL_BACKOFF`,
//!   `CLAUDE_MAX_BACKOFF`, `CLAUDE_BACKOFF_MULTIPLIER`
//! - Backend: `RUNTIME_BACKEND`
//! - Logging: `LOG_LEVEL`, `LOG_FILE`
//! - Prompt wrappers: `PROMPT_PRE_SYSTEM`, `PROMPT_POST_SYSTEM`,
//!   `PROMPT_PRE_USER`, `PROMPT_POST_USER` (literal or `@filepath`)
//! - Safety: `NO_HEADER`, `EFFECT_OUTBOX_ENABLED`

use crate::runtime::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project root (the repository foreman orchestrates).
    pub project_dir: PathBuf,
    /// Foreman state root, `<project>/.foreman`.
    pub root: PathBuf,

    /// Main worker pool capacity.
    pub max_workers: usize,
    /// Combined fix+resolve pool capacity.
    pub max_priority_workers: usize,
    /// Seconds before a resolve worker is considered timed out.
    pub resolve_worker_timeout: Duration,
    /// Bounded merge attempts before a worker fails.
    pub max_merge_attempts: u32,
    /// Bounded recovery attempts before a worker fails.
    pub max_recovery_attempts: u32,
    /// Seconds without progress before a worker is flagged stuck.
    pub stuck_worker_threshold: Duration,
    /// Max age of ERROR/WARN lines shown in the status display.
    pub error_log_max_age: Duration,
    /// Sleep between scheduler ticks.
    pub tick_interval: Duration,
    /// Minimum interval between liveness probes of the same pid.
    pub reap_min_interval: Duration,

    /// Backend retry policy.
    pub retry: RetryPolicy,
    /// Backend driver name (`RUNTIME_BACKEND`).
    pub backend: String,
    /// CLI command for the default backend.
    pub backend_cmd: String,

    /// Default iterations for the iterative work loop.
    pub max_iters: u32,
    /// Turn limit per backend call.
    pub max_turns: u32,
    /// Supervisor review interval in iterations (0 disables).
    pub supervisor_interval: u32,
    /// Bounded supervisor restarts per worker.
    pub max_restarts: u32,

    /// Raw prompt wrapper values (literal or `@filepath`), resolved by the
    /// runtime at init.
    pub prompt_pre_system: Option<String>,
    pub prompt_post_system: Option<String>,
    pub prompt_pre_user: Option<String>,
    pub prompt_post_user: Option<String>,

    /// Suppress the foreman header in injected prompts.
    pub no_header: bool,
    /// Whether lifecycle effects go through the crash-safe outbox.
    pub outbox_enabled: bool,

    /// Default branch of the orchestrated repository.
    pub default_branch: String,

    /// Log file path, if `LOG_FILE` was set.
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Build a config from the environment with `project_dir` as the root.
    pub fn from_env(project_dir: &Path) -> Self {
        let root = project_dir.join(".foreman");
        Self {
            project_dir: project_dir.to_path_buf(),
            root,
            max_workers: env_parse("MAX_WORKERS", 3),
            max_priority_workers: env_parse("MAX_PRIORITY_WORKERS", 2),
            resolve_worker_timeout: Duration::from_secs(env_parse(
                "RESOLVE_WORKER_TIMEOUT",
                1800,
            )),
            max_merge_attempts: env_parse("MAX_MERGE_ATTEMPTS", 3),
            max_recovery_attempts: env_parse("MAX_RECOVERY_ATTEMPTS", 3),
            stuck_worker_threshold: Duration::from_secs(env_parse(
                "STUCK_WORKER_THRESHOLD",
                3600,
            )),
            error_log_max_age: Duration::from_secs(env_parse("ERROR_LOG_MAX_AGE", 900)),
            tick_interval: Duration::from_secs(env_parse("TICK_INTERVAL", 15)),
            reap_min_interval: Duration::from_secs(env_parse("REAP_MIN_INTERVAL", 5)),
            retry: RetryPolicy {
                max_retries: env_parse("CLAUDE_MAX_RETRIES", 3),
                initial_backoff: Duration::from_secs(env_parse("CLAUDE_INITIAL_BACKOFF", 5)),
                max_backoff: Duration::from_secs(env_parse("CLAUDE_MAX_BACKOFF", 120)),
                multiplier: env_parse("CLAUDE_BACKOFF_MULTIPLIER", 2.0),
            },
            backend: std::env::var("RUNTIME_BACKEND").unwrap_or_else(|_| "claude".into()),
            backend_cmd: std::env::var("BACKEND_CMD").unwrap_or_else(|_| "claude".into()),
            max_iters: env_parse("MAX_ITERS", 10),
            max_turns: env_parse("MAX_TURNS", 40),
            supervisor_interval: env_parse("SUPERVISOR_INTERVAL", 3),
            max_restarts: env_parse("MAX_RESTARTS", 2),
            prompt_pre_system: std::env::var("PROMPT_PRE_SYSTEM").ok(),
            prompt_post_system: std::env::var("PROMPT_POST_SYSTEM").ok(),
            prompt_pre_user: std::env::var("PROMPT_PRE_USER").ok(),
            prompt_post_user: std::env::var("PROMPT_POST_USER").ok(),
            no_header: env_flag("NO_HEADER", false),
            outbox_enabled: env_flag("EFFECT_OUTBOX_ENABLED", true),
            default_branch: std::env::var("DEFAULT_BRANCH").unwrap_or_else(|_| "main".into()),
            log_file: std::env::var("LOG_FILE").ok().map(PathBuf::from),
        }
    }

    /// Path to the kanban task list.
    pub fn kanban_path(&self) -> PathBuf {
        self.project_dir.join("kanban.md")
    }

    /// Directory of plan files, one per task.
    pub fn plans_dir(&self) -> PathBuf {
        self.root.join("plans")
    }

    /// Directory of live worker directories.
    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    /// Archive destination for terminal workers.
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(".archive")
    }

    /// Shared conflict queue file.
    pub fn conflict_queue_path(&self) -> PathBuf {
        self.root.join("conflict-queue.json")
    }

    /// Append-only pending pool-entry queue, drained each tick.
    pub fn pool_pending_path(&self) -> PathBuf {
        self.root.join("pool-pending.jsonl")
    }

    /// Service scheduler state file.
    pub fn services_state_path(&self) -> PathBuf {
        self.root.join("services").join("state.json")
    }

    /// Orchestrator log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_env(Path::new("/tmp/project"));
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_merge_attempts, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.backend, "claude");
        assert!(config.outbox_enabled);
        assert_eq!(config.root, PathBuf::from("/tmp/project/.foreman"));
    }

    #[test]
    fn test_paths_derive_from_root() {
        let config = Config::from_env(Path::new("/work/repo"));
        assert_eq!(
            config.kanban_path(),
            PathBuf::from("/work/repo/kanban.md")
        );
        assert_eq!(
            config.conflict_queue_path(),
            PathBuf::from("/work/repo/.foreman/conflict-queue.json")
        );
        assert!(config.workers_dir().ends_with(".foreman/workers"));
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        // env_parse is pure given the same env; garbage values fall back
        assert_eq!(super::env_parse("NONEXISTENT_VAR_XYZ", 7u32), 7);
    }
}
