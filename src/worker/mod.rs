//! Per-worker filesystem layout.
//!
//! One worker owns one task and one directory named
//! `worker-<TASK>-<epoch>`. Everything the worker and the orchestrator
//! exchange lives under it:
//!
//! ```text
//! workers/worker-CORE-001-1733240000/
//!   workspace/                 git worktree, branch task-core-001-<slug>
//!   prd.md                     task spec handed to the agent
//!   pipeline-config.json       pipeline + runtime context
//!   git-state.json             lifecycle state, pr, attempts, history
//!   events.jsonl               append-only event log
//!   resume-state.json          retry accounting
//!   checkpoints/<run>/checkpoint-<N>.json
//!   logs/  results/  reports/  summaries/  tmp/
//!   effect-outbox/             pending/completed effect records
//!   agent.pid                  present iff an agent is currently running
//!   pr_url.txt                 present once a PR is open
//!   batch-context.json         present iff part of a conflict batch
//! ```
//!
//! Workers are archived (moved under `.archive/`) on terminal states, never
//! deleted.

pub mod git_state;
pub mod resume_state;

pub use git_state::{GitState, GitStateStore, HistoryEntry, LifecycleState};
pub use resume_state::{ResumeState, ResumeStateStore};

use crate::errors::LifecycleError;
use crate::util::epoch_secs;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static WORKER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^worker-([A-Z]{2,10}-[0-9]{1,4})-([0-9]+)$").unwrap());

/// Batch membership for workers resolving inside a conflict batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchContext {
    pub batch_id: String,
    pub position: usize,
    pub total: usize,
}

/// Handle on one worker directory. Cheap to clone; all state is on disk.
#[derive(Debug, Clone)]
pub struct WorkerDir {
    root: PathBuf,
    task_id: String,
}

impl WorkerDir {
    /// Scaffold a fresh worker directory for `task_id` under `workers_root`.
    pub fn create(workers_root: &Path, task_id: &str) -> Result<Self> {
        let name = format!("worker-{}-{}", task_id, epoch_secs());
        let root = workers_root.join(&name);
        for sub in [
            "workspace",
            "checkpoints",
            "logs",
            "results",
            "reports",
            "summaries",
            "tmp",
            "effect-outbox",
        ] {
            std::fs::create_dir_all(root.join(sub))
                .with_context(|| format!("Failed to create {}/{}", root.display(), sub))?;
        }
        Ok(Self {
            root,
            task_id: task_id.to_string(),
        })
    }

    /// Open an existing worker directory, resolving the task id from the
    /// directory name. A directory whose name does not parse is an error —
    /// effects must never silently no-op on an unresolvable task.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LifecycleError> {
        let root: PathBuf = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let caps = WORKER_NAME
            .captures(&name)
            .ok_or_else(|| LifecycleError::TaskIdUnresolvable {
                worker: root.clone(),
                reason: format!("directory name '{}' does not match worker-<TASK>-<epoch>", name),
            })?;
        Ok(Self {
            task_id: caps[1].to_string(),
            root,
        })
    }

    /// All live (non-archived) workers under `workers_root`, newest first.
    pub fn list(workers_root: &Path) -> Vec<WorkerDir> {
        let Ok(entries) = std::fs::read_dir(workers_root) else {
            return Vec::new();
        };
        let mut workers: Vec<WorkerDir> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| WorkerDir::open(e.path()).ok())
            .collect();
        workers.sort_by_key(|w| std::cmp::Reverse(w.epoch()));
        workers
    }

    /// The newest live worker for a task, if any.
    pub fn find_for_task(workers_root: &Path, task_id: &str) -> Option<WorkerDir> {
        Self::list(workers_root)
            .into_iter()
            .find(|w| w.task_id() == task_id)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Creation epoch parsed from the directory name; 0 if absent.
    pub fn epoch(&self) -> u64 {
        WORKER_NAME
            .captures(&self.name())
            .and_then(|c| c[2].parse().ok())
            .unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn prd(&self) -> PathBuf {
        self.root.join("prd.md")
    }

    pub fn pipeline_config(&self) -> PathBuf {
        self.root.join("pipeline-config.json")
    }

    pub fn git_state(&self) -> PathBuf {
        self.root.join("git-state.json")
    }

    pub fn events_log(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn resume_state(&self) -> PathBuf {
        self.root.join("resume-state.json")
    }

    pub fn worker_log(&self) -> PathBuf {
        self.root.join("worker.log")
    }

    pub fn checkpoints_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("checkpoints").join(run_id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.root.join("summaries")
    }

    pub fn supervisors_dir(&self) -> PathBuf {
        self.root.join("supervisors")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("effect-outbox")
    }

    pub fn agent_pid_file(&self) -> PathBuf {
        self.root.join("agent.pid")
    }

    pub fn pr_url_file(&self) -> PathBuf {
        self.root.join("pr_url.txt")
    }

    pub fn batch_context_file(&self) -> PathBuf {
        self.root.join("batch-context.json")
    }

    /// The git branch this worker's workspace is on.
    pub fn branch(&self, slug: &str) -> String {
        format!("task-{}-{}", self.task_id.to_lowercase(), slug)
    }

    /// Pid of a currently running agent, if the pid file exists and the
    /// process is alive. A stale pid file reads as "not running".
    pub fn running_agent_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(self.agent_pid_file()).ok()?;
        let pid: u32 = raw.trim().parse().ok()?;
        crate::util::pid_alive(pid).then_some(pid)
    }

    pub fn write_agent_pid(&self, pid: u32) -> Result<()> {
        std::fs::write(self.agent_pid_file(), pid.to_string())
            .context("Failed to write agent.pid")
    }

    pub fn clear_agent_pid(&self) {
        let _ = std::fs::remove_file(self.agent_pid_file());
    }

    pub fn batch_context(&self) -> Option<BatchContext> {
        crate::util::read_json(&self.batch_context_file()).ok()
    }

    pub fn write_batch_context(&self, ctx: &BatchContext) -> Result<()> {
        crate::util::write_json_atomic(&self.batch_context_file(), ctx)
    }

    pub fn git_state_store(&self) -> GitStateStore {
        GitStateStore::new(self.git_state())
    }

    pub fn resume_state_store(&self) -> ResumeStateStore {
        ResumeStateStore::new(self.resume_state())
    }

    /// Move the worker directory under `archive_root`, preserving its name.
    /// Consumes the handle; the old path is gone after this returns.
    pub fn archive(self, archive_root: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(archive_root)
            .with_context(|| format!("Failed to create {}", archive_root.display()))?;
        let dest = archive_root.join(self.name());
        std::fs::rename(&self.root, &dest).with_context(|| {
            format!("Failed to archive {} -> {}", self.root.display(), dest.display())
        })?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_scaffolds_layout() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "CORE-001").unwrap();
        assert_eq!(worker.task_id(), "CORE-001");
        assert!(worker.workspace().exists());
        assert!(worker.results_dir().exists());
        assert!(worker.outbox_dir().exists());
        assert!(worker.name().starts_with("worker-CORE-001-"));
    }

    #[test]
    fn test_open_parses_task_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker-AB-12-1733240000");
        std::fs::create_dir_all(&path).unwrap();
        let worker = WorkerDir::open(&path).unwrap();
        assert_eq!(worker.task_id(), "AB-12");
        assert_eq!(worker.epoch(), 1733240000);
    }

    #[test]
    fn test_open_rejects_renamed_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("renamed-by-hand");
        std::fs::create_dir_all(&path).unwrap();
        let err = WorkerDir::open(&path).unwrap_err();
        assert!(matches!(err, LifecycleError::TaskIdUnresolvable { .. }));
    }

    #[test]
    fn test_find_for_task_prefers_newest() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("worker-AB-1-100")).unwrap();
        std::fs::create_dir_all(dir.path().join("worker-AB-1-200")).unwrap();
        std::fs::create_dir_all(dir.path().join("worker-CD-2-150")).unwrap();
        let found = WorkerDir::find_for_task(dir.path(), "AB-1").unwrap();
        assert_eq!(found.epoch(), 200);
    }

    #[test]
    fn test_running_agent_pid_stale_file() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        assert!(worker.running_agent_pid().is_none());

        worker.write_agent_pid(std::process::id()).unwrap();
        assert_eq!(worker.running_agent_pid(), Some(std::process::id()));

        // A pid that cannot exist reads as not running
        std::fs::write(worker.agent_pid_file(), "999999999").unwrap();
        assert!(worker.running_agent_pid().is_none());

        worker.clear_agent_pid();
        assert!(!worker.agent_pid_file().exists());
    }

    #[test]
    fn test_archive_moves_directory() {
        let dir = tempdir().unwrap();
        let workers = dir.path().join("workers");
        std::fs::create_dir_all(&workers).unwrap();
        let worker = WorkerDir::create(&workers, "AB-1").unwrap();
        let name = worker.name();
        let old_path = worker.path().to_path_buf();

        let archive = dir.path().join(".archive");
        let dest = worker.archive(&archive).unwrap();
        assert!(!old_path.exists());
        assert_eq!(dest, archive.join(name));
        assert!(dest.join("workspace").exists());
    }

    #[test]
    fn test_batch_context_round_trip() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        assert!(worker.batch_context().is_none());
        let ctx = BatchContext {
            batch_id: "batch-1".into(),
            position: 1,
            total: 2,
        };
        worker.write_batch_context(&ctx).unwrap();
        assert_eq!(worker.batch_context().unwrap(), ctx);
    }
}
