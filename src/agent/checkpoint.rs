//! Per-iteration checkpoints and recovery commit records.
//!
//! Iterative agents write one checkpoint per iteration under
//! `checkpoints/<run-id>/checkpoint-<N>.json`, numbered monotonically within
//! the run. Steps with `commit_after` additionally record the workspace
//! commit in `checkpoints/commits.json`; the resume decider uses those to
//! pick a reset point.

use crate::util::{now_iso, read_json, write_json_atomic};
use crate::worker::WorkerDir;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    Interrupted,
}

/// One iteration's snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub number: u32,
    pub step_id: String,
    pub iteration: u32,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub summary: String,
    pub status: CheckpointStatus,
    pub timestamp: String,
}

/// Checkpoints for one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_run(worker: &WorkerDir, run_id: &str) -> Self {
        Self::new(worker.checkpoints_dir(run_id))
    }

    /// Next checkpoint number: one past the highest on disk.
    pub fn next_number(&self) -> u32 {
        self.list()
            .iter()
            .map(|c| c.number)
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }

    pub fn write(
        &self,
        step_id: &str,
        iteration: u32,
        files_modified: Vec<String>,
        summary: &str,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            number: self.next_number(),
            step_id: step_id.to_string(),
            iteration,
            files_modified,
            summary: summary.to_string(),
            status: CheckpointStatus::Completed,
            timestamp: now_iso(),
        };
        std::fs::create_dir_all(&self.dir)?;
        write_json_atomic(
            &self.dir.join(format!("checkpoint-{}.json", checkpoint.number)),
            &checkpoint,
        )?;
        Ok(checkpoint)
    }

    pub fn list(&self) -> Vec<Checkpoint> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut checkpoints: Vec<Checkpoint> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with("checkpoint-") && n.ends_with(".json")
                    })
                    .unwrap_or(false)
            })
            .filter_map(|p| read_json(&p).ok())
            .collect();
        checkpoints.sort_by_key(|c| c.number);
        checkpoints
    }

    pub fn latest(&self) -> Option<Checkpoint> {
        let mut checkpoints = self.list();
        checkpoints.pop()
    }

    /// Flag the most recent checkpoint interrupted (signal handling).
    pub fn mark_latest_interrupted(&self) -> Result<()> {
        let Some(mut latest) = self.latest() else {
            return Ok(());
        };
        latest.status = CheckpointStatus::Interrupted;
        write_json_atomic(
            &self.dir.join(format!("checkpoint-{}.json", latest.number)),
            &latest,
        )
    }
}

/// A `commit_after` record: which step committed what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryCheckpoint {
    pub step_id: String,
    pub commit: String,
    pub timestamp: String,
}

fn commits_path(worker: &WorkerDir) -> PathBuf {
    worker.path().join("checkpoints").join("commits.json")
}

/// Append a recovery checkpoint for a worker.
pub fn record_recovery(worker: &WorkerDir, step_id: &str, commit: &str) -> Result<()> {
    let path = commits_path(worker);
    let mut records: Vec<RecoveryCheckpoint> = if path.exists() {
        read_json(&path)?
    } else {
        Vec::new()
    };
    records.push(RecoveryCheckpoint {
        step_id: step_id.to_string(),
        commit: commit.to_string(),
        timestamp: now_iso(),
    });
    write_json_atomic(&path, &records)
}

/// All recovery checkpoints, oldest first.
pub fn recovery_checkpoints(worker: &WorkerDir) -> Vec<RecoveryCheckpoint> {
    read_json(&commits_path(worker)).unwrap_or_default()
}

/// The newest recovery checkpoint belonging to a step strictly before
/// `target_step` in `step_order`. This is what "recovery possible" means:
/// there is a committed state to reset to that predates the step being
/// retried.
pub fn last_recovery_before(
    worker: &WorkerDir,
    step_order: &[String],
    target_step: &str,
) -> Option<RecoveryCheckpoint> {
    let target_index = step_order.iter().position(|s| s == target_step)?;
    recovery_checkpoints(worker)
        .into_iter()
        .rev()
        .find(|record| {
            step_order
                .iter()
                .position(|s| *s == record.step_id)
                .is_some_and(|i| i < target_index)
        })
}
