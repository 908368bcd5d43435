//! Effect outbox: at-least-once delivery for lifecycle side effects.
//!
//! Before the engine runs a transition's effects it records them all as
//! pending in one batch file under the worker's `effect-outbox/` directory,
//! fsyncs, then executes each effect and marks it completed. A crash between
//! record and completion leaves pending entries behind; `replay_pending`
//! re-executes them on the next opportunity. Idempotence is the effect
//! author's contract — replay guarantees at-least-once, never exactly-once.

use crate::util::{now_iso, read_json, write_json_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Completed,
}

/// One recorded effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub batch_id: String,
    pub entry_id: u32,
    pub effect_name: String,
    /// Fully resolved arguments (data/ctx references already substituted).
    pub args: BTreeMap<String, String>,
    /// Runtime context captured at record time.
    pub context: serde_json::Value,
    pub status: OutboxStatus,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboxBatch {
    batch_id: String,
    entries: Vec<OutboxEntry>,
}

/// Handle on one worker's `effect-outbox/` directory.
#[derive(Debug, Clone)]
pub struct EffectOutbox {
    dir: PathBuf,
}

impl EffectOutbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Record a batch of effects as pending. The batch file and its
    /// directory are fsynced before this returns, so the record survives a
    /// crash that happens while the effects run.
    pub fn record_pending(
        &self,
        effects: &[(String, BTreeMap<String, String>)],
        context: serde_json::Value,
    ) -> Result<String> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let entries: Vec<OutboxEntry> = effects
            .iter()
            .enumerate()
            .map(|(i, (name, args))| OutboxEntry {
                batch_id: batch_id.clone(),
                entry_id: i as u32,
                effect_name: name.clone(),
                args: args.clone(),
                context: context.clone(),
                status: OutboxStatus::Pending,
                timestamp: now_iso(),
            })
            .collect();

        let batch = OutboxBatch {
            batch_id: batch_id.clone(),
            entries,
        };
        let path = self.batch_path(&batch_id);
        write_json_atomic(&path, &batch)?;
        // write_json_atomic syncs the file; sync the directory too so the
        // rename itself is durable.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(batch_id)
    }

    /// Mark one entry of a batch completed.
    pub fn mark_completed(&self, batch_id: &str, entry_id: u32) -> Result<()> {
        let path = self.batch_path(batch_id);
        let mut batch: OutboxBatch = read_json(&path)
            .with_context(|| format!("Outbox batch {} missing", batch_id))?;
        for entry in &mut batch.entries {
            if entry.entry_id == entry_id {
                entry.status = OutboxStatus::Completed;
            }
        }
        if batch
            .entries
            .iter()
            .all(|e| e.status == OutboxStatus::Completed)
        {
            // Fully completed batches are dropped rather than kept forever.
            std::fs::remove_file(&path)?;
        } else {
            write_json_atomic(&path, &batch)?;
        }
        Ok(())
    }

    /// All pending entries across all batches, oldest batch file first.
    pub fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|e| e == "json"))
                .collect(),
            Err(_) => return Ok(Vec::new()),
        };
        files.sort();
        let mut pending = Vec::new();
        for file in files {
            let batch: OutboxBatch = match read_json(&file) {
                Ok(b) => b,
                Err(_) => continue,
            };
            pending.extend(
                batch
                    .entries
                    .into_iter()
                    .filter(|e| e.status == OutboxStatus::Pending),
            );
        }
        Ok(pending)
    }

    /// Execute every pending entry via `executor`, marking each completed on
    /// success. Failures are left pending for the next replay. Returns the
    /// number of entries completed.
    pub fn replay_pending(
        &self,
        executor: &dyn Fn(&OutboxEntry) -> Result<()>,
    ) -> Result<usize> {
        self.replay_pending_except(None, executor)
    }

    /// Replay variant that skips one batch — used by the engine to flush
    /// *prior* batches before a directory-moving effect without re-running
    /// the batch currently in flight.
    pub fn replay_pending_except(
        &self,
        skip_batch: Option<&str>,
        executor: &dyn Fn(&OutboxEntry) -> Result<()>,
    ) -> Result<usize> {
        let mut completed = 0;
        for entry in self.pending()? {
            if skip_batch.is_some_and(|b| b == entry.batch_id) {
                continue;
            }
            match executor(&entry) {
                Ok(()) => {
                    self.mark_completed(&entry.batch_id, entry.entry_id)?;
                    completed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        effect = %entry.effect_name,
                        batch = %entry.batch_id,
                        error = %e,
                        "outbox replay: effect failed, left pending"
                    );
                }
            }
        }
        Ok(completed)
    }

    fn batch_path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", batch_id))
    }
}

/// Convenience for callers holding a worker dir path.
pub fn for_worker(worker_dir: &Path) -> EffectOutbox {
    EffectOutbox::new(worker_dir.join("effect-outbox"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn effect(name: &str) -> (String, BTreeMap<String, String>) {
        (name.to_string(), BTreeMap::new())
    }

    #[test]
    fn test_record_and_list_pending() {
        let dir = tempdir().unwrap();
        let outbox = EffectOutbox::new(dir.path().join("effect-outbox"));
        let batch = outbox
            .record_pending(
                &[effect("cleanup_worktree"), effect("archive_worker")],
                serde_json::json!({"task_id": "AB-1"}),
            )
            .unwrap();

        let pending = outbox.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].batch_id, batch);
        assert_eq!(pending[0].effect_name, "cleanup_worktree");
        assert_eq!(pending[1].entry_id, 1);
    }

    #[test]
    fn test_mark_completed_drains_batch() {
        let dir = tempdir().unwrap();
        let outbox = EffectOutbox::new(dir.path().join("effect-outbox"));
        let batch = outbox
            .record_pending(&[effect("a"), effect("b")], serde_json::Value::Null)
            .unwrap();

        outbox.mark_completed(&batch, 0).unwrap();
        assert_eq!(outbox.pending().unwrap().len(), 1);

        outbox.mark_completed(&batch, 1).unwrap();
        assert!(outbox.pending().unwrap().is_empty());
        // Fully completed batch file is gone
        assert!(
            std::fs::read_dir(dir.path().join("effect-outbox"))
                .unwrap()
                .next()
                .is_none()
        );
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let outbox = EffectOutbox::new(dir.path().join("effect-outbox"));
        outbox
            .record_pending(&[effect("a"), effect("b")], serde_json::Value::Null)
            .unwrap();

        let runs = Mutex::new(Vec::<String>::new());
        let executor = |entry: &OutboxEntry| {
            runs.lock().unwrap().push(entry.effect_name.clone());
            Ok(())
        };

        let first = outbox.replay_pending(&executor).unwrap();
        assert_eq!(first, 2);
        // Second replay finds nothing: same final state as replaying once.
        let second = outbox.replay_pending(&executor).unwrap();
        assert_eq!(second, 0);
        assert_eq!(runs.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_effect_stays_pending() {
        let dir = tempdir().unwrap();
        let outbox = EffectOutbox::new(dir.path().join("effect-outbox"));
        outbox
            .record_pending(&[effect("good"), effect("bad")], serde_json::Value::Null)
            .unwrap();

        let executor = |entry: &OutboxEntry| {
            if entry.effect_name == "bad" {
                anyhow::bail!("nope")
            }
            Ok(())
        };
        let completed = outbox.replay_pending(&executor).unwrap();
        assert_eq!(completed, 1);

        let still_pending = outbox.pending().unwrap();
        assert_eq!(still_pending.len(), 1);
        assert_eq!(still_pending[0].effect_name, "bad");
    }

    #[test]
    fn test_replay_except_skips_batch() {
        let dir = tempdir().unwrap();
        let outbox = EffectOutbox::new(dir.path().join("effect-outbox"));
        let first = outbox
            .record_pending(&[effect("old")], serde_json::Value::Null)
            .unwrap();
        let second = outbox
            .record_pending(&[effect("current")], serde_json::Value::Null)
            .unwrap();

        let executor = |_: &OutboxEntry| Ok(());
        let completed = outbox
            .replay_pending_except(Some(&second), &executor)
            .unwrap();
        assert_eq!(completed, 1);

        let pending = outbox.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].batch_id, second);
        let _ = first;
    }
}
