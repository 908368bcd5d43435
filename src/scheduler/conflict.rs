//! Conflict queue: workers whose PR merges hit conflicts, and the batching
//! of mutually conflicting PRs into sequentially resolved groups.
//!
//! The queue is one JSON file mutated only under its lock. Batch members
//! resolve strictly in position order; position N+1 is not eligible until
//! position N is marked resolved.

use crate::errors::SchedulerError;
use crate::util::{now_iso, read_json, with_file_lock, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Pending,
    Planning,
    Resolved,
    Failed,
}

/// One queued conflicting PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub task_id: String,
    pub worker_name: String,
    /// Files the failed merge reported as conflicting.
    pub files: Vec<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub status: ConflictStatus,
    pub added_at: String,
}

/// A batch assignment produced by grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAssignment {
    pub task_id: String,
    pub batch_id: String,
    pub position: usize,
    pub total: usize,
}

/// Handle on the shared conflict-queue file.
#[derive(Debug, Clone)]
pub struct ConflictQueue {
    path: PathBuf,
}

impl ConflictQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Result<Vec<ConflictEntry>, SchedulerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_json(&self.path).map_err(|e| SchedulerError::ConflictQueueCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Add an entry for a task. Re-adding an existing task refreshes its
    /// file list but keeps batch membership — add must be idempotent because
    /// the effect that calls it replays at-least-once.
    pub fn add(
        &self,
        task_id: &str,
        worker_name: &str,
        files: Vec<String>,
    ) -> Result<(), SchedulerError> {
        self.mutate(|entries| {
            if let Some(existing) = entries.iter_mut().find(|e| e.task_id == task_id) {
                existing.files = files.clone();
                return;
            }
            entries.push(ConflictEntry {
                task_id: task_id.to_string(),
                worker_name: worker_name.to_string(),
                files: files.clone(),
                batch_id: None,
                position: None,
                status: ConflictStatus::Pending,
                added_at: now_iso(),
            });
        })
    }

    /// Remove a task's entry. No-op if absent.
    pub fn remove(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.mutate(|entries| entries.retain(|e| e.task_id != task_id))
    }

    pub fn set_status(
        &self,
        task_id: &str,
        status: ConflictStatus,
    ) -> Result<(), SchedulerError> {
        self.mutate(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.task_id == task_id) {
                entry.status = status;
            }
        })
    }

    /// Mark a batch member resolved, releasing the next position.
    pub fn mark_resolved(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_status(task_id, ConflictStatus::Resolved)
    }

    /// Group pending unbatched entries whose file sets overlap into batches
    /// of at least two, assigning a batch id and positions in queue order.
    /// Entries that overlap nothing stay unbatched (the simple resolve
    /// pipeline handles them alone). Returns the new assignments.
    pub fn group_into_batches(&self) -> Result<Vec<BatchAssignment>, SchedulerError> {
        let mut assignments = Vec::new();
        self.mutate(|entries| {
            let candidates: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.batch_id.is_none() && e.status == ConflictStatus::Pending)
                .map(|(i, _)| i)
                .collect();

            // Greedy transitive grouping on file overlap, in queue order.
            let mut grouped: HashSet<usize> = HashSet::new();
            for &seed in &candidates {
                if grouped.contains(&seed) {
                    continue;
                }
                let mut group = vec![seed];
                let mut files: HashSet<String> =
                    entries[seed].files.iter().cloned().collect();
                let mut changed = true;
                while changed {
                    changed = false;
                    for &other in &candidates {
                        if group.contains(&other) || grouped.contains(&other) {
                            continue;
                        }
                        if entries[other].files.iter().any(|f| files.contains(f)) {
                            files.extend(entries[other].files.iter().cloned());
                            group.push(other);
                            changed = true;
                        }
                    }
                }
                if group.len() < 2 {
                    continue;
                }
                group.sort();
                let batch_id = uuid::Uuid::new_v4().to_string();
                let total = group.len();
                for (position, &idx) in group.iter().enumerate() {
                    grouped.insert(idx);
                    entries[idx].batch_id = Some(batch_id.clone());
                    entries[idx].position = Some(position);
                    assignments.push(BatchAssignment {
                        task_id: entries[idx].task_id.clone(),
                        batch_id: batch_id.clone(),
                        position,
                        total,
                    });
                }
            }
        })?;
        Ok(assignments)
    }

    /// The batch member whose turn it is: the lowest unresolved position,
    /// provided every position below it is resolved.
    pub fn next_eligible(&self, batch_id: &str) -> Result<Option<String>, SchedulerError> {
        let mut members: Vec<ConflictEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.batch_id.as_deref() == Some(batch_id))
            .collect();
        members.sort_by_key(|e| e.position.unwrap_or(usize::MAX));
        for member in &members {
            match member.status {
                ConflictStatus::Resolved => continue,
                ConflictStatus::Failed => return Ok(None),
                _ => return Ok(Some(member.task_id.clone())),
            }
        }
        Ok(None)
    }

    /// Number of resolved positions in a batch. Monotonically non-decreasing
    /// over the batch's lifetime.
    pub fn resolved_count(&self, batch_id: &str) -> Result<usize, SchedulerError> {
        Ok(self
            .entries()?
            .iter()
            .filter(|e| {
                e.batch_id.as_deref() == Some(batch_id)
                    && e.status == ConflictStatus::Resolved
            })
            .count())
    }

    fn mutate(
        &self,
        f: impl FnOnce(&mut Vec<ConflictEntry>),
    ) -> Result<(), SchedulerError> {
        with_file_lock(&self.path, || {
            let mut entries: Vec<ConflictEntry> = if self.path.exists() {
                read_json(&self.path)?
            } else {
                Vec::new()
            };
            f(&mut entries);
            write_json_atomic(&self.path, &entries)
        })
        .map_err(SchedulerError::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue() -> (tempfile::TempDir, ConflictQueue) {
        let dir = tempdir().unwrap();
        let q = ConflictQueue::new(dir.path().join("conflict-queue.json"));
        (dir, q)
    }

    #[test]
    fn test_add_remove_idempotent() {
        let (_dir, q) = queue();
        q.add("AB-1", "worker-AB-1-1", vec!["src/api.ts".into()]).unwrap();
        q.add("AB-1", "worker-AB-1-1", vec!["src/api.ts".into(), "src/b.ts".into()])
            .unwrap();
        let entries = q.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].files.len(), 2);

        q.remove("AB-1").unwrap();
        q.remove("AB-1").unwrap();
        assert!(q.entries().unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_entries_form_batch() {
        let (_dir, q) = queue();
        q.add("AB-1", "w1", vec!["src/api.ts".into()]).unwrap();
        q.add("AB-2", "w2", vec!["src/api.ts".into(), "src/x.ts".into()])
            .unwrap();
        q.add("AB-3", "w3", vec!["README.md".into()]).unwrap();

        let assignments = q.group_into_batches().unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].task_id, "AB-1");
        assert_eq!(assignments[0].position, 0);
        assert_eq!(assignments[1].task_id, "AB-2");
        assert_eq!(assignments[1].position, 1);
        assert_eq!(assignments[0].batch_id, assignments[1].batch_id);
        assert_eq!(assignments[0].total, 2);

        // Non-overlapping entry stays unbatched
        let entries = q.entries().unwrap();
        let ab3 = entries.iter().find(|e| e.task_id == "AB-3").unwrap();
        assert!(ab3.batch_id.is_none());
    }

    #[test]
    fn test_transitive_overlap_groups_together() {
        let (_dir, q) = queue();
        q.add("AB-1", "w1", vec!["a.rs".into(), "b.rs".into()]).unwrap();
        q.add("AB-2", "w2", vec!["b.rs".into(), "c.rs".into()]).unwrap();
        q.add("AB-3", "w3", vec!["c.rs".into()]).unwrap();

        let assignments = q.group_into_batches().unwrap();
        assert_eq!(assignments.len(), 3);
        assert!(assignments.iter().all(|a| a.total == 3));
    }

    #[test]
    fn test_grouping_is_stable_across_calls() {
        let (_dir, q) = queue();
        q.add("AB-1", "w1", vec!["a.rs".into()]).unwrap();
        q.add("AB-2", "w2", vec!["a.rs".into()]).unwrap();
        q.group_into_batches().unwrap();
        // Second call finds nothing new
        assert!(q.group_into_batches().unwrap().is_empty());
    }

    #[test]
    fn test_positions_release_in_order() {
        let (_dir, q) = queue();
        q.add("AB-1", "w1", vec!["a.rs".into()]).unwrap();
        q.add("AB-2", "w2", vec!["a.rs".into()]).unwrap();
        let assignments = q.group_into_batches().unwrap();
        let batch = assignments[0].batch_id.clone();

        assert_eq!(q.next_eligible(&batch).unwrap(), Some("AB-1".into()));
        assert_eq!(q.resolved_count(&batch).unwrap(), 0);

        q.mark_resolved("AB-1").unwrap();
        assert_eq!(q.next_eligible(&batch).unwrap(), Some("AB-2".into()));
        assert_eq!(q.resolved_count(&batch).unwrap(), 1);

        q.mark_resolved("AB-2").unwrap();
        assert_eq!(q.next_eligible(&batch).unwrap(), None);
        assert_eq!(q.resolved_count(&batch).unwrap(), 2);
    }

    #[test]
    fn test_failed_member_blocks_batch() {
        let (_dir, q) = queue();
        q.add("AB-1", "w1", vec!["a.rs".into()]).unwrap();
        q.add("AB-2", "w2", vec!["a.rs".into()]).unwrap();
        let batch = q.group_into_batches().unwrap()[0].batch_id.clone();
        q.set_status("AB-1", ConflictStatus::Failed).unwrap();
        assert_eq!(q.next_eligible(&batch).unwrap(), None);
    }
}
