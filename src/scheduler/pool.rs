//! Worker pools: tracked child pids, throttled reaping, and the file queue
//! sub-processes use to register pool entries.
//!
//! Liveness is probed with a zero signal at a minimum interval per pid.
//! Exited workers fire the pool's completion callback; overdue workers get
//! SIGTERM, a grace window, then SIGKILL and the timeout callback.

use crate::util::{pid_alive, read_json, terminate_pid, kill_pid, with_file_lock, write_atomic};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One tracked child process.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub task_id: String,
    pub worker_dir: PathBuf,
    pub pid: u32,
    pub started_at: Instant,
    last_probe: Option<Instant>,
}

impl PoolEntry {
    pub fn new(task_id: &str, worker_dir: &Path, pid: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            worker_dir: worker_dir.to_path_buf(),
            pid,
            started_at: Instant::now(),
            last_probe: None,
        }
    }
}

/// What reaping found.
#[derive(Debug)]
pub enum Reaped {
    Exited(PoolEntry),
    TimedOut(PoolEntry),
}

/// A bounded set of running workers.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    capacity: usize,
    entries: HashMap<String, PoolEntry>,
}

impl WorkerPool {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn insert(&mut self, entry: PoolEntry) {
        self.entries.insert(entry.task_id.clone(), entry);
    }

    pub fn remove(&mut self, task_id: &str) -> Option<PoolEntry> {
        self.entries.remove(task_id)
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Probe tracked pids (respecting `min_interval` per pid) and collect
    /// exits and timeouts. Timed-out pids get SIGTERM, `grace`, SIGKILL.
    pub fn reap(
        &mut self,
        min_interval: Duration,
        timeout: Duration,
        grace: Duration,
    ) -> Vec<Reaped> {
        let mut reaped = Vec::new();
        let now = Instant::now();

        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.last_probe
                    .map(|t| now.duration_since(t) >= min_interval)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in due {
            let entry = self.entries.get_mut(&task_id).expect("entry present");
            entry.last_probe = Some(now);

            if !pid_alive(entry.pid) {
                let entry = self.entries.remove(&task_id).expect("entry present");
                tracing::debug!(pool = %self.name, task = %task_id, pid = entry.pid, "worker exited");
                reaped.push(Reaped::Exited(entry));
            } else if now.duration_since(entry.started_at) >= timeout {
                tracing::warn!(pool = %self.name, task = %task_id, pid = entry.pid, "worker timed out, terminating");
                terminate_pid(entry.pid);
                std::thread::sleep(grace);
                if pid_alive(entry.pid) {
                    kill_pid(entry.pid);
                }
                let entry = self.entries.remove(&task_id).expect("entry present");
                reaped.push(Reaped::TimedOut(entry));
            }
        }
        reaped
    }
}

/// An entry written by a sub-process that spawned work on its own (the
/// `review` CLI path), drained into the in-memory pools each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEntry {
    pub pool: String,
    pub task_id: String,
    pub worker_dir: PathBuf,
    pub pid: u32,
}

/// Append-only pending queue under a file lock.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    path: PathBuf,
}

impl PendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn push(&self, entry: &PendingEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        with_file_lock(&self.path, || crate::util::append_line(&self.path, &line))
    }

    /// Read and clear every pending entry.
    pub fn drain(&self) -> Result<Vec<PendingEntry>> {
        with_file_lock(&self.path, || {
            if !self.path.exists() {
                return Ok(Vec::new());
            }
            let content = std::fs::read_to_string(&self.path)?;
            let entries = content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect();
            write_atomic(&self.path, b"")?;
            Ok(entries)
        })
    }
}

/// Snapshot of pool membership persisted across restarts. On restore, each
/// pid is verified alive before being re-tracked.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub entries: Vec<PendingEntry>,
}

impl PoolSnapshot {
    pub fn capture(pools: &[&WorkerPool]) -> Self {
        let entries = pools
            .iter()
            .flat_map(|pool| {
                pool.entries.values().map(|e| PendingEntry {
                    pool: pool.name.clone(),
                    task_id: e.task_id.clone(),
                    worker_dir: e.worker_dir.clone(),
                    pid: e.pid,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::util::write_json_atomic(path, self)
    }

    /// Load and keep only entries whose pid is still alive.
    pub fn restore(path: &Path) -> Self {
        let snapshot: PoolSnapshot = match read_json(path) {
            Ok(s) => s,
            Err(_) => return Self::default(),
        };
        Self {
            entries: snapshot
                .entries
                .into_iter()
                .filter(|e| pid_alive(e.pid))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_capacity_accounting() {
        let mut pool = WorkerPool::new("main", 2);
        assert_eq!(pool.free_capacity(), 2);
        pool.insert(PoolEntry::new("AB-1", Path::new("/w1"), 1111111));
        pool.insert(PoolEntry::new("AB-2", Path::new("/w2"), 2222222));
        assert_eq!(pool.free_capacity(), 0);
        assert!(pool.contains("AB-1"));
        pool.remove("AB-1");
        assert_eq!(pool.free_capacity(), 1);
    }

    #[test]
    fn test_reap_collects_dead_pids() {
        let mut pool = WorkerPool::new("main", 4);
        // pid 0 probes as dead, our own pid as alive
        pool.insert(PoolEntry::new("DEAD-1", Path::new("/w"), 0));
        pool.insert(PoolEntry::new("LIVE-1", Path::new("/w"), std::process::id()));

        let reaped = pool.reap(
            Duration::from_millis(0),
            Duration::from_secs(3600),
            Duration::from_millis(0),
        );
        assert_eq!(reaped.len(), 1);
        assert!(matches!(&reaped[0], Reaped::Exited(e) if e.task_id == "DEAD-1"));
        assert!(pool.contains("LIVE-1"));
        assert!(!pool.contains("DEAD-1"));
    }

    #[test]
    fn test_reap_throttles_probes() {
        let mut pool = WorkerPool::new("main", 4);
        pool.insert(PoolEntry::new("DEAD-1", Path::new("/w"), 0));

        // First probe catches it...
        let first = pool.reap(
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::ZERO,
        );
        assert_eq!(first.len(), 1);

        // ...and a fresh dead entry is skipped inside the min interval.
        pool.insert(PoolEntry::new("DEAD-2", Path::new("/w"), 0));
        pool.entries.get_mut("DEAD-2").unwrap().last_probe = Some(Instant::now());
        let second = pool.reap(
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Duration::ZERO,
        );
        assert!(second.is_empty());
        assert!(pool.contains("DEAD-2"));
    }

    #[test]
    fn test_pending_queue_push_and_drain() {
        let dir = tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pool-pending.jsonl"));
        let entry = PendingEntry {
            pool: "fix".into(),
            task_id: "AB-1".into(),
            worker_dir: PathBuf::from("/w"),
            pid: 42,
        };
        queue.push(&entry).unwrap();
        queue.push(&entry).unwrap();

        let drained = queue.drain().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], entry);
        // Drained means gone
        assert!(queue.drain().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_restore_filters_dead_pids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool-state.json");
        let mut pool = WorkerPool::new("main", 4);
        pool.insert(PoolEntry::new("LIVE-1", Path::new("/w"), std::process::id()));
        pool.insert(PoolEntry::new("DEAD-1", Path::new("/w"), 0));

        PoolSnapshot::capture(&[&pool]).save(&path).unwrap();
        let restored = PoolSnapshot::restore(&path);
        assert_eq!(restored.entries.len(), 1);
        assert_eq!(restored.entries[0].task_id, "LIVE-1");
    }
}
