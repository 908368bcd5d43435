//! Per-worker persistent lifecycle state (`git-state.json`).
//!
//! The store is the only writer of a worker's `current_state`; every change
//! appends a history entry and goes to disk atomically. The lifecycle engine
//! is the only caller of `set_state` outside of tests.

use crate::util::{now_iso, read_json, write_json_atomic};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Retained history entries per worker.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Every state a worker can be in, partitioned by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Startable: the worker exists but no agent has run yet.
    #[default]
    Created,

    // Working
    Executing,
    Testing,
    Reviewing,
    Fixing,

    // Waiting on the orchestrator
    NeedsMerge,
    NeedsResolve,
    NeedsFix,
    NeedsMultiResolve,

    // Transient audit markers
    Merging,
    Resolving,
    MergeConflict,
    FixCompleted,

    // Terminal
    Merged,
    Failed,
    Archived,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Archived)
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::NeedsMerge | Self::NeedsResolve | Self::NeedsFix | Self::NeedsMultiResolve
        )
    }

    pub fn is_working(self) -> bool {
        matches!(
            self,
            Self::Executing | Self::Testing | Self::Reviewing | Self::Fixing
        )
    }

    /// The snake_case name used in transition specs and history entries.
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Executing => "executing",
            Self::Testing => "testing",
            Self::Reviewing => "reviewing",
            Self::Fixing => "fixing",
            Self::NeedsMerge => "needs_merge",
            Self::NeedsResolve => "needs_resolve",
            Self::NeedsFix => "needs_fix",
            Self::NeedsMultiResolve => "needs_multi_resolve",
            Self::Merging => "merging",
            Self::Resolving => "resolving",
            Self::MergeConflict => "merge_conflict",
            Self::FixCompleted => "fix_completed",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One lifecycle transition, as recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub from: String,
    pub to: String,
    pub event: String,
    pub source: String,
    pub reason: String,
}

/// The persisted state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitState {
    pub current_state: LifecycleState,
    #[serde(default)]
    pub pr: Option<u64>,
    #[serde(default)]
    pub merge_attempts: u32,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl Default for GitState {
    fn default() -> Self {
        let now = now_iso();
        Self {
            current_state: LifecycleState::Created,
            pr: None,
            merge_attempts: 0,
            recovery_attempts: 0,
            last_error: String::new(),
            history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Store wrapping one `git-state.json` file.
#[derive(Debug, Clone)]
pub struct GitStateStore {
    path: PathBuf,
    history_cap: usize,
}

impl GitStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, defaulting to a fresh record if the file is absent.
    pub fn load(&self) -> Result<GitState> {
        if self.path.exists() {
            read_json(&self.path)
        } else {
            Ok(GitState::default())
        }
    }

    pub fn get_state(&self) -> Result<LifecycleState> {
        Ok(self.load()?.current_state)
    }

    pub fn is(&self, state: LifecycleState) -> bool {
        self.get_state().map(|s| s == state).unwrap_or(false)
    }

    /// Transition to `new`, appending a history entry. The write is atomic.
    pub fn set_state(
        &self,
        new: LifecycleState,
        event: &str,
        source: &str,
        reason: &str,
    ) -> Result<GitState> {
        self.update(|state| {
            let entry = HistoryEntry {
                timestamp: now_iso(),
                from: state.current_state.name().to_string(),
                to: new.name().to_string(),
                event: event.to_string(),
                source: source.to_string(),
                reason: reason.to_string(),
            };
            state.current_state = new;
            state.history.push(entry);
        })
    }

    /// Record an interim history entry without changing `current_state`'s
    /// final value. Used for `chain` audit markers.
    pub fn record_interim(
        &self,
        via: LifecycleState,
        event: &str,
        source: &str,
        reason: &str,
    ) -> Result<GitState> {
        self.update(|state| {
            let entry = HistoryEntry {
                timestamp: now_iso(),
                from: state.current_state.name().to_string(),
                to: via.name().to_string(),
                event: event.to_string(),
                source: source.to_string(),
                reason: reason.to_string(),
            };
            state.history.push(entry);
        })
    }

    pub fn inc_merge_attempts(&self) -> Result<u32> {
        let state = self.update(|s| s.merge_attempts += 1)?;
        Ok(state.merge_attempts)
    }

    pub fn inc_recovery_attempts(&self) -> Result<u32> {
        let state = self.update(|s| s.recovery_attempts += 1)?;
        Ok(state.recovery_attempts)
    }

    pub fn set_pr(&self, pr: u64) -> Result<()> {
        self.update(|s| s.pr = Some(pr))?;
        Ok(())
    }

    pub fn set_error(&self, error: &str) -> Result<()> {
        let error = error.to_string();
        self.update(move |s| s.last_error = error)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut GitState)) -> Result<GitState> {
        let mut state = self.load()?;
        f(&mut state);
        state.updated_at = now_iso();
        if state.history.len() > self.history_cap {
            let excess = state.history.len() - self.history_cap;
            state.history.drain(..excess);
        }
        write_json_atomic(&self.path, &state)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, GitStateStore) {
        let dir = tempdir().unwrap();
        let s = GitStateStore::new(dir.path().join("git-state.json"));
        (dir, s)
    }

    #[test]
    fn test_fresh_store_defaults_to_created() {
        let (_dir, store) = store();
        assert_eq!(store.get_state().unwrap(), LifecycleState::Created);
        assert!(store.is(LifecycleState::Created));
    }

    #[test]
    fn test_set_state_appends_history() {
        let (_dir, store) = store();
        store
            .set_state(LifecycleState::Executing, "worker.started", "scheduler", "picked")
            .unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.current_state, LifecycleState::Executing);
        assert_eq!(state.history.len(), 1);
        let entry = &state.history[0];
        assert_eq!(entry.from, "created");
        assert_eq!(entry.to, "executing");
        assert_eq!(entry.event, "worker.started");
        assert_eq!(entry.source, "scheduler");
    }

    #[test]
    fn test_record_interim_keeps_current_state() {
        let (_dir, store) = store();
        store
            .set_state(LifecycleState::NeedsMerge, "work.done", "pipeline", "")
            .unwrap();
        store
            .record_interim(LifecycleState::Merging, "merge.succeeded", "merge", "")
            .unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.current_state, LifecycleState::NeedsMerge);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].to, "merging");
    }

    #[test]
    fn test_history_cap() {
        let (_dir, store) = store();
        let store = store.with_history_cap(5);
        for i in 0..12 {
            store
                .set_state(LifecycleState::Executing, &format!("e{}", i), "t", "")
                .unwrap();
        }
        let state = store.load().unwrap();
        assert_eq!(state.history.len(), 5);
        // Most recent retained
        assert_eq!(state.history.last().unwrap().event, "e11");
        assert_eq!(state.history.first().unwrap().event, "e7");
    }

    #[test]
    fn test_counters_and_pr() {
        let (_dir, store) = store();
        assert_eq!(store.inc_merge_attempts().unwrap(), 1);
        assert_eq!(store.inc_merge_attempts().unwrap(), 2);
        assert_eq!(store.inc_recovery_attempts().unwrap(), 1);
        store.set_pr(42).unwrap();
        store.set_error("boom").unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.pr, Some(42));
        assert_eq!(state.merge_attempts, 2);
        assert_eq!(state.last_error, "boom");
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let (_dir, store) = store();
        store
            .set_state(LifecycleState::NeedsMultiResolve, "x", "y", "z")
            .unwrap();
        let reloaded = GitStateStore::new(store.path()).load().unwrap();
        assert_eq!(reloaded.current_state, LifecycleState::NeedsMultiResolve);
    }

    #[test]
    fn test_state_name_parse_round_trip() {
        for state in [
            LifecycleState::Created,
            LifecycleState::NeedsMerge,
            LifecycleState::MergeConflict,
            LifecycleState::Archived,
        ] {
            assert_eq!(LifecycleState::parse(state.name()), Some(state));
        }
        assert_eq!(LifecycleState::parse("bogus"), None);
    }

    #[test]
    fn test_partitions() {
        assert!(LifecycleState::Merged.is_terminal());
        assert!(LifecycleState::NeedsFix.is_waiting());
        assert!(LifecycleState::Testing.is_working());
        assert!(!LifecycleState::Created.is_terminal());
    }
}
