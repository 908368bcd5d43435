//! Declarative transition spec for the worker lifecycle.
//!
//! The engine is purely data-driven: states and transitions are added by
//! editing the spec, not by writing code. Each transition declares where it
//! applies (`from`, `*` is a wildcard), which event fires it, an optional
//! guard, the target state (`to`, null keeps the current state), an optional
//! kanban status character, an optional `chain` interim audit state, and the
//! effects to run.

use crate::errors::LifecycleError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One declared effect: a registry name plus an argument map. Argument
/// values are literals, `data.<path>` references into the event payload,
/// or `ctx.<key>` references into the runtime context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectCall {
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// One transition rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Source state name, or `*` for any state.
    pub from: String,
    /// Event name, dotted (`merge.succeeded`).
    pub event: String,
    /// Target state; `None` records the event without changing state.
    #[serde(default)]
    pub to: Option<String>,
    /// Guard name; evaluated before the transition is chosen. A failing
    /// guard lets the scan continue with the next candidate.
    #[serde(default)]
    pub guard: Option<String>,
    /// Kanban status character to set alongside the state change.
    #[serde(default)]
    pub kanban: Option<char>,
    /// Interim audit state recorded in history before moving to `to`.
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub effects: Vec<EffectCall>,
}

/// The whole spec, scanned in declaration order (first match wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub transitions: Vec<Transition>,
}

impl TransitionSpec {
    /// Load a spec from a JSON file.
    pub fn load(path: &Path) -> Result<Self, LifecycleError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LifecycleError::SpecLoad(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| LifecycleError::SpecLoad(format!("{}: {}", path.display(), e)))
    }

    /// The built-in spec covering the full worker lifecycle.
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_SPEC).expect("builtin transition spec must parse")
    }

    /// Candidate transitions for `(state, event)` in declaration order,
    /// wildcard included. Guard evaluation happens in the engine.
    pub fn candidates<'a>(
        &'a self,
        state: &str,
        event: &str,
    ) -> impl Iterator<Item = &'a Transition> {
        self.transitions
            .iter()
            .filter(move |t| t.event == event && (t.from == "*" || t.from == state))
    }
}

/// Effect names that move or archive the worker directory. Before running
/// one of these the engine flushes prior pending outbox entries, since the
/// records themselves live inside the directory being moved.
pub const DIRECTORY_MOVING_EFFECTS: &[&str] = &["archive_worker", "cleanup_worktree"];

const BUILTIN_SPEC: &str = r#"{
  "transitions": [
    { "from": "created", "event": "worker.started", "to": "executing", "kanban": "=",
      "effects": [] },

    { "from": "executing", "event": "work.testing", "to": "testing", "effects": [] },
    { "from": "testing", "event": "work.reviewing", "to": "reviewing", "effects": [] },

    { "from": "*", "event": "pr.opened", "to": null,
      "effects": [ { "name": "record_pr", "args": { "pr": "data.pr" } } ] },

    { "from": "*", "event": "work.done", "to": "needs_merge", "kanban": "P",
      "effects": [ { "name": "sync_github_status", "args": { "state": "pending_merge" } } ] },

    { "from": "*", "event": "work.failed", "to": "failed", "kanban": "*",
      "effects": [
        { "name": "sync_github_status", "args": { "state": "failed" } },
        { "name": "cleanup_worktree" },
        { "name": "archive_worker" }
      ] },

    { "from": "*", "event": "worker.crashed", "guard": "recovery_attempts_below_max",
      "to": "created",
      "effects": [ { "name": "count_recovery_attempt" } ] },
    { "from": "*", "event": "worker.crashed", "to": "failed", "kanban": "*",
      "effects": [
        { "name": "cleanup_worktree" },
        { "name": "archive_worker" }
      ] },

    { "from": "needs_merge", "event": "merge.succeeded", "chain": "merging",
      "to": "merged", "kanban": "x",
      "effects": [
        { "name": "rm_conflict_queue_entry" },
        { "name": "sync_github_status", "args": { "state": "merged" } },
        { "name": "cleanup_worktree" },
        { "name": "archive_worker" }
      ] },

    { "from": "needs_merge", "event": "merge.conflict", "chain": "merge_conflict",
      "to": "needs_resolve",
      "effects": [ { "name": "add_conflict_queue_entry", "args": { "files": "data.files" } } ] },

    { "from": "needs_merge", "event": "merge.failed", "guard": "merge_attempts_below_max",
      "to": null,
      "effects": [ { "name": "count_merge_attempt" } ] },
    { "from": "needs_merge", "event": "merge.failed", "to": "failed", "kanban": "*",
      "effects": [
        { "name": "sync_github_status", "args": { "state": "failed" } },
        { "name": "cleanup_worktree" },
        { "name": "archive_worker" }
      ] },

    { "from": "needs_resolve", "event": "batch.assigned", "to": "needs_multi_resolve",
      "effects": [] },

    { "from": "needs_resolve", "event": "resolve.started", "to": "resolving", "effects": [] },
    { "from": "needs_multi_resolve", "event": "resolve.started", "to": "resolving",
      "effects": [] },

    { "from": "resolving", "event": "resolve.done", "guard": "rebase_onto_default_succeeds",
      "to": "needs_merge",
      "effects": [ { "name": "publish_resolve_done" } ] },
    { "from": "resolving", "event": "resolve.done", "to": "needs_resolve", "effects": [] },

    { "from": "resolving", "event": "resolve.failed", "guard": "recovery_attempts_below_max",
      "to": "needs_resolve",
      "effects": [ { "name": "count_recovery_attempt" } ] },
    { "from": "resolving", "event": "resolve.failed", "to": "failed", "kanban": "*",
      "effects": [
        { "name": "rm_conflict_queue_entry" },
        { "name": "cleanup_worktree" },
        { "name": "archive_worker" }
      ] },

    { "from": "needs_merge", "event": "review.changes_requested", "to": "needs_fix",
      "effects": [] },
    { "from": "needs_fix", "event": "fix.started", "to": "fixing", "effects": [] },
    { "from": "fixing", "event": "fix.done", "chain": "fix_completed", "to": "needs_merge",
      "effects": [ { "name": "sync_github_status", "args": { "state": "fixed" } } ] },
    { "from": "fixing", "event": "fix.failed", "guard": "recovery_attempts_below_max",
      "to": "needs_fix",
      "effects": [ { "name": "count_recovery_attempt" } ] },
    { "from": "fixing", "event": "fix.failed", "to": "failed", "kanban": "*",
      "effects": [
        { "name": "cleanup_worktree" },
        { "name": "archive_worker" }
      ] },

    { "from": "*", "event": "worker.archived", "to": "archived",
      "effects": [ { "name": "archive_worker" } ] }
  ]
}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::LifecycleState;

    #[test]
    fn test_builtin_spec_parses() {
        let spec = TransitionSpec::builtin();
        assert!(spec.transitions.len() > 15);
    }

    #[test]
    fn test_builtin_states_all_known() {
        let spec = TransitionSpec::builtin();
        for t in &spec.transitions {
            if t.from != "*" {
                assert!(
                    LifecycleState::parse(&t.from).is_some(),
                    "unknown from state {}",
                    t.from
                );
            }
            if let Some(to) = &t.to {
                assert!(LifecycleState::parse(to).is_some(), "unknown to state {}", to);
            }
            if let Some(chain) = &t.chain {
                assert!(
                    LifecycleState::parse(chain).is_some(),
                    "unknown chain state {}",
                    chain
                );
            }
        }
    }

    #[test]
    fn test_candidates_ordered_and_filtered() {
        let spec = TransitionSpec::builtin();
        let candidates: Vec<_> = spec.candidates("needs_merge", "merge.failed").collect();
        assert_eq!(candidates.len(), 2);
        // Guarded attempt-counting rule first, terminal fallback second
        assert_eq!(
            candidates[0].guard.as_deref(),
            Some("merge_attempts_below_max")
        );
        assert!(candidates[1].guard.is_none());
        assert_eq!(candidates[1].to.as_deref(), Some("failed"));
    }

    #[test]
    fn test_wildcard_candidates_match_any_state() {
        let spec = TransitionSpec::builtin();
        let candidates: Vec<_> = spec.candidates("reviewing", "work.done").collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kanban, Some('P'));
    }

    #[test]
    fn test_no_candidates_for_terminal_merge() {
        let spec = TransitionSpec::builtin();
        assert_eq!(spec.candidates("merged", "merge.succeeded").count(), 0);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            TransitionSpec::load(&path),
            Err(LifecycleError::SpecLoad(_))
        ));
    }
}
