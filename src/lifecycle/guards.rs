//! Guard registry for the lifecycle engine.
//!
//! Guards are named predicates looked up from the transition spec. Most are
//! pure reads of worker state; a few (like `rebase_onto_default_succeeds`)
//! deliberately carry side effects and must be idempotent — the engine may
//! evaluate them again when a later event rescans the same transitions.

use crate::worker::{GitState, WorkerDir};
use std::collections::HashMap;
use std::sync::Arc;

/// What a guard gets to look at.
pub struct GuardContext<'a> {
    pub worker: &'a WorkerDir,
    pub state: &'a GitState,
    pub data: &'a serde_json::Value,
    pub max_merge_attempts: u32,
    pub max_recovery_attempts: u32,
}

pub type GuardFn = Arc<dyn Fn(&GuardContext<'_>) -> bool + Send + Sync>;

/// Named guard lookup table, immutable after startup.
#[derive(Clone, Default)]
pub struct GuardRegistry {
    guards: HashMap<String, GuardFn>,
}

impl GuardRegistry {
    /// Registry with the built-in counter guards. Side-effecting guards
    /// (`rebase_onto_default_succeeds`) are registered by the orchestrator,
    /// which owns the git plumbing they need.
    pub fn standard() -> Self {
        let mut registry = Self::default();
        registry.register("merge_attempts_below_max", |ctx| {
            ctx.state.merge_attempts < ctx.max_merge_attempts
        });
        registry.register("recovery_attempts_below_max", |ctx| {
            ctx.state.recovery_attempts < ctx.max_recovery_attempts
        });
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        guard: impl Fn(&GuardContext<'_>) -> bool + Send + Sync + 'static,
    ) {
        self.guards.insert(name.to_string(), Arc::new(guard));
    }

    pub fn get(&self, name: &str) -> Option<&GuardFn> {
        self.guards.get(name)
    }
}

impl std::fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.guards.keys().collect();
        names.sort();
        f.debug_struct("GuardRegistry").field("guards", &names).finish()
    }
}
