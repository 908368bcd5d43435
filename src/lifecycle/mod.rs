//! The worker lifecycle engine.
//!
//! Every state change in the system funnels through one operation:
//! [`LifecycleEngine::emit_event`]. The engine scans the transition spec in
//! declaration order, takes the first candidate whose guard passes, records
//! the transition (history + `events.jsonl`), couples the kanban edit to it,
//! and runs the declared effects through the crash-safe outbox.
//!
//! Crash-safety layering: history and the event log are appended before any
//! effect runs; effects are recorded pending in the outbox before execution
//! and marked completed after; pending entries replay on the next
//! opportunity. Before an effect that moves the worker directory, prior
//! pending batches are flushed (their records live inside that directory).

pub mod effects;
pub mod guards;
pub mod outbox;
pub mod spec;

pub use effects::{EffectEnv, EffectInvocation, EffectRegistry};
pub use guards::{GuardContext, GuardRegistry};
pub use outbox::{EffectOutbox, OutboxEntry};
pub use spec::{EffectCall, Transition, TransitionSpec};

use crate::errors::LifecycleError;
use crate::kanban::{KanbanStore, TaskStatus};
use crate::util::append_line;
use crate::worker::{LifecycleState, WorkerDir};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// What one `emit_event` did.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitOutcome {
    /// False when no transition matched — the event was a no-op.
    pub matched: bool,
    pub from: LifecycleState,
    pub to: Option<LifecycleState>,
    pub effects_completed: usize,
}

impl EmitOutcome {
    fn no_op(from: LifecycleState) -> Self {
        Self {
            matched: false,
            from,
            to: None,
            effects_completed: 0,
        }
    }
}

/// Bounds consulted by the built-in guards.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleLimits {
    pub max_merge_attempts: u32,
    pub max_recovery_attempts: u32,
}

/// The engine. Spec, guards and effects are loaded once at startup and
/// immutable afterwards; all mutable state lives on disk.
pub struct LifecycleEngine {
    spec: TransitionSpec,
    guards: GuardRegistry,
    effects: EffectRegistry,
    kanban: KanbanStore,
    limits: LifecycleLimits,
    outbox_enabled: bool,
    /// Re-entry guard: replaying pending effects can itself hit a
    /// directory-moving effect, which must not trigger another flush.
    replaying: AtomicBool,
}

impl LifecycleEngine {
    pub fn new(
        spec: TransitionSpec,
        guards: GuardRegistry,
        effects: EffectRegistry,
        kanban: KanbanStore,
        limits: LifecycleLimits,
        outbox_enabled: bool,
    ) -> Self {
        Self {
            spec,
            guards,
            effects,
            kanban,
            limits,
            outbox_enabled,
            replaying: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &TransitionSpec {
        &self.spec
    }

    /// Deliver one event to one worker.
    ///
    /// Returns `Ok` with `matched: false` when no transition applies — an
    /// event with no transition is a no-op by design (re-delivering
    /// `merge.succeeded` to a merged worker must not fail).
    pub fn emit_event(
        &self,
        worker: &WorkerDir,
        event: &str,
        source: &str,
        data: &serde_json::Value,
    ) -> Result<EmitOutcome, LifecycleError> {
        let store = worker.git_state_store();
        let state = store
            .load()
            .map_err(|e| LifecycleError::StateFile {
                path: store.path().to_path_buf(),
                source: e,
            })?;
        let from = state.current_state;

        // First matching transition whose guard passes wins.
        let mut chosen: Option<&Transition> = None;
        for candidate in self.spec.candidates(from.name(), event) {
            match &candidate.guard {
                None => {
                    chosen = Some(candidate);
                    break;
                }
                Some(guard_name) => {
                    let guard = self.guards.get(guard_name).ok_or_else(|| {
                        LifecycleError::UnknownGuard {
                            guard: guard_name.clone(),
                            event: event.to_string(),
                        }
                    })?;
                    let ctx = GuardContext {
                        worker,
                        state: &state,
                        data,
                        max_merge_attempts: self.limits.max_merge_attempts,
                        max_recovery_attempts: self.limits.max_recovery_attempts,
                    };
                    if guard(&ctx) {
                        chosen = Some(candidate);
                        break;
                    }
                    tracing::debug!(
                        worker = %worker.name(),
                        event,
                        guard = %guard_name,
                        "guard rejected transition, trying next candidate"
                    );
                }
            }
        }

        let Some(transition) = chosen else {
            tracing::debug!(worker = %worker.name(), event, state = %from, "no transition, event ignored");
            return Ok(EmitOutcome::no_op(from));
        };

        // Effects must all be known before anything is recorded.
        for call in &transition.effects {
            if !self.effects.contains(&call.name) {
                return Err(LifecycleError::UnknownEffect {
                    effect: call.name.clone(),
                    event: event.to_string(),
                });
            }
        }

        let to = match &transition.to {
            Some(name) => Some(LifecycleState::parse(name).ok_or_else(|| {
                LifecycleError::UnknownState {
                    state: name.clone(),
                }
            })?),
            None => None,
        };
        let chain = match &transition.chain {
            Some(name) => Some(LifecycleState::parse(name).ok_or_else(|| {
                LifecycleError::UnknownState {
                    state: name.clone(),
                }
            })?),
            None => None,
        };

        let reason = data
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        // 1. History entries: chain interim first, then the real move. One
        //    event-log line is appended per history entry so the two stay in
        //    lockstep for auditing.
        let state_err = |e: anyhow::Error| LifecycleError::StateFile {
            path: store.path().to_path_buf(),
            source: e,
        };
        if let Some(via) = chain {
            store
                .record_interim(via, event, source, &reason)
                .map_err(state_err)?;
            self.append_event_line(worker, event, source, from, via, data)?;
        }
        match to {
            Some(target) => {
                store
                    .set_state(target, event, source, &reason)
                    .map_err(state_err)?;
                self.append_event_line(worker, event, source, chain.unwrap_or(from), target, data)?;
            }
            None => {
                // State unchanged; still record the event for the audit trail.
                store
                    .record_interim(from, event, source, &reason)
                    .map_err(state_err)?;
                self.append_event_line(worker, event, source, from, from, data)?;
            }
        }

        // 2. Kanban edit, coupled to the transition.
        if let Some(ch) = transition.kanban {
            let status = TaskStatus::from_char(ch)?;
            self.kanban.set_status(worker.task_id(), status)?;
        }

        // 3. Effects, through the outbox.
        let resolved: Vec<(String, BTreeMap<String, String>)> = transition
            .effects
            .iter()
            .map(|call| (call.name.clone(), self.resolve_args(worker, call, data)))
            .collect();
        let effects_completed = self.run_effects(worker, &resolved, event)?;

        Ok(EmitOutcome {
            matched: true,
            from,
            to,
            effects_completed,
        })
    }

    /// Replay any pending outbox entries for a worker. Called by the
    /// scheduler on restart and by the engine before directory-moving
    /// effects.
    pub fn replay_outbox(&self, worker: &WorkerDir) -> Result<usize, LifecycleError> {
        let outbox = EffectOutbox::new(worker.outbox_dir());
        self.replay_with_guard(&outbox, None)
    }

    fn run_effects(
        &self,
        worker: &WorkerDir,
        resolved: &[(String, BTreeMap<String, String>)],
        event: &str,
    ) -> Result<usize, LifecycleError> {
        if resolved.is_empty() {
            return Ok(0);
        }

        if !self.outbox_enabled {
            let mut completed = 0;
            for (name, args) in resolved {
                let invocation = self.invocation(worker, args.clone());
                match self.effects.run(name, &invocation) {
                    Ok(()) => completed += 1,
                    Err(e) => {
                        tracing::warn!(worker = %worker.name(), effect = %name, error = %e, "effect failed");
                    }
                }
            }
            return Ok(completed);
        }

        let outbox = EffectOutbox::new(worker.outbox_dir());

        // Flush earlier batches before anything that moves the directory;
        // their records would otherwise move with it, unexecuted.
        let moves_dir = resolved
            .iter()
            .any(|(name, _)| spec::DIRECTORY_MOVING_EFFECTS.contains(&name.as_str()));

        let context = serde_json::json!({
            "worker_dir": worker.path(),
            "task_id": worker.task_id(),
            "event": event,
        });
        let batch_id = outbox
            .record_pending(resolved, context)
            .map_err(LifecycleError::Other)?;

        if moves_dir && !self.replaying.load(Ordering::SeqCst) {
            self.replay_with_guard(&outbox, Some(&batch_id))?;
        }

        let mut completed = 0;
        for (i, (name, args)) in resolved.iter().enumerate() {
            let invocation = self.invocation(worker, args.clone());
            match self.effects.run(name, &invocation) {
                Ok(()) => {
                    // After a directory move the batch file moved with the
                    // worker; failing to mark it is not fatal.
                    if let Err(e) = outbox.mark_completed(&batch_id, i as u32) {
                        tracing::debug!(effect = %name, error = %e, "could not mark outbox entry completed");
                    }
                    completed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %worker.name(),
                        effect = %name,
                        error = %e,
                        "effect failed, left pending in outbox"
                    );
                }
            }
        }
        Ok(completed)
    }

    fn replay_with_guard(
        &self,
        outbox: &EffectOutbox,
        skip_batch: Option<&str>,
    ) -> Result<usize, LifecycleError> {
        if self.replaying.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let result = outbox.replay_pending_except(skip_batch, &|entry: &OutboxEntry| {
            let worker_path = entry
                .context
                .get("worker_dir")
                .and_then(|v| v.as_str())
                .map(std::path::PathBuf::from)
                .ok_or_else(|| anyhow::anyhow!("outbox entry has no worker_dir context"))?;
            let task_id = entry
                .context
                .get("task_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("outbox entry has no task_id context"))?
                .to_string();
            let invocation = EffectInvocation {
                worker_path,
                task_id,
                args: entry.args.clone(),
            };
            self.effects.run(&entry.effect_name, &invocation)
        });
        self.replaying.store(false, Ordering::SeqCst);
        result.map_err(LifecycleError::Other)
    }

    fn invocation(
        &self,
        worker: &WorkerDir,
        args: BTreeMap<String, String>,
    ) -> EffectInvocation {
        EffectInvocation {
            worker_path: worker.path().to_path_buf(),
            task_id: worker.task_id().to_string(),
            args,
        }
    }

    /// Substitute `data.<path>` and `ctx.<key>` argument references. The
    /// runtime context carries four keys: `worker_dir`, `task_id`,
    /// `ralph_dir` (the state root the workers directory lives under) and
    /// `kanban_status` (the task's current status character).
    fn resolve_args(
        &self,
        worker: &WorkerDir,
        call: &EffectCall,
        data: &serde_json::Value,
    ) -> BTreeMap<String, String> {
        call.args
            .iter()
            .map(|(key, value)| {
                let resolved = if let Some(path) = value.strip_prefix("data.") {
                    lookup_json_path(data, path)
                        .map(json_to_arg)
                        .unwrap_or_default()
                } else if let Some(key) = value.strip_prefix("ctx.") {
                    match key {
                        "worker_dir" => worker.path().to_string_lossy().into_owned(),
                        "task_id" => worker.task_id().to_string(),
                        "ralph_dir" => worker
                            .path()
                            .parent()
                            .and_then(|workers| workers.parent())
                            .map(|root| root.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        "kanban_status" => self.kanban_status_char(worker.task_id()),
                        other => {
                            tracing::warn!(key = other, "unknown ctx reference in effect args");
                            String::new()
                        }
                    }
                } else {
                    value.clone()
                };
                (key.clone(), resolved)
            })
            .collect()
    }

    /// The task's current kanban status character, for `ctx.kanban_status`.
    fn kanban_status_char(&self, task_id: &str) -> String {
        self.kanban
            .get_all_tasks()
            .ok()
            .and_then(|tasks| {
                tasks
                    .into_iter()
                    .find(|t| t.id == task_id)
                    .map(|t| t.status.as_char().to_string())
            })
            .unwrap_or_default()
    }

    fn append_event_line(
        &self,
        worker: &WorkerDir,
        event: &str,
        source: &str,
        from: LifecycleState,
        to: LifecycleState,
        data: &serde_json::Value,
    ) -> Result<(), LifecycleError> {
        let line = serde_json::json!({
            "timestamp": crate::util::now_iso(),
            "event": event,
            "source": source,
            "from": from.name(),
            "to": to.name(),
            "data": data,
        });
        append_line(&worker.events_log(), &line.to_string()).map_err(LifecycleError::Other)
    }
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("transitions", &self.spec.transitions.len())
            .field("outbox_enabled", &self.outbox_enabled)
            .finish()
    }
}

fn lookup_json_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn json_to_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
