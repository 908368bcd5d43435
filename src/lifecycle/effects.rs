//! Effect registry for the lifecycle engine.
//!
//! Effects are named side-effect handlers looked up from the transition
//! spec. All of them must be idempotent: the outbox replays pending entries
//! at-least-once, and a crashed run may execute the same effect again.

use crate::kanban::KanbanStore;
use crate::scheduler::conflict::ConflictQueue;
use crate::worker::WorkerDir;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// What an effect gets to work with. `args` are fully resolved — `data.*`
/// and `ctx.*` references were substituted when the entry was recorded.
pub struct EffectInvocation {
    pub worker_path: PathBuf,
    pub task_id: String,
    pub args: BTreeMap<String, String>,
}

impl EffectInvocation {
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    /// Parse an argument holding either a JSON string array or a
    /// comma-separated list.
    pub fn arg_list(&self, key: &str) -> Vec<String> {
        let Some(raw) = self.arg(key) else {
            return Vec::new();
        };
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw) {
            return items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

pub type EffectFn = Arc<dyn Fn(&EffectInvocation) -> Result<()> + Send + Sync>;

/// Everything the built-in effects need handles on.
#[derive(Clone)]
pub struct EffectEnv {
    pub kanban: KanbanStore,
    pub conflict_queue: ConflictQueue,
    pub archive_dir: PathBuf,
}

/// Named effect lookup table, immutable after startup.
#[derive(Clone, Default)]
pub struct EffectRegistry {
    handlers: HashMap<String, EffectFn>,
}

impl EffectRegistry {
    /// Registry with the built-in filesystem and queue effects.
    /// `register` can overlay any of them with an embedder's own handler.
    pub fn standard(env: EffectEnv) -> Self {
        let mut registry = Self::default();

        registry.register("cleanup_worktree", |inv| {
            let workspace = inv.worker_path.join("workspace");
            if workspace.exists() {
                crate::gitops::remove_worktree(&workspace)?;
            }
            Ok(())
        });

        let archive_dir = env.archive_dir.clone();
        registry.register("archive_worker", move |inv| {
            if !inv.worker_path.exists() {
                // Already archived by an earlier replay.
                return Ok(());
            }
            let worker = WorkerDir::open(&inv.worker_path)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            worker.archive(&archive_dir)?;
            Ok(())
        });

        let queue = env.conflict_queue.clone();
        registry.register("rm_conflict_queue_entry", move |inv| {
            queue
                .remove(&inv.task_id)
                .map_err(|e| anyhow::anyhow!("{}", e))
        });

        let queue = env.conflict_queue.clone();
        registry.register("add_conflict_queue_entry", move |inv| {
            let worker_name = inv
                .worker_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            queue
                .add(&inv.task_id, &worker_name, inv.arg_list("files"))
                .map_err(|e| anyhow::anyhow!("{}", e))
        });

        let queue = env.conflict_queue;
        registry.register("publish_resolve_done", move |inv| {
            queue
                .mark_resolved(&inv.task_id)
                .map_err(|e| anyhow::anyhow!("{}", e))
        });

        registry.register("count_merge_attempt", |inv| {
            let store = crate::worker::GitStateStore::new(
                inv.worker_path.join("git-state.json"),
            );
            store.inc_merge_attempts()?;
            Ok(())
        });

        registry.register("count_recovery_attempt", |inv| {
            let store = crate::worker::GitStateStore::new(
                inv.worker_path.join("git-state.json"),
            );
            store.inc_recovery_attempts()?;
            Ok(())
        });

        registry.register("record_pr", |inv| {
            let pr: u64 = inv
                .arg("pr")
                .context("record_pr requires a 'pr' argument")?
                .parse()
                .context("record_pr 'pr' argument is not a number")?;
            let store = crate::worker::GitStateStore::new(
                inv.worker_path.join("git-state.json"),
            );
            store.set_pr(pr)?;
            Ok(())
        });

        let kanban = env.kanban;
        registry.register("mark_task_complete", move |inv| {
            kanban
                .set_status(&inv.task_id, crate::kanban::TaskStatus::Done)
                .map_err(|e| anyhow::anyhow!("{}", e))
        });

        // GitHub status propagation stays outside this crate's scope; the
        // shipped handler is a logged no-op so transitions that declare it
        // converge everywhere. Overlay via `register` to wire a real sync.
        registry.register("sync_github_status", |inv| {
            tracing::debug!(
                task = %inv.task_id,
                state = inv.arg("state").unwrap_or("unknown"),
                "sync_github_status: no github handle registered"
            );
            Ok(())
        });

        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        handler: impl Fn(&EffectInvocation) -> Result<()> + Send + Sync + 'static,
    ) {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn run(&self, name: &str, invocation: &EffectInvocation) -> Result<()> {
        let handler = self
            .handlers
            .get(name)
            .with_context(|| format!("no effect handler named '{}'", name))?;
        handler(invocation)
    }
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("EffectRegistry").field("effects", &names).finish()
    }
}
