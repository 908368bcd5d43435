//! The orchestration scheduler: one long-lived supervisor process, one main
//! loop.
//!
//! Each tick: ingest externally registered pool entries, reap finished and
//! timed-out children, schedule ready tasks into the main pool (effective
//! priority + aging + file-conflict avoidance), drive fix/resolve workers in
//! the priority pool, group conflicting PRs into batches, attempt merges for
//! waiting workers, display status, sleep.
//!
//! Workers are separate processes; the scheduler talks to them only through
//! the filesystem. A spawner trait hides the process launch so tests can run
//! workers in-process against a mock backend.

pub mod conflict;
pub mod pool;
pub mod priority;

use crate::config::Config;
use crate::errors::SchedulerError;
use crate::kanban::{KanbanStore, Task};
use crate::lifecycle::LifecycleEngine;
use crate::merge::{GitHub, MergeCoordinator};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::worker::{LifecycleState, WorkerDir};
use anyhow::{Context, Result};
use async_trait::async_trait;
use conflict::ConflictQueue;
use pool::{PendingQueue, PoolEntry, PoolSnapshot, Reaped, WorkerPool};
use priority::{AgingTracker, PriorityWeights, rank};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

static PATHISH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_./-]*/[A-Za-z0-9_./-]*\.[A-Za-z0-9]+").unwrap());

/// Launches a worker process. The production implementation re-execs the
/// foreman binary; tests substitute an in-process runner.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker (or resume one) and return its pid.
    async fn spawn(&self, worker: &WorkerDir, resume: bool) -> Result<u32>;
}

/// Spawns `foreman worker start|resume --dir <worker>` as a detached child,
/// with stdout/stderr appended to the worker's log.
pub struct ProcessSpawner {
    pub project_dir: PathBuf,
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, worker: &WorkerDir, resume: bool) -> Result<u32> {
        let exe = std::env::current_exe().context("Cannot locate foreman binary")?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(worker.worker_log())?;
        let mode = if resume { "resume" } else { "start" };
        let mut child = tokio::process::Command::new(exe)
            .arg("--project-dir")
            .arg(&self.project_dir)
            .arg("worker")
            .arg(mode)
            .arg("--dir")
            .arg(worker.path())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .with_context(|| format!("Failed to spawn worker for {}", worker.task_id()))?;
        let pid = child.id().unwrap_or(0);
        // Await in the background so the child never lingers as a zombie —
        // liveness probing relies on the pid disappearing after exit.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(pid)
    }
}

pub struct Orchestrator {
    config: Config,
    kanban: KanbanStore,
    engine: Arc<LifecycleEngine>,
    merge: MergeCoordinator,
    queue: ConflictQueue,
    spawner: Arc<dyn WorkerSpawner>,
    main_pool: WorkerPool,
    priority_pool: WorkerPool,
    pending: PendingQueue,
    aging: AgingTracker,
    weights: PriorityWeights,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        engine: Arc<LifecycleEngine>,
        github: Arc<dyn GitHub>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        let kanban = KanbanStore::new(config.kanban_path(), config.plans_dir());
        let queue = ConflictQueue::new(config.conflict_queue_path());
        let merge = MergeCoordinator::new(github, Arc::clone(&engine));
        let main_pool = WorkerPool::new("main", config.max_workers);
        let priority_pool = WorkerPool::new("priority", config.max_priority_workers);
        let pending = PendingQueue::new(config.pool_pending_path());
        Self {
            config,
            kanban,
            engine,
            merge,
            queue,
            spawner,
            main_pool,
            priority_pool,
            pending,
            aging: AgingTracker::default(),
            weights: PriorityWeights::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked at the top of every tick; signal handlers set it.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The main loop. Returns when all tasks are terminal and no workers
    /// remain, or when shutdown is requested.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        self.restore_pools();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("shutdown requested: draining, leaving workers to finish");
                break;
            }
            self.tick().await?;
            if self.all_done()? {
                tracing::info!("all tasks terminal, scheduler exiting");
                break;
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
        self.persist_pools();
        Ok(())
    }

    /// One scheduler iteration.
    pub async fn tick(&mut self) -> Result<(), SchedulerError> {
        self.ingest_pending()?;
        self.reap().await?;
        self.schedule_main().await?;
        // Batch formation runs before priority spawning so freshly
        // conflicting PRs get the sequenced multi-PR pipeline, not two
        // simultaneous simple resolvers.
        self.coordinate_batches()?;
        self.schedule_priority().await?;
        self.process_merges().await?;
        self.display_status();
        Ok(())
    }

    fn restore_pools(&mut self) {
        let snapshot = PoolSnapshot::restore(&self.config.root.join("pool-state.json"));
        for entry in snapshot.entries {
            let pool_entry = PoolEntry::new(&entry.task_id, &entry.worker_dir, entry.pid);
            match entry.pool.as_str() {
                "priority" => self.priority_pool.insert(pool_entry),
                _ => self.main_pool.insert(pool_entry),
            }
        }
    }

    fn persist_pools(&self) {
        let snapshot = PoolSnapshot::capture(&[&self.main_pool, &self.priority_pool]);
        if let Err(e) = snapshot.save(&self.config.root.join("pool-state.json")) {
            tracing::warn!(error = %e, "could not persist pool state");
        }
    }

    /// Step 1: pool entries registered by sub-processes.
    fn ingest_pending(&mut self) -> Result<(), SchedulerError> {
        for entry in self.pending.drain().map_err(SchedulerError::Other)? {
            let pool_entry = PoolEntry::new(&entry.task_id, &entry.worker_dir, entry.pid);
            match entry.pool.as_str() {
                "priority" => self.priority_pool.insert(pool_entry),
                _ => self.main_pool.insert(pool_entry),
            }
        }
        Ok(())
    }

    /// Step 2: reap exited and timed-out children, then pick up orphaned
    /// workers (crashed in a previous orchestrator life).
    async fn reap(&mut self) -> Result<(), SchedulerError> {
        let min = self.config.reap_min_interval;
        let grace = std::time::Duration::from_secs(2);
        let reaped: Vec<Reaped> = self
            .main_pool
            .reap(min, self.config.stuck_worker_threshold, grace)
            .into_iter()
            .chain(
                self.priority_pool
                    .reap(min, self.config.resolve_worker_timeout, grace)
                    .into_iter(),
            )
            .collect();

        for event in reaped {
            match event {
                Reaped::Exited(entry) => {
                    self.aging.reset(&entry.task_id);
                    self.handle_worker_exit(&entry.worker_dir).await?;
                }
                Reaped::TimedOut(entry) => {
                    tracing::warn!(task = %entry.task_id, "worker killed after timeout");
                    if let Ok(worker) = WorkerDir::open(&entry.worker_dir) {
                        self.engine.emit_event(
                            &worker,
                            "worker.crashed",
                            "scheduler",
                            &serde_json::json!({"reason": "timeout"}),
                        )?;
                    }
                }
            }
        }

        self.recover_orphans().await?;
        Ok(())
    }

    /// Exited-worker callback: a child that died while still in a working
    /// state never reported an outcome, so it goes through resume.
    async fn handle_worker_exit(&mut self, worker_dir: &std::path::Path) -> Result<(), SchedulerError> {
        if !worker_dir.exists() {
            // Terminal effects archived it; nothing to do.
            return Ok(());
        }
        let worker = WorkerDir::open(worker_dir)?;
        let state = worker
            .git_state_store()
            .get_state()
            .map_err(SchedulerError::Other)?;
        if state.is_working() || state == LifecycleState::Created {
            self.resume_or_fail(&worker).await?;
        }
        Ok(())
    }

    /// Workers in a working state with no live agent and no pool entry:
    /// leftovers from a crash or restart.
    async fn recover_orphans(&mut self) -> Result<(), SchedulerError> {
        for worker in WorkerDir::list(&self.config.workers_dir()) {
            let task_id = worker.task_id().to_string();
            if self.main_pool.contains(&task_id) || self.priority_pool.contains(&task_id) {
                continue;
            }
            if worker.running_agent_pid().is_some() {
                continue;
            }
            let Ok(state) = worker.git_state_store().get_state() else {
                continue;
            };
            if state.is_working() || state == LifecycleState::Created {
                // Created workers that were never started are not orphans.
                let started = !worker
                    .git_state_store()
                    .load()
                    .map(|s| s.history.is_empty())
                    .unwrap_or(true);
                if state == LifecycleState::Created && !started {
                    continue;
                }
                self.resume_or_fail(&worker).await?;
            }
        }
        Ok(())
    }

    async fn resume_or_fail(&mut self, worker: &WorkerDir) -> Result<(), SchedulerError> {
        let resume_store = worker.resume_state_store();
        if resume_store.is_cooling() {
            return Ok(());
        }
        if resume_store.is_terminal() || resume_store.max_exceeded() {
            self.engine.emit_event(
                worker,
                "work.failed",
                "scheduler",
                &serde_json::json!({"reason": "worker crashed and resume budget exhausted"}),
            )?;
            return Ok(());
        }
        if self.main_pool.free_capacity() == 0 {
            return Ok(());
        }
        tracing::info!(task = %worker.task_id(), "resuming crashed worker");
        let pid = self
            .spawner
            .spawn(worker, true)
            .await
            .map_err(SchedulerError::Other)?;
        self.main_pool
            .insert(PoolEntry::new(worker.task_id(), worker.path(), pid));
        Ok(())
    }

    /// Step 3: fill main capacity with the best ready tasks.
    async fn schedule_main(&mut self) -> Result<(), SchedulerError> {
        let ready_set = self.kanban.get_ready_tasks(true)?;
        if !ready_set.cycles.is_empty() {
            tracing::warn!(cycles = ?ready_set.cycles, "tasks in dependency cycles are excluded");
        }

        // Aging observes everything ready this tick, picked or not.
        let ready_ids: Vec<String> = ready_set.ready.iter().map(|t| t.id.clone()).collect();
        self.aging.observe(&ready_ids);

        if self.main_pool.free_capacity() == 0 {
            return Ok(());
        }

        // One main worker per task: skip anything tracked or already owned
        // by a live worker directory.
        let candidates: Vec<Task> = ready_set
            .ready
            .into_iter()
            .filter(|t| !self.main_pool.contains(&t.id) && !self.priority_pool.contains(&t.id))
            .filter(|t| {
                WorkerDir::find_for_task(&self.config.workers_dir(), &t.id)
                    .map(|w| {
                        w.git_state_store()
                            .get_state()
                            .map(|s| s.is_terminal())
                            .unwrap_or(true)
                    })
                    .unwrap_or(true)
            })
            .collect();

        let depths: HashMap<String, u32> = candidates
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    self.kanban.get_dependency_depth(&t.id).unwrap_or(0),
                )
            })
            .collect();
        let ranked: Vec<Task> = rank(&candidates, &self.aging, &depths, &self.weights)
            .into_iter()
            .cloned()
            .collect();

        let mut active_files = self.active_file_sets();
        for task in ranked {
            if self.main_pool.free_capacity() == 0 {
                break;
            }
            let files = self.likely_files(&task.id);
            if !files.is_disjoint(&active_files) {
                tracing::debug!(task = %task.id, "deferred by file-conflict with an active worker");
                continue;
            }
            self.start_main_worker(&task).await?;
            active_files.extend(files);
        }
        Ok(())
    }

    async fn start_main_worker(&mut self, task: &Task) -> Result<(), SchedulerError> {
        let worker = WorkerDir::create(&self.config.workers_dir(), &task.id)
            .map_err(SchedulerError::Other)?;

        // Workspace: a worktree on a task branch. Failure is survivable in
        // repos without a remote; the workspace stays a plain directory.
        let slug = crate::util::slugify(&task.brief);
        let branch = worker.branch(&slug);
        let workspace = worker.workspace();
        let _ = std::fs::remove_dir(&workspace);
        if let Err(e) = crate::gitops::worktree_add(
            &self.config.project_dir,
            &workspace,
            &branch,
            &self.config.default_branch,
        ) {
            tracing::warn!(task = %task.id, error = %e, "worktree add failed, using plain workspace");
            let _ = std::fs::create_dir_all(&workspace);
        }

        // PRD: the kanban brief plus the plan when one exists.
        let mut prd = format!("# {}\n\n{}\n", task.id, task.brief);
        let plan_path = self.config.plans_dir().join(format!("{}-plan.md", task.id));
        if let Ok(plan) = std::fs::read_to_string(&plan_path) {
            prd.push_str("\n## PLAN\n\n");
            prd.push_str(&plan);
        }
        std::fs::write(worker.prd(), prd).map_err(|e| SchedulerError::Other(e.into()))?;

        let mut config = PipelineConfig::new(
            Pipeline::builtin("default").expect("default pipeline exists"),
        );
        config.flags.insert("needs_plan".into(), !task.has_plan);
        config
            .save(&worker.pipeline_config())
            .map_err(SchedulerError::Other)?;

        self.engine.emit_event(
            &worker,
            "worker.started",
            "scheduler",
            &serde_json::json!({"task": task.id}),
        )?;

        let pid = self
            .spawner
            .spawn(&worker, false)
            .await
            .map_err(SchedulerError::Other)?;
        tracing::info!(task = %task.id, pid, worker = %worker.name(), "main worker started");
        self.main_pool
            .insert(PoolEntry::new(&task.id, worker.path(), pid));
        self.aging.reset(&task.id);
        Ok(())
    }

    /// Step 4: fix and resolve workers in the priority pool.
    async fn schedule_priority(&mut self) -> Result<(), SchedulerError> {
        for worker in WorkerDir::list(&self.config.workers_dir()) {
            if self.priority_pool.free_capacity() == 0 {
                break;
            }
            let task_id = worker.task_id().to_string();
            if self.priority_pool.contains(&task_id) || self.main_pool.contains(&task_id) {
                continue;
            }
            if worker.running_agent_pid().is_some() {
                continue;
            }
            let Ok(state) = worker.git_state_store().get_state() else {
                continue;
            };
            match state {
                LifecycleState::NeedsFix => {
                    self.start_priority_worker(&worker, "fix", "fix.started").await?;
                }
                LifecycleState::NeedsResolve => {
                    self.start_priority_worker(&worker, "resolve", "resolve.started")
                        .await?;
                }
                LifecycleState::NeedsMultiResolve => {
                    self.start_priority_worker(&worker, "multi-pr-resolve", "resolve.started")
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn start_priority_worker(
        &mut self,
        worker: &WorkerDir,
        pipeline_name: &str,
        event: &str,
    ) -> Result<(), SchedulerError> {
        let mut config = PipelineConfig::new(
            Pipeline::builtin(pipeline_name).expect("builtin pipeline exists"),
        );
        if let Some(batch) = worker.batch_context() {
            config.flags.insert("batch_lead".into(), batch.position == 0);
        }
        config
            .save(&worker.pipeline_config())
            .map_err(SchedulerError::Other)?;

        self.engine
            .emit_event(worker, event, "scheduler", &serde_json::json!({}))?;
        let pid = self
            .spawner
            .spawn(worker, false)
            .await
            .map_err(SchedulerError::Other)?;
        tracing::info!(task = %worker.task_id(), pipeline = pipeline_name, pid, "priority worker started");
        self.priority_pool
            .insert(PoolEntry::new(worker.task_id(), worker.path(), pid));
        Ok(())
    }

    /// Step 5: group pending conflict entries into batches and notify the
    /// affected workers.
    fn coordinate_batches(&mut self) -> Result<(), SchedulerError> {
        for assignment in self.queue.group_into_batches()? {
            let Some(worker) =
                WorkerDir::find_for_task(&self.config.workers_dir(), &assignment.task_id)
            else {
                tracing::warn!(task = %assignment.task_id, "batched task has no live worker");
                continue;
            };
            worker
                .write_batch_context(&crate::worker::BatchContext {
                    batch_id: assignment.batch_id.clone(),
                    position: assignment.position,
                    total: assignment.total,
                })
                .map_err(SchedulerError::Other)?;
            self.engine.emit_event(
                &worker,
                "batch.assigned",
                "scheduler",
                &serde_json::json!({
                    "batch_id": assignment.batch_id,
                    "position": assignment.position,
                    "total": assignment.total,
                }),
            )?;
            tracing::info!(
                task = %assignment.task_id,
                batch = %assignment.batch_id,
                position = assignment.position,
                "conflict batch assigned"
            );
        }
        Ok(())
    }

    /// Step 6: attempt merges for workers waiting on one.
    async fn process_merges(&mut self) -> Result<(), SchedulerError> {
        for worker in WorkerDir::list(&self.config.workers_dir()) {
            if worker.git_state_store().is(LifecycleState::NeedsMerge)
                && !self.main_pool.contains(worker.task_id())
                && !self.priority_pool.contains(worker.task_id())
            {
                self.merge.process(&worker).await?;
            }
        }
        Ok(())
    }

    /// Step 7: status line for humans watching the run.
    fn display_status(&self) {
        let Ok(report) = self.kanban.report() else {
            return;
        };
        let style = console::Style::new().bold();
        println!(
            "{} {} pending / {} active / {} awaiting merge / {} done / {} failed | main {} prio {} | conflicts {}",
            style.apply_to("[foreman]"),
            report.pending,
            report.in_progress,
            report.pending_approval,
            report.done,
            report.failed,
            self.main_pool.len(),
            self.priority_pool.len(),
            self.queue.entries().map(|e| e.len()).unwrap_or(0),
        );
        for worker in WorkerDir::list(&self.config.workers_dir()) {
            if let Ok(state) = worker.git_state_store().load()
                && !state.last_error.is_empty()
            {
                // Only errors inside the configured max-age window.
                let recorded_at = state
                    .history
                    .last()
                    .map(|h| h.timestamp.clone())
                    .unwrap_or_else(|| state.updated_at.clone());
                if !within_max_age(&recorded_at, self.config.error_log_max_age) {
                    continue;
                }
                eprintln!(
                    "  {} {}: {}",
                    console::style("!").red(),
                    worker.task_id(),
                    state.last_error
                );
            }
        }
    }

    fn all_done(&self) -> Result<bool, SchedulerError> {
        let tasks = self.kanban.get_all_tasks()?;
        let kanban_done = tasks.iter().all(|t| t.status.is_terminal());
        Ok(kanban_done && self.main_pool.is_empty() && self.priority_pool.is_empty())
    }

    /// Files an unstarted task is likely to touch: path-looking tokens in
    /// its plan file.
    fn likely_files(&self, task_id: &str) -> HashSet<String> {
        let plan = self
            .config
            .plans_dir()
            .join(format!("{}-plan.md", task_id));
        let Ok(content) = std::fs::read_to_string(&plan) else {
            return HashSet::new();
        };
        PATHISH
            .find_iter(&content)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Union of likely-touched files across active main workers.
    fn active_file_sets(&self) -> HashSet<String> {
        self.main_pool
            .task_ids()
            .iter()
            .flat_map(|task_id| self.likely_files(task_id))
            .collect()
    }
}

/// Whether an RFC 3339 timestamp falls inside the max-age window.
/// Unparsable timestamps count as recent — hiding an error is worse than
/// repeating one.
fn within_max_age(timestamp: &str, max_age: std::time::Duration) -> bool {
    match chrono::DateTime::parse_from_rfc3339(timestamp) {
        Ok(recorded) => {
            let age = chrono::Utc::now().signed_duration_since(recorded);
            age.to_std().map(|age| age <= max_age).unwrap_or(true)
        }
        Err(_) => true,
    }
}
