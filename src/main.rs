use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use foreman::agent::{AgentHost, HostConfig};
use foreman::config::Config;
use foreman::errors::exit;
use foreman::kanban::KanbanStore;
use foreman::lifecycle::{
    EffectEnv, EffectRegistry, GuardRegistry, LifecycleEngine, LifecycleLimits, TransitionSpec,
};
use foreman::merge::{GhCli, GitHub};
use foreman::runtime::Runtime;
use foreman::scheduler::conflict::ConflictQueue;
use foreman::scheduler::{Orchestrator, ProcessSpawner};
use foreman::services::{ServiceDef, ServiceScheduler};
use foreman::worker::WorkerDir;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Multi-agent workload orchestrator")]
pub struct Cli {
    /// Increase verbosity (-v INFO, -vv DEBUG, -vvv TRACE)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .foreman layout and a kanban template
    Init,
    /// Run the orchestrator until all tasks are terminal
    Run {
        #[arg(long)]
        max_workers: Option<usize>,
        #[arg(long)]
        max_iters: Option<u32>,
        #[arg(long)]
        max_turns: Option<u32>,
    },
    /// Show kanban and worker status
    Status,
    /// Archive leftover workers and clear stale queues
    Clean {
        #[arg(long)]
        force: bool,
    },
    /// Check the environment for everything a run needs
    Doctor,
    /// Validate the kanban and worker pipeline configs
    Validate,
    /// Worker-process entry points (spawned by the orchestrator)
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Manually trigger review handling for a task
    Review {
        task: String,
        action: ReviewAction,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommands {
    Start {
        #[arg(long)]
        dir: PathBuf,
    },
    Resume {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ReviewAction {
    Fix,
    Resolve,
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let mut config = Config::from_env(&project_dir);
    let _log_guard = init_logging(&cli, &config);

    let code = match &cli.command {
        Commands::Init => cmd_init(&config)?,
        Commands::Run {
            max_workers,
            max_iters,
            max_turns,
        } => {
            if let Some(n) = max_workers {
                config.max_workers = *n;
            }
            if let Some(n) = max_iters {
                config.max_iters = *n;
            }
            if let Some(n) = max_turns {
                config.max_turns = *n;
            }
            cmd_run(config).await?
        }
        Commands::Status => cmd_status(&config)?,
        Commands::Clean { force } => cmd_clean(&config, *force)?,
        Commands::Doctor => cmd_doctor(&config),
        Commands::Validate => cmd_validate(&config),
        Commands::Worker { command } => cmd_worker(&config, command).await?,
        Commands::Review { task, action } => cmd_review(&config, task, *action).await?,
    };
    drop(_log_guard);
    std::process::exit(code);
}

fn init_logging(cli: &Cli, config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let level = if cli.quiet {
        "warn".to_string()
    } else {
        match cli.verbose {
            0 => std::env::var("LOG_LEVEL")
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|_| "info".into()),
            1 => "info".into(),
            2 => "debug".into(),
            _ => "trace".into(),
        }
    };
    let filter = EnvFilter::try_new(format!("foreman={}", level))
        .unwrap_or_else(|_| EnvFilter::new("foreman=info"));

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let appender = tracing_appender::rolling::never(
                dir,
                file.unwrap_or_else(|| "foreman.log".into()),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Shared wiring: the lifecycle engine with standard guards and effects,
/// the rebase guard backed by real git.
fn build_engine(config: &Config) -> Arc<LifecycleEngine> {
    let kanban = KanbanStore::new(config.kanban_path(), config.plans_dir());
    let queue = ConflictQueue::new(config.conflict_queue_path());
    let mut guards = GuardRegistry::standard();
    let default_branch = config.default_branch.clone();
    guards.register("rebase_onto_default_succeeds", move |ctx| {
        let workspace = ctx.worker.workspace();
        match foreman::gitops::rebase_onto_default(&workspace, &default_branch) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(error = %e, "rebase guard errored");
                false
            }
        }
    });
    let effects = EffectRegistry::standard(EffectEnv {
        kanban: kanban.clone(),
        conflict_queue: queue,
        archive_dir: config.archive_dir(),
    });
    Arc::new(LifecycleEngine::new(
        TransitionSpec::builtin(),
        guards,
        effects,
        kanban,
        LifecycleLimits {
            max_merge_attempts: config.max_merge_attempts,
            max_recovery_attempts: config.max_recovery_attempts,
        },
        config.outbox_enabled,
    ))
}

fn cmd_init(config: &Config) -> Result<i32> {
    for dir in [
        config.root.clone(),
        config.workers_dir(),
        config.archive_dir(),
        config.plans_dir(),
        config.logs_dir(),
        config.root.join("services"),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let kanban = config.kanban_path();
    if !kanban.exists() {
        std::fs::write(
            &kanban,
            "# Tasks\n\n- [ ] **[DEMO-001]** Replace me with a real task\n  \
             - Description: Example entry\n  - Priority: 50\n  - Dependencies: none\n",
        )?;
    }
    println!("Initialized foreman project at {}", config.root.display());
    Ok(exit::OK)
}

async fn cmd_run(config: Config) -> Result<i32> {
    let engine = build_engine(&config);
    let github: Arc<dyn GitHub> = Arc::new(GhCli::new(&config.project_dir));
    let spawner = Arc::new(ProcessSpawner {
        project_dir: config.project_dir.clone(),
    });
    let services_path = config.services_state_path();
    let service_defs = load_service_defs(&config);
    let mut orchestrator = Orchestrator::new(config, engine, github, spawner);

    let shutdown = orchestrator.shutdown_flag();
    tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, finishing current tick");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    // Housekeeping services tick alongside the main loop.
    let services_shutdown = Arc::clone(&shutdown);
    let services_task = tokio::spawn(async move {
        let mut scheduler = ServiceScheduler::new(service_defs, services_path);
        while !services_shutdown.load(Ordering::SeqCst) {
            if let Err(e) = scheduler.tick().await {
                tracing::warn!(error = %e, "service scheduler tick failed");
            }
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
    });

    let result = orchestrator.run().await;
    services_task.abort();
    match result {
        Ok(()) => Ok(exit::OK),
        Err(e) => {
            tracing::error!(error = %e, "orchestrator failed");
            Ok(exit::RUN_FAILED)
        }
    }
}

fn load_service_defs(config: &Config) -> Vec<ServiceDef> {
    let path = config.root.join("services").join("services.json");
    foreman::util::read_json(&path).unwrap_or_default()
}

fn cmd_status(config: &Config) -> Result<i32> {
    let kanban = KanbanStore::new(config.kanban_path(), config.plans_dir());
    let report = kanban.report()?;
    println!(
        "tasks: {} total | {} pending, {} in progress, {} awaiting merge, {} done, {} failed, {} not planned",
        report.total(),
        report.pending,
        report.in_progress,
        report.pending_approval,
        report.done,
        report.failed,
        report.not_planned,
    );
    for worker in WorkerDir::list(&config.workers_dir()) {
        let state = worker.git_state_store().load()?;
        println!(
            "  {} {} pr={} merge_attempts={}{}",
            worker.task_id(),
            state.current_state,
            state
                .pr
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            state.merge_attempts,
            if state.last_error.is_empty() {
                String::new()
            } else {
                format!(" error={}", state.last_error)
            }
        );
    }
    Ok(exit::OK)
}

fn cmd_clean(config: &Config, force: bool) -> Result<i32> {
    let mut archived = 0usize;
    for worker in WorkerDir::list(&config.workers_dir()) {
        let state = worker.git_state_store().get_state().unwrap_or_default();
        let idle = worker.running_agent_pid().is_none();
        if state.is_terminal() || (force && idle) {
            worker.archive(&config.archive_dir())?;
            archived += 1;
        }
    }
    // Stale lock files are safe to clear while nothing runs.
    for entry in std::fs::read_dir(&config.root).into_iter().flatten().flatten() {
        if entry.path().extension().is_some_and(|e| e == "lock") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    let _ = std::fs::remove_file(config.pool_pending_path());
    println!("archived {} workers", archived);
    Ok(exit::OK)
}

fn cmd_doctor(config: &Config) -> i32 {
    let mut failures = 0;
    let mut check = |name: &str, ok: bool, hint: &str| {
        if ok {
            println!("  ok   {}", name);
        } else {
            println!("  FAIL {} ({})", name, hint);
            failures += 1;
        }
    };

    check(
        "project is a git repository",
        foreman::gitops::is_git_workspace(&config.project_dir),
        "run from a git checkout",
    );
    check(
        "kanban.md present",
        config.kanban_path().exists(),
        "run `foreman init`",
    );
    check(
        "backend available",
        Runtime::from_config(config).is_ok(),
        "install the backend CLI or set RUNTIME_BACKEND",
    );
    check(
        "gh CLI on PATH",
        std::process::Command::new("gh")
            .arg("--version")
            .output()
            .is_ok(),
        "install GitHub CLI for PR operations",
    );

    if failures == 0 {
        println!("all checks passed");
        exit::OK
    } else {
        exit::INIT_FAILED
    }
}

fn cmd_validate(config: &Config) -> i32 {
    let kanban = KanbanStore::new(config.kanban_path(), config.plans_dir());
    let mut problems = 0;

    match kanban.get_ready_tasks(true) {
        Ok(ready) => {
            for cycle_member in &ready.cycles {
                println!("cyclic dependency: {}", cycle_member);
                problems += 1;
            }
        }
        Err(e) => {
            println!("kanban unreadable: {}", e);
            problems += 1;
        }
    }

    for worker in WorkerDir::list(&config.workers_dir()) {
        if worker.pipeline_config().exists()
            && let Err(e) = foreman::pipeline::PipelineConfig::load(&worker.pipeline_config())
        {
            println!("{}: bad pipeline config: {}", worker.task_id(), e);
            problems += 1;
        }
    }

    if problems == 0 {
        println!("validation passed");
        exit::OK
    } else {
        exit::VALIDATION_FAILED
    }
}

async fn cmd_worker(config: &Config, command: &WorkerCommands) -> Result<i32> {
    let (dir, resume) = match command {
        WorkerCommands::Start { dir } => (dir, false),
        WorkerCommands::Resume { dir } => (dir, true),
    };
    let worker = WorkerDir::open(dir)?;
    let engine = build_engine(config);
    let runtime = Arc::new(Runtime::from_config(config)?);
    let github: Arc<dyn GitHub> = Arc::new(GhCli::new(&config.project_dir));
    let host = AgentHost::new(runtime, github, HostConfig::from_config(config));
    let queue = ConflictQueue::new(config.conflict_queue_path());

    // On SIGINT/SIGTERM: mark the latest checkpoint interrupted, flush the
    // outbox, exit with the conventional code. Workers own their cleanup.
    let run = foreman::runner::run_worker(&engine, &host, &queue, &worker, resume);
    tokio::pin!(run);
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let code = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            interrupt_cleanup(&engine, &worker);
            exit::SIGINT
        }
        _ = sigterm.recv() => {
            interrupt_cleanup(&engine, &worker);
            exit::SIGTERM
        }
    };
    Ok(code)
}

fn interrupt_cleanup(engine: &LifecycleEngine, worker: &WorkerDir) {
    // Latest run directory's newest checkpoint gets the interrupted flag.
    if let Ok(entries) = std::fs::read_dir(worker.path().join("checkpoints")) {
        let mut runs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        runs.sort();
        if let Some(latest_run) = runs.pop() {
            let _ = foreman::agent::CheckpointStore::new(latest_run).mark_latest_interrupted();
        }
    }
    if let Err(e) = engine.replay_outbox(worker) {
        tracing::warn!(error = %e, "outbox flush on interrupt failed");
    }
    worker.clear_agent_pid();
}

async fn cmd_review(config: &Config, task: &str, action: ReviewAction) -> Result<i32> {
    let Some(worker) = WorkerDir::find_for_task(&config.workers_dir(), task) else {
        eprintln!("no live worker for task {}", task);
        return Ok(exit::WORKER_TASK_NOT_FOUND);
    };
    let engine = build_engine(config);
    match action {
        ReviewAction::Fix => {
            engine.emit_event(
                &worker,
                "review.changes_requested",
                "cli",
                &serde_json::json!({"reason": "manual review fix request"}),
            )?;
            println!("{} queued for fix", task);
        }
        ReviewAction::Resolve => {
            engine.emit_event(
                &worker,
                "merge.conflict",
                "cli",
                &serde_json::json!({"files": [], "reason": "manual resolve request"}),
            )?;
            println!("{} queued for resolve", task);
        }
        ReviewAction::Sync => {
            let state = worker.git_state_store().load()?;
            let Some(pr) = state.pr else {
                eprintln!("{} has no PR to sync", task);
                return Ok(exit::REVIEW_FAILED);
            };
            let github = GhCli::new(&config.project_dir);
            let reviews = github.list_reviews(pr).await?;
            let changes_requested = reviews
                .iter()
                .any(|r| r.state.eq_ignore_ascii_case("changes_requested"));
            if changes_requested {
                engine.emit_event(
                    &worker,
                    "review.changes_requested",
                    "review-sync",
                    &serde_json::json!({"pr": pr}),
                )?;
                println!("{}: changes requested, queued for fix", task);
            } else {
                println!("{}: {} reviews, none blocking", task, reviews.len());
            }
        }
    }
    Ok(exit::OK)
}
