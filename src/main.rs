use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use relay::backlog::{DiscoveryFeed, FsTaskStore, TaskStore};
use relay::config::Config;
use relay::core::{DependencyGraph, TaskId};
use relay::git::GitSourceControl;
use relay::orchestration::{
    health, AuditLog, Collaborators, HttpJobExecutor, Orchestrator, OrchestratorSettings,
    OrchestratorStatus,
};
use relay::queue::PriorityQueueManager;
use relay::state::{JsonFileStore, PoolSnapshot, QueueSnapshot, StateStore};
use relay::util::{Clock, SystemClock};
use relay::{rlog, rlog_error, Error, Result};

/// Relay - dependency-aware task orchestrator for remote coding workers
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RELAY_DEBUG=1          Enable debug logging (alternative to --debug)\n    RELAY_LOG_LEVEL        error, warn, info, debug or trace\n    RELAY_EXECUTOR_KEY     Executor API key (name configurable via executor.api_key_env)")]
pub struct Cli {
    /// Enable debug logging (writes to <state_dir>/relay.log and stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: <repo>/.relay/relay.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository root (default: current directory)
    #[arg(short = 'r', long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the scheduling loop until Ctrl-C
    Run,
    /// Show queue and worker pool state
    Status,
    /// Check queued entries and dependency cycles (exit 1 when unhealthy)
    Validate,
    /// Clear the queues and re-ingest every task file
    Rebuild,
}

fn main() {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            rlog_error!("{}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let repo = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let config = Config::load_for_repo(&repo, cli.config.as_deref())?;
    let truncate = cli.command == Command::Run;
    relay::log::init(&config.state_path(&repo), cli.debug, truncate);
    rlog!("Command {:?} repo={}", cli.command, repo.display());

    match cli.command {
        Command::Run => run(&repo, &config).map(|_| 0),
        Command::Status => status(&repo, &config).map(|_| 0),
        Command::Validate => validate(&repo, &config),
        Command::Rebuild => rebuild(&repo, &config).map(|_| 0),
    }
}

fn task_store(repo: &Path, config: &Config) -> Arc<FsTaskStore> {
    Arc::new(FsTaskStore::new(
        config.tasks_path(repo),
        config.done_path(repo),
    ))
}

fn open_queues(
    repo: &Path,
    config: &Config,
    tasks: Arc<FsTaskStore>,
) -> Result<PriorityQueueManager> {
    let store = Arc::new(JsonFileStore::<QueueSnapshot>::new(
        config.queue_state_file(repo),
    ));
    Ok(
        PriorityQueueManager::load(store, tasks, Arc::new(SystemClock))?
            .with_context_threshold(config.context_ratio_threshold),
    )
}

fn run(repo: &Path, config: &Config) -> Result<()> {
    let (endpoint, api_key) = config.executor_credentials()?;
    let scm = GitSourceControl::new(repo, &config.remote).map_err(|e| {
        Error::Config(format!("{} is not a usable git repository: {}", repo.display(), e))
    })?;
    let executor = HttpJobExecutor::new(endpoint, api_key)?;

    let mut settings = OrchestratorSettings::from(config);
    if settings.source.is_empty() {
        settings.source = repo.display().to_string();
    }

    let state_dir = config.state_path(repo);
    let collaborators = Collaborators {
        tasks: task_store(repo, config),
        scm: Arc::new(scm),
        executor: Arc::new(executor),
        clock: Arc::new(SystemClock),
        queue_store: Arc::new(JsonFileStore::new(config.queue_state_file(repo))),
        pool_store: Arc::new(JsonFileStore::new(config.pool_state_file(repo))),
        feed: Some(DiscoveryFeed::new(config.feed_path(repo))),
        audit: AuditLog::new(&state_dir),
    };

    println!("Relay running on {} ({} workers)", repo.display(), settings.workers);
    println!("Log: {}", state_dir.join("relay.log").display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut orchestrator = Orchestrator::new(settings, collaborators)?;
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                rlog!("Ctrl-C received");
                signal.cancel();
            }
        });
        orchestrator.run(shutdown).await
    })?;

    println!("Relay stopped");
    Ok(())
}

fn status(repo: &Path, config: &Config) -> Result<()> {
    let queues = JsonFileStore::<QueueSnapshot>::new(config.queue_state_file(repo))
        .load()?
        .unwrap_or_default();
    let pool = JsonFileStore::<PoolSnapshot>::new(config.pool_state_file(repo))
        .load()?
        .unwrap_or_default();
    print!("{}", OrchestratorStatus::from_snapshots(&queues, &pool));
    if let Some(updated) = queues.last_updated.max(pool.last_updated) {
        println!("Last updated: {}", updated.to_rfc3339());
    }
    Ok(())
}

fn validate(repo: &Path, config: &Config) -> Result<i32> {
    let tasks = task_store(repo, config);
    let mut queues = open_queues(repo, config, Arc::clone(&tasks))?;
    let settings = OrchestratorSettings::from(config);
    let mut healthy = true;

    match health::self_check(
        &mut queues,
        tasks.as_ref(),
        SystemClock.now(),
        &settings.health,
        false,
    ) {
        Ok(report) => {
            println!(
                "Queues: {} entries, {} invalid ({:.1}%)",
                report.total,
                report.invalid.len(),
                report.invalid_ratio() * 100.0
            );
            for entry in &report.invalid {
                println!("  {} [{}]: {}", entry.id, entry.queue, entry.reason);
            }
        }
        Err(e @ Error::QueueCorrupted { .. }) => {
            println!("{}", e);
            healthy = false;
        }
        Err(e) => return Err(e),
    }

    let mut graph = DependencyGraph::new();
    for id in tasks.list()? {
        if let Some(task) = tasks.load_task(&id) {
            graph.add(&task);
        }
    }
    let stats = graph.stats();
    println!(
        "Backlog: {} tasks, {} dependency edges",
        stats.total_tasks, stats.total_edges
    );
    let cycles = graph.cycle_groups();
    if cycles.is_empty() {
        println!("No dependency cycles");
    } else {
        healthy = false;
        for cycle in &cycles {
            let names: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            println!("Dependency cycle: {}", names.join(" -> "));
        }
    }

    Ok(if healthy { 0 } else { 1 })
}

fn rebuild(repo: &Path, config: &Config) -> Result<()> {
    let tasks = task_store(repo, config);
    let mut queues = open_queues(repo, config, Arc::clone(&tasks))?;
    let pool_store = JsonFileStore::<PoolSnapshot>::new(config.pool_state_file(repo));
    let mut pool = pool_store.load()?.unwrap_or_default();

    let mut exclude: HashSet<TaskId> = pool
        .slots
        .iter()
        .filter_map(|s| s.task_id().cloned())
        .collect();
    exclude.extend(pool.completed_task_ids.iter().cloned());

    queues.clear()?;
    pool.retries.clear();
    pool.dead_letters.clear();
    pool_store.save(&pool)?;

    let summary = queues.process_all(&tasks.list()?, &exclude)?;
    println!(
        "Rebuilt queues: scanned={} routed={} skipped={} errors={}",
        summary.scanned,
        summary.routed,
        summary.skipped,
        summary.errors.len()
    );
    for error in &summary.errors {
        println!("  {}: {}", error.task_ref, error.reason);
    }
    Ok(())
}
