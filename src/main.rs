use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge::config::{CliOverrides, Config};
use forge::engine::{AgentEngine, SubprocessEngine};
use forge::store::SessionStore;
use forge::worktree::{GitWorktreeManager, WorktreeManager};
use forge::{Executor, RunEvent};

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "Autonomous development orchestrator")]
struct Cli {
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    fast: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a phase from scratch
    Run {
        project: String,
        phase: String,
    },
    /// Resume the most recently interrupted session for project/phase
    Resume {
        project: String,
        phase: String,
    },
    /// Print the execution plan for a phase without running anything
    DryRun {
        phase: String,
    },
    /// Show the active session for project/phase, if any
    Status {
        project: String,
        phase: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    let overrides = CliOverrides {
        fast: if cli.fast { Some(true) } else { None },
        ..Default::default()
    };
    let config = Config::load(project_dir, overrides).context("failed to load configuration")?;
    config.ensure_directories()?;
    let _log_guard = forge::logging::init(&config.log_dir, cli.verbose)?;

    match &cli.command {
        Commands::Run { project, phase } => cmd_run(config, project, phase).await,
        Commands::Resume { project, phase } => cmd_resume(config, project, phase).await,
        Commands::DryRun { phase } => cmd_dry_run(config, phase),
        Commands::Status { project, phase } => cmd_status(config, project, phase),
    }
}

fn build_executor(config: Config) -> Result<Executor> {
    let store = SessionStore::open(&config.session_db).context("failed to open session store")?;
    let engine: Arc<dyn AgentEngine> = Arc::new(SubprocessEngine::new(
        config.agent_cmd.clone(),
        Vec::new(),
        config.dangerously_skip_permissions,
        config.model.clone(),
    ));
    let worktrees: Arc<dyn WorktreeManager> = Arc::new(GitWorktreeManager::new(config.project_root.clone()));
    Ok(Executor::new(config, engine, worktrees, store))
}

async fn cmd_run(config: Config, project: &str, phase: &str) -> Result<()> {
    let (executor, mut events) = build_executor(config)?.with_event_channel(64);
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let session = executor.run(project, phase).await;
    drop(executor);
    let _ = printer.await;

    match session {
        Ok(session) => {
            if session.failed_tasks.is_empty() {
                println!("phase {} complete: {} task(s) done", phase, session.completed_tasks.len());
                Ok(())
            } else {
                println!(
                    "phase {} stopped: {} failed, {} completed — run `forge resume {} {}` to continue",
                    phase,
                    session.failed_tasks.len(),
                    session.completed_tasks.len(),
                    project,
                    phase
                );
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("run failed: {e} — run `forge resume {project} {phase}` to continue");
            std::process::exit(1);
        }
    }
}

async fn cmd_resume(config: Config, project: &str, phase: &str) -> Result<()> {
    let (executor, mut events) = build_executor(config)?.with_event_channel(64);
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let session = executor.resume(project, phase).await;
    drop(executor);
    let _ = printer.await;

    match session {
        Ok(Some(session)) => {
            if session.failed_tasks.is_empty() {
                println!("phase {} complete: {} task(s) done", phase, session.completed_tasks.len());
                Ok(())
            } else {
                println!(
                    "phase {} stopped: {} failed, {} completed — run `forge resume {} {}` to continue",
                    phase,
                    session.failed_tasks.len(),
                    session.completed_tasks.len(),
                    project,
                    phase
                );
                std::process::exit(1);
            }
        }
        Ok(None) => {
            println!("no active session for {project}/{phase}");
            Ok(())
        }
        Err(e) => {
            eprintln!("resume failed: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_dry_run(config: Config, phase: &str) -> Result<()> {
    let executor = build_executor(config)?;
    let plan = executor.dry_run(phase)?;
    if plan.is_empty() {
        println!("no tasks found for phase {phase}");
        return Ok(());
    }
    println!("{:<6} {:<14} {:<8} {:<8} dependencies", "wave", "task", "group", "hours");
    for entry in plan {
        println!(
            "{:<6} {:<14} {:<8} {:<8} {}",
            entry.wave,
            entry.task_id,
            entry.parallel_group,
            entry.estimate_hours,
            entry.dependencies.join(", ")
        );
    }
    Ok(())
}

fn cmd_status(config: Config, project: &str, phase: &str) -> Result<()> {
    let store = SessionStore::open(&config.session_db).context("failed to open session store")?;
    match store.find_active_session(project, phase)? {
        Some(session) => {
            println!("session {} ({}/{})", session.id, session.project, session.phase);
            println!("  pending:   {}", session.pending_tasks.len());
            println!("  completed: {}", session.completed_tasks.len());
            println!("  failed:    {}", session.failed_tasks.len());
            if let Some(current) = &session.current_task {
                println!("  current:   {current}");
            }
        }
        None => println!("no active session for {project}/{phase}"),
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::WaveStarted { wave, tasks } => {
            println!("wave {wave}: {} task(s)", tasks.len());
        }
        RunEvent::TaskStarted { task_id } => {
            println!("  {task_id} started");
        }
        RunEvent::TaskCompleted { task_id, success } => {
            println!("  {task_id} {}", if *success { "done" } else { "failed" });
        }
        RunEvent::WaveCompleted { wave, failed } => {
            println!("wave {wave} complete ({failed} failed)");
        }
        RunEvent::RunCompleted { success } => {
            println!("run {}", if *success { "complete" } else { "stopped" });
        }
    }
}
