use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crucible::config::CrucibleConfig;
use crucible::sandbox::{ContainerRunner, InsecureRunner, Sandbox};
use crucible::telemetry;
use crucible::worker::Worker;

mod doctor;
mod status;

/// Sandboxed task orchestrator for AI-generated code changes
///
/// crucible polls a filesystem task queue, runs each task's AI executor
/// and verification commands inside a locked-down container, scans every
/// byte of output for leaked secrets, and writes one durable result
/// record per task.
///
/// QUICK START:
///
///   # one-time: check your environment
///   crucible doctor
///
///   # drop a task file into the queue
///   cp my-task.json .crucible/tasks/fix-login.json
///
///   # process the queue once
///   crucible run --once
///
/// Tasks never touch your checkout: each runs in its own worktree on its
/// own branch, and the primary branch is never written to.
#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'crucible <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue worker
    ///
    /// Acquires the worker lock for the handoff root and processes tasks
    /// until stopped (SIGINT/SIGTERM) or, with --once, for a single
    /// pass. Requires a reachable container engine and a local sandbox
    /// image unless --insecure-runner is given.
    Run(RunArgs),

    /// Check system requirements and configuration
    ///
    /// Verifies that git and the container engine are available, the
    /// sandbox image is present, and the handoff root is writable.
    Doctor {
        /// Target repository (default: current directory)
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },

    /// Show a read-only queue summary
    ///
    /// Counts and ids per queue directory plus the current worker-lock
    /// holder. Takes no locks; safe to run next to a live worker.
    Status {
        /// Target repository (default: current directory)
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Target repository (default: current directory)
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Process the queue once and exit instead of polling
    #[arg(long)]
    once: bool,

    /// DANGER: run commands directly on the host instead of a container.
    /// Every result is stamped insecure_runner_used. Development only.
    #[arg(long)]
    insecure_runner: bool,
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_worker(&args),
        Commands::Doctor { repo } => doctor::run(&repo),
        Commands::Status { repo } => status::run(&repo),
    }
}

fn run_worker(args: &RunArgs) -> Result<()> {
    let repo = args
        .repo
        .canonicalize()
        .with_context(|| format!("repository path '{}' not found", args.repo.display()))?;
    let config = CrucibleConfig::load(&repo)?;

    let sandbox: Box<dyn Sandbox> = if args.insecure_runner {
        Box::new(InsecureRunner)
    } else {
        Box::new(ContainerRunner::new(&config.sandbox))
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("shutdown requested; finishing current task");
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let worker = Worker::new(repo, config, sandbox, shutdown);
    worker.run(args.once)
}
