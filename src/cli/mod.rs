#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::Paths;
use crate::config::machine::MachineIdentity;
use crate::config::projects::{ProjectRegistry, normalize_repo_url};
use crate::core::git::Git;
use crate::daemon;
use crate::daemon::logging;
use crate::daemon::status::read_snapshot;
use crate::task::runner::format_duration;
use crate::task::supervisor::SupervisorConfig;

#[derive(Debug, Parser)]
#[command(name = "pushd", version, about = "Push task execution daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Run(RunArgs),
    /// Start the daemon in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Start the daemon if needed, restarting on a version change
    Ensure,
    /// Show daemon and task status
    Status(StatusArgs),
    /// Manage the project registry
    Project(ProjectArgs),
    /// Print version and machine identity
    Version,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Seconds between scheduler ticks
    #[arg(long = "poll-interval", default_value_t = 30)]
    pub poll_interval_secs: u64,
    /// Maximum concurrently supervised tasks
    #[arg(long = "max-concurrent", default_value_t = daemon::MAX_CONCURRENT)]
    pub max_concurrent: usize,
    /// Coding agent executable
    #[arg(long, default_value = "claude")]
    pub agent: String,
    /// Comma-separated tool allowlist passed to the agent
    #[arg(long = "allowed-tools")]
    pub allowed_tools: Option<String>,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output the raw status file as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ProjectArgs {
    #[command(subcommand)]
    pub cmd: ProjectCommands,
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommands {
    /// Register a local checkout for task execution
    Register {
        /// Path to the repository (defaults to the current directory)
        path: Option<PathBuf>,
    },
    /// List registered projects
    List,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match Paths::resolve() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("pushd: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.cmd {
        Commands::Run(args) => run_daemon(paths, args, true).await,
        Commands::Start => {
            logging::init_console();
            match daemon::start(&paths).await {
                Ok(true) => {
                    println!("daemon started");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("daemon already running");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("pushd: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Stop => {
            logging::init_console();
            match daemon::stop(&paths).await {
                Ok(true) => {
                    println!("daemon stopped");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("daemon was not running");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("pushd: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Ensure => {
            logging::init_console();
            match daemon::ensure_running(&paths).await {
                Ok(true) => {
                    println!("daemon started");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("daemon up to date");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("pushd: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Status(args) => print_status(&paths, args.json),
        Commands::Project(args) => {
            logging::init_console();
            match args.cmd {
                ProjectCommands::Register { path } => register_project(&paths, path).await,
                ProjectCommands::List => list_projects(&paths),
            }
        }
        Commands::Version => {
            println!("pushd {}", env!("CARGO_PKG_VERSION"));
            if let Ok(machine) = MachineIdentity::load_or_create(&paths) {
                println!("machine {}", machine.machine_id);
            }
            ExitCode::SUCCESS
        }
    }
}

/// The daemon surface always exits 0; the log and status file are the
/// observability surface for failures.
async fn run_daemon(paths: Paths, args: RunArgs, mirror_stderr: bool) -> ExitCode {
    let opts = daemon::DaemonOptions {
        poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
        max_concurrent: args.max_concurrent.max(1),
        supervisor: SupervisorConfig {
            agent_executable: args.agent,
            allowed_tools: args.allowed_tools,
            ..SupervisorConfig::default()
        },
        mirror_stderr,
    };
    match tokio::spawn(daemon::run(paths, opts)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            eprintln!("pushd: {e}");
            tracing::error!(error = %e, "daemon exited with error");
        }
        Err(e) => {
            eprintln!("pushd: daemon crashed: {e}");
            tracing::error!(error = %e, "daemon crashed");
        }
    }
    ExitCode::SUCCESS
}

fn print_status(paths: &Paths, json: bool) -> ExitCode {
    let snapshot = read_snapshot(&paths.status_file());

    if json {
        match snapshot {
            Some(snapshot) => println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_owned())
            ),
            None => println!("{{}}"),
        }
        return ExitCode::SUCCESS;
    }

    let Some(snapshot) = snapshot else {
        println!("Daemon: OFFLINE");
        println!();
        println!("Run 'pushd start' to start the daemon.");
        return ExitCode::SUCCESS;
    };

    let alive = snapshot.running && daemon::pid_alive(snapshot.daemon.pid);
    if alive {
        println!(
            "Daemon: ONLINE (v{}, pid {})",
            snapshot.daemon.version, snapshot.daemon.pid
        );
    } else {
        println!("Daemon: OFFLINE");
    }
    println!("Machine: {}", snapshot.daemon.machine_name);
    println!();

    if snapshot.running_tasks.is_empty() && snapshot.queued_tasks.is_empty() {
        println!("No active tasks");
    }
    if !snapshot.running_tasks.is_empty() {
        println!("Running ({}):", snapshot.running_tasks.len());
        for task in &snapshot.running_tasks {
            let elapsed = task
                .elapsed_seconds
                .map(format_duration)
                .unwrap_or_default();
            println!("  ● #{} {} ({elapsed})", task.display_number, task.summary);
            if let Some(detail) = &task.detail {
                println!("    └─ {detail}");
            }
        }
    }
    if !snapshot.queued_tasks.is_empty() {
        println!("Queued ({}):", snapshot.queued_tasks.len());
        for task in &snapshot.queued_tasks {
            println!("  ○ #{} {}", task.display_number, task.summary);
        }
    }

    println!();
    println!(
        "Completed today: {} | Slots: {}/{}",
        snapshot.stats.completed_today, snapshot.stats.running, snapshot.stats.max_concurrent
    );
    ExitCode::SUCCESS
}

async fn register_project(paths: &Paths, path: Option<PathBuf>) -> ExitCode {
    let dir = path.unwrap_or_else(|| PathBuf::from("."));
    let dir = match dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("pushd: cannot resolve {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    };

    let git = Git::new(dir.clone());
    if !git.is_repository().await {
        eprintln!("pushd: {} is not a git repository", dir.display());
        return ExitCode::FAILURE;
    }
    let remote = match git.remote_url().await {
        Ok(remote) => remote,
        Err(e) => {
            eprintln!("pushd: cannot read origin remote: {e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(repo_url) = normalize_repo_url(&remote) else {
        eprintln!("pushd: cannot normalize remote '{remote}'");
        return ExitCode::FAILURE;
    };

    let mut registry = ProjectRegistry::load(paths);
    registry.register(&repo_url, &dir);
    if let Err(e) = registry.save(paths) {
        eprintln!("pushd: {e}");
        return ExitCode::FAILURE;
    }
    println!("registered {repo_url} -> {}", dir.display());
    ExitCode::SUCCESS
}

fn list_projects(paths: &Paths) -> ExitCode {
    let registry = ProjectRegistry::load(paths);
    if registry.projects.is_empty() {
        println!("no projects registered");
        return ExitCode::SUCCESS;
    }
    for (repo_url, entry) in &registry.projects {
        let default = registry.default_project.as_deref() == Some(repo_url.as_str());
        let marker = if default { "*" } else { " " };
        println!("{marker} {repo_url} -> {}", entry.local_path);
    }
    ExitCode::SUCCESS
}
