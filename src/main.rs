//! emsm - Minecraft world and server manager
//!
//! # Architecture Overview
//!
//! ```text
//!     emsm serve -w foo -w bar
//!        │
//!        ▼
//!  ┌────────────┐   ┌──────────────┐   ┌─────────────────────────────┐
//!  │   config   │──▶│   manager    │──▶│ process (one supervisor per │
//!  │ main.conf  │   │ WorldManager │   │ world, sh -c "exec ...")    │
//!  │ server.conf│   └──────┬───────┘   └─────────────────────────────┘
//!  │ worlds.conf│          │
//!  └────────────┘          ▼
//!               ┌─────────────────────┐   ┌──────────────────────────┐
//!               │ lifecycle::lock     │   │ net::port, provision,     │
//!               │ emsm.lock (flock)   │──▶│ registry emsm_state.json  │
//!               └─────────────────────┘   └──────────────────────────┘
//! ```
//!
//! Worlds started by `serve` stay children of that process. SIGINT/SIGTERM
//! stop them gracefully, SIGHUP restarts them. `stop` only reaches worlds
//! whose `serve` process died.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use emsm::config::{load_config, Configuration, InstancePaths, Selection};
use emsm::lifecycle::signals::{SignalEvent, Signals};
use emsm::lifecycle::startup::{ensure_user, UserCheck};
use emsm::lifecycle::Shutdown;
use emsm::manager::{
    BatchReport, CrashMonitor, UninstallReport, UpdateReport, WorldManager, WorldStatus,
};
use emsm::observability::logging;
use emsm::process::ShellLauncher;
use emsm::provision::HttpFetcher;

type Manager = WorldManager<ShellLauncher, HttpFetcher>;

#[derive(Parser)]
#[command(name = "emsm")]
#[command(about = "Manage Minecraft worlds and server executables", version)]
struct Cli {
    /// Instance root holding conf/, server/ and worlds/
    #[arg(long, env = "EMSM_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(flatten)]
    targets: Targets,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Targets {
    /// Select a world (repeatable)
    #[arg(short = 'w', long = "world", global = true)]
    worlds: Vec<String>,

    /// Select every world
    #[arg(short = 'W', long = "all-worlds", global = true)]
    all_worlds: bool,

    /// Select a server (repeatable)
    #[arg(short = 's', long = "server", global = true)]
    servers: Vec<String>,

    /// Select every server
    #[arg(short = 'S', long = "all-servers", global = true)]
    all_servers: bool,
}

impl Targets {
    fn worlds(&self) -> Selection {
        Selection {
            names: self.worlds.clone(),
            all: self.all_worlds,
        }
    }

    fn servers(&self) -> Selection {
        Selection {
            names: self.servers.clone(),
            all: self.all_servers,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the selected worlds and supervise them in the foreground
    ///
    /// There is no separate restart command: send SIGHUP to this process to
    /// restart its worlds, SIGINT or SIGTERM to stop them and exit.
    #[command(alias = "start")]
    Serve,
    /// Stop selected worlds left running by a `serve` process that died
    ///
    /// Worlds of a live `serve` process are stopped by signalling it.
    Stop,
    /// Show which worlds are running, on which port and under which pid
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration with rejected sections and warnings
    Configuration,
    /// Download the executables of the selected servers again, skipping
    /// servers with a world that does not stop in time
    Update,
    /// Like update, but kill worlds that do not stop in time
    ForceUpdate,
    /// Remove the selected servers, moving their worlds to another one
    Uninstall {
        /// Server the worlds of the removed servers switch to
        #[arg(long)]
        replacement: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let paths = InstancePaths::new(&cli.root);
    let config = load_config(&paths)?;

    logging::init(config.global.loglevel);
    tracing::info!(root = %paths.root().display(), "emsm v{} starting", env!("CARGO_PKG_VERSION"));

    match ensure_user(&config.global.user)? {
        UserCheck::Matches => {}
        UserCheck::Switched { uid, gid } => {
            tracing::info!(user = %config.global.user, uid, gid, "Dropped privileges")
        }
        UserCheck::Mismatch { current_uid } => tracing::warn!(
            user = %config.global.user,
            current_uid,
            "Not running as the configured user"
        ),
    }

    match cli.command {
        Commands::Configuration => Ok(print_configuration(&config)?),
        Commands::Status { json } => {
            let worlds = if cli.targets.worlds().is_empty() {
                config.world_names()
            } else {
                cli.targets.worlds().resolve("world", &config.world_names())?
            };
            let manager = WorldManager::new(config, ShellLauncher, HttpFetcher::new()?);
            print_status(&manager, &worlds, json)
        }
        Commands::Update => update(config, cli.targets.servers(), false).await,
        Commands::ForceUpdate => update(config, cli.targets.servers(), true).await,
        Commands::Uninstall { replacement } => {
            let servers = cli.targets.servers().resolve("server", &config.server_names())?;
            let manager = WorldManager::new(config, ShellLauncher, HttpFetcher::new()?);
            let mut success = true;
            for server in servers {
                match manager.uninstall_server(&server, &replacement).await {
                    Ok(report) => print_uninstall(&report),
                    Err(e) => {
                        println!("{} - uninstall: failure: {}", server, e);
                        success = false;
                    }
                }
            }
            Ok(exit_code(success))
        }
        Commands::Stop => {
            let worlds = cli.targets.worlds().resolve("world", &config.world_names())?;
            let manager = WorldManager::new(config, ShellLauncher, HttpFetcher::new()?);
            let stopped = manager.stop_all(&worlds).await;
            print_batch("stop", &stopped);
            Ok(exit_code(stopped.is_success()))
        }
        Commands::Serve => {
            let worlds = cli.targets.worlds().resolve("world", &config.world_names())?;
            let manager = Arc::new(WorldManager::new(config, ShellLauncher, HttpFetcher::new()?));
            serve(manager, &worlds).await
        }
    }
}

async fn serve(manager: Arc<Manager>, worlds: &[String]) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut signals = Signals::register()?;
    let started = manager.start_all(worlds).await;
    print_batch("start", &started);
    let mut success = started.is_success();

    if manager.supervised_worlds().is_empty() {
        tracing::error!("No world is running, nothing to supervise");
        return Ok(exit_code(false));
    }

    let shutdown = Shutdown::new();
    let monitor = tokio::spawn(CrashMonitor::new(Arc::clone(&manager)).run(shutdown.subscribe()));

    loop {
        match signals.next().await {
            SignalEvent::Restart => {
                let restarted = manager.restart_all(&manager.supervised_worlds()).await;
                print_batch("restart", &restarted);
            }
            SignalEvent::Shutdown => break,
        }
    }

    shutdown.trigger();
    let stopped = manager.stop_all(&manager.supervised_worlds()).await;
    print_batch("stop", &stopped);
    success &= stopped.is_success();

    match monitor.await {
        Ok(crashes) if !crashes.is_empty() => {
            tracing::warn!(count = crashes.len(), "Worlds crashed while serving");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Crash monitor task failed"),
    }

    tracing::info!("Shutdown complete");
    Ok(exit_code(success))
}

async fn update(
    config: Configuration,
    selection: Selection,
    force: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let servers = selection.resolve("server", &config.server_names())?;
    let manager = WorldManager::new(config, ShellLauncher, HttpFetcher::new()?);
    let mut success = true;
    for server in servers {
        let report = manager.update_server(&server, force).await?;
        print_update(&report);
        success &= report.is_success();
    }
    Ok(exit_code(success))
}

fn print_batch(action: &str, batch: &BatchReport) {
    for report in &batch.reports {
        println!("{} - {}", action, report);
    }
}

fn print_update(report: &UpdateReport) {
    print_batch(&format!("{} - update: stop", report.server), &report.stopped);
    match &report.download {
        Some(Ok(path)) => println!("{} - update: downloaded {}", report.server, path.display()),
        Some(Err(e)) => println!("{} - update: failure: {}", report.server, e),
        None => println!("{} - update: skipped, not every world could be stopped", report.server),
    }
    print_batch(&format!("{} - update: start", report.server), &report.restarted);
}

fn print_uninstall(report: &UninstallReport) {
    println!(
        "{} - uninstall: removed, worlds moved to '{}': {}",
        report.server,
        report.replacement,
        if report.worlds.is_empty() {
            "none".to_string()
        } else {
            report.worlds.join(", ")
        }
    );
    if report.executable_removed {
        println!("{} - uninstall: executable deleted", report.server);
    }
}

fn print_status(manager: &Manager, worlds: &[String], json: bool) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let statuses: Vec<WorldStatus> = worlds
        .iter()
        .map(|w| manager.status(w))
        .collect::<Result<_, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(ExitCode::SUCCESS);
    }
    for status in &statuses {
        let port = status.port().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let pid = status
            .registered
            .as_ref()
            .map(|e| e.pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let note = if status.orphaned { " (orphaned)" } else { "" };
        println!(
            "{:<20} {:<10} port {:<6} pid {}{}",
            status.local.world,
            status.phase(),
            port,
            pid,
            note
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_configuration(config: &Configuration) -> Result<ExitCode, serde_json::Error> {
    let failures: Vec<String> = config.failures.iter().map(|e| e.to_string()).collect();
    let warnings: Vec<String> = config.warnings.iter().map(|w| w.to_string()).collect();
    let document = json!({
        "emsm": config.global,
        "servers": config.servers,
        "worlds": config.worlds,
        "failures": failures,
        "warnings": warnings,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(exit_code(config.failures.is_empty()))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
