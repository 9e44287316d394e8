//! autotestd — the autotest scheduler daemon.
//!
//! Single binary that assembles the scheduler:
//! - State store (redb)
//! - Drone manager and drones
//! - Host scheduler with metahost plugins
//! - Dispatcher tick loop
//!
//! # Usage
//!
//! ```text
//! autotestd run --config /etc/autotest/scheduler.toml --data-dir /var/lib/autotest
//! autotestd check-config --config /etc/autotest/scheduler.toml
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use autotest_core::SchedulerConfig;
use autotest_drone::DefaultDroneFactory;
use autotest_scheduler::{AdminAlerts, Dispatcher, DroneManager, HostScheduler};
use autotest_state::{SchedulerDb, StateStore};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "/etc/autotest/scheduler.toml";

#[derive(Parser)]
#[command(name = "autotestd", about = "Autotest scheduler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Run {
        /// Scheduler configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/autotest")]
        data_dir: PathBuf,
    },
    /// Parse the configuration and print the effective drone settings.
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,autotestd=debug,autotest=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => run(&config, &data_dir).await,
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            print!("{}", describe_drones(&config));
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<SchedulerConfig> {
    SchedulerConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

async fn run(config_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    info!("autotest scheduler starting");
    let config = load_config(config_path)?;

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("autotest.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    let db: Arc<dyn SchedulerDb> = Arc::new(state);

    let factory = Arc::new(DefaultDroneFactory::new(
        config.scheduler.max_transfer_processes as usize,
    ));
    let mut drone_manager = DroneManager::new(config.clone(), factory, AdminAlerts::new())
        .with_config_path(config_path);
    drone_manager
        .initialize(
            &config.scheduler.results_dir,
            &config.scheduler.drones,
            &config.scheduler.results_host,
        )
        .await?;
    info!(drones = drone_manager.drones().count(), "drone manager initialized");

    let host_scheduler = HostScheduler::new(
        db.clone(),
        Vec::new(),
        &config.site_metahost_scheduler_names(),
    );

    let mut dispatcher = Dispatcher::new(db, drone_manager, host_scheduler);
    dispatcher.initialize().await?;
    info!("dispatcher initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let result = dispatcher.run(shutdown_rx).await;
    dispatcher.shutdown().await;

    info!("autotest scheduler stopped");
    Ok(result?)
}

/// One line per drone, plus the results repository.
fn describe_drones(config: &SchedulerConfig) -> String {
    let mut out = String::new();
    for hostname in &config.scheduler.drones {
        let settings = config.drone_settings(hostname);
        let users = settings
            .allowed_users
            .map(|users| users.into_iter().collect::<Vec<_>>().join(" "))
            .unwrap_or_else(|| "*".to_string());
        let _ = writeln!(
            out,
            "{hostname}: enabled={} max_processes={} users={users} username={}",
            settings.enabled,
            settings.max_processes,
            settings.username.as_deref().unwrap_or("-"),
        );
    }
    let _ = writeln!(
        out,
        "results repository: {} ({})",
        config.scheduler.results_host,
        config.scheduler.results_dir.display()
    );
    out
}
