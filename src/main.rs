//! Headless front end for the capture pipeline.

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use blinkwatch::{
    auth::{AllowList, CredentialCheck},
    init_logging,
    settings::default_settings_path,
    PipelineCoordinator, PipelineEvent, SettingsStore,
};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "blinkwatch")]
#[command(version)]
#[command(about = "Blink-rate and host telemetry capture with offline-first sync", long_about = None)]
struct Cli {
    /// Settings file (created with defaults when missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor until Ctrl-C or until the duration elapses
    Run {
        #[arg(long)]
        user: String,

        /// Required when the settings carry a credential list
        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Session and host aggregates for a user
    Stats {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Run one sync attempt now
    Sync,

    /// Store counters and recent sync attempts
    Status {
        #[arg(long, default_value = "10")]
        log_entries: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let store = SettingsStore::new(cli.config.unwrap_or_else(default_settings_path))?;
    let settings = store.get();
    info!("Settings loaded from {}", store.path().display());

    match cli.command {
        Commands::Run {
            user,
            password,
            duration_secs,
        } => {
            let check = AllowList::from_settings(&settings);
            if !check.authenticate(&user, password.as_deref().unwrap_or_default()) {
                bail!("invalid credentials for {user}");
            }
            let coordinator = PipelineCoordinator::open(settings)?;
            cmd_run(&coordinator, &user, duration_secs.map(Duration::from_secs)).await
        }
        Commands::Stats { user, days } => {
            let coordinator = PipelineCoordinator::open(settings)?;
            print_json(&coordinator.stats(&user, days).await)
        }
        Commands::Sync => {
            let coordinator = PipelineCoordinator::open(settings)?;
            match coordinator.sync_now().await {
                Some(status) => print_json(&status),
                None => bail!("a sync is already running"),
            }
        }
        Commands::Status { log_entries } => {
            let coordinator = PipelineCoordinator::open(settings)?;
            #[derive(Serialize)]
            struct Status {
                database: blinkwatch::db::DatabaseStats,
                recent_syncs: Vec<blinkwatch::db::SyncLogEntry>,
            }
            print_json(&Status {
                database: coordinator.database_stats().await,
                recent_syncs: coordinator.recent_sync_log(log_entries).await,
            })
        }
    }
}

async fn cmd_run(
    coordinator: &PipelineCoordinator,
    user: &str,
    duration: Option<Duration>,
) -> Result<()> {
    let mut events = coordinator.subscribe();
    coordinator.start().await;
    coordinator.start_monitoring(user).await?;

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; stopping");
                break;
            }
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(PipelineEvent::MetricsUpdated { metrics }) => {
                    let blink = coordinator.blink_data();
                    println!(
                        "{} | blinks {} ({:.1}/min, {:?}) | cpu {:.0}% mem {:.0}% net {}",
                        blink.session_duration,
                        blink.total_blinks,
                        blink.blinks_per_minute,
                        blink.strain_level,
                        metrics.cpu_percent,
                        metrics.memory_percent,
                        if metrics.network_available { "up" } else { "down" },
                    );
                }
                Ok(PipelineEvent::Sync { status }) => println!("sync: {status}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} pipeline events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let summary = coordinator.stop_monitoring().await;
    coordinator.shutdown().await;
    if let Some(summary) = summary {
        print_json(&summary)?;
    }
    Ok(())
}
