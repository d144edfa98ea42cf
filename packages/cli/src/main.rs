//! `runnerctl` — operator entry point for the orchestrator core: start the
//! control plane in the foreground, or replay a stuck webhook delivery
//! against a running instance's database.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_core::{Config, System};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "runnerctl")]
#[command(about = "Operate the self-hosted runner orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane in the foreground until Ctrl-C.
    Start,
    /// Request a graceful shutdown of the leader-held distributed lock, then exit.
    Shutdown,
    /// Re-run a stored webhook delivery's handler using its persisted payload.
    Replay {
        /// The `X-GitHub-Delivery` id to replay.
        delivery_id: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start().await,
        Commands::Shutdown => run_shutdown().await,
        Commands::Replay { delivery_id } => run_replay(&delivery_id).await,
    }
}

async fn run_start() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let system = Arc::new(System::new(config).await.context("failed to initialize system")?);
    let handles = system.spawn_background_tasks();

    tracing::info!("orchestrator running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Releases this node's hold on the HA leader lock, if any, so a standby
/// node can take over without waiting out the full TTL.
async fn run_shutdown() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    if !config.ha.enabled {
        tracing::info!("high availability is disabled; nothing to release");
        return Ok(());
    }

    let system = System::new(config).await.context("failed to initialize system")?;
    let mut lock = orchestrator_core::lock::DistributedLock::new(
        system.storage.kv(),
        system.config.ha.lock_key.clone(),
        system.config.ha.node_id.clone(),
        system.config.ha.lock_ttl,
    );

    if lock.is_held_by_this_token().await.context("failed to check lock ownership")? {
        lock.release().await.context("failed to release leader lock")?;
        tracing::info!(node_id = %system.config.ha.node_id, "released leader lock");
    } else {
        tracing::info!(node_id = %system.config.ha.node_id, "this node does not hold the leader lock");
    }
    Ok(())
}

async fn run_replay(delivery_id: &str) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let system = System::new(config).await.context("failed to initialize system")?;

    let result = system
        .ingestor
        .replay(delivery_id)
        .await
        .context("replay failed")?;

    println!(
        "success={} processed={} message={}",
        result.success, result.processed, result.message
    );
    Ok(())
}
