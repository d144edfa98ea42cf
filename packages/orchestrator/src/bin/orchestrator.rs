//! Control-plane HTTP server: webhook ingestion, health, and metrics
//! endpoints, plus the background Job Worker/Auto-Scaler loops.

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::config::Config;
use orchestrator_core::monitoring;
use orchestrator_core::webhook::http::{health_router, router as webhook_router, WebhookState};
use orchestrator_core::System;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    tracing::info!("starting self-hosted runner orchestrator");

    let config = Config::from_env().context("failed to load configuration")?;
    let port = config.port;

    let system = Arc::new(System::new(config).await.context("failed to initialize system")?);

    let worker_handles = system.spawn_background_tasks();
    tokio::spawn(monitoring::run_sink(system.events.clone()));

    let app = webhook_router(WebhookState { ingestor: system.ingestor.clone() })
        .merge(health_router(system.storage.clone()))
        .merge(monitoring::router());

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind listener")?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for handle in worker_handles {
        handle.abort();
    }

    Ok(())
}
