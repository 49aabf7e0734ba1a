pub mod broadcaster;
pub mod config;
pub mod controller;
pub mod errors;
pub mod harness;
pub mod http;
pub mod models;
pub mod record;
pub mod registry;
pub mod runner;
pub mod state;

use crate::config::DashboardConfig;
use crate::controller::RunController;
use crate::errors::{AppError, AppResult};
use anyhow::Context;
use std::path::Path;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub async fn run() -> AppResult<()> {
    let config = DashboardConfig::load()?;
    init_tracing(config.log_dir.as_deref()).map_err(AppError::Internal)?;

    let controller = RunController::new(&config);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        history_limit = config.history_limit,
        max_run_duration_secs = ?config.max_run_duration_secs,
        "dashboard listening"
    );

    axum::serve(listener, http::router(controller))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("dashboard stopped");
    Ok(())
}

/// Serves the dashboard API on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, controller: RunController) -> AppResult<()> {
    axum::serve(listener, http::router(controller)).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| error.to_string());
    };

    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dashboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
