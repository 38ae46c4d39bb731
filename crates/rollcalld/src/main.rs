use anyhow::{Context, Result};
use rollcall_core::CommandExtractor;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::load()?;
    tracing::info!(
        dataset = %config.dataset_dir.display(),
        attendance = %config.attendance_path.display(),
        roster = %config.roster_path.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    let extractor = CommandExtractor::from_command_line(&config.extractor)
        .context("extractor command line is empty")?;
    let admin_grant = Duration::from_secs(config.admin_grant_secs);
    let engine = engine::spawn_engine(config, extractor).context("failed to start engine")?;

    let service = RollcallService::new(engine.clone(), admin_grant);
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    match engine.stop_attendance().await {
        Ok(summary) => tracing::info!(marked = summary.marked.len(), "attendance run stopped"),
        Err(engine::EngineError::NotRunning) => {}
        Err(e) => tracing::warn!(error = %e, "attendance run ended with error"),
    }
    engine.cancel_verification();

    Ok(())
}
