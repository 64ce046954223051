use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use gymkeep::clock::SystemClock;
use gymkeep::config::{DaemonConfig, EngineConfig};
use gymkeep::engine::Engine;
use gymkeep::sweeper::{run_compactor, run_sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let daemon = DaemonConfig::from_env()?;
    let config = EngineConfig::from_env()?;
    gymkeep::observability::init(daemon.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&daemon.data_dir)?;

    let engine = Arc::new(Engine::new(daemon.wal_path(), config, Arc::new(SystemClock))?);
    info!("gymkeep started");
    info!("  data_dir: {}", daemon.data_dir.display());
    info!("  sweep_interval: {:?}", daemon.sweep_interval);
    info!("  compact_threshold: {}", daemon.compact_threshold);
    info!(
        "  metrics: {}",
        daemon
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper = tokio::spawn(run_sweeper(engine.clone(), daemon.sweep_interval));
    let compactor = tokio::spawn(run_compactor(engine.clone(), daemon.compact_threshold));

    shutdown_signal().await?;
    info!("shutdown signal received");
    sweeper.abort();
    compactor.abort();

    // One last pass so nothing overdue waits for the next start.
    let report = engine.run_sweep().await;
    info!(
        "final sweep: {} penalties, {} failures",
        report.penalties_issued,
        report.failures.len()
    );
    info!("gymkeep stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
