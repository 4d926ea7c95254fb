use std::sync::Arc;

use tracing::info;

use slotkeeper::config::Config;
use slotkeeper::engine::Engine;
use slotkeeper::notify::{LogChannel, NotifyHub};
use slotkeeper::{notify, reaper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotkeeper::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), hub.clone())?);

    info!("slotkeeper started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let dispatcher = tokio::spawn(notify::run_dispatcher(
        hub.subscribe_all(),
        Arc::new(LogChannel),
    ));
    let sweeper = tokio::spawn(reaper::run_reaper(engine.clone(), config.clone()));
    let compactor = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background tasks");
    sweeper.abort();
    compactor.abort();
    dispatcher.abort();

    // Every committed event is already fsynced; compaction only shortens the next replay.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("slotkeeper stopped");
    Ok(())
}
