use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use labsched::collaborators::Collaborators;
use labsched::config::DaemonConfig;
use labsched::engine::Engine;
use labsched::notify::NotifyHub;
use labsched::reaper;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = DaemonConfig::from_env();
    labsched::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let wal_path = config.wal_path();
    let engine = {
        let wal_path = wal_path.clone();
        let schedule = config.schedule.clone();
        tokio::task::spawn_blocking(move || {
            Engine::new(
                wal_path,
                Arc::new(NotifyHub::new()),
                schedule,
                Collaborators::detached(),
            )
        })
        .await??
    };
    let engine = Arc::new(engine);

    info!("labsched started");
    info!("  wal: {}", wal_path.display());
    info!("  resources: {}", engine.list_resources().len());
    info!("  sweep interval: {:?}", config.sweep_interval);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let sweeper = tokio::spawn(reaper::run_sweeper(engine.clone(), config.sweep_interval));
    let compactor = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
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
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background tasks");
    sweeper.abort();
    compactor.abort();

    // Leave a compact log behind for the next start.
    let final_engine = engine.clone();
    match tokio::task::spawn_blocking(move || final_engine.compact_wal()).await? {
        Ok(()) => info!("WAL compacted"),
        Err(e) => tracing::warn!("final compaction failed: {e}"),
    }

    info!("labsched stopped");
    Ok(())
}
