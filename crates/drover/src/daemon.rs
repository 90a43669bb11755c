//! Scheduler daemon: SQLite tenants, webhook delivery, periodic ticks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drover_scheduler::{
    Manager, Runner, SchedulerConfig, WebhookConfig, WebhookExecutor, recover,
};
use drover_store::{MemoryKeySpace, SqliteStore};
use miette::Result;
use tokio::sync::watch;
use tracing::info;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub worker_url: String,
    pub scheduler: SchedulerConfig,
    /// Number of concurrent deliveries to the worker endpoint.
    pub delivery_workers: usize,
    /// Claimed jobs buffered for delivery.
    pub delivery_queue_size: usize,
    /// How long to wait on a locked tenant database.
    pub busy_timeout: Duration,
}

fn open_store(data_dir: PathBuf, busy_timeout: Duration) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(data_dir)
        .map_err(|e| miette::miette!("failed to open store: {}", e))?
        .with_busy_timeout(busy_timeout);
    Ok(Arc::new(store))
}

/// Run the scheduler until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(data_dir = %config.data_dir.display(), "starting Drover daemon");

    config
        .scheduler
        .validate()
        .map_err(|e| miette::miette!("{}", e))?;
    let store = open_store(config.data_dir, config.busy_timeout)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let webhook = WebhookConfig {
        workers: config.delivery_workers,
        queue_size: config.delivery_queue_size,
        ..WebhookConfig::new(config.worker_url)
    };
    let (executor, pool) = WebhookExecutor::start(webhook, shutdown_rx.clone())
        .map_err(|e| miette::miette!("failed to start webhook executor: {}", e))?;

    let manager = Manager::new(
        store.clone(),
        store.clone(),
        Arc::new(MemoryKeySpace::new()),
        Arc::new(executor),
        config.scheduler,
    )
    .map_err(|e| miette::miette!("{}", e))?;

    let result = Runner::new(Arc::new(manager)).run(shutdown_rx).await;

    // The runner also returns when disabled; stop delivery either way.
    let _ = shutdown_tx.send(true);
    pool.join().await;
    store.close_all();

    result.map_err(|e| miette::miette!("scheduler failed: {}", e))?;
    info!("Drover daemon stopped");
    Ok(())
}

/// Reset interrupted jobs in every tenant once and exit.
pub async fn recover_once(data_dir: PathBuf) -> Result<()> {
    let store = open_store(data_dir, Duration::from_secs(5))?;

    let report = tokio::task::spawn_blocking(move || recover(store.as_ref(), store.as_ref()))
        .await
        .map_err(|e| miette::miette!("recovery panicked: {}", e))?;

    info!(
        tenants = report.tenants,
        jobs_reset = report.jobs_reset,
        failures = report.failures,
        "recovery complete"
    );
    if report.failures > 0 {
        return Err(miette::miette!(
            "recovery failed for {} tenant(s)",
            report.failures
        ));
    }
    Ok(())
}
