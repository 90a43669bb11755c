//! Periodic driver for the manager loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::manager::{Manager, RecoveryReport, TickReport};
use crate::SchedulerError;

/// Runs recovery once, then ticks the manager every poll interval until
/// shutdown.
pub struct Runner {
    manager: Arc<Manager>,
}

impl Runner {
    /// Create a runner for `manager`.
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Run until `shutdown_rx` turns true or its sender is dropped.
    ///
    /// Returns immediately when the scheduler is disabled. Ticks never
    /// overlap: a tick that overruns the interval delays the next one rather
    /// than running concurrently with it.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let config = self.manager.config().clone();
        if !config.enabled {
            info!("scheduler disabled, not starting");
            return Ok(());
        }

        let recovery = self.recover().await?;
        info!(
            tenants = recovery.tenants,
            jobs_reset = recovery.jobs_reset,
            failures = recovery.failures,
            "recovery complete"
        );

        let mut interval = time::interval(config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_interval = ?config.poll_interval(),
            restrict_to_primary_tenant = config.restrict_to_primary_tenant,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }

                _ = interval.tick() => {
                    match self.tick(config.restrict_to_primary_tenant).await {
                        Ok(report) => {
                            if report.jobs_claimed > 0 {
                                debug!(
                                    claimed = report.jobs_claimed,
                                    dispatched = report.jobs_dispatched,
                                    rejected = report.jobs_rejected,
                                    "tick dispatched jobs"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "tick failed"),
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the recovery sweep off the async runtime.
    pub async fn recover(&self) -> Result<RecoveryReport, SchedulerError> {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.recover())
            .await
            .map_err(|e| SchedulerError::Panicked(e.to_string()))
    }

    /// Run one tick off the async runtime.
    pub async fn tick(&self, restrict_to_primary_tenant: bool) -> Result<TickReport, SchedulerError> {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.manage(restrict_to_primary_tenant))
            .await
            .map_err(|e| SchedulerError::Panicked(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use drover_store::{Job, JobStatus, MemoryKeySpace, MemoryStore, Queue, TenantId};
    use tokio::sync::mpsc;

    use crate::SchedulerConfig;
    use crate::dispatch::{Accepted, TaskExecutor};
    use crate::SubmissionError;

    struct Forward {
        tx: Mutex<mpsc::UnboundedSender<Job>>,
    }

    impl TaskExecutor for Forward {
        fn submit(&self, tenant: &TenantId, job: Job) -> Result<Accepted, SubmissionError> {
            let accepted = Accepted::new(tenant, &job);
            self.tx
                .lock()
                .unwrap()
                .send(job)
                .map_err(|_| SubmissionError::Closed)?;
            Ok(accepted)
        }
    }

    fn runner(store: Arc<MemoryStore>, config: SchedulerConfig) -> (Runner, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Manager::new(
            store.clone(),
            store,
            Arc::new(MemoryKeySpace::new()),
            Arc::new(Forward { tx: Mutex::new(tx) }),
            config,
        )
        .unwrap();
        (Runner::new(Arc::new(manager)), rx)
    }

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: 0.01,
            tenant_refresh_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interrupted_job_redispatched_after_restart() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::from("t1");
        store.put_queue(&tenant, Queue::new("default", 1)).unwrap();
        store
            .insert_job(&tenant, Job::new("orphan", "default", serde_json::json!({})))
            .unwrap();
        store
            .insert_job(&tenant, Job::new("waiting", "default", serde_json::json!({})))
            .unwrap();
        // Left behind by a previous process.
        store.set_status(&tenant, "orphan", JobStatus::Progress).unwrap();

        let (runner, mut rx) = runner(store.clone(), fast());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.key, "orphan");
        assert_eq!(job.status, JobStatus::Progress);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Capacity 1 was taken by the recovered job.
        assert_eq!(
            store.job(&tenant, "waiting").unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_disabled_returns_immediately() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::from("t1");
        store.put_queue(&tenant, Queue::new("default", 1)).unwrap();
        store
            .insert_job(&tenant, Job::new("a", "default", serde_json::json!({})))
            .unwrap();
        store.set_status(&tenant, "a", JobStatus::Progress).unwrap();

        let config = SchedulerConfig {
            enabled: false,
            ..fast()
        };
        let (runner, mut rx) = runner(store.clone(), config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        runner.run(shutdown_rx).await.unwrap();

        assert!(rx.try_recv().is_err());
        // No recovery either.
        assert_eq!(
            store.job(&tenant, "a").unwrap().unwrap().status,
            JobStatus::Progress
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stops_when_sender_dropped() {
        let (runner, _rx) = runner(Arc::new(MemoryStore::new()), fast());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
