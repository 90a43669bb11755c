//! Executor that delivers claimed jobs to an HTTP worker endpoint.
//!
//! `submit` only enqueues; a pool of delivery tasks drains the queue and POSTs
//! each [`JobEnvelope`] as JSON. A failed delivery is logged and the job stays
//! in progress, exactly like a rejected submission.

use std::sync::Arc;
use std::time::Duration;

use drover_store::{Job, TenantId};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{Accepted, JobEnvelope, TaskExecutor};
use crate::{SchedulerError, SubmissionError};

/// Default number of delivery tasks.
pub const DEFAULT_DELIVERY_WORKERS: usize = 4;

/// Default delivery queue size.
pub const DEFAULT_DELIVERY_QUEUE_SIZE: usize = 256;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the webhook executor.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Worker endpoint receiving `POST` requests.
    pub url: String,
    /// Number of delivery tasks.
    pub workers: usize,
    /// Jobs buffered before `submit` reports [`SubmissionError::QueueFull`].
    pub queue_size: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl WebhookConfig {
    /// Config with defaults for everything but the URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            workers: DEFAULT_DELIVERY_WORKERS,
            queue_size: DEFAULT_DELIVERY_QUEUE_SIZE,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Submits jobs to a bounded delivery queue.
pub struct WebhookExecutor {
    work_tx: mpsc::Sender<JobEnvelope>,
}

/// Delivery tasks spawned by [`WebhookExecutor::start`].
pub struct DeliveryPool {
    handles: Vec<JoinHandle<()>>,
}

impl DeliveryPool {
    /// Wait for every delivery task to stop.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl WebhookExecutor {
    /// Spawn the delivery pool on the current runtime.
    ///
    /// Delivery tasks stop when `shutdown_rx` turns true or every executor
    /// clone is dropped. Jobs still queued at shutdown are delivered first.
    pub fn start(
        config: WebhookConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(Self, DeliveryPool), SchedulerError> {
        if config.workers == 0 || config.queue_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "webhook workers and queue size must be at least 1".to_string(),
            ));
        }

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let url = Arc::new(config.url);

        let (work_tx, work_rx) = mpsc::channel::<JobEnvelope>(config.queue_size);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let work_rx = Arc::clone(&work_rx);
            let client = client.clone();
            let url = Arc::clone(&url);
            let mut shutdown_rx = shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                debug!(worker_id, "delivery worker started");

                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    let envelope = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            biased;
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                                continue;
                            }
                            envelope = rx.recv() => envelope,
                        }
                    };

                    let Some(envelope) = envelope else {
                        // Channel closed
                        break;
                    };

                    deliver(&client, &url, &envelope).await;
                }

                // Jobs already accepted are delivered before stopping.
                let mut drained = 0usize;
                loop {
                    let next = work_rx.lock().await.try_recv();
                    let Ok(envelope) = next else {
                        break;
                    };
                    deliver(&client, &url, &envelope).await;
                    drained += 1;
                }

                debug!(worker_id, drained, "delivery worker stopped");
            }));
        }

        info!(workers = config.workers, url = %url, "webhook executor started");
        Ok((Self { work_tx }, DeliveryPool { handles }))
    }
}

async fn deliver(client: &reqwest::Client, url: &str, envelope: &JobEnvelope) {
    let result = client
        .post(url)
        .json(envelope)
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match result {
        Ok(_) => {
            debug!(tenant = %envelope.tenant, job = %envelope.job.key, "delivered job");
        }
        Err(e) => {
            warn!(
                tenant = %envelope.tenant,
                job = %envelope.job.key,
                error = %e,
                "job delivery failed, job stays in progress until recovery"
            );
        }
    }
}

impl TaskExecutor for WebhookExecutor {
    fn submit(&self, tenant: &TenantId, job: Job) -> Result<Accepted, SubmissionError> {
        let accepted = Accepted::new(tenant, &job);
        let envelope = JobEnvelope {
            tenant: tenant.clone(),
            job,
        };

        self.work_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmissionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmissionError::Closed,
        })?;
        Ok(accepted)
    }
}
