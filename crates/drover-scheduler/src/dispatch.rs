//! Hand-off of claimed jobs to an execution facility.
//!
//! Dispatch is fire-and-forget: the manager never waits for a job to finish
//! and never retries a rejected submission. A rejected job stays in progress
//! until the startup recovery sweep resets it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use drover_store::{Job, TenantId};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::SubmissionError;

/// Receipt for a job the execution facility took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    /// Tenant the job belongs to.
    pub tenant: TenantId,
    /// Key of the accepted job.
    pub job_key: String,
}

impl Accepted {
    /// Receipt for `job` of `tenant`.
    pub fn new(tenant: &TenantId, job: &Job) -> Self {
        Self {
            tenant: tenant.clone(),
            job_key: job.key.clone(),
        }
    }
}

/// A claimed job as handed to the execution facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Tenant the job belongs to.
    pub tenant: TenantId,
    /// The job record, already in progress.
    pub job: Job,
}

/// External facility that runs claimed jobs.
pub trait TaskExecutor: Send + Sync {
    /// Queue `job` for near-immediate asynchronous execution.
    ///
    /// Must not wait for the job to run.
    fn submit(&self, tenant: &TenantId, job: Job) -> Result<Accepted, SubmissionError>;
}

/// Type alias for an in-process job handler.
///
/// The returned result is logged only; moving the job to a final status is
/// the handler's own business.
pub type JobHandler = Arc<
    dyn Fn(TenantId, Job) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;

/// Runs each job as a task on a tokio runtime.
pub struct SpawnExecutor {
    runtime: Handle,
    handler: JobHandler,
}

impl SpawnExecutor {
    /// Create an executor on the current tokio runtime.
    pub fn new(handler: JobHandler) -> Result<Self, SubmissionError> {
        let runtime =
            Handle::try_current().map_err(|e| SubmissionError::Unavailable(e.to_string()))?;
        Ok(Self::with_runtime(runtime, handler))
    }

    /// Create an executor on an explicit runtime.
    pub fn with_runtime(runtime: Handle, handler: JobHandler) -> Self {
        Self { runtime, handler }
    }
}

impl TaskExecutor for SpawnExecutor {
    fn submit(&self, tenant: &TenantId, job: Job) -> Result<Accepted, SubmissionError> {
        let accepted = Accepted::new(tenant, &job);
        let handler = Arc::clone(&self.handler);
        let tenant = tenant.clone();

        self.runtime.spawn(async move {
            let key = job.key.clone();
            if let Err(error) = handler(tenant.clone(), job).await {
                warn!(tenant = %tenant, job = %key, error = %error, "job handler reported failure");
            }
        });

        Ok(accepted)
    }
}

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs the executor took.
    pub accepted: Vec<Accepted>,
    /// Jobs the executor refused, with the reason.
    pub rejected: Vec<(String, SubmissionError)>,
}

/// Submits claimed jobs to a [`TaskExecutor`].
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn TaskExecutor>,
}

impl Dispatcher {
    /// Create a dispatcher over `executor`.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }

    /// Submit every job once. Rejections are logged and reported, never retried.
    pub fn dispatch(&self, tenant: &TenantId, jobs: Vec<Job>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for job in jobs {
            let key = job.key.clone();
            match self.executor.submit(tenant, job) {
                Ok(accepted) => {
                    debug!(tenant = %tenant, job = %key, "dispatched job");
                    report.accepted.push(accepted);
                }
                Err(error) => {
                    warn!(
                        tenant = %tenant,
                        job = %key,
                        error = %error,
                        "job submission rejected, job stays in progress until recovery"
                    );
                    report.rejected.push((key, error));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Accepts everything except keys listed in `refuse`.
    struct Selective {
        refuse: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl TaskExecutor for Selective {
        fn submit(&self, tenant: &TenantId, job: Job) -> Result<Accepted, SubmissionError> {
            self.seen.lock().unwrap().push(job.key.clone());
            if self.refuse.contains(&job.key.as_str()) {
                return Err(SubmissionError::QueueFull);
            }
            Ok(Accepted::new(tenant, &job))
        }
    }

    fn job(key: &str) -> Job {
        Job::new(key, "default", serde_json::json!({}))
    }

    #[test]
    fn test_rejections_do_not_stop_batch() {
        let executor = Arc::new(Selective {
            refuse: vec!["b"],
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new(executor.clone());
        let tenant = TenantId::from("t1");

        let report = dispatcher.dispatch(&tenant, vec![job("a"), job("b"), job("c")]);

        assert_eq!(*executor.seen.lock().unwrap(), vec!["a", "b", "c"]);
        let accepted: Vec<_> = report.accepted.iter().map(|a| a.job_key.as_str()).collect();
        assert_eq!(accepted, vec!["a", "c"]);
        assert_eq!(
            report.rejected,
            vec![("b".to_string(), SubmissionError::QueueFull)]
        );
    }

    #[test]
    fn test_spawn_executor_needs_runtime() {
        let handler: JobHandler = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        assert!(matches!(
            SpawnExecutor::new(handler),
            Err(SubmissionError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_executor_runs_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: JobHandler = Arc::new(move |tenant, job| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send((tenant, job)).map_err(|e| e.to_string())
            })
        });
        let executor = SpawnExecutor::new(handler).unwrap();
        let tenant = TenantId::from("t1");

        let accepted = executor.submit(&tenant, job("a")).unwrap();
        assert_eq!(accepted.job_key, "a");

        let (got_tenant, got_job) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_tenant, tenant);
        assert_eq!(got_job.key, "a");
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = JobEnvelope {
            tenant: TenantId::from("t1"),
            job: job("a"),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["tenant"], "t1");
        assert_eq!(value["job"]["key"], "a");
        assert_eq!(value["job"]["status"], "pending");
    }
}
