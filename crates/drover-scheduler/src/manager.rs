//! Manager loop: one scheduling tick across every tenant.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use drover_store::{JobStore, KeySpace, StoreError, TenantDirectory, TenantId};
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffController, Decision};
use crate::claim::claim;
use crate::dispatch::{Dispatcher, TaskExecutor};
use crate::{SchedulerConfig, SchedulerError};

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tenants considered this tick.
    pub tenants_seen: usize,
    /// Tenants skipped by their backoff counter.
    pub tenants_skipped: usize,
    /// Tenants found without queues or jobs.
    pub tenants_idle: usize,
    /// Tenants whose queues were scanned.
    pub tenants_scanned: usize,
    /// Tenants skipped because the store could not serve them.
    pub tenants_unavailable: usize,
    /// Tenants removed from the directory since it was listed.
    pub tenants_removed: usize,
    /// Tenants whose processing failed for any other reason.
    pub tenants_failed: usize,
    /// Jobs moved to progress.
    pub jobs_claimed: usize,
    /// Jobs the executor accepted.
    pub jobs_dispatched: usize,
    /// Jobs the executor refused.
    pub jobs_rejected: usize,
}

/// Counters for the startup recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tenants swept.
    pub tenants: usize,
    /// Jobs moved from progress back to pending.
    pub jobs_reset: usize,
    /// Tenants the sweep failed on.
    pub failures: usize,
}

enum TenantOutcome {
    Skipped,
    Idle,
    Scanned {
        claimed: usize,
        dispatched: usize,
        rejected: usize,
    },
}

struct TenantCache {
    fetched_at: Instant,
    tenants: Vec<TenantId>,
}

/// The queue manager.
///
/// Holds no locks across tenants; concurrent managers against the same store
/// rely on the store's claim transaction isolation.
pub struct Manager {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn TenantDirectory>,
    backoff: BackoffController,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
    tenant_cache: Mutex<Option<TenantCache>>,
}

impl Manager {
    /// Create a new manager.
    pub fn new(
        store: Arc<dyn JobStore>,
        directory: Arc<dyn TenantDirectory>,
        keys: Arc<dyn KeySpace>,
        executor: Arc<dyn TaskExecutor>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            store,
            directory,
            backoff: BackoffController::new(keys, config.idle_skip_ticks),
            dispatcher: Dispatcher::new(executor),
            config,
            tenant_cache: Mutex::new(None),
        })
    }

    /// The manager's configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one tick now.
    pub fn manage(&self, restrict_to_primary_tenant: bool) -> TickReport {
        self.manage_at(restrict_to_primary_tenant, Utc::now())
    }

    /// Run one tick as of `now`.
    ///
    /// A failure in one tenant is logged and counted; the remaining tenants
    /// are still processed. Nothing is retried within the tick.
    #[tracing::instrument(skip(self, now))]
    pub fn manage_at(&self, restrict_to_primary_tenant: bool, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let Some(tenants) = self.tenants(restrict_to_primary_tenant) else {
            return report;
        };

        for tenant in tenants {
            report.tenants_seen += 1;

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| self.process_tenant(&tenant, now)))
                    .unwrap_or_else(|payload| Err(SchedulerError::Panicked(panic_message(payload))));

            match outcome {
                Ok(TenantOutcome::Skipped) => report.tenants_skipped += 1,
                Ok(TenantOutcome::Idle) => report.tenants_idle += 1,
                Ok(TenantOutcome::Scanned {
                    claimed,
                    dispatched,
                    rejected,
                }) => {
                    report.tenants_scanned += 1;
                    report.jobs_claimed += claimed;
                    report.jobs_dispatched += dispatched;
                    report.jobs_rejected += rejected;
                }
                Err(SchedulerError::Store(StoreError::TenantNotFound(_))) => {
                    debug!(tenant = %tenant, "tenant no longer exists, dropping it from the list");
                    self.forget_tenant(&tenant);
                    report.tenants_removed += 1;
                }
                Err(e) if e.is_store_unavailable() => {
                    debug!(tenant = %tenant, error = %e, "store unavailable, skipping tenant this tick");
                    report.tenants_unavailable += 1;
                }
                Err(SchedulerError::Panicked(message)) => {
                    error!(tenant = %tenant, panic = %message, "tenant processing panicked");
                    report.tenants_failed += 1;
                }
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "tenant processing failed");
                    report.tenants_failed += 1;
                }
            }
        }

        if report.jobs_claimed > 0 || report.tenants_failed > 0 {
            debug!(?report, "tick finished");
        }
        report
    }

    /// Reset every tenant's in-progress jobs to pending. See [`recover`].
    pub fn recover(&self) -> RecoveryReport {
        recover(self.directory.as_ref(), self.store.as_ref())
    }

    fn process_tenant(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<TenantOutcome, SchedulerError> {
        match self.backoff.evaluate(self.store.as_ref(), tenant)? {
            Decision::Skip { .. } => return Ok(TenantOutcome::Skipped),
            Decision::Idle { .. } => return Ok(TenantOutcome::Idle),
            Decision::Scan => {}
        }

        let result = self.scan_tenant(tenant, now);
        self.backoff.finish_scan(tenant);
        result
    }

    fn scan_tenant(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<TenantOutcome, SchedulerError> {
        let mut claimed = 0;
        let mut dispatched = 0;
        let mut rejected = 0;

        for queue in self.store.list_queues(tenant)? {
            let jobs = claim(
                self.store.as_ref(),
                tenant,
                &queue.key,
                now,
                self.config.max_claim_batch,
            )?;
            if jobs.is_empty() {
                continue;
            }

            claimed += jobs.len();
            let report = self.dispatcher.dispatch(tenant, jobs);
            dispatched += report.accepted.len();
            rejected += report.rejected.len();
        }

        Ok(TenantOutcome::Scanned {
            claimed,
            dispatched,
            rejected,
        })
    }

    /// Tenants to process this tick.
    ///
    /// Lists the directory every tick unless `tenant_refresh` is set, in which
    /// case a list younger than that is reused. Falls back to a stale list if the directory fails; returns `None` only
    /// if there is nothing cached either.
    fn tenants(&self, restrict_to_primary_tenant: bool) -> Option<Vec<TenantId>> {
        let mut cache = self.lock_tenant_cache();

        let refresh = self.config.tenant_refresh();
        let fresh = !refresh.is_zero()
            && cache
                .as_ref()
                .is_some_and(|c| c.fetched_at.elapsed() < refresh);
        if !fresh {
            match self.directory.list_tenants() {
                Ok(tenants) => {
                    *cache = Some(TenantCache {
                        fetched_at: Instant::now(),
                        tenants,
                    });
                }
                Err(e) if cache.is_some() => {
                    warn!(error = %e, "failed to list tenants, reusing previous list");
                }
                Err(e) => {
                    warn!(error = %e, "failed to list tenants, skipping tick");
                    return None;
                }
            }
        }

        let tenants = cache.as_ref()?.tenants.iter();
        if restrict_to_primary_tenant {
            Some(
                tenants
                    .filter(|t| **t == self.config.primary_tenant)
                    .cloned()
                    .collect(),
            )
        } else {
            Some(tenants.cloned().collect())
        }
    }

    fn forget_tenant(&self, tenant: &TenantId) {
        if let Some(cache) = self.lock_tenant_cache().as_mut() {
            cache.tenants.retain(|t| t != tenant);
        }
    }

    fn lock_tenant_cache(&self) -> MutexGuard<'_, Option<TenantCache>> {
        self.tenant_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reset every tenant's in-progress jobs to pending.
///
/// Meant for startup, before the first tick: jobs left in progress by a
/// previous process have no worker anymore.
#[tracing::instrument(skip_all)]
pub fn recover(directory: &dyn TenantDirectory, store: &dyn JobStore) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let tenants = match directory.list_tenants() {
        Ok(tenants) => tenants,
        Err(e) => {
            warn!(error = %e, "failed to list tenants for recovery");
            report.failures += 1;
            return report;
        }
    };

    for tenant in tenants {
        report.tenants += 1;
        match store.reset_in_progress(&tenant) {
            Ok(0) => {}
            Ok(count) => {
                info!(tenant = %tenant, count, "reset interrupted jobs to pending");
                report.jobs_reset += count;
            }
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "failed to reset interrupted jobs");
                report.failures += 1;
            }
        }
    }

    report
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use drover_store::{
        Job, JobStatus, MemoryKeySpace, MemoryStore, Queue, StoreError, Table, TransactionWork,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::SubmissionError;
    use crate::dispatch::Accepted;

    /// Records every submission; refuses all when `refuse` is set.
    #[derive(Default)]
    struct Recorder {
        refuse: bool,
        submitted: Mutex<Vec<(TenantId, Job)>>,
    }

    impl Recorder {
        fn keys(&self) -> Vec<String> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|(_, j)| j.key.clone())
                .collect()
        }
    }

    impl TaskExecutor for Recorder {
        fn submit(&self, tenant: &TenantId, job: Job) -> Result<Accepted, SubmissionError> {
            if self.refuse {
                return Err(SubmissionError::Unavailable("down".to_string()));
            }
            let accepted = Accepted::new(tenant, &job);
            self.submitted.lock().unwrap().push((tenant.clone(), job));
            Ok(accepted)
        }
    }

    /// Wraps a store, counting existence checks and failing or panicking on
    /// chosen tenants.
    struct Instrumented {
        inner: MemoryStore,
        checks: AtomicUsize,
        failing: Option<TenantId>,
        unavailable: Option<TenantId>,
        panicking: Option<TenantId>,
    }

    impl Instrumented {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                checks: AtomicUsize::new(0),
                failing: None,
                unavailable: None,
                panicking: None,
            }
        }

        fn guard(&self, tenant: &TenantId) -> Result<(), StoreError> {
            if self.panicking.as_ref() == Some(tenant) {
                panic!("store bug for {}", tenant);
            }
            if self.unavailable.as_ref() == Some(tenant) {
                return Err(StoreError::Unavailable("locked".to_string()));
            }
            if self.failing.as_ref() == Some(tenant) {
                return Err(StoreError::Corrupt("bad row".to_string()));
            }
            Ok(())
        }
    }

    impl JobStore for Instrumented {
        fn table_populated(&self, tenant: &TenantId, table: Table) -> Result<bool, StoreError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.inner.table_populated(tenant, table)
        }

        fn list_queues(&self, tenant: &TenantId) -> Result<Vec<Queue>, StoreError> {
            self.guard(tenant)?;
            self.inner.list_queues(tenant)
        }

        fn transaction(
            &self,
            tenant: &TenantId,
            work: &mut TransactionWork<'_>,
        ) -> Result<(), StoreError> {
            self.inner.transaction(tenant, work)
        }

        fn reset_in_progress(&self, tenant: &TenantId) -> Result<usize, StoreError> {
            self.inner.reset_in_progress(tenant)
        }
    }

    impl TenantDirectory for Instrumented {
        fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
            self.inner.list_tenants()
        }
    }

    fn manager(store: Arc<Instrumented>, executor: Arc<Recorder>) -> Manager {
        Manager::new(
            store.clone(),
            store,
            Arc::new(MemoryKeySpace::new()),
            executor,
            SchedulerConfig::default(),
        )
        .unwrap()
    }

    fn seed(store: &MemoryStore, tenant: &str, max_workers: usize, jobs: &[&str]) {
        let tenant = TenantId::from(tenant);
        store
            .put_queue(&tenant, Queue::new("default", max_workers))
            .unwrap();
        for key in jobs {
            store
                .insert_job(&tenant, Job::new(*key, "default", serde_json::json!({})))
                .unwrap();
        }
    }

    #[test]
    fn test_tick_claims_and_dispatches() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 2, &["A", "B", "C"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store.clone(), executor.clone());

        let report = manager.manage(false);

        assert_eq!(report.tenants_scanned, 1);
        assert_eq!(report.jobs_claimed, 2);
        assert_eq!(report.jobs_dispatched, 2);
        assert_eq!(executor.keys(), vec!["A", "B"]);

        let submitted = executor.submitted.lock().unwrap();
        assert!(submitted.iter().all(|(_, j)| j.status == JobStatus::Progress));
    }

    #[test]
    fn test_saturated_second_tick_claims_nothing() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 2, &["A", "B", "C"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store, executor.clone());

        assert_eq!(manager.manage(false).jobs_claimed, 2);
        let second = manager.manage(false);
        assert_eq!(second.tenants_scanned, 1);
        assert_eq!(second.jobs_claimed, 0);
        assert_eq!(executor.keys(), vec!["A", "B"]);
    }

    #[test]
    fn test_completion_frees_capacity() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 1, &["A", "B"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store.clone(), executor.clone());

        manager.manage(false);
        store
            .inner
            .set_status(&TenantId::from("t1"), "A", JobStatus::Complete)
            .unwrap();
        manager.manage(false);

        assert_eq!(executor.keys(), vec!["A", "B"]);
    }

    #[test]
    fn test_idle_tenant_backoff_schedule() {
        let inner = MemoryStore::new();
        inner.create_tenant(&TenantId::from("idle")).unwrap();
        let store = Arc::new(Instrumented::new(inner));
        let manager = manager(store.clone(), Arc::new(Recorder::default()));

        // First tick checks and parks the tenant.
        assert_eq!(manager.manage(false).tenants_idle, 1);
        assert_eq!(store.checks.load(Ordering::SeqCst), 1);

        // Nine ticks without a check.
        for _ in 0..9 {
            assert_eq!(manager.manage(false).tenants_skipped, 1);
        }
        assert_eq!(store.checks.load(Ordering::SeqCst), 1);

        // The tenth re-checks.
        assert_eq!(manager.manage(false).tenants_idle, 1);
        assert_eq!(store.checks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_newly_active_tenant_found_within_skip_window() {
        let inner = MemoryStore::new();
        inner.create_tenant(&TenantId::from("late")).unwrap();
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store.clone(), executor.clone());

        manager.manage(false);
        seed(&store.inner, "late", 1, &["first"]);

        let mut ticks = 0;
        while executor.keys().is_empty() {
            manager.manage(false);
            ticks += 1;
            assert!(ticks <= 10, "tenant not discovered within the skip window");
        }
        assert_eq!(ticks, 10);
    }

    #[test]
    fn test_failing_tenant_does_not_block_others() {
        let inner = MemoryStore::new();
        seed(&inner, "a-broken", 1, &["x"]);
        seed(&inner, "b-busy", 1, &["y"]);
        seed(&inner, "c-panics", 1, &["z"]);
        seed(&inner, "d-healthy", 1, &["w"]);
        let mut store = Instrumented::new(inner);
        store.failing = Some(TenantId::from("a-broken"));
        store.unavailable = Some(TenantId::from("b-busy"));
        store.panicking = Some(TenantId::from("c-panics"));
        let store = Arc::new(store);
        let executor = Arc::new(Recorder::default());
        let manager = manager(store, executor.clone());

        let report = manager.manage(false);

        assert_eq!(report.tenants_seen, 4);
        assert_eq!(report.tenants_failed, 2);
        assert_eq!(report.tenants_unavailable, 1);
        assert_eq!(report.tenants_scanned, 1);
        assert_eq!(executor.keys(), vec!["w"]);
    }

    #[test]
    fn test_restrict_to_primary_tenant() {
        let inner = MemoryStore::new();
        seed(&inner, "_system", 1, &["sys"]);
        seed(&inner, "other", 1, &["oth"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store, executor.clone());

        let report = manager.manage(true);
        assert_eq!(report.tenants_seen, 1);
        assert_eq!(executor.keys(), vec!["sys"]);
    }

    #[test]
    fn test_rejected_submission_leaves_job_in_progress() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 1, &["A"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder {
            refuse: true,
            ..Default::default()
        });
        let manager = manager(store.clone(), executor);

        let report = manager.manage(false);
        assert_eq!(report.jobs_claimed, 1);
        assert_eq!(report.jobs_rejected, 1);

        let job = store.inner.job(&TenantId::from("t1"), "A").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Progress);

        // Not retried on the next tick.
        assert_eq!(manager.manage(false).jobs_claimed, 0);
    }

    #[test]
    fn test_recover_resets_progress_jobs() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 1, &["A", "B"]);
        inner.create_tenant(&TenantId::from("empty")).unwrap();
        inner
            .set_status(&TenantId::from("t1"), "A", JobStatus::Progress)
            .unwrap();
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store, executor.clone());

        let recovery = manager.recover();
        assert_eq!(
            recovery,
            RecoveryReport {
                tenants: 2,
                jobs_reset: 1,
                failures: 0
            }
        );

        manager.manage(false);
        assert_eq!(executor.keys(), vec!["A"]);
    }

    #[test]
    fn test_delayed_jobs_wait_for_their_time() {
        let inner = MemoryStore::new();
        let tenant = TenantId::from("t1");
        inner.put_queue(&tenant, Queue::new("default", 5)).unwrap();
        let now = Utc::now();
        inner
            .insert_job(
                &tenant,
                Job::new("later", "default", serde_json::json!({}))
                    .delayed_until(now + Duration::seconds(10)),
            )
            .unwrap();
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = manager(store, executor.clone());

        assert_eq!(manager.manage_at(false, now).jobs_claimed, 0);
        assert_eq!(
            manager
                .manage_at(false, now + Duration::seconds(10))
                .jobs_claimed,
            1
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result = Manager::new(
            store.clone(),
            store,
            Arc::new(MemoryKeySpace::new()),
            Arc::new(Recorder::default()),
            SchedulerConfig {
                max_claim_batch: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_tenant_list_cached() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 1, &["A"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = Manager::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryKeySpace::new()),
            executor.clone(),
            SchedulerConfig {
                tenant_refresh_secs: 3600,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(manager.manage(false).tenants_seen, 1);
        seed(&store.inner, "t2", 1, &["B"]);
        // Still the cached list.
        assert_eq!(manager.manage(false).tenants_seen, 1);
    }

    #[test]
    fn test_new_tenant_scanned_on_next_tick() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 1, &["A"]);
        let store = Arc::new(Instrumented::new(inner));
        let executor = Arc::new(Recorder::default());
        let manager = Manager::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryKeySpace::new()),
            executor.clone(),
            SchedulerConfig::default(),
        )
        .unwrap();

        assert_eq!(manager.manage(false).tenants_seen, 1);
        seed(&store.inner, "t2", 1, &["B"]);

        let report = manager.manage(false);
        assert_eq!(report.tenants_seen, 2);
        assert_eq!(report.jobs_claimed, 1);
        assert_eq!(executor.keys(), vec!["A", "B"]);
    }

    #[test]
    fn test_removed_tenant_dropped_from_cached_list() {
        let inner = MemoryStore::new();
        seed(&inner, "t1", 1, &["A"]);
        seed(&inner, "t2", 1, &["B"]);
        let store = Arc::new(Instrumented::new(inner));
        let manager = Manager::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryKeySpace::new()),
            Arc::new(Recorder::default()),
            SchedulerConfig {
                tenant_refresh_secs: 3600,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(manager.manage(false).tenants_scanned, 2);
        store.inner.remove_tenant(&TenantId::from("t2")).unwrap();

        let report = manager.manage(false);
        assert_eq!(report.tenants_seen, 2);
        assert_eq!(report.tenants_removed, 1);
        assert_eq!(report.tenants_failed, 0);

        // Gone from the cached list without waiting for a refresh.
        assert_eq!(manager.manage(false).tenants_seen, 1);
    }
}
