//! In-process job store.
//!
//! Each tenant's tables sit behind their own mutex, so every transaction on a
//! tenant is serialized against every other access to that tenant.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    Job, JobStatus, JobStore, JobTransaction, Queue, StoreError, Table, TenantDirectory, TenantId,
    TransactionWork,
};

/// Tables of one tenant. `None` means the table does not exist.
#[derive(Debug, Default)]
struct TenantTables {
    queues: Option<BTreeMap<String, Queue>>,
    /// Kept in insertion order.
    jobs: Option<Vec<Job>>,
}

impl TenantTables {
    fn job_mut(&mut self, key: &str) -> Option<&mut Job> {
        self.jobs.as_mut()?.iter_mut().find(|j| j.key == key)
    }
}

/// In-memory implementation of [`JobStore`] and [`TenantDirectory`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: RwLock<BTreeMap<TenantId, Arc<Mutex<TenantTables>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant with no tables. No-op if it exists.
    pub fn create_tenant(&self, tenant: &TenantId) -> Result<(), StoreError> {
        self.tenant_or_create(tenant).map(|_| ())
    }

    /// Remove a tenant and all its records.
    pub fn remove_tenant(&self, tenant: &TenantId) -> Result<(), StoreError> {
        let mut tenants = self.tenants.write().map_err(|_| poisoned())?;
        tenants.remove(tenant);
        Ok(())
    }

    /// Create or replace a queue definition, creating the queue table if needed.
    pub fn put_queue(&self, tenant: &TenantId, queue: Queue) -> Result<(), StoreError> {
        let slot = self.tenant_or_create(tenant)?;
        let mut tables = lock(&slot)?;
        tables
            .queues
            .get_or_insert_with(BTreeMap::new)
            .insert(queue.key.clone(), queue);
        Ok(())
    }

    /// Append a job, creating the job table if needed.
    pub fn insert_job(&self, tenant: &TenantId, job: Job) -> Result<(), StoreError> {
        let slot = self.tenant_or_create(tenant)?;
        let mut tables = lock(&slot)?;
        let jobs = tables.jobs.get_or_insert_with(Vec::new);
        if jobs.iter().any(|j| j.key == job.key) {
            return Err(StoreError::JobExists {
                tenant: tenant.clone(),
                key: job.key,
            });
        }
        jobs.push(job);
        Ok(())
    }

    /// Overwrite a job's status, as the worker or an operator would.
    pub fn set_status(
        &self,
        tenant: &TenantId,
        key: &str,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        let slot = self.tenant(tenant)?;
        let mut tables = lock(&slot)?;
        let job = tables.job_mut(key).ok_or_else(|| StoreError::JobNotFound {
            tenant: tenant.clone(),
            key: key.to_string(),
        })?;
        job.status = status;
        Ok(())
    }

    /// Drop a table entirely.
    pub fn drop_table(&self, tenant: &TenantId, table: Table) -> Result<(), StoreError> {
        let slot = self.tenant(tenant)?;
        let mut tables = lock(&slot)?;
        match table {
            Table::Queues => tables.queues = None,
            Table::Jobs => tables.jobs = None,
        }
        Ok(())
    }

    /// Read a single job.
    pub fn job(&self, tenant: &TenantId, key: &str) -> Result<Option<Job>, StoreError> {
        let slot = self.tenant(tenant)?;
        let tables = lock(&slot)?;
        Ok(tables
            .jobs
            .as_ref()
            .and_then(|jobs| jobs.iter().find(|j| j.key == key).cloned()))
    }

    /// All jobs of a tenant, in insertion order.
    pub fn jobs(&self, tenant: &TenantId) -> Result<Vec<Job>, StoreError> {
        let slot = self.tenant(tenant)?;
        let tables = lock(&slot)?;
        Ok(tables.jobs.clone().unwrap_or_default())
    }

    fn tenant(&self, tenant: &TenantId) -> Result<Arc<Mutex<TenantTables>>, StoreError> {
        let tenants = self.tenants.read().map_err(|_| poisoned())?;
        tenants
            .get(tenant)
            .cloned()
            .ok_or_else(|| StoreError::TenantNotFound(tenant.clone()))
    }

    fn tenant_or_create(&self, tenant: &TenantId) -> Result<Arc<Mutex<TenantTables>>, StoreError> {
        let mut tenants = self.tenants.write().map_err(|_| poisoned())?;
        Ok(Arc::clone(tenants.entry(tenant.clone()).or_default()))
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

fn lock(slot: &Mutex<TenantTables>) -> Result<MutexGuard<'_, TenantTables>, StoreError> {
    slot.lock().map_err(|_| poisoned())
}

impl TenantDirectory for MemoryStore {
    fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let tenants = self.tenants.read().map_err(|_| poisoned())?;
        Ok(tenants.keys().cloned().collect())
    }
}

impl JobStore for MemoryStore {
    fn table_populated(&self, tenant: &TenantId, table: Table) -> Result<bool, StoreError> {
        let slot = self.tenant(tenant)?;
        let tables = lock(&slot)?;
        Ok(match table {
            Table::Queues => tables.queues.as_ref().is_some_and(|q| !q.is_empty()),
            Table::Jobs => tables.jobs.as_ref().is_some_and(|j| !j.is_empty()),
        })
    }

    fn list_queues(&self, tenant: &TenantId) -> Result<Vec<Queue>, StoreError> {
        let slot = self.tenant(tenant)?;
        let tables = lock(&slot)?;
        Ok(tables
            .queues
            .as_ref()
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default())
    }

    fn transaction(
        &self,
        tenant: &TenantId,
        work: &mut TransactionWork<'_>,
    ) -> Result<(), StoreError> {
        let slot = self.tenant(tenant)?;
        let mut tables = lock(&slot)?;
        let mut tx = MemoryTransaction {
            tenant,
            tables: &mut *tables,
            undo: Vec::new(),
        };

        match work(&mut tx) {
            Ok(()) => Ok(()),
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    fn reset_in_progress(&self, tenant: &TenantId) -> Result<usize, StoreError> {
        let slot = self.tenant(tenant)?;
        let mut tables = lock(&slot)?;
        let Some(jobs) = tables.jobs.as_mut() else {
            return Ok(0);
        };

        let mut reset = 0;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Progress) {
            job.status = JobStatus::Pending;
            reset += 1;
        }
        Ok(reset)
    }
}

/// Applies writes in place and undoes them if the transaction fails.
struct MemoryTransaction<'a> {
    tenant: &'a TenantId,
    tables: &'a mut TenantTables,
    undo: Vec<(String, JobStatus)>,
}

impl MemoryTransaction<'_> {
    fn rollback(&mut self) {
        debug!(tenant = %self.tenant, writes = self.undo.len(), "rolling back transaction");
        while let Some((key, status)) = self.undo.pop() {
            if let Some(job) = self.tables.job_mut(&key) {
                job.status = status;
            }
        }
    }
}

impl JobTransaction for MemoryTransaction<'_> {
    fn queue(&mut self, key: &str) -> Result<Option<Queue>, StoreError> {
        Ok(self.tables.queues.as_ref().and_then(|q| q.get(key).cloned()))
    }

    fn count_in_progress(&mut self, queue: &str) -> Result<usize, StoreError> {
        Ok(self.tables.jobs.as_ref().map_or(0, |jobs| {
            jobs.iter()
                .filter(|j| j.queue == queue && j.status == JobStatus::Progress)
                .count()
        }))
    }

    fn select_eligible(
        &mut self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let Some(jobs) = self.tables.jobs.as_ref() else {
            return Ok(Vec::new());
        };

        let mut eligible: Vec<&Job> = jobs
            .iter()
            .filter(|j| j.queue == queue && j.is_eligible(now))
            .collect();
        // Stable sort keeps insertion order among equal delays.
        eligible.sort_by_key(|j| j.delay_until);
        Ok(eligible.into_iter().take(limit).cloned().collect())
    }

    fn mark_in_progress(&mut self, job_key: &str) -> Result<(), StoreError> {
        let tenant = self.tenant;
        let job = self
            .tables
            .job_mut(job_key)
            .ok_or_else(|| StoreError::JobNotFound {
                tenant: tenant.clone(),
                key: job_key.to_string(),
            })?;

        if job.status != JobStatus::Pending {
            return Err(StoreError::InvalidTransition {
                key: job_key.to_string(),
                from: job.status,
                to: JobStatus::Progress,
            });
        }

        self.undo.push((job_key.to_string(), job.status));
        job.status = JobStatus::Progress;
        Ok(())
    }
}
