//! Interfaces the scheduler consumes from its host.

use chrono::{DateTime, Utc};

use crate::{Job, Queue, StoreError, Table, TenantId};

/// Enumerates the tenants to scan.
pub trait TenantDirectory: Send + Sync {
    /// List all tenants currently known to the host.
    fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError>;
}

/// Read/write access to one tenant's queues and jobs inside a transaction.
pub trait JobTransaction {
    /// Read a queue definition.
    fn queue(&mut self, key: &str) -> Result<Option<Queue>, StoreError>;

    /// Count jobs of `queue` currently in progress.
    fn count_in_progress(&mut self, queue: &str) -> Result<usize, StoreError>;

    /// Select up to `limit` pending jobs of `queue` with `delay_until <= now`,
    /// ordered by `delay_until` ascending, then insertion order.
    fn select_eligible(
        &mut self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Move a pending job to progress.
    ///
    /// Fails with [`StoreError::InvalidTransition`] if the job is not pending.
    fn mark_in_progress(&mut self, job_key: &str) -> Result<(), StoreError>;
}

/// Work executed inside [`JobStore::transaction`].
pub type TransactionWork<'a> =
    dyn FnMut(&mut dyn JobTransaction) -> Result<(), StoreError> + 'a;

/// Transactional access to per-tenant queue and job records.
///
/// Implementations must run [`JobStore::transaction`] with isolation
/// equivalent to serializable transactions over the job table. With weaker
/// isolation, two schedulers claiming against the same tenant can briefly
/// overshoot a queue's `max_workers`; such a store must say so in its own
/// documentation. Both bundled stores are serializable.
pub trait JobStore: Send + Sync {
    /// Whether `table` exists for `tenant` and holds at least one record.
    fn table_populated(&self, tenant: &TenantId, table: Table) -> Result<bool, StoreError>;

    /// List the tenant's queue definitions.
    fn list_queues(&self, tenant: &TenantId) -> Result<Vec<Queue>, StoreError>;

    /// Run `work` in a single transaction. Commits if `work` returns `Ok`,
    /// rolls back otherwise.
    fn transaction(
        &self,
        tenant: &TenantId,
        work: &mut TransactionWork<'_>,
    ) -> Result<(), StoreError>;

    /// Reset every job left in progress back to pending. Returns the number of
    /// jobs reset.
    fn reset_in_progress(&self, tenant: &TenantId) -> Result<usize, StoreError>;
}
