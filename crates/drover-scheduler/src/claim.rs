//! Claim transaction: atomically move eligible pending jobs of one queue to
//! progress without exceeding the queue's `max_workers`.

use chrono::{DateTime, Utc};
use drover_store::{Job, JobStatus, JobStore, JobTransaction, StoreError, TenantId};
use tracing::{debug, trace};

/// Claim up to the queue's free capacity (at most `batch_limit`) of jobs that
/// are pending with `delay_until <= now`.
///
/// The capacity read, selection and status writes happen in one store
/// transaction. Returns the claimed jobs, already marked [`JobStatus::Progress`].
/// A queue that no longer exists or has no free capacity yields an empty list
/// and writes nothing.
pub fn claim(
    store: &dyn JobStore,
    tenant: &TenantId,
    queue_key: &str,
    now: DateTime<Utc>,
    batch_limit: usize,
) -> Result<Vec<Job>, StoreError> {
    let mut claimed = Vec::new();

    store.transaction(tenant, &mut |tx: &mut dyn JobTransaction| {
        // The closure may be retried by a store; start from scratch each time.
        claimed.clear();

        let Some(queue) = tx.queue(queue_key)? else {
            trace!(tenant = %tenant, queue = queue_key, "queue vanished before claim");
            return Ok(());
        };

        let busy = tx.count_in_progress(queue_key)?;
        let capacity = queue.max_workers.saturating_sub(busy).min(batch_limit);
        if capacity == 0 {
            if busy > queue.max_workers {
                debug!(
                    tenant = %tenant,
                    queue = queue_key,
                    busy,
                    max_workers = queue.max_workers,
                    "queue over capacity, claiming nothing"
                );
            }
            return Ok(());
        }

        for mut job in tx.select_eligible(queue_key, now, capacity)? {
            tx.mark_in_progress(&job.key)?;
            job.status = JobStatus::Progress;
            claimed.push(job);
        }
        Ok(())
    })?;

    if !claimed.is_empty() {
        debug!(tenant = %tenant, queue = queue_key, count = claimed.len(), "claimed jobs");
    }
    Ok(claimed)
}
