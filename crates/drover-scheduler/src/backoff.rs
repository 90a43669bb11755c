//! Per-tenant skip counters that keep idle tenants from being scanned every tick.
//!
//! Each tick decrements the tenant's counter. While it stays positive the
//! tenant is skipped. At zero or below, the queue and job tables are checked;
//! a tenant with either table missing or empty is parked for
//! `idle_skip_ticks` ticks, so a newly activated tenant is discovered within
//! that many ticks.

use std::sync::Arc;

use drover_store::{JobStore, KeySpace, StoreError, Table, TenantId};
use tracing::{debug, trace};

/// Key holding the skip counter in each tenant's key space.
pub const SKIP_KEY: &str = "queue-control/skip";

/// What to do with a tenant this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Counter still positive; nothing was checked.
    Skip { remaining: i64 },
    /// A table was missing or empty; the tenant is parked.
    Idle { table: Table },
    /// Run the claim cycle.
    Scan,
}

/// Decides per tick whether a tenant is worth scanning.
pub struct BackoffController {
    keys: Arc<dyn KeySpace>,
    idle_skip_ticks: i64,
}

impl BackoffController {
    /// Create a controller over `keys`.
    pub fn new(keys: Arc<dyn KeySpace>, idle_skip_ticks: u32) -> Self {
        Self {
            keys,
            idle_skip_ticks: i64::from(idle_skip_ticks),
        }
    }

    /// Advance the tenant's counter by one tick and decide.
    ///
    /// A store error leaves the counter decremented but not parked, so the
    /// next tick checks again.
    pub fn evaluate(&self, store: &dyn JobStore, tenant: &TenantId) -> Result<Decision, StoreError> {
        let remaining = self.keys.incr(tenant, SKIP_KEY, -1);
        if remaining > 0 {
            trace!(tenant = %tenant, remaining, "skipping tenant");
            return Ok(Decision::Skip { remaining });
        }

        for table in [Table::Queues, Table::Jobs] {
            if !store.table_populated(tenant, table)? {
                debug!(
                    tenant = %tenant,
                    table = %table,
                    skip = self.idle_skip_ticks,
                    "tenant has no {}, backing off",
                    table
                );
                self.keys.set(tenant, SKIP_KEY, self.idle_skip_ticks);
                return Ok(Decision::Idle { table });
            }
        }

        Ok(Decision::Scan)
    }

    /// Record that a scan ran: the counter is raised to at least 1.
    pub fn finish_scan(&self, tenant: &TenantId) {
        if self.keys.get(tenant, SKIP_KEY).unwrap_or(0) < 1 {
            self.keys.set(tenant, SKIP_KEY, 1);
        }
    }

    /// Current counter value, if any.
    pub fn remaining(&self, tenant: &TenantId) -> Option<i64> {
        self.keys.get(tenant, SKIP_KEY)
    }
}
