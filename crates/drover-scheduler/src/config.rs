//! Scheduler configuration.

use std::time::Duration;

use drover_store::TenantId;
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Default number of ticks an idle tenant is skipped for.
pub const DEFAULT_IDLE_SKIP_TICKS: u32 = 10;

/// Default upper bound on jobs claimed per queue per tick.
pub const DEFAULT_MAX_CLAIM_BATCH: usize = 100;

/// Default tenant the scan is restricted to when asked.
pub const DEFAULT_PRIMARY_TENANT: &str = "_system";

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler runs at all.
    pub enabled: bool,

    /// Only scan the primary tenant.
    pub restrict_to_primary_tenant: bool,

    /// Tenant scanned when `restrict_to_primary_tenant` is set.
    pub primary_tenant: TenantId,

    /// Seconds between ticks. Fractions allowed.
    pub poll_interval_secs: f64,

    /// Ticks to skip a tenant after finding it without queues or jobs.
    pub idle_skip_ticks: u32,

    /// Most jobs claimed from one queue in one tick.
    pub max_claim_batch: usize,

    /// Seconds to reuse the tenant list before enumerating again. Zero lists
    /// the directory on every tick.
    pub tenant_refresh_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restrict_to_primary_tenant: false,
            primary_tenant: TenantId::from(DEFAULT_PRIMARY_TENANT),
            poll_interval_secs: 1.0,
            idle_skip_ticks: DEFAULT_IDLE_SKIP_TICKS,
            max_claim_batch: DEFAULT_MAX_CLAIM_BATCH,
            tenant_refresh_secs: 0,
        }
    }
}

impl SchedulerConfig {
    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !self.poll_interval_secs.is_finite() || self.poll_interval_secs <= 0.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "poll interval must be a positive number of seconds, got {}",
                self.poll_interval_secs
            )));
        }
        if self.idle_skip_ticks == 0 {
            return Err(SchedulerError::InvalidConfig(
                "idle skip ticks must be at least 1".to_string(),
            ));
        }
        if self.max_claim_batch == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max claim batch must be at least 1".to_string(),
            ));
        }
        if self.primary_tenant.as_str().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "primary tenant must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs).unwrap_or(Duration::from_secs(1))
    }

    /// Get the tenant list refresh interval as a Duration.
    pub fn tenant_refresh(&self) -> Duration {
        Duration::from_secs(self.tenant_refresh_secs)
    }
}
