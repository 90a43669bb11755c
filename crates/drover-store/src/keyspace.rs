//! Per-tenant ephemeral key space.

use dashmap::DashMap;

use crate::TenantId;

/// Integer key/value space addressed by tenant.
///
/// Values are advisory: losing them (for example on restart) must never
/// affect correctness.
pub trait KeySpace: Send + Sync {
    /// Read a value.
    fn get(&self, tenant: &TenantId, key: &str) -> Option<i64>;

    /// Overwrite a value.
    fn set(&self, tenant: &TenantId, key: &str, value: i64);

    /// Atomically add `delta` to a value (missing reads as 0) and return the
    /// new value.
    fn incr(&self, tenant: &TenantId, key: &str, delta: i64) -> i64;
}

/// In-memory key space.
///
/// Share one instance between managers to share their backoff state, or give
/// each its own to isolate it.
#[derive(Debug, Default)]
pub struct MemoryKeySpace {
    values: DashMap<(TenantId, String), i64>,
}

impl MemoryKeySpace {
    /// Create an empty key space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every value held for `tenant`.
    pub fn clear_tenant(&self, tenant: &TenantId) {
        self.values.retain(|(t, _), _| t != tenant);
    }
}

impl KeySpace for MemoryKeySpace {
    fn get(&self, tenant: &TenantId, key: &str) -> Option<i64> {
        self.values
            .get(&(tenant.clone(), key.to_string()))
            .map(|v| *v)
    }

    fn set(&self, tenant: &TenantId, key: &str, value: i64) {
        self.values.insert((tenant.clone(), key.to_string()), value);
    }

    fn incr(&self, tenant: &TenantId, key: &str, delta: i64) -> i64 {
        let mut entry = self
            .values
            .entry((tenant.clone(), key.to_string()))
            .or_insert(0);
        *entry += delta;
        *entry
    }
}
