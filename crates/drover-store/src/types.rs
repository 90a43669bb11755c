//! Tenant, queue and job types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Identifier of an isolated tenant namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A named, capacity-limited lane for jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue key.
    pub key: String,
    /// Maximum number of jobs of this queue allowed in progress at once.
    pub max_workers: usize,
}

impl Queue {
    /// Create a queue definition.
    pub fn new(key: impl Into<String>, max_workers: usize) -> Self {
        Self {
            key: key.into(),
            max_workers,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Claimed and handed to a worker.
    Progress,
    /// Finished successfully (set by the worker).
    Complete,
    /// Finished with an error (set by the worker).
    Failed,
}

impl JobStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Progress => "progress",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "progress" => Ok(JobStatus::Progress),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown job status '{}'", other))),
        }
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job key, unique within a tenant.
    pub key: String,
    /// Key of the queue this job belongs to.
    pub queue: String,
    /// Current status of the job.
    pub status: JobStatus,
    /// Earliest instant at which the job may be claimed.
    pub delay_until: DateTime<Utc>,
    /// When this job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Opaque command and parameters, interpreted only by the worker.
    pub payload: serde_json::Value,
}

impl Job {
    /// Create a pending job that is eligible immediately.
    pub fn new(key: impl Into<String>, queue: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            queue: queue.into(),
            status: JobStatus::Pending,
            delay_until: now,
            created_at: now,
            payload,
        }
    }

    /// Defer eligibility until `at`.
    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = at;
        self
    }

    /// Check if this job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.delay_until <= now
    }
}

/// Tables a tenant may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Queue definitions.
    Queues,
    /// Job records.
    Jobs,
}

impl Table {
    /// Table name in the backing store.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Queues => "queues",
            Table::Jobs => "jobs",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
