//! Multi-tenant job queue scheduler for Drover.
//!
//! Once per tick, for every tenant:
//! - Skip tenants that recently had no queues or jobs ([`BackoffController`])
//! - Claim eligible pending jobs per queue without exceeding `max_workers`
//!   ([`claim`])
//! - Hand claimed jobs to a [`TaskExecutor`] without waiting for them
//!
//! [`Runner`] drives ticks on a tokio interval and resets interrupted jobs
//! once at startup.

mod backoff;
mod claim;
mod config;
mod dispatch;
mod error;
mod manager;
mod runner;
mod webhook;

pub use backoff::{BackoffController, Decision, SKIP_KEY};
pub use claim::claim;
pub use config::{
    DEFAULT_IDLE_SKIP_TICKS, DEFAULT_MAX_CLAIM_BATCH, DEFAULT_PRIMARY_TENANT, SchedulerConfig,
};
pub use dispatch::{
    Accepted, DispatchReport, Dispatcher, JobEnvelope, JobHandler, SpawnExecutor, TaskExecutor,
};
pub use error::{SchedulerError, SubmissionError};
pub use manager::{Manager, RecoveryReport, TickReport, recover};
pub use runner::Runner;
pub use webhook::{
    DEFAULT_DELIVERY_QUEUE_SIZE, DEFAULT_DELIVERY_WORKERS, DeliveryPool, WebhookConfig,
    WebhookExecutor,
};
