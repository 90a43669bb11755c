//! Storage interfaces for the Drover queue scheduler.
//!
//! This crate defines what the scheduler needs from its host:
//! - [`TenantDirectory`]: which tenants exist
//! - [`JobStore`]: per-tenant queues and jobs with serializable claim transactions
//! - [`KeySpace`]: a per-tenant ephemeral integer key space
//!
//! It also ships two stores: [`MemoryStore`] for embedding and tests, and
//! [`SqliteStore`], which keeps one SQLite database per tenant.

mod error;
mod keyspace;
mod memory;
mod sqlite;
mod store;
mod types;

pub use error::StoreError;
pub use keyspace::{KeySpace, MemoryKeySpace};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, TENANT_FILE_EXTENSION};
pub use store::{JobStore, JobTransaction, TenantDirectory, TransactionWork};
pub use types::{Job, JobStatus, Queue, Table, TenantId};
