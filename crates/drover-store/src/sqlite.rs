//! SQLite-backed job store: one database file per tenant.
//!
//! Tenants are the `*.sqlite` files in the root directory; the file stem is
//! the tenant id. Claim transactions use `BEGIN IMMEDIATE`, which takes the
//! database write lock up front and so serializes claims across every process
//! that opens the same file.

use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use crate::{
    Job, JobStatus, JobStore, JobTransaction, Queue, StoreError, Table, TenantDirectory, TenantId,
    TransactionWork,
};

/// File extension of tenant databases.
pub const TENANT_FILE_EXTENSION: &str = "sqlite";

/// Default time to wait on a locked database before giving up.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const JOB_COLUMNS: &str = "key, queue, status, delay_until, created_at, payload";

/// SQLite implementation of [`JobStore`] and [`TenantDirectory`].
pub struct SqliteStore {
    root: PathBuf,
    busy_timeout: Duration,
    connections: DashMap<TenantId, TenantConnection>,
}

/// A cached connection and the file it was opened on.
struct TenantConnection {
    conn: Arc<Mutex<Connection>>,
    file: FileId,
}

/// Identifies a database file across renames and replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(meta: &Metadata) -> Self {
        let created = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            dev: created.as_secs(),
            ino: u64::from(created.subsec_nanos()),
        }
    }
}

impl SqliteStore {
    /// Table layout the store reads and writes. Creating and migrating it is
    /// the host's job; this constant documents the contract.
    pub const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS queues (
            key TEXT PRIMARY KEY,
            max_workers INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            key TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            delay_until INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, status, delay_until);
    ";

    /// Open a store rooted at `root`, which must be an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "tenant directory {} does not exist",
                root.display()
            )));
        }

        info!(root = %root.display(), "opened sqlite job store");
        Ok(Self {
            root,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            connections: DashMap::new(),
        })
    }

    /// How long to wait on a locked database before reporting it unavailable.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Path of a tenant's database file.
    pub fn tenant_path(&self, tenant: &TenantId) -> Result<PathBuf, StoreError> {
        let id = tenant.as_str();
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(StoreError::TenantNotFound(tenant.clone()));
        }
        Ok(self
            .root
            .join(format!("{}.{}", id, TENANT_FILE_EXTENSION)))
    }

    /// Forget cached connections, e.g. after tenant files were replaced.
    pub fn close_all(&self) {
        self.connections.clear();
    }

    /// The tenant's connection, reopened if the file was replaced since it
    /// was cached.
    fn connection(&self, tenant: &TenantId) -> Result<Arc<Mutex<Connection>>, StoreError> {
        let path = self.tenant_path(tenant)?;
        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(self.tenant_gone(tenant)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.tenant_gone(tenant));
            }
            Err(e) => return Err(e.into()),
        };
        let file = FileId::of(&meta);

        if let Some(cached) = self.connections.get(tenant) {
            if cached.file == file {
                return Ok(Arc::clone(&cached.conn));
            }
            info!(tenant = %tenant, path = %path.display(), "tenant database replaced, reopening");
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        debug!(tenant = %tenant, path = %path.display(), "opened tenant database");

        let conn = Arc::new(Mutex::new(conn));
        self.connections.insert(
            tenant.clone(),
            TenantConnection {
                conn: Arc::clone(&conn),
                file,
            },
        );
        Ok(conn)
    }

    fn tenant_gone(&self, tenant: &TenantId) -> StoreError {
        if self.connections.remove(tenant).is_some() {
            debug!(tenant = %tenant, "tenant database removed, closed connection");
        }
        StoreError::TenantNotFound(tenant.clone())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
}

fn table_exists(conn: &Connection, table: Table) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table.name()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// A job row as stored, before decoding.
struct JobRow {
    key: String,
    queue: String,
    status: String,
    delay_until: i64,
    created_at: i64,
    payload: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            queue: row.get(1)?,
            status: row.get(2)?,
            delay_until: row.get(3)?,
            created_at: row.get(4)?,
            payload: row.get(5)?,
        })
    }
}

fn from_millis(key: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("job {} has out-of-range timestamp {}", key, ms)))
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            status: row.status.parse()?,
            delay_until: from_millis(&row.key, row.delay_until)?,
            created_at: from_millis(&row.key, row.created_at)?,
            payload: serde_json::from_str(&row.payload)?,
            queue: row.queue,
            key: row.key,
        })
    }
}

fn queue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Queue> {
    let max_workers: i64 = row.get(1)?;
    Ok(Queue {
        key: row.get(0)?,
        // Negative capacity means no capacity.
        max_workers: usize::try_from(max_workers).unwrap_or(0),
    })
}

impl TenantDirectory for SqliteStore {
    fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let mut tenants = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(TENANT_FILE_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                tenants.push(TenantId::from(stem));
            }
        }
        tenants.sort();

        // Close connections to databases that are gone.
        self.connections
            .retain(|tenant, _| tenants.binary_search(tenant).is_ok());
        Ok(tenants)
    }
}

impl JobStore for SqliteStore {
    fn table_populated(&self, tenant: &TenantId, table: Table) -> Result<bool, StoreError> {
        let slot = self.connection(tenant)?;
        let conn = lock(&slot)?;
        if !table_exists(&conn, table)? {
            return Ok(false);
        }

        // Table names come from a closed enum, never from input.
        let populated = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {})", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(populated)
    }

    fn list_queues(&self, tenant: &TenantId) -> Result<Vec<Queue>, StoreError> {
        let slot = self.connection(tenant)?;
        let conn = lock(&slot)?;
        let mut stmt = conn.prepare_cached("SELECT key, max_workers FROM queues ORDER BY key")?;
        let queues = stmt
            .query_map([], queue_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(queues)
    }

    fn transaction(
        &self,
        tenant: &TenantId,
        work: &mut TransactionWork<'_>,
    ) -> Result<(), StoreError> {
        let slot = self.connection(tenant)?;
        let mut conn = lock(&slot)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Dropping `tx` without commit rolls back.
        work(&mut SqliteTransaction { tenant, conn: &tx })?;
        tx.commit()?;
        Ok(())
    }

    fn reset_in_progress(&self, tenant: &TenantId) -> Result<usize, StoreError> {
        let slot = self.connection(tenant)?;
        let mut conn = lock(&slot)?;
        if !table_exists(&conn, Table::Jobs)? {
            return Ok(0);
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reset = tx.execute(
            "UPDATE jobs SET status = ?1 WHERE status = ?2",
            params![JobStatus::Pending.as_str(), JobStatus::Progress.as_str()],
        )?;
        tx.commit()?;
        Ok(reset)
    }
}

struct SqliteTransaction<'a> {
    tenant: &'a TenantId,
    conn: &'a Connection,
}

impl JobTransaction for SqliteTransaction<'_> {
    fn queue(&mut self, key: &str) -> Result<Option<Queue>, StoreError> {
        let queue = self
            .conn
            .prepare_cached("SELECT key, max_workers FROM queues WHERE key = ?1")?
            .query_row(params![key], queue_from_row)
            .optional()?;
        Ok(queue)
    }

    fn count_in_progress(&mut self, queue: &str) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = ?2")?
            .query_row(params![queue, JobStatus::Progress.as_str()], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn select_eligible(
        &mut self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM jobs
             WHERE queue = ?1 AND status = ?2 AND delay_until <= ?3
             ORDER BY delay_until ASC, rowid ASC
             LIMIT ?4",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![
                    queue,
                    JobStatus::Pending.as_str(),
                    now.timestamp_millis(),
                    i64::try_from(limit).unwrap_or(i64::MAX),
                ],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(Job::try_from).collect()
    }

    fn mark_in_progress(&mut self, job_key: &str) -> Result<(), StoreError> {
        let updated = self
            .conn
            .prepare_cached("UPDATE jobs SET status = ?1 WHERE key = ?2 AND status = ?3")?
            .execute(params![
                JobStatus::Progress.as_str(),
                job_key,
                JobStatus::Pending.as_str()
            ])?;
        if updated == 1 {
            return Ok(());
        }

        let current: Option<String> = self
            .conn
            .prepare_cached("SELECT status FROM jobs WHERE key = ?1")?
            .query_row(params![job_key], |row| row.get(0))
            .optional()?;
        match current {
            None => Err(StoreError::JobNotFound {
                tenant: self.tenant.clone(),
                key: job_key.to_string(),
            }),
            Some(status) => Err(StoreError::InvalidTransition {
                key: job_key.to_string(),
                from: status.parse()?,
                to: JobStatus::Progress,
            }),
        }
    }
}
