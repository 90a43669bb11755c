//! Drover: multi-tenant background job scheduler
//!
//! Main binary with subcommands:
//! - `run`: Scheduler daemon (recovery sweep, then periodic ticks)
//! - `tenants`: List tenants and whether they have queues and jobs
//! - `recover`: Reset interrupted jobs to pending and exit

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use drover_scheduler::{
    DEFAULT_DELIVERY_QUEUE_SIZE, DEFAULT_DELIVERY_WORKERS, DEFAULT_IDLE_SKIP_TICKS,
    DEFAULT_MAX_CLAIM_BATCH, DEFAULT_PRIMARY_TENANT, SchedulerConfig,
};
use drover_store::{JobStore, SqliteStore, Table, TenantDirectory, TenantId};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

mod daemon;

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Multi-tenant background job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Run {
        /// Directory holding one SQLite database per tenant
        #[arg(long, env = "DROVER_DATA_DIR")]
        data_dir: PathBuf,

        /// Worker endpoint receiving claimed jobs as JSON POST requests
        #[arg(long, env = "DROVER_WORKER_URL")]
        worker_url: String,

        /// Seconds between ticks (fractions allowed)
        #[arg(long, env = "DROVER_POLL_INTERVAL", default_value = "1")]
        poll_interval: f64,

        /// Disable the scheduler without removing it from the deployment.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "DROVER_ENABLED", value_parser = parse_bool_env, default_value = "true")]
        enabled: bool,

        /// Only schedule jobs of the primary tenant.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "DROVER_RESTRICT_TO_PRIMARY_TENANT", value_parser = parse_bool_env, default_value = "false")]
        restrict_to_primary_tenant: bool,

        /// Tenant scheduled when restricted to the primary tenant
        #[arg(long, env = "DROVER_PRIMARY_TENANT", default_value = DEFAULT_PRIMARY_TENANT)]
        primary_tenant: String,

        /// Ticks to skip a tenant that has no queues or jobs
        #[arg(long, env = "DROVER_IDLE_SKIP_TICKS", default_value_t = DEFAULT_IDLE_SKIP_TICKS)]
        idle_skip_ticks: u32,

        /// Most jobs claimed from one queue per tick
        #[arg(long, env = "DROVER_MAX_CLAIM_BATCH", default_value_t = DEFAULT_MAX_CLAIM_BATCH)]
        max_claim_batch: usize,

        /// Seconds to reuse the tenant list before listing the data directory again (0 lists it every tick)
        #[arg(long, env = "DROVER_TENANT_REFRESH", default_value = "0")]
        tenant_refresh: u64,

        /// Number of concurrent deliveries to the worker endpoint
        #[arg(long, env = "DROVER_DELIVERY_WORKERS", default_value_t = DEFAULT_DELIVERY_WORKERS)]
        delivery_workers: usize,

        /// Claimed jobs buffered for delivery before submissions are refused
        #[arg(long, env = "DROVER_DELIVERY_QUEUE_SIZE", default_value_t = DEFAULT_DELIVERY_QUEUE_SIZE)]
        delivery_queue_size: usize,

        /// Milliseconds to wait on a locked tenant database
        #[arg(long, env = "DROVER_BUSY_TIMEOUT_MS", default_value = "250")]
        busy_timeout_ms: u64,
    },

    /// List tenants and whether they have queues and jobs
    Tenants {
        /// Directory holding one SQLite database per tenant
        #[arg(long, env = "DROVER_DATA_DIR")]
        data_dir: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Reset jobs left in progress by a stopped scheduler and exit
    Recover {
        /// Directory holding one SQLite database per tenant
        #[arg(long, env = "DROVER_DATA_DIR")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "drover=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            worker_url,
            poll_interval,
            enabled,
            restrict_to_primary_tenant,
            primary_tenant,
            idle_skip_ticks,
            max_claim_batch,
            tenant_refresh,
            delivery_workers,
            delivery_queue_size,
            busy_timeout_ms,
        } => {
            let config = daemon::DaemonConfig {
                data_dir,
                worker_url,
                scheduler: SchedulerConfig {
                    enabled,
                    restrict_to_primary_tenant,
                    primary_tenant: TenantId::new(primary_tenant),
                    poll_interval_secs: poll_interval,
                    idle_skip_ticks,
                    max_claim_batch,
                    tenant_refresh_secs: tenant_refresh,
                },
                delivery_workers,
                delivery_queue_size,
                busy_timeout: std::time::Duration::from_millis(busy_timeout_ms),
            };
            daemon::run(config).await
        }

        Commands::Tenants { data_dir, json } => list_tenants(data_dir, json),

        Commands::Recover { data_dir } => daemon::recover_once(data_dir).await,
    }
}

/// One row of `drover tenants` output.
struct TenantSummary {
    tenant: TenantId,
    queues: Option<usize>,
    has_jobs: Option<bool>,
}

fn list_tenants(data_dir: PathBuf, json: bool) -> Result<()> {
    let store = Arc::new(
        SqliteStore::open(data_dir).map_err(|e| miette::miette!("failed to open store: {}", e))?,
    );
    let tenants = store
        .list_tenants()
        .map_err(|e| miette::miette!("failed to list tenants: {}", e))?;

    let summaries: Vec<TenantSummary> = tenants
        .into_iter()
        .map(|tenant| {
            let queues = match store.table_populated(&tenant, Table::Queues) {
                Ok(true) => store.list_queues(&tenant).ok().map(|q| q.len()),
                Ok(false) => Some(0),
                Err(_) => None,
            };
            let has_jobs = store.table_populated(&tenant, Table::Jobs).ok();
            TenantSummary {
                tenant,
                queues,
                has_jobs,
            }
        })
        .collect();

    if json {
        let value: Vec<serde_json::Value> = summaries
            .iter()
            .map(|s| {
                serde_json::json!({
                    "tenant": s.tenant,
                    "queues": s.queues,
                    "has_jobs": s.has_jobs,
                })
            })
            .collect();
        let out = serde_json::to_string_pretty(&value)
            .map_err(|e| miette::miette!("failed to encode tenants: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No tenants found.");
        return Ok(());
    }

    println!("{:<32} {:>8} {:>6}", "TENANT", "QUEUES", "JOBS");
    for s in &summaries {
        let queues = s.queues.map_or_else(|| "?".to_string(), |n| n.to_string());
        let jobs = match s.has_jobs {
            Some(true) => "yes",
            Some(false) => "no",
            None => "?",
        };
        println!("{:<32} {:>8} {:>6}", s.tenant, queues, jobs);
    }
    Ok(())
}
