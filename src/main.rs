use clap::{Args, Parser};
use miette::{IntoDiagnostic, Result};
use portal_ledger::application::events::{EventPublisher, LogSink, NotificationWorker};
use portal_ledger::application::portal::Portal;
use portal_ledger::config::PolicyConfig;
use portal_ledger::domain::ports::{LedgerStoreRef, LockManagerRef};
use portal_ledger::infrastructure::clock::SystemClock;
use portal_ledger::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryLockManager};
use portal_ledger::interfaces::csv::balance_writer::BalanceWriter;
use portal_ledger::interfaces::csv::event_reader::EventReader;
use portal_ledger::interfaces::seed::Seed;
use portal_ledger::telemetry;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input events CSV file
    input: PathBuf,

    /// JSON file with users, orders, tasks and invites to create before replaying
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "PORTAL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Redis URL for advisory locks shared between processes. Requires 'lock-redis'.
    #[arg(long, env = "PORTAL_REDIS_URL")]
    redis_url: Option<String>,

    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Args)]
struct PolicyArgs {
    #[arg(long, env = "PORTAL_PAYMENT_LOCK_TTL_SECS", default_value_t = 30)]
    payment_lock_ttl_secs: u64,

    #[arg(long, env = "PORTAL_TASK_LOCK_TTL_SECS", default_value_t = 10)]
    task_lock_ttl_secs: u64,

    #[arg(long, env = "PORTAL_INVITE_LOCK_TTL_SECS", default_value_t = 10)]
    invite_lock_ttl_secs: u64,

    /// Retries a failed payment notification gets before it needs an operator
    #[arg(long, env = "PORTAL_MAX_RETRIES", default_value_t = 3)]
    max_notification_retries: u32,

    #[arg(long, env = "PORTAL_SWEEP_BATCH", default_value_t = 100)]
    sweep_batch_size: usize,

    #[arg(long, env = "PORTAL_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    #[arg(long, env = "PORTAL_SWEEP_GRACE_SECS", default_value_t = 30)]
    sweep_grace_secs: u64,

    #[arg(long, env = "PORTAL_EVENT_BUFFER", default_value_t = 256)]
    event_buffer: usize,

    #[arg(long, env = "PORTAL_MIN_WATCH_SECONDS", default_value_t = 15)]
    min_watch_seconds: u64,

    /// UTC offset, in minutes, of the midnight that resets daily task caps
    #[arg(long, env = "PORTAL_DAY_OFFSET_MINUTES", default_value_t = 0, allow_negative_numbers = true)]
    day_offset_minutes: i32,
}

impl From<PolicyArgs> for PolicyConfig {
    fn from(args: PolicyArgs) -> Self {
        Self {
            payment_lock_ttl_secs: args.payment_lock_ttl_secs,
            task_lock_ttl_secs: args.task_lock_ttl_secs,
            invite_lock_ttl_secs: args.invite_lock_ttl_secs,
            max_notification_retries: args.max_notification_retries,
            sweep_batch_size: args.sweep_batch_size,
            sweep_interval_secs: args.sweep_interval_secs,
            sweep_grace_secs: args.sweep_grace_secs,
            event_buffer: args.event_buffer,
            min_watch_seconds: args.min_watch_seconds,
            day_offset_minutes: args.day_offset_minutes,
        }
    }
}

fn open_store(db_path: Option<PathBuf>) -> Result<LedgerStoreRef> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        use portal_ledger::infrastructure::rocksdb::RocksDbLedgerStore;
        return Ok(Arc::new(RocksDbLedgerStore::open(path)?));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        warn!(
            "Persistent storage requested via --db-path, but the 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }

    Ok(Arc::new(InMemoryLedgerStore::in_memory()))
}

async fn open_locks(redis_url: Option<&str>) -> Result<LockManagerRef> {
    #[cfg(feature = "lock-redis")]
    if let Some(url) = redis_url {
        use portal_ledger::infrastructure::redis_lock::RedisLockManager;
        return Ok(Arc::new(RedisLockManager::new(url, None).await?));
    }

    #[cfg(not(feature = "lock-redis"))]
    if redis_url.is_some() {
        warn!(
            "Shared locks requested via --redis-url, but the 'lock-redis' feature is not enabled. Falling back to in-process locks."
        );
    }

    Ok(Arc::new(InMemoryLockManager::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init("info");

    let locks = open_locks(cli.redis_url.as_deref()).await?;
    let policy = PolicyConfig::from(cli.policy);
    let store = open_store(cli.db_path)?;

    let (events, receiver) = EventPublisher::channel(policy.event_buffer);
    let worker = NotificationWorker::new(receiver, Arc::new(LogSink)).spawn();
    let portal = Portal::new(store, locks, Arc::new(SystemClock), policy, events)?;

    if let Some(seed_path) = cli.seed {
        let seed = Seed::from_reader(File::open(seed_path).into_diagnostic()?)?;
        seed.apply(&portal).await?;
    }

    // Replay events; a rejected event is reported and skipped.
    let file = File::open(cli.input).into_diagnostic()?;
    for (index, event) in EventReader::new(file).events().enumerate() {
        let row = index + 1;
        match event {
            Ok(event) => {
                if let Err(e) = portal.apply(event).await {
                    warn!(row, error = %e, "Event rejected");
                }
            }
            Err(e) => warn!(row, error = %e, "Unreadable event"),
        }
    }

    let balances = portal.balances().await?;
    drop(portal);
    let delivered = worker.await.into_diagnostic()?;
    debug!(delivered, "Notification worker drained");

    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_balances(&balances)?;

    Ok(())
}
