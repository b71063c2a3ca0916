use super::kv::{Batch, KvBackend, KvPair, Table};
use super::store::KvLedgerStore;
use crate::domain::ports::LockManager;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A thread-safe in-memory key-value backend.
///
/// One `RwLock` guards all tables, so a batch write is atomic with respect to
/// readers. Ideal for testing or runs where persistence is not required.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    tables: Arc<RwLock<HashMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<KvPair>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn write(&self, batch: Batch) -> Result<()> {
        let mut tables = self.tables.write().await;
        for (table, key, value) in batch.puts {
            tables.entry(table).or_default().insert(key, value);
        }
        Ok(())
    }
}

pub type InMemoryLedgerStore = KvLedgerStore<MemoryBackend>;

impl KvLedgerStore<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

struct Hold {
    token: String,
    expires_at: Instant,
}

/// Process-local [`LockManager`]. Expired holds are taken over on the next acquire.
#[derive(Default, Clone)]
pub struct InMemoryLockManager {
    holds: Arc<DashMap<String, Hold>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let hold = Hold {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        match self.holds.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    held.insert(hold);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert(hold);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self
            .holds
            .remove_if(key, |_, hold| hold.token == token)
            .is_some())
    }
}
