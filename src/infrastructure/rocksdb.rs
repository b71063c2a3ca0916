use super::kv::{Batch, KvBackend, KvPair, Table};
use super::store::KvLedgerStore;
use crate::error::{PortalError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

/// A persistent key-value backend using RocksDB.
///
/// Each [`Table`] maps to its own column family, named after the table. Batches
/// are applied through a single `WriteBatch`, so a committed transaction is either
/// fully on disk or not at all.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<DB>,
}

impl RocksDbBackend {
    /// Opens or creates a RocksDB instance at `path`, creating missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, table: Table) -> Result<&ColumnFamily> {
        self.db.cf_handle(table.name()).ok_or_else(|| {
            PortalError::StorageError(format!("column family {} not found", table.name()))
        })
    }
}

#[async_trait]
impl KvBackend for RocksDbBackend {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(table)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<KvPair>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.into_vec(), value.into_vec()));
        }

        Ok(rows)
    }

    async fn write(&self, batch: Batch) -> Result<()> {
        let mut write_batch = WriteBatch::default();
        for (table, key, value) in batch.puts {
            write_batch.put_cf(self.cf(table)?, key, value);
        }
        self.db.write(write_batch)?;
        Ok(())
    }
}

pub type RocksDbLedgerStore = KvLedgerStore<RocksDbBackend>;

impl KvLedgerStore<RocksDbBackend> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(RocksDbBackend::open(path)?))
    }
}
