//! Key-value layer shared by the storage backends.
//!
//! Every record lives in one [`Table`] under a big-endian key, so that prefix scans
//! return a user's rows in id order. Values are JSON.

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Users,
    Orders,
    Notifications,
    Ledger,
    Tasks,
    Completions,
    Invites,
    Sequences,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Users,
        Table::Orders,
        Table::Notifications,
        Table::Ledger,
        Table::Tasks,
        Table::Completions,
        Table::Invites,
        Table::Sequences,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Orders => "orders",
            Table::Notifications => "notifications",
            Table::Ledger => "ledger",
            Table::Tasks => "tasks",
            Table::Completions => "completions",
            Table::Invites => "invites",
            Table::Sequences => "sequences",
        }
    }
}

pub type KvPair = (Vec<u8>, Vec<u8>);

/// A set of puts applied all-or-nothing.
#[derive(Debug, Default)]
pub struct Batch {
    pub puts: Vec<(Table, Vec<u8>, Vec<u8>)>,
}

impl Batch {
    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.puts.push((table, key, value));
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }
}

#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Rows whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<KvPair>>;
    async fn write(&self, batch: Batch) -> Result<()>;
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Concatenates big-endian ids into one key.
pub fn id_key(parts: &[u64]) -> Vec<u8> {
    parts.iter().flat_map(|part| part.to_be_bytes()).collect()
}

pub fn notification_key(order: u64, transaction_id: &str) -> Vec<u8> {
    let mut key = order.to_be_bytes().to_vec();
    key.extend_from_slice(transaction_id.as_bytes());
    key
}
