use super::kv::{self, Batch, KvBackend, Table};
use crate::domain::account::{LedgerEntry, NewLedgerEntry, UserAccount};
use crate::domain::ids::{OrderId, TaskId, Tokens, UserId};
use crate::domain::invite::InviteRecord;
use crate::domain::order::Order;
use crate::domain::payment::PaymentNotification;
use crate::domain::ports::{LedgerStore, LedgerTx};
use crate::domain::task::{RewardTask, TaskCompletionRecord};
use crate::error::{PortalError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

type RowKey = (Table, Vec<u8>);

struct Shared<B> {
    backend: B,
    /// Serializes the insert re-check and batch write of concurrent commits.
    commit_lock: Mutex<()>,
    sequence_lock: Mutex<()>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
}

/// Transactional [`LedgerStore`] over any [`KvBackend`].
///
/// A transaction stages its writes in memory and applies them as one batch on
/// commit. Inserts are checked for absence again under the commit lock, so two
/// transactions racing to create the same row cannot both succeed: the loser gets
/// [`PortalError::WriteConflict`]. Row locks are plain tokio mutexes keyed by row
/// and owned by the transaction that took them.
///
/// Id sequences advance outside of transactions; a rolled-back transaction leaves
/// a gap.
pub struct KvLedgerStore<B: KvBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: KvBackend> Clone for KvLedgerStore<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: KvBackend> KvLedgerStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                commit_lock: Mutex::new(()),
                sequence_lock: Mutex::new(()),
                row_locks: DashMap::new(),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    async fn scan_values<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        self.shared
            .backend
            .scan_prefix(table, prefix)
            .await?
            .iter()
            .map(|(_, value)| kv::decode(value))
            .collect()
    }
}

#[async_trait]
impl<B: KvBackend> LedgerStore for KvLedgerStore<B> {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(KvTx {
            shared: Arc::clone(&self.shared),
            staged: BTreeMap::new(),
            held: HashMap::new(),
        }))
    }

    async fn users(&self) -> Result<Vec<UserAccount>> {
        self.scan_values(Table::Users, &[]).await
    }

    async fn ledger_entries(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        self.scan_values(Table::Ledger, &kv::id_key(&[user])).await
    }

    async fn notifications(&self) -> Result<Vec<PaymentNotification>> {
        self.scan_values(Table::Notifications, &[]).await
    }

    async fn tasks(&self) -> Result<Vec<RewardTask>> {
        self.scan_values(Table::Tasks, &[]).await
    }
}

enum Staged {
    Put(Vec<u8>),
    Insert(Vec<u8>),
}

impl Staged {
    fn bytes(&self) -> &[u8] {
        match self {
            Staged::Put(bytes) | Staged::Insert(bytes) => bytes,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Staged::Put(bytes) | Staged::Insert(bytes) => bytes,
        }
    }
}

struct KvTx<B: KvBackend> {
    shared: Arc<Shared<B>>,
    staged: BTreeMap<RowKey, Staged>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl<B: KvBackend> KvTx<B> {
    async fn read<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        if let Some(staged) = self.staged.get(&(table, key.to_vec())) {
            return kv::decode(staged.bytes()).map(Some);
        }
        match self.shared.backend.get(table, key).await? {
            Some(bytes) => kv::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Committed rows overlaid with this transaction's staged rows.
    async fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = self
            .shared
            .backend
            .scan_prefix(table, prefix)
            .await?
            .into_iter()
            .collect();
        for ((staged_table, key), staged) in self.staged.range((table, prefix.to_vec())..) {
            if *staged_table != table || !key.starts_with(prefix) {
                break;
            }
            rows.insert(key.clone(), staged.bytes().to_vec());
        }
        rows.values().map(|value| kv::decode(value)).collect()
    }

    /// Blocks until this transaction owns the row. Re-entrant.
    async fn lock_row(&mut self, table: Table, key: Vec<u8>) {
        let row = (table, key);
        if self.held.contains_key(&row) {
            return;
        }
        let mutex = self.shared.row_locks.entry(row.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        self.held.insert(row, guard);
    }

    fn put<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> Result<()> {
        self.staged.insert((table, key), Staged::Put(kv::encode(value)?));
        Ok(())
    }

    fn put_locked<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> Result<()> {
        if !self.held.contains_key(&(table, key.clone())) {
            return Err(PortalError::StorageError(format!(
                "{} row written without holding its lock",
                table.name()
            )));
        }
        self.put(table, key, value)
    }

    async fn insert<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> Result<()> {
        let row = (table, key);
        let exists = self.staged.contains_key(&row)
            || self.shared.backend.get(table, &row.1).await?.is_some();
        if exists {
            return Err(PortalError::WriteConflict(format!(
                "{} row already exists",
                table.name()
            )));
        }
        self.staged.insert(row, Staged::Insert(kv::encode(value)?));
        Ok(())
    }

    async fn next_id(&self, table: Table) -> Result<u64> {
        let _guard = self.shared.sequence_lock.lock().await;
        let key = table.name().as_bytes();
        let current: u64 = match self.shared.backend.get(Table::Sequences, key).await? {
            Some(bytes) => kv::decode(&bytes)?,
            None => 0,
        };
        let next = current + 1;
        let mut batch = Batch::default();
        batch.put(Table::Sequences, key.to_vec(), kv::encode(&next)?);
        self.shared.backend.write(batch).await?;
        Ok(next)
    }
}

impl<B: KvBackend> Drop for KvTx<B> {
    fn drop(&mut self) {
        let rows: Vec<RowKey> = self
            .held
            .drain()
            .map(|(row, guard)| {
                drop(guard);
                row
            })
            .collect();
        for row in rows {
            self.shared
                .row_locks
                .remove_if(&row, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

#[async_trait]
impl<B: KvBackend> LedgerTx for KvTx<B> {
    async fn user(&mut self, id: UserId) -> Result<Option<UserAccount>> {
        self.read(Table::Users, &kv::id_key(&[id])).await
    }

    async fn lock_user(&mut self, id: UserId) -> Result<UserAccount> {
        let key = kv::id_key(&[id]);
        self.lock_row(Table::Users, key.clone()).await;
        self.read(Table::Users, &key)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("user {id}")))
    }

    async fn insert_user(&mut self, user: &UserAccount) -> Result<()> {
        self.insert(Table::Users, kv::id_key(&[user.id]), user).await
    }

    async fn update_user(&mut self, user: &UserAccount) -> Result<()> {
        self.put_locked(Table::Users, kv::id_key(&[user.id]), user)
    }

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry> {
        let id = self.next_id(Table::Ledger).await?;
        let entry = entry.into_entry(id);
        self.insert(Table::Ledger, kv::id_key(&[entry.user, id]), &entry)
            .await?;
        Ok(entry)
    }

    async fn next_order_id(&mut self) -> Result<OrderId> {
        self.next_id(Table::Orders).await
    }

    async fn order(&mut self, id: OrderId) -> Result<Option<Order>> {
        self.read(Table::Orders, &kv::id_key(&[id])).await
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Order> {
        let key = kv::id_key(&[id]);
        self.lock_row(Table::Orders, key.clone()).await;
        self.read(Table::Orders, &key)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("order {id}")))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        self.insert(Table::Orders, kv::id_key(&[order.id]), order).await
    }

    async fn update_order(&mut self, order: &Order) -> Result<()> {
        self.put_locked(Table::Orders, kv::id_key(&[order.id]), order)
    }

    async fn notification(
        &mut self,
        order: OrderId,
        transaction_id: &str,
    ) -> Result<Option<PaymentNotification>> {
        self.read(
            Table::Notifications,
            &kv::notification_key(order, transaction_id),
        )
        .await
    }

    async fn lock_notification(
        &mut self,
        order: OrderId,
        transaction_id: &str,
    ) -> Result<Option<PaymentNotification>> {
        let key = kv::notification_key(order, transaction_id);
        self.lock_row(Table::Notifications, key.clone()).await;
        self.read(Table::Notifications, &key).await
    }

    async fn insert_notification(&mut self, notification: &PaymentNotification) -> Result<()> {
        let key = kv::notification_key(notification.order_id, &notification.transaction_id);
        self.insert(Table::Notifications, key, notification).await
    }

    async fn update_notification(&mut self, notification: &PaymentNotification) -> Result<()> {
        let key = kv::notification_key(notification.order_id, &notification.transaction_id);
        self.put_locked(Table::Notifications, key, notification)
    }

    async fn task(&mut self, id: TaskId) -> Result<Option<RewardTask>> {
        self.read(Table::Tasks, &kv::id_key(&[id])).await
    }

    async fn put_task(&mut self, task: &RewardTask) -> Result<()> {
        self.put(Table::Tasks, kv::id_key(&[task.id]), task)
    }

    async fn completions(&mut self, user: UserId, task: TaskId) -> Result<Vec<TaskCompletionRecord>> {
        self.scan(Table::Completions, &kv::id_key(&[user, task])).await
    }

    async fn append_completion(
        &mut self,
        user: UserId,
        task: TaskId,
        reward: Tokens,
        at: DateTime<Utc>,
    ) -> Result<TaskCompletionRecord> {
        let id = self.next_id(Table::Completions).await?;
        let record = TaskCompletionRecord {
            id,
            user,
            task,
            reward,
            completed_at: at,
        };
        self.insert(Table::Completions, kv::id_key(&[user, task, id]), &record)
            .await?;
        Ok(record)
    }

    async fn invite(&mut self, invitee: UserId) -> Result<Option<InviteRecord>> {
        self.read(Table::Invites, &kv::id_key(&[invitee])).await
    }

    async fn lock_invite(&mut self, invitee: UserId) -> Result<Option<InviteRecord>> {
        let key = kv::id_key(&[invitee]);
        self.lock_row(Table::Invites, key.clone()).await;
        self.read(Table::Invites, &key).await
    }

    async fn insert_invite(&mut self, invite: &InviteRecord) -> Result<()> {
        self.insert(Table::Invites, kv::id_key(&[invite.invitee]), invite)
            .await
    }

    async fn update_invite(&mut self, invite: &InviteRecord) -> Result<()> {
        self.put_locked(Table::Invites, kv::id_key(&[invite.invitee]), invite)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }
        let _commit = self.shared.commit_lock.lock().await;
        let mut batch = Batch::default();
        for ((table, key), write) in staged {
            if matches!(write, Staged::Insert(_))
                && self.shared.backend.get(table, &key).await?.is_some()
            {
                warn!(table = table.name(), "Insert lost a race at commit");
                return Err(PortalError::WriteConflict(format!(
                    "{} row was created concurrently",
                    table.name()
                )));
            }
            batch.put(table, key, write.into_bytes());
        }
        let rows = batch.puts.len();
        self.shared.backend.write(batch).await?;
        debug!(rows, "Committed transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(rows = self.staged.len(), "Rolled back transaction");
        Ok(())
    }
}
