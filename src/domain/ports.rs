use super::account::{LedgerEntry, NewLedgerEntry, UserAccount};
use super::ids::{OrderId, TaskId, Tokens, UserId};
use super::invite::InviteRecord;
use super::order::Order;
use super::payment::PaymentNotification;
use super::task::{RewardTask, TaskCompletionRecord};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Durable storage for accounts, the ledger and the records that drive it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens a transaction. Dropping it without calling `commit` rolls it back.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    async fn users(&self) -> Result<Vec<UserAccount>>;
    /// Entries of one user, oldest first.
    async fn ledger_entries(&self, user: UserId) -> Result<Vec<LedgerEntry>>;
    async fn notifications(&self) -> Result<Vec<PaymentNotification>>;
    async fn tasks(&self) -> Result<Vec<RewardTask>>;
}

/// A unit of work against a [`LedgerStore`].
///
/// Writes are only visible to others after `commit`. The `lock_*` methods take a
/// row lock that is held until the transaction commits or is dropped; they block
/// while another transaction holds the same row.
#[async_trait]
pub trait LedgerTx: Send {
    async fn user(&mut self, id: UserId) -> Result<Option<UserAccount>>;
    async fn lock_user(&mut self, id: UserId) -> Result<UserAccount>;
    async fn insert_user(&mut self, user: &UserAccount) -> Result<()>;
    /// Only legal on a row locked through `lock_user`.
    async fn update_user(&mut self, user: &UserAccount) -> Result<()>;
    async fn append_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry>;

    async fn next_order_id(&mut self) -> Result<OrderId>;
    async fn order(&mut self, id: OrderId) -> Result<Option<Order>>;
    async fn lock_order(&mut self, id: OrderId) -> Result<Order>;
    async fn insert_order(&mut self, order: &Order) -> Result<()>;
    /// Only legal on a row locked through `lock_order`.
    async fn update_order(&mut self, order: &Order) -> Result<()>;

    async fn notification(
        &mut self,
        order: OrderId,
        transaction_id: &str,
    ) -> Result<Option<PaymentNotification>>;
    /// Locks the row even when it does not exist yet, so a following insert is
    /// serialized with other callers for the same payment.
    async fn lock_notification(
        &mut self,
        order: OrderId,
        transaction_id: &str,
    ) -> Result<Option<PaymentNotification>>;
    async fn insert_notification(&mut self, notification: &PaymentNotification) -> Result<()>;
    /// Only legal on a row locked through `lock_notification`.
    async fn update_notification(&mut self, notification: &PaymentNotification) -> Result<()>;

    async fn task(&mut self, id: TaskId) -> Result<Option<RewardTask>>;
    async fn put_task(&mut self, task: &RewardTask) -> Result<()>;
    async fn completions(&mut self, user: UserId, task: TaskId) -> Result<Vec<TaskCompletionRecord>>;
    async fn append_completion(
        &mut self,
        user: UserId,
        task: TaskId,
        reward: Tokens,
        at: DateTime<Utc>,
    ) -> Result<TaskCompletionRecord>;

    async fn invite(&mut self, invitee: UserId) -> Result<Option<InviteRecord>>;
    async fn lock_invite(&mut self, invitee: UserId) -> Result<Option<InviteRecord>>;
    async fn insert_invite(&mut self, invite: &InviteRecord) -> Result<()>;
    /// Only legal on a row locked through `lock_invite`.
    async fn update_invite(&mut self, invite: &InviteRecord) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Advisory, TTL-bounded mutual exclusion over string keys.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Sets `key` to `token` unless it is held; the hold lapses after `ttl`.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;
    /// Clears `key` only while it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type LockManagerRef = Arc<dyn LockManager>;
pub type ClockRef = Arc<dyn Clock>;
