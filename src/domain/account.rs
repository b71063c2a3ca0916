use super::ids::{AdminId, EntryId, FeatureId, OrderId, TaskId, Tokens, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A user account as far as the ledger is concerned: an id and a spendable balance.
///
/// The balance is only ever written by the ledger mutation primitive, which appends
/// a matching [`LedgerEntry`] in the same transaction.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct UserAccount {
    pub id: UserId,
    pub balance: Tokens,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            balance: 0,
            created_at,
        }
    }
}

/// Why a balance changed.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Recharge,
    Consume,
    TaskReward,
    InviteReward,
    Refund,
    AdminAdjustment,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Recharge => "recharge",
            ChangeKind::Consume => "consume",
            ChangeKind::TaskReward => "task_reward",
            ChangeKind::InviteReward => "invite_reward",
            ChangeKind::Refund => "refund",
            ChangeKind::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a ledger entry.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum LedgerRef {
    Order(OrderId),
    Task(TaskId),
    /// Invite records are keyed by their invitee.
    Invite(UserId),
    Admin(AdminId),
    Feature(FeatureId),
}

/// Immutable audit row for a single balance change.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user: UserId,
    pub delta: Tokens,
    pub balance_after: Tokens,
    pub kind: ChangeKind,
    pub reference: Option<LedgerRef>,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

/// A requested balance change, before it has been validated and applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    pub user: UserId,
    pub delta: Tokens,
    pub kind: ChangeKind,
    pub reference: Option<LedgerRef>,
    pub remark: String,
}

impl LedgerChange {
    pub fn new(user: UserId, delta: Tokens, kind: ChangeKind) -> Self {
        Self {
            user,
            delta,
            kind,
            reference: None,
            remark: default_remark(kind).to_string(),
        }
    }

    pub fn with_reference(mut self, reference: LedgerRef) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }
}

fn default_remark(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Recharge => "token recharge",
        ChangeKind::Consume => "token consumption",
        ChangeKind::TaskReward => "task reward",
        ChangeKind::InviteReward => "invite reward",
        ChangeKind::Refund => "refund",
        ChangeKind::AdminAdjustment => "manual adjustment",
    }
}

/// Entry fields the store needs to persist an entry; the id is assigned on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user: UserId,
    pub delta: Tokens,
    pub balance_after: Tokens,
    pub kind: ChangeKind,
    pub reference: Option<LedgerRef>,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn into_entry(self, id: EntryId) -> LedgerEntry {
        LedgerEntry {
            id,
            user: self.user,
            delta: self.delta,
            balance_after: self.balance_after,
            kind: self.kind,
            reference: self.reference,
            remark: self.remark,
            created_at: self.created_at,
        }
    }
}
