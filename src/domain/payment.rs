use super::ids::OrderId;
use super::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only gateway event kind that moves money into an account.
pub const TRANSACTION_SUCCESS: &str = "TRANSACTION.SUCCESS";

/// A verified payment callback, as handed over by the gateway client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub order_id: OrderId,
    pub transaction_id: String,
    pub paid: Amount,
    pub event_kind: String,
}

impl PaymentConfirmation {
    pub fn success(order_id: OrderId, transaction_id: impl Into<String>, paid: Amount) -> Self {
        Self {
            order_id,
            transaction_id: transaction_id.into(),
            paid,
            event_kind: TRANSACTION_SUCCESS.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Pending,
    Success,
    Failed,
}

/// Deduplication record for one `(order, transaction)` pair.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PaymentNotification {
    pub order_id: OrderId,
    pub transaction_id: String,
    pub kind: String,
    pub paid: Amount,
    pub status: NotifyStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Cleared once a validation failure is recorded; the sweep leaves such rows alone.
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl PaymentNotification {
    pub fn new(confirmation: &PaymentConfirmation, now: DateTime<Utc>) -> Self {
        Self {
            order_id: confirmation.order_id,
            transaction_id: confirmation.transaction_id.clone(),
            kind: confirmation.event_kind.clone(),
            paid: confirmation.paid,
            status: NotifyStatus::Pending,
            retry_count: 0,
            last_error: None,
            retryable: true,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NotifyStatus::Success
    }

    /// True when the row has failed and used up its retry budget.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == NotifyStatus::Failed && self.retry_count >= max_retries
    }

    /// Whether the background sweep should pick this row up.
    pub fn is_sweepable(&self, max_retries: u32, touched_before: DateTime<Utc>) -> bool {
        matches!(self.status, NotifyStatus::Pending | NotifyStatus::Failed)
            && self.retryable
            && self.retry_count < max_retries
            && self.updated_at <= touched_before
    }

    /// Puts the row back into `pending` for another attempt and counts it.
    pub fn begin_retry(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = NotifyStatus::Pending;
        self.updated_at = now;
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.status = NotifyStatus::Success;
        self.last_error = None;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, retryable: bool, now: DateTime<Utc>) {
        self.status = NotifyStatus::Failed;
        self.last_error = Some(reason.into());
        self.retryable = retryable;
        self.processed_at = Some(now);
        self.updated_at = now;
    }
}
