use super::ids::{OrderId, Tokens, UserId};
use super::money::Amount;
use crate::error::PortalError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
    Refunded,
}

/// Every legal status change. Anything absent from this table is a state conflict.
const TRANSITIONS: &[(OrderStatus, OrderStatus)] = &[
    (OrderStatus::Pending, OrderStatus::Completed),
    (OrderStatus::Pending, OrderStatus::Cancelled),
    // Reversal of a refund. Only reachable through an operator status update.
    (OrderStatus::Refunded, OrderStatus::Completed),
];

impl OrderStatus {
    pub fn can_transition(self, to: OrderStatus) -> bool {
        TRANSITIONS.contains(&(self, to))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Wechat,
    Alipay,
    Manual,
}

/// A monetary intent: pay `amount`, receive `tokens`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Order {
    pub id: OrderId,
    pub user: UserId,
    pub amount: Amount,
    pub tokens: Tokens,
    pub method: PaymentMethod,
    pub status: OrderStatus,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Moves the order to `to` without a payment attached.
    ///
    /// `pending -> completed` is refused here: that edge needs a matching payment and
    /// goes through [`Order::mark_paid`].
    pub fn transition(&mut self, to: OrderStatus) -> Result<(), PortalError> {
        if self.status == OrderStatus::Pending && to == OrderStatus::Completed {
            return Err(PortalError::StateConflict(format!(
                "order {} can only complete through a confirmed payment",
                self.id
            )));
        }
        self.check_transition(to)?;
        self.status = to;
        Ok(())
    }

    /// Completes a pending order for a confirmed payment of `paid`.
    pub fn mark_paid(
        &mut self,
        transaction_id: &str,
        paid: Amount,
        at: DateTime<Utc>,
    ) -> Result<(), PortalError> {
        if self.status != OrderStatus::Pending {
            return Err(PortalError::StateConflict(format!(
                "order {} is {}, expected pending",
                self.id, self.status
            )));
        }
        self.check_transition(OrderStatus::Completed)?;
        if paid != self.amount {
            return Err(PortalError::ValidationError(format!(
                "payment amount mismatch for order {}: expected {}, got {}",
                self.id, self.amount, paid
            )));
        }
        self.status = OrderStatus::Completed;
        self.transaction_id = Some(transaction_id.to_string());
        self.paid_at = Some(at);
        Ok(())
    }

    fn check_transition(&self, to: OrderStatus) -> Result<(), PortalError> {
        if self.status.can_transition(to) {
            Ok(())
        } else {
            Err(PortalError::StateConflict(format!(
                "order {} cannot move from {} to {}",
                self.id, self.status, to
            )))
        }
    }
}
