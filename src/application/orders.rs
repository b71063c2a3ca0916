use crate::domain::ids::{OrderId, Tokens, UserId};
use crate::domain::money::Amount;
use crate::domain::order::{Order, OrderStatus, PaymentMethod};
use crate::domain::ports::{ClockRef, LedgerStoreRef};
use crate::error::{PortalError, Result};
use tracing::info;

/// Creation and non-payment status changes of orders.
///
/// Completion through a payment belongs to the reconciler; this service never
/// touches balances.
pub struct OrderService {
    store: LedgerStoreRef,
    clock: ClockRef,
}

impl OrderService {
    pub fn new(store: LedgerStoreRef, clock: ClockRef) -> Self {
        Self { store, clock }
    }

    /// Opens a pending order for `user` to pay `amount` and receive `tokens`.
    pub async fn checkout(
        &self,
        user: UserId,
        amount: Amount,
        tokens: Tokens,
        method: PaymentMethod,
    ) -> Result<Order> {
        if tokens <= 0 {
            return Err(PortalError::ValidationError(format!(
                "token quantity must be positive, got {tokens}"
            )));
        }

        let mut tx = self.store.begin().await?;
        if tx.user(user).await?.is_none() {
            return Err(PortalError::NotFound(format!("user {user}")));
        }
        let order = Order {
            id: tx.next_order_id().await?,
            user,
            amount,
            tokens,
            method,
            status: OrderStatus::Pending,
            transaction_id: None,
            created_at: self.clock.now(),
            paid_at: None,
        };
        tx.insert_order(&order).await?;
        tx.commit().await?;

        info!(order = order.id, user, amount = %amount, tokens, "Order created");
        Ok(order)
    }

    pub async fn order(&self, id: OrderId) -> Result<Order> {
        let mut tx = self.store.begin().await?;
        tx.order(id)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("order {id}")))
    }

    /// User cancel or gateway close. Cancelling a cancelled order is a no-op.
    pub async fn cancel(&self, id: OrderId) -> Result<Order> {
        self.update_status(id, OrderStatus::Cancelled).await
    }

    /// Operator status change through the transition table. Status only: no
    /// ledger effect, and `completed` is reachable only from `refunded`.
    pub async fn update_status(&self, id: OrderId, to: OrderStatus) -> Result<Order> {
        let mut tx = self.store.begin().await?;
        let mut order = tx.lock_order(id).await?;
        if order.status == to {
            return Ok(order);
        }

        let from = order.status;
        order.transition(to)?;
        tx.update_order(&order).await?;
        tx.commit().await?;

        info!(order = id, from = %from, to = %to, "Order status changed");
        Ok(order)
    }
}
