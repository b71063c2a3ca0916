use super::events::{EventPublisher, RewardEvent};
use super::ledger;
use super::locking::{LockKey, with_lock};
use crate::config::PolicyConfig;
use crate::domain::account::{ChangeKind, LedgerChange, LedgerRef};
use crate::domain::ids::{OrderId, Tokens, UserId};
use crate::domain::money::Amount;
use crate::domain::order::OrderStatus;
use crate::domain::payment::{
    NotifyStatus, PaymentConfirmation, PaymentNotification, TRANSACTION_SUCCESS,
};
use crate::domain::ports::{ClockRef, LedgerStoreRef, LockManagerRef};
use crate::error::{PortalError, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// What a reconcile call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call completed the order and credited the tokens.
    Applied {
        user: UserId,
        tokens: Tokens,
        balance: Tokens,
    },
    /// The payment had already been processed; nothing changed.
    AlreadyProcessed,
    /// Another worker is processing the same payment. Retry later.
    Deferred,
}

/// Counts from one pass of the retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub applied: usize,
    pub already_processed: usize,
    pub deferred: usize,
    pub failed: usize,
}

enum Registration {
    Proceed,
    Done,
}

/// Turns gateway payment confirmations into completed orders and credited tokens.
///
/// Safe under at-least-once, out-of-order and concurrent delivery: a
/// `(order, transaction)` pair credits at most once, however often and from however
/// many workers it arrives.
pub struct PaymentReconciler {
    store: LedgerStoreRef,
    locks: LockManagerRef,
    clock: ClockRef,
    policy: PolicyConfig,
    events: EventPublisher,
}

impl PaymentReconciler {
    pub fn new(
        store: LedgerStoreRef,
        locks: LockManagerRef,
        clock: ClockRef,
        policy: PolicyConfig,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            policy,
            events,
        }
    }

    pub async fn reconcile(&self, confirmation: PaymentConfirmation) -> Result<ReconcileOutcome> {
        if confirmation.event_kind != TRANSACTION_SUCCESS {
            return Err(PortalError::ValidationError(format!(
                "unsupported payment event kind {}",
                confirmation.event_kind
            )));
        }
        if confirmation.transaction_id.trim().is_empty() {
            return Err(PortalError::ValidationError(
                "payment confirmation without a transaction id".to_string(),
            ));
        }

        if let Registration::Done = self.register(&confirmation).await? {
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let order = confirmation.order_id;
        let txn = confirmation.transaction_id.as_str();
        let paid = confirmation.paid;
        let key = LockKey::payment(order, txn);

        let attempt = with_lock(
            self.locks.as_ref(),
            &key,
            self.policy.payment_lock_ttl(),
            move || self.attempt(order, txn, paid),
        )
        .await?;

        match attempt {
            None => {
                info!(order, txn, "Payment is being processed elsewhere, deferring");
                Ok(ReconcileOutcome::Deferred)
            }
            Some(Ok(outcome)) => {
                if let ReconcileOutcome::Applied {
                    user,
                    tokens,
                    balance,
                } = &outcome
                {
                    self.events.publish(RewardEvent::Recharged {
                        user: *user,
                        order,
                        tokens: *tokens,
                        balance: *balance,
                    });
                }
                Ok(outcome)
            }
            Some(Err(e)) => Err(e),
        }
    }

    /// Finds or creates the notification row for this payment.
    async fn register(&self, confirmation: &PaymentConfirmation) -> Result<Registration> {
        match self.try_register(confirmation).await {
            Err(PortalError::WriteConflict(_)) => {
                debug!(
                    order = confirmation.order_id,
                    txn = %confirmation.transaction_id,
                    "Notification created concurrently, re-reading"
                );
                self.try_register(confirmation).await
            }
            other => other,
        }
    }

    async fn try_register(&self, confirmation: &PaymentConfirmation) -> Result<Registration> {
        let order = confirmation.order_id;
        let txn = confirmation.transaction_id.as_str();
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        if tx.order(order).await?.is_none() {
            return Err(PortalError::NotFound(format!("order {order}")));
        }

        match tx.lock_notification(order, txn).await? {
            Some(existing) if existing.is_success() => Ok(Registration::Done),
            Some(existing) if existing.is_exhausted(self.policy.max_notification_retries) => {
                Err(PortalError::PermanentFailure(format!(
                    "payment {txn} for order {order} used all {} retries: {}",
                    existing.retry_count,
                    existing.last_error.as_deref().unwrap_or("unknown error")
                )))
            }
            Some(mut existing) => {
                if existing.status == NotifyStatus::Failed {
                    existing.begin_retry(now);
                    tx.update_notification(&existing).await?;
                    tx.commit().await?;
                    debug!(order, txn, retry = existing.retry_count, "Retrying payment notification");
                }
                Ok(Registration::Proceed)
            }
            None => {
                tx.insert_notification(&PaymentNotification::new(confirmation, now))
                    .await?;
                tx.commit().await?;
                Ok(Registration::Proceed)
            }
        }
    }

    /// Runs under the payment lock. Failures are recorded before the lock goes.
    async fn attempt(&self, order: OrderId, txn: &str, paid: Amount) -> Result<ReconcileOutcome> {
        let result = self.apply(order, txn, paid).await;
        if let Err(e) = &result {
            self.record_failure(order, txn, e).await;
        }
        result
    }

    async fn apply(&self, order_id: OrderId, txn: &str, paid: Amount) -> Result<ReconcileOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut notification = tx
            .lock_notification(order_id, txn)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("notification {order_id}/{txn}")))?;
        if notification.is_success() {
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let mut order = tx.lock_order(order_id).await?;
        if order.status == OrderStatus::Completed {
            if order.transaction_id.as_deref() != Some(txn) {
                warn!(
                    order = order_id,
                    txn,
                    paid_with = ?order.transaction_id,
                    "Order was already completed by another transaction"
                );
            }
            notification.mark_success(now);
            tx.update_notification(&notification).await?;
            tx.commit().await?;
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        order.mark_paid(txn, paid, now)?;
        tx.update_order(&order).await?;

        let change = LedgerChange::new(order.user, order.tokens, ChangeKind::Recharge)
            .with_reference(LedgerRef::Order(order.id));
        let entry = ledger::mutate(tx.as_mut(), change, now).await?;

        notification.mark_success(now);
        tx.update_notification(&notification).await?;
        tx.commit().await?;

        info!(
            order = order_id,
            txn,
            user = order.user,
            tokens = order.tokens,
            balance = entry.balance_after,
            "Payment applied"
        );
        Ok(ReconcileOutcome::Applied {
            user: order.user,
            tokens: order.tokens,
            balance: entry.balance_after,
        })
    }

    async fn record_failure(&self, order: OrderId, txn: &str, cause: &PortalError) {
        let retryable = cause.is_transient();
        let recorded = async {
            let mut tx = self.store.begin().await?;
            let Some(mut notification) = tx.lock_notification(order, txn).await? else {
                return Ok(());
            };
            if notification.is_success() {
                return Ok(());
            }
            notification.mark_failed(cause.to_string(), retryable, self.clock.now());
            tx.update_notification(&notification).await?;
            tx.commit().await
        }
        .await;

        match recorded {
            Ok(()) => warn!(order, txn, retryable, error = %cause, "Payment notification failed"),
            Err(e) => error!(
                order,
                txn,
                error = %e,
                cause = %cause,
                "Failed to record payment notification failure"
            ),
        }
    }

    /// Re-drives notifications left pending or failed, oldest first.
    ///
    /// Rows touched within the grace period belong to a caller still in flight and
    /// are skipped, as are validation failures and exhausted rows.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(self.policy.sweep_grace())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let max = self.policy.max_notification_retries;

        let mut due: Vec<PaymentNotification> = self
            .store
            .notifications()
            .await?
            .into_iter()
            .filter(|n| n.is_sweepable(max, cutoff))
            .collect();
        due.sort_by_key(|n| n.created_at);
        due.truncate(self.policy.sweep_batch_size);

        let mut report = SweepReport::default();
        for notification in due {
            report.attempted += 1;
            let confirmation = PaymentConfirmation {
                order_id: notification.order_id,
                transaction_id: notification.transaction_id,
                paid: notification.paid,
                event_kind: notification.kind,
            };
            match self.reconcile(confirmation).await {
                Ok(ReconcileOutcome::Applied { .. }) => report.applied += 1,
                Ok(ReconcileOutcome::AlreadyProcessed) => report.already_processed += 1,
                Ok(ReconcileOutcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    debug!(order = notification.order_id, error = %e, "Sweep retry failed");
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                applied = report.applied,
                deferred = report.deferred,
                failed = report.failed,
                "Payment retry sweep finished"
            );
        }
        Ok(report)
    }
}
