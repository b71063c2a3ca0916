use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use portal_ledger::application::events::RewardEvent;
use portal_ledger::application::locking::LockKey;
use portal_ledger::application::reconcile::ReconcileOutcome;
use portal_ledger::application::sweeper::RetrySweeper;
use portal_ledger::config::PolicyConfig;
use portal_ledger::domain::account::{ChangeKind, LedgerRef};
use portal_ledger::domain::order::OrderStatus;
use portal_ledger::domain::payment::{NotifyStatus, PaymentConfirmation};
use portal_ledger::domain::ports::LockManager;
use portal_ledger::error::{PortalError, Result};
use portal_ledger::infrastructure::in_memory::InMemoryLockManager;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod common;
use common::{Harness, amount};

#[tokio::test]
async fn test_payment_credits_once() {
    let mut h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;
    let confirmation = PaymentConfirmation::success(order.id, "TXN1", amount(dec!(10.00)));

    let first = h.portal.reconciler.reconcile(confirmation.clone()).await.unwrap();
    assert_eq!(
        first,
        ReconcileOutcome::Applied {
            user: 1,
            tokens: 100,
            balance: 100
        }
    );

    let paid = h.portal.orders.order(order.id).await.unwrap();
    assert_eq!(paid.status, OrderStatus::Completed);
    assert_eq!(paid.transaction_id.as_deref(), Some("TXN1"));
    assert_eq!(paid.paid_at, Some(common::start()));

    let entries = h.portal.ledger.history(1).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].delta, 100);
    assert_eq!(entries[0].kind, ChangeKind::Recharge);
    assert_eq!(entries[0].reference, Some(LedgerRef::Order(order.id)));

    // The gateway delivers again.
    let again = h.portal.reconciler.reconcile(confirmation).await.unwrap();
    assert_eq!(again, ReconcileOutcome::AlreadyProcessed);
    assert_eq!(h.balance(1).await, 100);
    assert_eq!(h.portal.ledger.history(1).await.unwrap().len(), 1);

    let notifications = h.store.notifications().await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, NotifyStatus::Success);

    assert_eq!(
        h.events.recv().await,
        Some(RewardEvent::Recharged {
            user: 1,
            order: order.id,
            tokens: 100,
            balance: 100
        })
    );
    assert!(h.events.try_recv().is_err());
    h.assert_ledger_consistent(1).await;
}

#[tokio::test]
async fn test_amount_mismatch_is_rejected() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;

    let result = h
        .portal
        .reconciler
        .reconcile(PaymentConfirmation::success(order.id, "TXN1", amount(dec!(9.99))))
        .await;
    assert!(matches!(result, Err(PortalError::ValidationError(_))));

    assert_eq!(
        h.portal.orders.order(order.id).await.unwrap().status,
        OrderStatus::Pending
    );
    assert!(h.portal.ledger.history(1).await.unwrap().is_empty());
    assert_eq!(h.balance(1).await, 0);

    let notification = &h.store.notifications().await.unwrap()[0];
    assert_eq!(notification.status, NotifyStatus::Failed);
    assert!(!notification.retryable);
    assert!(
        notification
            .last_error
            .as_deref()
            .is_some_and(|reason| reason.contains("mismatch"))
    );

    // Validation failures are never swept.
    h.clock.advance(ChronoDuration::hours(1));
    let report = h.portal.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_credit_once() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let portal = h.portal.clone();
        let confirmation = PaymentConfirmation::success(order.id, "TXN1", amount(dec!(10.00)));
        handles.push(tokio::spawn(async move {
            portal.reconciler.reconcile(confirmation).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ReconcileOutcome::Applied { .. } => applied += 1,
            ReconcileOutcome::AlreadyProcessed | ReconcileOutcome::Deferred => {}
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.balance(1).await, 100);
    assert_eq!(h.portal.ledger.history(1).await.unwrap().len(), 1);
    assert_eq!(h.store.notifications().await.unwrap().len(), 1);
    h.assert_ledger_consistent(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_transactions_for_one_order_credit_once() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;

    let mut handles = Vec::new();
    for txn in ["TXN-A", "TXN-B", "TXN-C", "TXN-D"] {
        let portal = h.portal.clone();
        let confirmation = PaymentConfirmation::success(order.id, txn, amount(dec!(10.00)));
        handles.push(tokio::spawn(async move {
            portal.reconciler.reconcile(confirmation).await
        }));
    }
    let outcomes: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let applied = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, ReconcileOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(h.balance(1).await, 100);

    let notifications = h.store.notifications().await.unwrap();
    assert_eq!(notifications.len(), 4);
    assert!(notifications.iter().all(|n| n.status == NotifyStatus::Success));
}

#[tokio::test]
async fn test_deferred_payment_is_swept_after_grace() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(25.00), 300).await;

    let key = LockKey::payment(order.id, "TXN9");
    h.locks
        .try_acquire(key.as_str(), "other-worker", Duration::from_secs(30))
        .await
        .unwrap();
    let outcome = h
        .portal
        .reconciler
        .reconcile(PaymentConfirmation::success(order.id, "TXN9", amount(dec!(25))))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Deferred);

    // The other worker died without finishing.
    h.locks.release(key.as_str(), "other-worker").await.unwrap();

    let report = h.portal.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.attempted, 0, "still inside the grace period");

    h.clock.advance(ChronoDuration::seconds(31));
    let report = h.portal.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(h.balance(1).await, 300);

    let report = h.portal.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.attempted, 0);
}

/// Fails the first `failures` acquisitions, then behaves like the in-memory manager.
struct FlakyLocks {
    inner: InMemoryLockManager,
    failures: AtomicU32,
}

#[async_trait]
impl LockManager for FlakyLocks {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PortalError::LockBackendError("connection reset".into()));
        }
        self.inner.try_acquire(key, token, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.inner.release(key, token).await
    }
}

#[tokio::test]
async fn test_lock_backend_outage_is_retried_by_sweeper() {
    let locks = Arc::new(InMemoryLockManager::new());
    let flaky = Arc::new(FlakyLocks {
        inner: InMemoryLockManager::new(),
        failures: AtomicU32::new(1),
    });
    let h = Harness::with_locks(PolicyConfig::default(), locks, flaky).await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;

    let result = h
        .portal
        .reconciler
        .reconcile(PaymentConfirmation::success(order.id, "TXN1", amount(dec!(10))))
        .await;
    assert!(matches!(result, Err(PortalError::LockBackendError(_))));
    assert!(result.unwrap_err().is_transient());
    assert_eq!(h.balance(1).await, 0);

    h.clock.advance(ChronoDuration::minutes(1));
    let report = h.portal.reconciler.sweep_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.balance(1).await, 100);
}

#[tokio::test]
async fn test_exhausted_notification_needs_operator() {
    let policy = PolicyConfig {
        max_notification_retries: 1,
        ..PolicyConfig::default()
    };
    let h = Harness::with_policy(policy).await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;
    let short = PaymentConfirmation::success(order.id, "TXN1", amount(dec!(1)));

    for _ in 0..2 {
        assert!(h.portal.reconciler.reconcile(short.clone()).await.is_err());
    }
    let result = h.portal.reconciler.reconcile(short).await;
    assert!(matches!(result, Err(PortalError::PermanentFailure(_))));

    let notification = &h.store.notifications().await.unwrap()[0];
    assert_eq!(notification.status, NotifyStatus::Failed);
    assert_eq!(notification.retry_count, 1);
}

#[tokio::test]
async fn test_background_sweeper_stops_on_cancel() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;

    let key = LockKey::payment(order.id, "TXN1");
    h.locks
        .try_acquire(key.as_str(), "other-worker", Duration::from_secs(30))
        .await
        .unwrap();
    h.portal
        .reconciler
        .reconcile(PaymentConfirmation::success(order.id, "TXN1", amount(dec!(10))))
        .await
        .unwrap();
    h.locks.release(key.as_str(), "other-worker").await.unwrap();
    h.clock.advance(ChronoDuration::minutes(5));

    let shutdown = CancellationToken::new();
    let sweeper = RetrySweeper::new(h.portal.reconciler.clone(), Duration::from_millis(10));
    let handle = tokio::spawn(sweeper.run(shutdown.clone()));

    let credited = tokio::time::timeout(Duration::from_secs(5), async {
        while h.balance(1).await != 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(credited.is_ok(), "sweeper never applied the payment");

    shutdown.cancel();
    let sweeps = handle.await.unwrap();
    assert!(sweeps >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redelivery_waits_for_notification_row() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;
    let short = PaymentConfirmation::success(order.id, "TXN1", amount(dec!(9.99)));
    assert!(h.portal.reconciler.reconcile(short).await.is_err());

    // Another worker is retrying the same payment and holds its row.
    let mut holder = h.store.begin().await.unwrap();
    let mut row = holder.lock_notification(order.id, "TXN1").await.unwrap().unwrap();
    assert_eq!((row.status, row.retry_count), (NotifyStatus::Failed, 0));

    let portal = h.portal.clone();
    let mut redelivery = tokio::spawn(async move {
        portal
            .reconciler
            .reconcile(PaymentConfirmation::success(order.id, "TXN1", amount(dec!(10.00))))
            .await
    });
    let waited = tokio::time::timeout(Duration::from_millis(50), &mut redelivery).await;
    assert!(waited.is_err(), "redelivery ran while the row was held");

    row.begin_retry(common::start());
    row.mark_failed("gateway timeout", true, common::start());
    holder.update_notification(&row).await.unwrap();
    holder.commit().await.unwrap();

    let outcome = redelivery.await.unwrap().unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { balance: 100, .. }));

    let notification = &h.store.notifications().await.unwrap()[0];
    assert_eq!(notification.status, NotifyStatus::Success);
    assert_eq!(notification.retry_count, 2);
    h.assert_ledger_consistent(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redelivery_never_reopens_settled_notification() {
    let h = Harness::new().await;
    h.users(&[1]).await;
    let order = h.order(1, dec!(10.00), 100).await;
    let short = PaymentConfirmation::success(order.id, "TXN1", amount(dec!(9.99)));
    assert!(h.portal.reconciler.reconcile(short).await.is_err());

    let mut holder = h.store.begin().await.unwrap();
    let mut row = holder.lock_notification(order.id, "TXN1").await.unwrap().unwrap();

    let portal = h.portal.clone();
    let mut redelivery = tokio::spawn(async move {
        portal
            .reconciler
            .reconcile(PaymentConfirmation::success(order.id, "TXN1", amount(dec!(10.00))))
            .await
    });
    let waited = tokio::time::timeout(Duration::from_millis(50), &mut redelivery).await;
    assert!(waited.is_err(), "redelivery ran while the row was held");

    row.mark_success(common::start());
    holder.update_notification(&row).await.unwrap();
    holder.commit().await.unwrap();

    assert_eq!(
        redelivery.await.unwrap().unwrap(),
        ReconcileOutcome::AlreadyProcessed
    );
    let notification = &h.store.notifications().await.unwrap()[0];
    assert_eq!(notification.status, NotifyStatus::Success);
    assert_eq!(notification.retry_count, 0);
    assert!(h.portal.ledger.history(1).await.unwrap().is_empty());
}
