#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use portal_ledger::application::events::{EventPublisher, RewardEvent};
use portal_ledger::application::portal::Portal;
use portal_ledger::config::PolicyConfig;
use portal_ledger::domain::ids::{TaskId, Tokens, UserId};
use portal_ledger::domain::money::Amount;
use portal_ledger::domain::order::{Order, PaymentMethod};
use portal_ledger::domain::ports::{LedgerStoreRef, LockManagerRef};
use portal_ledger::domain::task::RewardTask;
use portal_ledger::infrastructure::clock::ManualClock;
use portal_ledger::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryLockManager};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Friday 2025-03-14, 10:00 UTC.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap()
}

pub fn amount(value: Decimal) -> Amount {
    Amount::new(value).unwrap()
}

pub fn daily_task(id: TaskId, reward: Tokens, daily_limit: u32) -> RewardTask {
    RewardTask {
        id,
        key: "daily_check_in".to_string(),
        name: format!("Task {id}"),
        reward,
        daily_limit,
        interval_seconds: 0,
        repeatable: true,
        valid_from: None,
        valid_to: None,
        enabled: true,
    }
}

/// A portal over in-memory storage and a manual clock, with its event channel exposed.
pub struct Harness {
    pub portal: Arc<Portal>,
    pub store: LedgerStoreRef,
    pub locks: Arc<InMemoryLockManager>,
    pub clock: ManualClock,
    pub events: mpsc::Receiver<RewardEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_policy(PolicyConfig::default()).await
    }

    pub async fn with_policy(policy: PolicyConfig) -> Self {
        let locks = Arc::new(InMemoryLockManager::new());
        Self::with_locks(policy, locks.clone(), locks).await
    }

    /// Uses `lock_manager` for the services; `locks` stays reachable for tests that
    /// hold keys by hand.
    pub async fn with_locks(
        policy: PolicyConfig,
        locks: Arc<InMemoryLockManager>,
        lock_manager: LockManagerRef,
    ) -> Self {
        let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::in_memory());
        let clock = ManualClock::new(start());
        let (publisher, events) = EventPublisher::channel(policy.event_buffer);
        let portal = Portal::new(
            store.clone(),
            lock_manager,
            Arc::new(clock.clone()),
            policy,
            publisher,
        )
        .unwrap();
        Self {
            portal: Arc::new(portal),
            store,
            locks,
            clock,
            events,
        }
    }

    pub async fn users(&self, ids: &[UserId]) {
        for id in ids {
            self.portal.ledger.register_user(*id).await.unwrap();
        }
    }

    pub async fn order(&self, user: UserId, price: Decimal, tokens: Tokens) -> Order {
        self.portal
            .orders
            .checkout(user, amount(price), tokens, PaymentMethod::Wechat)
            .await
            .unwrap()
    }

    pub async fn balance(&self, user: UserId) -> Tokens {
        self.portal.ledger.balance(user).await.unwrap()
    }

    pub async fn assert_ledger_consistent(&self, user: UserId) {
        let report = self.portal.ledger.audit(user).await.unwrap();
        assert!(report.is_consistent(), "ledger out of sync: {report:?}");
        assert!(report.balance >= 0, "negative balance: {report:?}");
    }
}

pub fn write_events(path: &Path, rows: &[[&str; 5]]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["type", "user", "target", "reference", "amount"])?;
    for row in rows {
        wtr.write_record(row)?;
    }

    wtr.flush()?;
    Ok(())
}
