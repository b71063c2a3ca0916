use super::events::EventPublisher;
use super::invites::InviteRewards;
use super::ledger::LedgerService;
use super::orders::OrderService;
use super::reconcile::{PaymentReconciler, ReconcileOutcome};
use super::tasks::TaskThrottle;
use crate::config::PolicyConfig;
use crate::domain::ids::{AdminId, FeatureId, OrderId, TaskId, Tokens, UserId};
use crate::domain::payment::PaymentConfirmation;
use crate::domain::ports::{ClockRef, LedgerStoreRef, LockManagerRef};
use crate::domain::task::TaskPayload;
use crate::domain::verify::VerifierRegistry;
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// One externally triggered operation, as replayed by the command-line driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    Payment(PaymentConfirmation),
    Cancel {
        order: OrderId,
    },
    CompleteTask {
        user: UserId,
        task: TaskId,
        payload: TaskPayload,
    },
    GrantInvite {
        invitee: UserId,
    },
    Consume {
        user: UserId,
        feature: FeatureId,
        cost: Tokens,
    },
    Adjust {
        user: UserId,
        admin: AdminId,
        delta: Tokens,
    },
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceRow {
    pub user: UserId,
    pub balance: Tokens,
    pub entries: usize,
}

/// All services wired over one store, lock manager and clock.
pub struct Portal {
    pub ledger: LedgerService,
    pub orders: OrderService,
    pub reconciler: Arc<PaymentReconciler>,
    pub tasks: TaskThrottle,
    pub invites: InviteRewards,
    store: LedgerStoreRef,
}

impl Portal {
    pub fn new(
        store: LedgerStoreRef,
        locks: LockManagerRef,
        clock: ClockRef,
        policy: PolicyConfig,
        events: EventPublisher,
    ) -> Result<Self> {
        policy.validate()?;
        let verifiers = VerifierRegistry::standard(policy.min_watch_seconds);
        Ok(Self {
            ledger: LedgerService::new(store.clone(), clock.clone()),
            orders: OrderService::new(store.clone(), clock.clone()),
            reconciler: Arc::new(PaymentReconciler::new(
                store.clone(),
                locks.clone(),
                clock.clone(),
                policy.clone(),
                events.clone(),
            )),
            tasks: TaskThrottle::new(
                store.clone(),
                locks.clone(),
                clock.clone(),
                policy.clone(),
                verifiers,
                events.clone(),
            ),
            invites: InviteRewards::new(store.clone(), locks, clock, policy, events),
            store,
        })
    }

    pub async fn apply(&self, event: PortalEvent) -> Result<()> {
        match event {
            PortalEvent::Payment(confirmation) => {
                let outcome = self.reconciler.reconcile(confirmation).await?;
                if outcome == ReconcileOutcome::AlreadyProcessed {
                    debug!("Duplicate payment confirmation ignored");
                }
            }
            PortalEvent::Cancel { order } => {
                self.orders.cancel(order).await?;
            }
            PortalEvent::CompleteTask {
                user,
                task,
                payload,
            } => {
                self.tasks.complete_task(user, task, payload).await?;
            }
            PortalEvent::GrantInvite { invitee } => {
                self.invites.grant_invite_reward(invitee).await?;
            }
            PortalEvent::Consume {
                user,
                feature,
                cost,
            } => {
                self.ledger.consume(user, cost, feature, None).await?;
            }
            PortalEvent::Adjust { user, admin, delta } => {
                self.ledger.adjust(user, delta, admin, None).await?;
            }
            PortalEvent::Sweep => {
                self.reconciler.sweep_once().await?;
            }
        }
        Ok(())
    }

    /// Every account with its balance and ledger length, by user id.
    pub async fn balances(&self) -> Result<Vec<BalanceRow>> {
        let mut rows = Vec::new();
        for user in self.store.users().await? {
            rows.push(BalanceRow {
                user: user.id,
                balance: user.balance,
                entries: self.store.ledger_entries(user.id).await?.len(),
            });
        }
        Ok(rows)
    }
}
