use crate::domain::account::{ChangeKind, LedgerChange, LedgerEntry, LedgerRef, NewLedgerEntry, UserAccount};
use crate::domain::ids::{AdminId, FeatureId, Tokens, UserId};
use crate::domain::ports::{ClockRef, LedgerStoreRef, LedgerTx};
use crate::error::{PortalError, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Applies one balance change inside an open transaction.
///
/// Locks the user row, rejects a result below zero, then writes the new balance and
/// its ledger entry. Nothing is persisted until the caller commits, so the change
/// lands or disappears together with the caller's other writes.
pub async fn mutate(
    tx: &mut dyn LedgerTx,
    change: LedgerChange,
    now: DateTime<Utc>,
) -> Result<LedgerEntry> {
    if change.delta == 0 {
        return Err(PortalError::ValidationError(
            "balance change must not be zero".to_string(),
        ));
    }

    let mut user = tx.lock_user(change.user).await?;
    let balance = user
        .balance
        .checked_add(change.delta)
        .ok_or_else(|| PortalError::ValidationError("balance overflow".to_string()))?;
    if balance < 0 {
        return Err(PortalError::InsufficientBalance {
            user: user.id,
            balance: user.balance,
            delta: change.delta,
        });
    }

    user.balance = balance;
    tx.update_user(&user).await?;
    tx.append_entry(NewLedgerEntry {
        user: change.user,
        delta: change.delta,
        balance_after: balance,
        kind: change.kind,
        reference: change.reference,
        remark: change.remark,
        created_at: now,
    })
    .await
}

/// Result of recomputing a user's balance from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub user: UserId,
    pub balance: Tokens,
    pub ledger_sum: Tokens,
    pub entries: usize,
    /// Id of the first entry whose `balance_after` does not follow from its predecessor.
    pub broken_at: Option<u64>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum && self.broken_at.is_none()
    }
}

/// Account-facing ledger operations: registration, reads, spending and corrections.
pub struct LedgerService {
    store: LedgerStoreRef,
    clock: ClockRef,
}

impl LedgerService {
    pub fn new(store: LedgerStoreRef, clock: ClockRef) -> Self {
        Self { store, clock }
    }

    /// Creates a zero-balance account, or returns the existing one.
    pub async fn register_user(&self, id: UserId) -> Result<UserAccount> {
        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.user(id).await? {
            return Ok(existing);
        }
        let user = UserAccount::new(id, self.clock.now());
        tx.insert_user(&user).await?;
        match tx.commit().await {
            Ok(()) => Ok(user),
            Err(PortalError::WriteConflict(_)) => self.account(id).await,
            Err(e) => Err(e),
        }
    }

    pub async fn account(&self, id: UserId) -> Result<UserAccount> {
        let mut tx = self.store.begin().await?;
        tx.user(id)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("user {id}")))
    }

    pub async fn balance(&self, id: UserId) -> Result<Tokens> {
        Ok(self.account(id).await?.balance)
    }

    /// Ledger entries of `user`, oldest first.
    pub async fn history(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        self.store.ledger_entries(user).await
    }

    /// Spends `cost` tokens on a feature.
    pub async fn consume(
        &self,
        user: UserId,
        cost: Tokens,
        feature: FeatureId,
        remark: Option<String>,
    ) -> Result<LedgerEntry> {
        if cost <= 0 {
            return Err(PortalError::ValidationError(format!(
                "cost must be positive, got {cost}"
            )));
        }
        let mut change = LedgerChange::new(user, -cost, ChangeKind::Consume)
            .with_reference(LedgerRef::Feature(feature));
        if let Some(remark) = remark {
            change = change.with_remark(remark);
        }
        self.apply(change).await
    }

    /// Operator correction, either direction.
    pub async fn adjust(
        &self,
        user: UserId,
        delta: Tokens,
        admin: AdminId,
        remark: Option<String>,
    ) -> Result<LedgerEntry> {
        let mut change = LedgerChange::new(user, delta, ChangeKind::AdminAdjustment)
            .with_reference(LedgerRef::Admin(admin));
        if let Some(remark) = remark {
            change = change.with_remark(remark);
        }
        let entry = self.apply(change).await?;
        info!(user, delta, admin, balance = entry.balance_after, "Balance adjusted");
        Ok(entry)
    }

    pub async fn audit(&self, user: UserId) -> Result<AuditReport> {
        let balance = self.balance(user).await?;
        let entries = self.history(user).await?;

        let mut running: Tokens = 0;
        let mut broken_at = None;
        for entry in &entries {
            running += entry.delta;
            if broken_at.is_none() && entry.balance_after != running {
                broken_at = Some(entry.id);
            }
        }

        let report = AuditReport {
            user,
            balance,
            ledger_sum: running,
            entries: entries.len(),
            broken_at,
        };
        if !report.is_consistent() {
            warn!(
                user,
                balance,
                ledger_sum = running,
                broken_at = ?broken_at,
                "Ledger does not reconcile with balance"
            );
        }
        Ok(report)
    }

    async fn apply(&self, change: LedgerChange) -> Result<LedgerEntry> {
        let mut tx = self.store.begin().await?;
        let entry = mutate(tx.as_mut(), change, self.clock.now()).await?;
        tx.commit().await?;
        Ok(entry)
    }
}
