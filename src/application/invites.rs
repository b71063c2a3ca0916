use super::events::{EventPublisher, RewardEvent};
use super::ledger;
use super::locking::{LockKey, with_lock};
use crate::config::PolicyConfig;
use crate::domain::account::{ChangeKind, LedgerChange, LedgerRef};
use crate::domain::ids::{Tokens, UserId};
use crate::domain::invite::InviteRecord;
use crate::domain::ports::{ClockRef, LedgerStoreRef, LockManagerRef};
use crate::error::{PortalError, Result};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    Granted {
        inviter: UserId,
        reward: Tokens,
        balance: Tokens,
    },
    /// No pending invite for this invitee: never registered, or already settled.
    NothingToGrant,
    /// A grant for the same invitee is in flight elsewhere.
    Deferred,
}

/// One-time referral rewards, credited to the inviter.
pub struct InviteRewards {
    store: LedgerStoreRef,
    locks: LockManagerRef,
    clock: ClockRef,
    policy: PolicyConfig,
    events: EventPublisher,
}

impl InviteRewards {
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

    /// Records that `inviter` brought in `invitee`. Each invitee can be invited once.
    pub async fn register_invite(
        &self,
        inviter: UserId,
        invitee: UserId,
        reward: Tokens,
    ) -> Result<InviteRecord> {
        if inviter == invitee {
            return Err(PortalError::ValidationError(format!(
                "user {inviter} cannot invite themselves"
            )));
        }
        if reward <= 0 {
            return Err(PortalError::ValidationError(format!(
                "invite reward must be positive, got {reward}"
            )));
        }

        let mut tx = self.store.begin().await?;
        for user in [inviter, invitee] {
            if tx.user(user).await?.is_none() {
                return Err(PortalError::NotFound(format!("user {user}")));
            }
        }

        let already_invited =
            || PortalError::ValidationError(format!("user {invitee} was already invited"));
        let record = InviteRecord::new(inviter, invitee, reward, self.clock.now());
        match tx.insert_invite(&record).await {
            Err(PortalError::WriteConflict(_)) => return Err(already_invited()),
            other => other?,
        }
        match tx.commit().await {
            Err(PortalError::WriteConflict(_)) => return Err(already_invited()),
            other => other?,
        }

        info!(inviter, invitee, reward, "Invite registered");
        Ok(record)
    }

    /// Pays the inviter of `invitee` once. Calling it again is a no-op.
    pub async fn grant_invite_reward(&self, invitee: UserId) -> Result<InviteOutcome> {
        let key = LockKey::invite(invitee);
        let granted = with_lock(
            self.locks.as_ref(),
            &key,
            self.policy.invite_lock_ttl(),
            move || self.grant(invitee),
        )
        .await?;

        let Some(granted) = granted else {
            info!(invitee, "Invite reward already in progress, deferring");
            return Ok(InviteOutcome::Deferred);
        };
        let outcome = granted?;

        if let InviteOutcome::Granted {
            inviter,
            reward,
            balance,
        } = &outcome
        {
            self.events.publish(RewardEvent::InviteRewarded {
                inviter: *inviter,
                invitee,
                reward: *reward,
                balance: *balance,
            });
        }
        Ok(outcome)
    }

    async fn grant(&self, invitee: UserId) -> Result<InviteOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let Some(mut invite) = tx.lock_invite(invitee).await? else {
            return Ok(InviteOutcome::NothingToGrant);
        };
        if !invite.is_pending() {
            return Ok(InviteOutcome::NothingToGrant);
        }

        let change = LedgerChange::new(invite.inviter, invite.reward, ChangeKind::InviteReward)
            .with_reference(LedgerRef::Invite(invitee));
        let entry = ledger::mutate(tx.as_mut(), change, now).await?;
        invite.mark_granted(now);
        tx.update_invite(&invite).await?;
        tx.commit().await?;

        info!(
            inviter = invite.inviter,
            invitee,
            reward = invite.reward,
            balance = entry.balance_after,
            "Invite reward granted"
        );
        Ok(InviteOutcome::Granted {
            inviter: invite.inviter,
            reward: invite.reward,
            balance: entry.balance_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ledger::LedgerService;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryLockManager};
    use std::sync::Arc;

    async fn rewards() -> InviteRewards {
        let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::in_memory());
        let ledger = LedgerService::new(store.clone(), Arc::new(SystemClock));
        for user in [1, 2, 3] {
            ledger.register_user(user).await.unwrap();
        }
        InviteRewards::new(
            store,
            Arc::new(InMemoryLockManager::new()),
            Arc::new(SystemClock),
            PolicyConfig::default(),
            EventPublisher::disabled(),
        )
    }

    #[tokio::test]
    async fn test_register_rules() {
        let rewards = rewards().await;
        rewards.register_invite(1, 2, 50).await.unwrap();

        assert!(matches!(
            rewards.register_invite(3, 2, 50).await,
            Err(PortalError::ValidationError(_))
        ));
        assert!(matches!(
            rewards.register_invite(1, 1, 50).await,
            Err(PortalError::ValidationError(_))
        ));
        assert!(matches!(
            rewards.register_invite(1, 3, 0).await,
            Err(PortalError::ValidationError(_))
        ));
        assert!(matches!(
            rewards.register_invite(1, 7, 50).await,
            Err(PortalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_invitee_is_noop() {
        let rewards = rewards().await;
        assert_eq!(
            rewards.grant_invite_reward(3).await.unwrap(),
            InviteOutcome::NothingToGrant
        );
    }
}
