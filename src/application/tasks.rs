use super::events::{EventPublisher, RewardEvent};
use super::ledger;
use super::locking::{LockKey, with_lock};
use crate::config::PolicyConfig;
use crate::domain::account::{ChangeKind, LedgerChange, LedgerRef};
use crate::domain::ids::{TaskId, Tokens, UserId};
use crate::domain::ports::{ClockRef, LedgerStoreRef, LockManagerRef};
use crate::domain::task::{
    CompletionStats, Day, MAX_INTERVAL_SECONDS, RateLimit, RewardTask, TaskPayload,
};
use crate::domain::verify::VerifierRegistry;
use crate::error::{PortalError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskReward {
    pub reward: Tokens,
    pub balance: Tokens,
}

/// One row of a user's task board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAvailability {
    pub task: TaskId,
    pub key: String,
    pub name: String,
    pub reward: Tokens,
    pub completed_today: u32,
    pub completed_total: u64,
    pub blocked_by: Option<RateLimit>,
    /// When a blocked task opens up again; `None` when it never will.
    pub next_available_at: Option<DateTime<Utc>>,
}

impl TaskAvailability {
    pub fn is_available(&self) -> bool {
        self.blocked_by.is_none()
    }
}

/// Grants task rewards within each task's daily cap, cooldown and repeatability.
pub struct TaskThrottle {
    store: LedgerStoreRef,
    locks: LockManagerRef,
    clock: ClockRef,
    policy: PolicyConfig,
    verifiers: VerifierRegistry,
    events: EventPublisher,
}

impl TaskThrottle {
    pub fn new(
        store: LedgerStoreRef,
        locks: LockManagerRef,
        clock: ClockRef,
        policy: PolicyConfig,
        verifiers: VerifierRegistry,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            policy,
            verifiers,
            events,
        }
    }

    /// Creates or replaces a task definition.
    pub async fn put_task(&self, task: &RewardTask) -> Result<()> {
        if task.reward <= 0 {
            return Err(PortalError::ValidationError(format!(
                "task {} reward must be positive",
                task.id
            )));
        }
        if task.interval_seconds > MAX_INTERVAL_SECONDS {
            return Err(PortalError::ValidationError(format!(
                "task {} interval of {}s exceeds the {MAX_INTERVAL_SECONDS}s maximum",
                task.id, task.interval_seconds
            )));
        }
        if let (Some(from), Some(to)) = (task.valid_from, task.valid_to)
            && from > to
        {
            return Err(PortalError::ValidationError(format!(
                "task {} validity window ends before it starts",
                task.id
            )));
        }
        let mut tx = self.store.begin().await?;
        tx.put_task(task).await?;
        tx.commit().await
    }

    /// Records a completion and credits the task's reward.
    ///
    /// A completion already in flight for the same user and task is rejected with
    /// [`RateLimit::Busy`] rather than queued.
    pub async fn complete_task(
        &self,
        user: UserId,
        task: TaskId,
        payload: TaskPayload,
    ) -> Result<TaskReward> {
        let offset = self.policy.day_offset()?;
        let key = LockKey::task(user, task);
        let payload = &payload;

        let granted = with_lock(
            self.locks.as_ref(),
            &key,
            self.policy.task_lock_ttl(),
            move || self.grant(user, task, payload, offset),
        )
        .await?;

        let Some(granted) = granted else {
            info!(user, task, "Task completion already in progress");
            return Err(PortalError::RateLimited(RateLimit::Busy));
        };
        let reward = granted?;

        self.events.publish(RewardEvent::TaskRewarded {
            user,
            task,
            reward: reward.reward,
            balance: reward.balance,
        });
        Ok(reward)
    }

    async fn grant(
        &self,
        user: UserId,
        task_id: TaskId,
        payload: &TaskPayload,
        offset: FixedOffset,
    ) -> Result<TaskReward> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let task = tx
            .task(task_id)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("task {task_id}")))?;
        task.check_active(now)?;

        // Holding the user row keeps the count below stable until commit, even if
        // the advisory lock lapses.
        tx.lock_user(user).await?;

        let day = Day::containing(now, offset);
        let records = tx.completions(user, task_id).await?;
        let stats = CompletionStats::collect(&records, &day);
        if let Err(limit) = task.check_limits(&stats, now, &day) {
            debug!(user, task = task_id, reason = %limit, "Task completion throttled");
            return Err(PortalError::RateLimited(limit));
        }

        self.verifiers.verify(&task, payload)?;

        let change = LedgerChange::new(user, task.reward, ChangeKind::TaskReward)
            .with_reference(LedgerRef::Task(task.id))
            .with_remark(format!("task reward: {}", task.name));
        let entry = ledger::mutate(tx.as_mut(), change, now).await?;
        tx.append_completion(user, task.id, task.reward, now).await?;
        tx.commit().await?;

        info!(
            user,
            task = task_id,
            reward = task.reward,
            balance = entry.balance_after,
            "Task reward granted"
        );
        Ok(TaskReward {
            reward: task.reward,
            balance: entry.balance_after,
        })
    }

    /// Enabled, currently valid tasks and whether `user` can complete each right now.
    pub async fn task_board(&self, user: UserId) -> Result<Vec<TaskAvailability>> {
        let now = self.clock.now();
        let day = Day::containing(now, self.policy.day_offset()?);

        let mut tx = self.store.begin().await?;
        if tx.user(user).await?.is_none() {
            return Err(PortalError::NotFound(format!("user {user}")));
        }

        let mut board = Vec::new();
        for task in self.store.tasks().await? {
            if task.check_active(now).is_err() {
                continue;
            }
            let stats = CompletionStats::collect(&tx.completions(user, task.id).await?, &day);
            let blocked_by = task.check_limits(&stats, now, &day).err();
            board.push(TaskAvailability {
                task: task.id,
                next_available_at: blocked_by.as_ref().and_then(RateLimit::retry_at),
                key: task.key,
                name: task.name,
                reward: task.reward,
                completed_today: stats.today,
                completed_total: stats.total,
                blocked_by,
            });
        }
        Ok(board)
    }
}
