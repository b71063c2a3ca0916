use crate::domain::ids::{OrderId, TaskId, UserId};
use crate::domain::ports::LockManager;
use crate::error::Result;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Name of an advisory lock. One key per business identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn payment(order: OrderId, transaction_id: &str) -> Self {
        Self(format!("payment-notify:{order}:{transaction_id}"))
    }

    pub fn task(user: UserId, task: TaskId) -> Self {
        Self(format!("task-complete:{user}:{task}"))
    }

    pub fn invite(invitee: UserId) -> Self {
        Self(format!("invite-reward:{invitee}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs `work` while holding `key`, or returns `Ok(None)` without running it when
/// the key is held elsewhere.
///
/// The lock is released on every exit path, panics included; the panic is resumed
/// after the release. Each acquisition uses a fresh token, so a release after the
/// lease lapsed never clears a lock someone else took over.
pub async fn with_lock<T, F, Fut>(
    locks: &dyn LockManager,
    key: &LockKey,
    ttl: Duration,
    work: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let token = Uuid::new_v4().to_string();
    if !locks.try_acquire(key.as_str(), &token, ttl).await? {
        return Ok(None);
    }

    let outcome = AssertUnwindSafe(work()).catch_unwind().await;

    match locks.release(key.as_str(), &token).await {
        Ok(true) => {}
        Ok(false) => warn!(key = %key, "Lock lease lapsed before release"),
        Err(e) => warn!(key = %key, error = %e, "Failed to release lock"),
    }

    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
