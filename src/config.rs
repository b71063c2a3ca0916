//! Tunable policy constants for locking, retries and throttling.

use crate::error::{PortalError, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on `sweep_grace_secs`: a week.
pub const MAX_SWEEP_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Lease on `payment-notify:{order}:{txn}`.
    pub payment_lock_ttl_secs: u64,
    /// Lease on `task-complete:{user}:{task}`.
    pub task_lock_ttl_secs: u64,
    /// Lease on `invite-reward:{invitee}`.
    pub invite_lock_ttl_secs: u64,
    /// Attempts a failed payment notification gets before it is permanent.
    pub max_notification_retries: u32,
    /// Notifications picked up per sweep.
    pub sweep_batch_size: usize,
    pub sweep_interval_secs: u64,
    /// Notifications touched more recently than this are left to their caller.
    pub sweep_grace_secs: u64,
    /// Capacity of the post-commit event channel.
    pub event_buffer: usize,
    pub min_watch_seconds: u64,
    /// Offset from UTC, in minutes, of the midnight that resets daily caps.
    pub day_offset_minutes: i32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            payment_lock_ttl_secs: 30,
            task_lock_ttl_secs: 10,
            invite_lock_ttl_secs: 10,
            max_notification_retries: 3,
            sweep_batch_size: 100,
            sweep_interval_secs: 60,
            sweep_grace_secs: 30,
            event_buffer: 256,
            min_watch_seconds: 15,
            day_offset_minutes: 0,
        }
    }
}

impl PolicyConfig {
    pub fn payment_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.payment_lock_ttl_secs)
    }

    pub fn task_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.task_lock_ttl_secs)
    }

    pub fn invite_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.invite_lock_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Saturates at [`MAX_SWEEP_GRACE_SECS`].
    pub fn sweep_grace(&self) -> chrono::Duration {
        let secs = self.sweep_grace_secs.min(MAX_SWEEP_GRACE_SECS);
        chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn day_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.day_offset_minutes * 60).ok_or_else(|| {
            PortalError::ValidationError(format!(
                "day offset of {} minutes is out of range",
                self.day_offset_minutes
            ))
        })
    }

    /// Rejects values no service can run with.
    pub fn validate(&self) -> Result<()> {
        if self.payment_lock_ttl_secs == 0
            || self.task_lock_ttl_secs == 0
            || self.invite_lock_ttl_secs == 0
        {
            return Err(PortalError::ValidationError(
                "lock TTLs must be at least one second".to_string(),
            ));
        }
        if self.event_buffer == 0 || self.sweep_batch_size == 0 {
            return Err(PortalError::ValidationError(
                "event buffer and sweep batch size must be positive".to_string(),
            ));
        }
        if self.sweep_grace_secs > MAX_SWEEP_GRACE_SECS {
            return Err(PortalError::ValidationError(format!(
                "sweep grace of {}s exceeds the {MAX_SWEEP_GRACE_SECS}s maximum",
                self.sweep_grace_secs
            )));
        }
        self.day_offset().map(|_| ())
    }
}
