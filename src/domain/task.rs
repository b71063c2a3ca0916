use super::ids::{TaskId, Tokens, UserId};
use crate::error::PortalError;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Free-form, task-kind-specific data sent along with a completion.
pub type TaskPayload = serde_json::Map<String, serde_json::Value>;

/// Longest cooldown a task may be configured with.
pub const MAX_INTERVAL_SECONDS: u64 = 366 * 24 * 60 * 60;

/// Reward task configuration.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct RewardTask {
    pub id: TaskId,
    /// Completion kind; selects the eligibility verifier.
    pub key: String,
    pub name: String,
    pub reward: Tokens,
    /// Completions allowed per day, `0` for no cap.
    #[serde(default)]
    pub daily_limit: u32,
    /// Minimum seconds between two completions, `0` for none.
    #[serde(default)]
    pub interval_seconds: u64,
    #[serde(default = "default_true")]
    pub repeatable: bool,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// One successful completion. Append-only.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct TaskCompletionRecord {
    pub id: u64,
    pub user: UserId,
    pub task: TaskId,
    pub reward: Tokens,
    pub completed_at: DateTime<Utc>,
}

/// Why a completion was throttled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimit {
    #[error("daily limit reached ({limit} per day), resets at {resets_at}")]
    DailyLimitReached {
        limit: u32,
        resets_at: DateTime<Utc>,
    },
    #[error("task is cooling down, retry at {retry_at}")]
    CoolingDown { retry_at: DateTime<Utc> },
    #[error("task already completed and is not repeatable")]
    AlreadyCompleted,
    #[error("too many requests, a completion is already in progress")]
    Busy,
}

impl RateLimit {
    /// Earliest time the same completion could succeed, when one is known.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RateLimit::DailyLimitReached { resets_at, .. } => Some(*resets_at),
            RateLimit::CoolingDown { retry_at } => Some(*retry_at),
            RateLimit::AlreadyCompleted | RateLimit::Busy => None,
        }
    }
}

/// The calendar day a daily cap is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Day {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Day {
    /// The day containing `now`, with midnight taken at the given UTC offset.
    pub fn containing(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local_midnight = now
            .with_timezone(&offset)
            .date_naive()
            .and_time(NaiveTime::MIN);
        let start = (local_midnight - Duration::seconds(offset.local_minus_utc() as i64)).and_utc();
        Self {
            start,
            end: start + Duration::days(1),
        }
    }
}

/// Completion history of one user for one task, reduced to what the limits need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionStats {
    pub today: u32,
    pub total: u64,
    pub last: Option<DateTime<Utc>>,
}

impl CompletionStats {
    pub fn collect(records: &[TaskCompletionRecord], day: &Day) -> Self {
        records.iter().fold(Self::default(), |mut stats, record| {
            stats.total += 1;
            if record.completed_at >= day.start && record.completed_at < day.end {
                stats.today += 1;
            }
            if stats.last.is_none_or(|last| record.completed_at > last) {
                stats.last = Some(record.completed_at);
            }
            stats
        })
    }
}

impl RewardTask {
    /// Rejects disabled tasks and tasks outside their validity window.
    pub fn check_active(&self, now: DateTime<Utc>) -> Result<(), PortalError> {
        if !self.enabled {
            return Err(PortalError::ValidationError(format!(
                "task {} is disabled",
                self.id
            )));
        }
        if let Some(from) = self.valid_from
            && now < from
        {
            return Err(PortalError::ValidationError(format!(
                "task {} has not started yet",
                self.id
            )));
        }
        if let Some(to) = self.valid_to
            && now > to
        {
            return Err(PortalError::ValidationError(format!(
                "task {} has ended",
                self.id
            )));
        }
        Ok(())
    }

    /// Evaluates daily cap, interval and repeatability, in that order.
    pub fn check_limits(
        &self,
        stats: &CompletionStats,
        now: DateTime<Utc>,
        day: &Day,
    ) -> Result<(), RateLimit> {
        if self.daily_limit > 0 && stats.today >= self.daily_limit {
            return Err(RateLimit::DailyLimitReached {
                limit: self.daily_limit,
                resets_at: day.end,
            });
        }
        if self.interval_seconds > 0
            && let Some(last) = stats.last
        {
            // An interval past the representable range never elapses.
            let retry_at = i64::try_from(self.interval_seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|interval| last.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < retry_at {
                return Err(RateLimit::CoolingDown { retry_at });
            }
        }
        if !self.repeatable && stats.total > 0 {
            return Err(RateLimit::AlreadyCompleted);
        }
        Ok(())
    }
}
