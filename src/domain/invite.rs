use super::ids::{Tokens, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Granted,
    /// Set by operators; never eligible for a grant.
    Failed,
}

/// Referral relationship, one per invitee.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct InviteRecord {
    pub inviter: UserId,
    pub invitee: UserId,
    pub reward: Tokens,
    pub status: InviteStatus,
    pub created_at: DateTime<Utc>,
    pub granted_at: Option<DateTime<Utc>>,
}

impl InviteRecord {
    pub fn new(inviter: UserId, invitee: UserId, reward: Tokens, now: DateTime<Utc>) -> Self {
        Self {
            inviter,
            invitee,
            reward,
            status: InviteStatus::Pending,
            created_at: now,
            granted_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == InviteStatus::Pending
    }

    pub fn mark_granted(&mut self, now: DateTime<Utc>) {
        self.status = InviteStatus::Granted;
        self.granted_at = Some(now);
    }
}
