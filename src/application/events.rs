//! Post-commit reward events.
//!
//! Services publish after their transaction committed and their lock is released.
//! Delivery is at-most-once: a full or closed channel drops the event with a
//! warning, and a failing sink never reaches back into the ledger.

use crate::domain::ids::{OrderId, TaskId, Tokens, UserId};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RewardEvent {
    Recharged {
        user: UserId,
        order: OrderId,
        tokens: Tokens,
        balance: Tokens,
    },
    TaskRewarded {
        user: UserId,
        task: TaskId,
        reward: Tokens,
        balance: Tokens,
    },
    InviteRewarded {
        inviter: UserId,
        invitee: UserId,
        reward: Tokens,
        balance: Tokens,
    },
}

impl RewardEvent {
    /// The user whose balance changed.
    pub fn user(&self) -> UserId {
        match self {
            RewardEvent::Recharged { user, .. } | RewardEvent::TaskRewarded { user, .. } => *user,
            RewardEvent::InviteRewarded { inviter, .. } => *inviter,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventPublisher {
    sender: Option<mpsc::Sender<RewardEvent>>,
}

impl EventPublisher {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<RewardEvent>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A publisher that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: RewardEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(event) {
            warn!(error = %e, "Dropped reward event");
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &RewardEvent) -> Result<()>;
}

/// Writes each event as a structured log line.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, event: &RewardEvent) -> Result<()> {
        info!(user = event.user(), event = ?event, "Reward notification");
        Ok(())
    }
}

/// Drains the event channel into a sink until every publisher is gone.
pub struct NotificationWorker {
    receiver: mpsc::Receiver<RewardEvent>,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationWorker {
    pub fn new(receiver: mpsc::Receiver<RewardEvent>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { receiver, sink }
    }

    /// Returns the number of events delivered successfully.
    pub async fn run(mut self) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.receiver.recv().await {
            match self.sink.deliver(&event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(user = event.user(), error = %e, "Notification delivery failed"),
            }
        }
        delivered
    }

    pub fn spawn(self) -> JoinHandle<usize> {
        tokio::spawn(self.run())
    }
}
