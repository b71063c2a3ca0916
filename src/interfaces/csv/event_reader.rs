use crate::application::portal::PortalEvent;
use crate::domain::ids::{Tokens, UserId};
use crate::domain::money::Amount;
use crate::domain::payment::PaymentConfirmation;
use crate::domain::task::TaskPayload;
use crate::error::{PortalError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum EventType {
    Payment,
    Cancel,
    Task,
    Invite,
    Consume,
    Adjust,
    Sweep,
}

/// One CSV row. Column meaning depends on the type:
///
/// | type    | user    | target  | reference      | amount          |
/// |---------|---------|---------|----------------|-----------------|
/// | payment |         | order   | transaction id | paid amount     |
/// | cancel  |         | order   |                |                 |
/// | task    | user    | task    | video id       | watched seconds |
/// | invite  |         | invitee |                |                 |
/// | consume | user    | feature |                | cost            |
/// | adjust  | user    | admin   |                | signed delta    |
/// | sweep   |         |         |                |                 |
#[derive(Debug, Deserialize)]
struct EventRecord {
    #[serde(rename = "type")]
    kind: EventType,
    user: Option<UserId>,
    target: Option<u64>,
    reference: Option<String>,
    amount: Option<Decimal>,
}

impl EventRecord {
    fn into_event(self) -> Result<PortalEvent> {
        let event = match self.kind {
            EventType::Payment => PortalEvent::Payment(PaymentConfirmation::success(
                required(self.target, "order")?,
                required(self.reference, "transaction id")?,
                Amount::new(required(self.amount, "amount")?)?,
            )),
            EventType::Cancel => PortalEvent::Cancel {
                order: required(self.target, "order")?,
            },
            EventType::Task => {
                let mut payload = TaskPayload::new();
                if let Some(video) = self.reference {
                    payload.insert("video_id".to_string(), video.into());
                }
                if let Some(seconds) = self.amount.and_then(|secs| secs.to_f64()) {
                    payload.insert("watch_duration".to_string(), seconds.into());
                }
                PortalEvent::CompleteTask {
                    user: required(self.user, "user")?,
                    task: required(self.target, "task")?,
                    payload,
                }
            }
            EventType::Invite => PortalEvent::GrantInvite {
                invitee: required(self.target, "invitee")?,
            },
            EventType::Consume => PortalEvent::Consume {
                user: required(self.user, "user")?,
                feature: required(self.target, "feature")?,
                cost: whole_tokens(required(self.amount, "amount")?)?,
            },
            EventType::Adjust => PortalEvent::Adjust {
                user: required(self.user, "user")?,
                admin: self.target.unwrap_or_default(),
                delta: whole_tokens(required(self.amount, "amount")?)?,
            },
            EventType::Sweep => PortalEvent::Sweep,
        };
        Ok(event)
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| PortalError::ValidationError(format!("missing {field}")))
}

fn whole_tokens(value: Decimal) -> Result<Tokens> {
    if !value.fract().is_zero() {
        return Err(PortalError::ValidationError(format!(
            "token amounts are whole numbers, got {value}"
        )));
    }
    value
        .to_i64()
        .ok_or_else(|| PortalError::ValidationError(format!("token amount {value} out of range")))
}

/// Reads portal events from a CSV source.
///
/// Wraps `csv::Reader` with whitespace trimming and flexible record lengths, so
/// trailing empty columns may be omitted.
pub struct EventReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> EventReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses rows; a bad row yields an error without ending the stream.
    pub fn events(self) -> impl Iterator<Item = Result<PortalEvent>> {
        self.reader
            .into_deserialize::<EventRecord>()
            .map(|row| row.map_err(PortalError::from)?.into_event())
    }
}
