//! Event types and the event state machine.
//!
//! An event is created `PENDING`. Each delivery attempt records its outcome, moving the
//! event to `DELIVERED` or `FAILED`. The only way out of `FAILED` is a manual retry,
//! which puts it back to `PENDING` without touching the attempt counter.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Default number of events returned by a list call.
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Upper bound on the number of events returned by a list call.
pub const MAX_PAGE_LIMIT: usize = 100;
/// Default retention for events, after which they are purged.
pub const DEFAULT_EVENT_TTL: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 60 * 60);

/// Identifier of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an event, `evt_` followed by 12 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("evt_{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Delivered,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Delivered => "DELIVERED",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "DELIVERED" => Ok(EventStatus::Delivered),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(RelayError::Validation(format!("unknown event status '{other}'"))),
        }
    }
}

/// The result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(status_code: u16) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            error: None,
        }
    }

    pub fn failed(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            error: Some(error.into()),
        }
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        if self.success {
            "delivered"
        } else {
            "failed"
        }
    }
}

/// Request to create an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tenant_id: TenantId,
    pub payload: serde_json::Value,
    /// The tenant's target URL at ingestion time. Kept for audit only, delivery always
    /// uses the current tenant configuration.
    pub target_url: String,
}

/// A tenant event and its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub status: EventStatus,
    pub payload: serde_json::Value,
    pub target_url: String,
    pub attempts: u32,
    #[serde(with = "epoch_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "epoch_seconds::option", default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// When the event becomes eligible for purging.
    #[serde(with = "epoch_seconds")]
    pub ttl: DateTime<Utc>,
}

impl Event {
    /// Build a fresh `PENDING` event. Timestamps are truncated to microseconds so the
    /// in-memory and database representations order identically.
    pub fn pending(new: NewEvent, now: DateTime<Utc>, retention: std::time::Duration) -> Result<Self> {
        let created_at = now.trunc_subsecs(6);
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| RelayError::Validation(format!("invalid retention: {e}")))?;
        Ok(Self {
            event_id: EventId::generate(),
            tenant_id: new.tenant_id,
            status: EventStatus::Pending,
            payload: new.payload,
            target_url: new.target_url,
            attempts: 0,
            created_at,
            last_attempt_at: None,
            error_message: None,
            ttl: created_at + retention,
        })
    }

    /// Apply a delivery outcome: one more attempt, and the terminal status it implies.
    pub fn apply_outcome(&mut self, outcome: &DeliveryOutcome, at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(at.trunc_subsecs(6));
        if outcome.success {
            self.status = EventStatus::Delivered;
            self.error_message = None;
        } else {
            self.status = EventStatus::Failed;
            self.error_message = outcome.error.clone();
        }
    }

    /// Move a `FAILED` event back to `PENDING`, keeping its attempt count.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.status != EventStatus::Failed {
            return Err(RelayError::PreconditionFailed(format!(
                "event {} is {}, only FAILED events can be retried",
                self.event_id, self.status
            )));
        }
        self.status = EventStatus::Pending;
        self.error_message = None;
        Ok(())
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            created_at: self.created_at,
            event_id: self.event_id.clone(),
        }
    }
}

/// Filter and pagination for listing a tenant's events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl EventFilter {
    /// Requested page size, defaulted and clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn decoded_cursor(&self) -> Result<Option<Cursor>> {
        self.cursor.as_deref().map(Cursor::decode).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_cursor: Option<String>,
}

/// Position in a newest-first listing: the last `(created_at, event_id)` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub event_id: EventId,
}

impl Cursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at.timestamp_micros(), self.event_id))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || RelayError::Validation("invalid pagination cursor".to_string());
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (micros, event_id) = raw.split_once(':').ok_or_else(invalid)?;
        let micros = micros.parse::<i64>().map_err(|_| invalid())?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
        if event_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            created_at,
            event_id: EventId::from(event_id),
        })
    }

    /// Whether `event` sorts strictly after this cursor in newest-first order.
    pub fn precedes(&self, event: &Event) -> bool {
        (event.created_at, &event.event_id) < (self.created_at, &self.event_id)
    }
}

/// Serde helpers rendering timestamps as decimal epoch-second strings.
pub mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.timestamp().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }

    fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        let secs = raw
            .parse::<i64>()
            .map_err(|_| format!("expected epoch seconds, got '{raw}'"))?;
        DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("epoch seconds out of range: {secs}"))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| parse(&raw).map_err(de::Error::custom))
                .transpose()
        }
    }
}
