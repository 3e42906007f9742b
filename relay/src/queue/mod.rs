//! At-least-once message queue contract.
//!
//! Messages carry only `{tenantId, eventId}`; the worker reads everything else fresh.
//! Receiving a message hides it for a visibility timeout that grows with each receive.
//! A message that is not deleted before the timeout lapses becomes visible again, and
//! after [`DEFAULT_MAX_RECEIVE_COUNT`] receives it is moved to the dead-letter queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{EventId, TenantId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryQueue;
pub use postgres::PostgresQueue;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(16 * 60);
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// Body of a delivery message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub tenant_id: TenantId,
    pub event_id: EventId,
}

impl QueueMessage {
    pub fn new(tenant_id: TenantId, event_id: EventId) -> Self {
        Self { tenant_id, event_id }
    }

    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a message body, rejecting empty identifiers.
    pub fn from_body(body: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(body)?;
        if message.tenant_id.as_str().is_empty() || message.event_id.as_str().is_empty() {
            return Err(crate::error::RelayError::Validation(
                "queue message has an empty tenantId or eventId".to_string(),
            ));
        }
        Ok(message)
    }
}

/// Opaque handle proving a particular receive of a message. Only the most recent
/// receipt for a message can delete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(pub Uuid);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub receipt: Receipt,
    pub body: String,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Approximate queue size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.visible + self.in_flight
    }
}

/// Visibility timeout schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub visibility_timeout: Duration,
    pub backoff_factor: u32,
    pub max_visibility_timeout: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_visibility_timeout: DEFAULT_MAX_VISIBILITY_TIMEOUT,
        }
    }
}

impl QueuePolicy {
    /// Visibility timeout for the `receive_count`th receive:
    /// `visibility_timeout * backoff_factor^(receive_count - 1)`, capped.
    pub fn visibility_for(&self, receive_count: u32) -> Duration {
        let exponent = receive_count.saturating_sub(1);
        let multiplier = self.backoff_factor.max(1).saturating_pow(exponent);
        self.visibility_timeout
            .saturating_mul(multiplier)
            .min(self.max_visibility_timeout)
    }
}

/// Point-to-point queue with visibility timeouts.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Publish a raw body. Returns the new message id.
    async fn send(&self, body: &str) -> Result<Uuid>;

    /// Receive up to `max_messages` visible messages, hiding each for its
    /// visibility timeout. May return fewer, or none.
    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge a message. A receipt from a superseded receive is a no-op.
    async fn delete(&self, receipt: &Receipt) -> Result<()>;

    async fn depth(&self) -> Result<QueueDepth>;
}

/// Publish a delivery message.
pub async fn enqueue(queue: &dyn MessageQueue, message: &QueueMessage) -> Result<Uuid> {
    queue.send(&message.to_body()?).await
}
