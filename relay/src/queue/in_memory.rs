//! In-memory queue with visibility timeouts and dead-letter redrive.
//!
//! Uses tokio's clock so tests can pause and advance time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

use super::{MessageQueue, QueueDepth, QueuePolicy, ReceivedMessage, Receipt};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<Uuid>,
    enqueued_at: DateTime<Utc>,
}

impl StoredMessage {
    fn new(body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
            enqueued_at: Utc::now(),
        }
    }
}

struct Redrive {
    dead_letter: InMemoryQueue,
    max_receive_count: u32,
}

/// Cloning shares the underlying messages.
#[derive(Clone)]
pub struct InMemoryQueue {
    name: Arc<str>,
    messages: Arc<Mutex<Vec<StoredMessage>>>,
    policy: QueuePolicy,
    redrive: Option<Arc<Redrive>>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, policy: QueuePolicy) -> Self {
        Self {
            name: Arc::from(name.into()),
            messages: Arc::new(Mutex::new(Vec::new())),
            policy,
            redrive: None,
        }
    }

    /// Move messages to `dead_letter` once they have been received
    /// `max_receive_count` times without being deleted.
    pub fn with_dead_letter(mut self, dead_letter: InMemoryQueue, max_receive_count: u32) -> Self {
        self.redrive = Some(Arc::new(Redrive {
            dead_letter,
            max_receive_count,
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    fn push(&self, body: String) -> Uuid {
        let message = StoredMessage::new(body);
        let id = message.id;
        self.messages.lock().push(message);
        id
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> Result<Uuid> {
        Ok(self.push(body.to_string()))
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut exhausted = Vec::new();
        let mut received = Vec::new();

        {
            let mut messages = self.messages.lock();

            if let Some(redrive) = &self.redrive {
                let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut *messages)
                    .into_iter()
                    .partition(|m| m.visible_at <= now && m.receive_count >= redrive.max_receive_count);
                *messages = live;
                exhausted = dead;
            }

            for message in messages.iter_mut().filter(|m| m.visible_at <= now).take(max_messages) {
                message.receive_count += 1;
                let receipt = Uuid::new_v4();
                message.receipt = Some(receipt);
                message.visible_at = now + self.policy.visibility_for(message.receive_count);
                received.push(ReceivedMessage {
                    message_id: message.id,
                    receipt: Receipt(receipt),
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                    enqueued_at: message.enqueued_at,
                });
            }
        }

        if let Some(redrive) = &self.redrive {
            for message in exhausted {
                warn!(
                    queue = %self.name,
                    dead_letter_queue = %redrive.dead_letter.name,
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "Moving message to dead-letter queue"
                );
                redrive.dead_letter.push(message.body);
            }
        }

        Ok(received)
    }

    async fn delete(&self, receipt: &Receipt) -> Result<()> {
        self.messages.lock().retain(|m| m.receipt != Some(receipt.0));
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Instant::now();
        let messages = self.messages.lock();
        let visible = messages.iter().filter(|m| m.visible_at <= now).count() as u64;
        Ok(QueueDepth {
            visible,
            in_flight: messages.len() as u64 - visible,
        })
    }
}
