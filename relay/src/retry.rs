//! Manual retry of failed events and dead-letter requeue.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::event::{Event, EventId, TenantId};
use crate::queue::{self, MessageQueue, QueueMessage};
use crate::store::EventStore;

/// Messages pulled from the dead-letter queue per receive.
pub const REQUEUE_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequeueReport {
    pub requeued: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct RetryController {
    events: Arc<dyn EventStore>,
    queue: Arc<dyn MessageQueue>,
    dead_letters: Arc<dyn MessageQueue>,
}

impl RetryController {
    pub fn new(
        events: Arc<dyn EventStore>,
        queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            events,
            queue,
            dead_letters,
        }
    }

    /// Reset a `FAILED` event to `PENDING` and enqueue one fresh delivery message.
    ///
    /// The reset is a conditional write, so of several concurrent calls for the same
    /// event only those that observe `FAILED` enqueue.
    ///
    /// # Errors
    /// - `NotFound` if the event doesn't exist under this tenant
    /// - `PreconditionFailed` if the event isn't `FAILED`
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, event_id = %event_id), err)]
    pub async fn retry_event(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event> {
        let event = self.events.reset_for_retry(tenant_id, event_id).await?;
        queue::enqueue(self.queue.as_ref(), &QueueMessage::new(tenant_id.clone(), event_id.clone())).await?;
        info!(attempts = event.attempts, "Event reset for retry and re-enqueued");
        Ok(event)
    }

    /// Move up to `max_messages` from the dead-letter queue back to the main queue.
    ///
    /// Each body is published unchanged and only deleted from the dead-letter queue
    /// once the publish succeeded. Bodies that don't parse, and publish failures,
    /// count as failed and stay in the dead-letter queue.
    #[tracing::instrument(skip(self), err)]
    pub async fn requeue_dead_letters(&self, max_messages: usize) -> Result<RequeueReport> {
        let mut report = RequeueReport::default();
        let mut seen = 0usize;

        while seen < max_messages {
            let batch_size = REQUEUE_BATCH_SIZE.min(max_messages - seen);
            let messages = self.dead_letters.receive(batch_size).await?;
            if messages.is_empty() {
                break;
            }
            seen += messages.len();

            for message in messages {
                if let Err(e) = QueueMessage::from_body(&message.body) {
                    warn!(message_id = %message.message_id, error = %e, "Dead letter has an invalid body, leaving it");
                    report.failed += 1;
                    continue;
                }
                if let Err(e) = self.queue.send(&message.body).await {
                    warn!(message_id = %message.message_id, error = %e, "Failed to republish dead letter, leaving it");
                    report.failed += 1;
                    continue;
                }
                if let Err(e) = self.dead_letters.delete(&message.receipt).await {
                    // Already republished; a later requeue may deliver it twice
                    warn!(message_id = %message.message_id, error = %e, "Republished dead letter could not be deleted");
                }
                report.requeued += 1;
            }
        }

        counter!("relay_dead_letters_requeued_total").increment(report.requeued);
        info!(requeued = report.requeued, failed = report.failed, "Dead-letter requeue finished");
        Ok(report)
    }
}
