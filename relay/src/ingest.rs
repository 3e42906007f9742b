//! Event ingestion: persist, then enqueue.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::{error, info};

use crate::delivery::DeliverySwitch;
use crate::error::{RelayError, Result};
use crate::event::{Event, NewEvent, TenantId};
use crate::queue::{self, MessageQueue, QueueMessage};
use crate::store::EventStore;

/// Accepts tenant events and hands them to the delivery pipeline.
#[derive(Clone)]
pub struct IngestionGateway {
    events: Arc<dyn EventStore>,
    queue: Arc<dyn MessageQueue>,
    switch: DeliverySwitch,
}

impl IngestionGateway {
    pub fn new(events: Arc<dyn EventStore>, queue: Arc<dyn MessageQueue>, switch: DeliverySwitch) -> Self {
        Self { events, queue, switch }
    }

    /// Store a `PENDING` event and enqueue it for delivery.
    ///
    /// The event is written before the message is published, so a worker never sees
    /// a message for an event that doesn't exist yet. If publishing fails the event
    /// stays `PENDING` and the error is returned to the caller.
    ///
    /// # Errors
    /// - `Unavailable` if delivery is switched off
    /// - `Validation` if the payload is not a JSON object
    #[tracing::instrument(skip(self, target_url, payload), fields(tenant_id = %tenant_id), err)]
    pub async fn ingest(&self, tenant_id: &TenantId, target_url: &str, payload: Value) -> Result<Event> {
        if !self.switch.is_enabled() {
            return Err(RelayError::Unavailable("webhook delivery is disabled".to_string()));
        }
        if !payload.is_object() {
            return Err(RelayError::Validation("payload must be a JSON object".to_string()));
        }

        let event = self
            .events
            .create(NewEvent {
                tenant_id: tenant_id.clone(),
                payload,
                target_url: target_url.to_string(),
            })
            .await?;

        let message = QueueMessage::new(event.tenant_id.clone(), event.event_id.clone());
        if let Err(e) = queue::enqueue(self.queue.as_ref(), &message).await {
            error!(event_id = %event.event_id, error = %e, "Event stored but could not be enqueued");
            return Err(e);
        }

        counter!("relay_events_ingested_total").increment(1);
        info!(event_id = %event.event_id, "Event ingested");
        Ok(event)
    }
}
