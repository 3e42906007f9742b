//! Delivery worker: turns queue messages into delivery attempts.
//!
//! ```text
//! Worker::run(shutdown)
//!   └─ loop until cancelled
//!        ├─ queue.receive(batch_size)
//!        └─ handle_batch()                     // bounded by max_concurrent_deliveries
//!             └─ handle_message() per message
//!                  ├─ parse {tenantId, eventId}   malformed → ack, drop
//!                  ├─ load tenant config          missing → MissingTenantPolicy
//!                  ├─ load event                  missing → ack, drop
//!                  ├─ deliver with the current URL and secret
//!                  ├─ record outcome
//!                  └─ ack
//! ```
//!
//! Any infrastructure error before the ack leaves the message in the queue, where it
//! becomes visible again after its visibility timeout. Delivery failures (non-2xx,
//! timeouts) are recorded as `FAILED` and acked; they are retried manually.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::DeliveryClient;
use crate::error::{RelayError, Result};
use crate::event::{DeliveryOutcome, EventId, TenantId};
use crate::queue::{MessageQueue, QueueMessage, ReceivedMessage};
use crate::store::{EventStore, TenantConfigStore};

/// Error recorded on events whose tenant has no webhook configuration.
pub const MISSING_TENANT_CONFIG: &str = "Tenant webhook config not found";

/// What to do with a message whose tenant has no webhook configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTenantPolicy {
    /// Record the event as `FAILED` and ack the message.
    #[default]
    FailEvent,
    /// Leave the message for redelivery, eventually dead-lettering it.
    Retry,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_concurrent_deliveries: usize,
    pub missing_tenant_policy: MissingTenantPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            max_concurrent_deliveries: 10,
            missing_tenant_policy: MissingTenantPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MalformedMessage,
    EventMissing,
}

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// An attempt was recorded and the message acked.
    Acked { delivered: bool },
    /// Nothing could be attempted; the message was acked so it stops circulating.
    Dropped { reason: DropReason },
}

/// Per-batch tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    pub left_for_redelivery: usize,
}

#[derive(Clone)]
pub struct Worker {
    events: Arc<dyn EventStore>,
    tenants: Arc<dyn TenantConfigStore>,
    queue: Arc<dyn MessageQueue>,
    delivery: DeliveryClient,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    pub fn new(
        events: Arc<dyn EventStore>,
        tenants: Arc<dyn TenantConfigStore>,
        queue: Arc<dyn MessageQueue>,
        delivery: DeliveryClient,
        config: WorkerConfig,
    ) -> Self {
        Self {
            events,
            tenants,
            queue,
            delivery,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Process one received message.
    ///
    /// Returns an error when the message was left unacknowledged for redelivery.
    #[tracing::instrument(skip(self, message), fields(message_id = %message.message_id, receive_count = message.receive_count, tenant_id = tracing::field::Empty))]
    pub async fn handle_message(&self, message: &ReceivedMessage) -> Result<Disposition> {
        let parsed = match QueueMessage::from_body(&message.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Dropping malformed queue message");
                self.queue.delete(&message.receipt).await?;
                return Ok(Disposition::Dropped {
                    reason: DropReason::MalformedMessage,
                });
            }
        };
        let QueueMessage { tenant_id, event_id } = parsed;
        tracing::Span::current().record("tenant_id", tracing::field::display(&tenant_id));

        let config = match self.tenants.get_config(&tenant_id).await? {
            Some(config) => config,
            None => match self.config.missing_tenant_policy {
                MissingTenantPolicy::Retry => {
                    warn!(%tenant_id, %event_id, "Tenant has no webhook config, leaving message for redelivery");
                    return Err(RelayError::not_found("Tenant config", &tenant_id));
                }
                MissingTenantPolicy::FailEvent => {
                    warn!(%tenant_id, %event_id, "Tenant has no webhook config, failing event");
                    let outcome = DeliveryOutcome::failed(None, MISSING_TENANT_CONFIG);
                    counter!("relay_deliveries_total", "outcome" => outcome.label()).increment(1);
                    return self.settle(message, &tenant_id, &event_id, &outcome).await;
                }
            },
        };

        let event = match self.events.get(&tenant_id, &event_id).await {
            Ok(event) => event,
            Err(e) if e.is_not_found() => {
                warn!(%tenant_id, %event_id, "Event no longer exists, dropping message");
                self.queue.delete(&message.receipt).await?;
                return Ok(Disposition::Dropped {
                    reason: DropReason::EventMissing,
                });
            }
            Err(e) => return Err(e),
        };

        debug!(%tenant_id, %event_id, status = %event.status, attempts = event.attempts, "Attempting delivery");
        let outcome = self
            .delivery
            .deliver(&config.target_url, &event.payload, &config.webhook_secret)
            .await;

        self.settle(message, &tenant_id, &event_id, &outcome).await
    }

    /// Record the outcome and ack.
    async fn settle(
        &self,
        message: &ReceivedMessage,
        tenant_id: &TenantId,
        event_id: &EventId,
        outcome: &DeliveryOutcome,
    ) -> Result<Disposition> {
        match self.events.record_outcome(tenant_id, event_id, outcome).await {
            Ok(event) => {
                info!(
                    %tenant_id,
                    %event_id,
                    status = %event.status,
                    attempts = event.attempts,
                    error = ?outcome.error,
                    "Delivery attempt recorded"
                );
            }
            Err(e) if e.is_not_found() => {
                warn!(%tenant_id, %event_id, "Event vanished before its outcome was recorded");
                self.queue.delete(&message.receipt).await?;
                return Ok(Disposition::Dropped {
                    reason: DropReason::EventMissing,
                });
            }
            Err(e) => return Err(e),
        }

        self.queue.delete(&message.receipt).await?;
        Ok(Disposition::Acked {
            delivered: outcome.success,
        })
    }

    /// Process a batch concurrently, at most `max_concurrent_deliveries` at a time.
    pub async fn handle_batch(&self, messages: Vec<ReceivedMessage>) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries.max(1)));
        let mut join_set = JoinSet::new();
        let mut report = BatchReport::default();

        for message in messages {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Delivery semaphore closed");
                    report.left_for_redelivery += 1;
                    continue;
                }
            };
            let worker = self.clone();
            worker.in_flight.fetch_add(1, Ordering::Relaxed);

            join_set.spawn(async move {
                let _permit = permit;
                let in_flight = worker.in_flight.clone();
                let _guard = scopeguard::guard((), |_| {
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                });
                let result = worker.handle_message(&message).await;
                (message.message_id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(Disposition::Acked { delivered: true }))) => report.delivered += 1,
                Ok((_, Ok(Disposition::Acked { delivered: false }))) => report.failed += 1,
                Ok((_, Ok(Disposition::Dropped { .. }))) => report.dropped += 1,
                Ok((message_id, Err(e))) => {
                    if e.is_transient() {
                        warn!(%message_id, error = %e, "Processing failed, message left for redelivery");
                    } else {
                        debug!(%message_id, error = %e, "Message left for redelivery");
                    }
                    report.left_for_redelivery += 1;
                }
                Err(join_error) => {
                    error!(error = %join_error, "Delivery task panicked");
                    report.left_for_redelivery += 1;
                }
            }
        }

        report
    }

    /// Poll the queue and process batches until `shutdown` is cancelled.
    #[tracing::instrument(skip_all, fields(queue = %self.queue.name()))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            max_concurrent_deliveries = self.config.max_concurrent_deliveries,
            "Delivery worker started"
        );

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(self.config.batch_size) => received,
            };

            match received {
                Ok(messages) if !messages.is_empty() => {
                    counter!("relay_messages_received_total").increment(messages.len() as u64);
                    let report = self.handle_batch(messages).await;
                    debug!(?report, "Processed batch");
                    // Keep draining while there is work
                    continue;
                }
                Ok(_) => debug!("No messages, sleeping"),
                Err(e) => warn!(error = %e, "Failed to receive messages"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliverySwitch, DELIVERY_DISABLED};
    use crate::event::{Event, EventStatus, NewEvent};
    use crate::http::MockHttpClient;
    use crate::queue::{self, InMemoryQueue, QueuePolicy};
    use crate::store::{InMemoryEventStore, InMemoryTenantStore};
    use crate::tenant::TenantConfigPatch;
    use serde_json::json;

    const ACME_URL: &str = "https://acme.example/hooks";

    struct Fixture {
        worker: Worker,
        events: InMemoryEventStore,
        tenants: InMemoryTenantStore,
        queue: InMemoryQueue,
        http: MockHttpClient,
        switch: DeliverySwitch,
    }

    fn fixture(config: WorkerConfig) -> Fixture {
        let events = InMemoryEventStore::new();
        let tenants = InMemoryTenantStore::new();
        let queue = InMemoryQueue::new("deliveries", QueuePolicy::default());
        let http = MockHttpClient::new();
        let switch = DeliverySwitch::default();
        let delivery = DeliveryClient::new(Arc::new(http.clone()), switch.clone());
        let worker = Worker::new(
            Arc::new(events.clone()),
            Arc::new(tenants.clone()),
            Arc::new(queue.clone()),
            delivery,
            config,
        );
        Fixture {
            worker,
            events,
            tenants,
            queue,
            http,
            switch,
        }
    }

    impl Fixture {
        async fn with_acme(self) -> Self {
            self.tenants
                .create_config(&"acme".into(), ACME_URL, Some("whsec_acme".into()))
                .await
                .unwrap();
            self
        }

        async fn enqueue_event(&self, tenant: &str) -> Event {
            let event = self
                .events
                .create(NewEvent {
                    tenant_id: tenant.into(),
                    payload: json!({"event": "user.signup", "user_id": "123"}),
                    target_url: "https://stale.example/hooks".into(),
                })
                .await
                .unwrap();
            queue::enqueue(&self.queue, &QueueMessage::new(event.tenant_id.clone(), event.event_id.clone()))
                .await
                .unwrap();
            event
        }

        async fn receive_one(&self) -> ReceivedMessage {
            self.queue.receive(1).await.unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn test_successful_delivery_is_recorded_and_acked() {
        let f = fixture(WorkerConfig::default()).with_acme().await;
        let event = f.enqueue_event("acme").await;
        f.http.respond_with_status(ACME_URL, 200);

        let disposition = f.worker.handle_message(&f.receive_one().await).await.unwrap();
        assert_eq!(disposition, Disposition::Acked { delivered: true });

        let stored = f.events.get(&event.tenant_id, &event.event_id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Delivered);
        assert_eq!(stored.attempts, 1);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_recorded_and_acked() {
        let f = fixture(WorkerConfig::default()).with_acme().await;
        let event = f.enqueue_event("acme").await;
        f.http.respond_with_status(ACME_URL, 503);

        let disposition = f.worker.handle_message(&f.receive_one().await).await.unwrap();
        assert_eq!(disposition, Disposition::Acked { delivered: false });

        let stored = f.events.get(&event.tenant_id, &event.event_id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("HTTP 503"));
        assert!(f.queue.is_empty(), "failures are acked, not redelivered");
    }

    #[tokio::test]
    async fn test_delivery_uses_current_config_not_snapshot() {
        let f = fixture(WorkerConfig::default()).with_acme().await;
        f.enqueue_event("acme").await;
        f.tenants
            .update_config(
                &"acme".into(),
                &TenantConfigPatch {
                    target_url: Some("https://new.acme.example/hooks".into()),
                    webhook_secret: Some("whsec_rotated".into()),
                },
            )
            .await
            .unwrap();
        f.http.respond_with_status("https://new.acme.example/hooks", 200);

        f.worker.handle_message(&f.receive_one().await).await.unwrap();

        let calls = f.http.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://new.acme.example/hooks");
        let signature = calls[0].header("stripe-signature").unwrap();
        assert!(crate::signing::verify("whsec_rotated", &calls[0].body, signature, None));
        assert!(!crate::signing::verify("whsec_acme", &calls[0].body, signature, None));
    }

    #[tokio::test]
    async fn test_delivery_attempted_regardless_of_stored_status() {
        let f = fixture(WorkerConfig::default()).with_acme().await;
        let event = f.enqueue_event("acme").await;
        f.events
            .record_outcome(&event.tenant_id, &event.event_id, &DeliveryOutcome::delivered(200))
            .await
            .unwrap();
        f.http.respond_with_status(ACME_URL, 200);

        f.worker.handle_message(&f.receive_one().await).await.unwrap();
        assert_eq!(f.http.call_count(), 1);
        let stored = f.events.get(&event.tenant_id, &event.event_id).await.unwrap();
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_tenant_fails_event_by_default() {
        let f = fixture(WorkerConfig::default());
        let event = f.enqueue_event("ghost").await;

        let disposition = f.worker.handle_message(&f.receive_one().await).await.unwrap();
        assert_eq!(disposition, Disposition::Acked { delivered: false });
        let stored = f.events.get(&event.tenant_id, &event.event_id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(MISSING_TENANT_CONFIG));
        assert_eq!(f.http.call_count(), 0);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_missing_tenant_retry_policy_leaves_message() {
        let f = fixture(WorkerConfig {
            missing_tenant_policy: MissingTenantPolicy::Retry,
            ..Default::default()
        });
        let event = f.enqueue_event("ghost").await;

        let err = f.worker.handle_message(&f.receive_one().await).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.queue.len(), 1);
        let stored = f.events.get(&event.tenant_id, &event.event_id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn test_malformed_and_orphaned_messages_are_dropped() {
        let f = fixture(WorkerConfig::default()).with_acme().await;
        f.queue.send("not json").await.unwrap();
        let disposition = f.worker.handle_message(&f.receive_one().await).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::Dropped {
                reason: DropReason::MalformedMessage
            }
        );

        queue::enqueue(&f.queue, &QueueMessage::new("acme".into(), EventId::from("evt_missing00000")))
            .await
            .unwrap();
        let disposition = f.worker.handle_message(&f.receive_one().await).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::Dropped {
                reason: DropReason::EventMissing
            }
        );
        assert!(f.queue.is_empty());
        assert_eq!(f.http.call_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_delivery_records_failure() {
        let f = fixture(WorkerConfig::default()).with_acme().await;
        let event = f.enqueue_event("acme").await;
        f.switch.disable();

        f.worker.handle_message(&f.receive_one().await).await.unwrap();
        let stored = f.events.get(&event.tenant_id, &event.event_id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(DELIVERY_DISABLED));
        assert_eq!(f.http.call_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_batch_tallies_outcomes() {
        let f = fixture(WorkerConfig {
            max_concurrent_deliveries: 2,
            ..Default::default()
        })
        .with_acme()
        .await;
        for _ in 0..3 {
            f.enqueue_event("acme").await;
        }
        f.queue.send("garbage").await.unwrap();
        f.http.respond_with_status(ACME_URL, 200);
        f.http.respond_with_status(ACME_URL, 200);
        f.http.respond_with_status(ACME_URL, 500);

        let messages = f.queue.receive(10).await.unwrap();
        let report = f.worker.handle_batch(messages).await;
        assert_eq!(
            report,
            BatchReport {
                delivered: 2,
                failed: 1,
                dropped: 1,
                left_for_redelivery: 0
            }
        );
        assert_eq!(f.worker.in_flight(), 0);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_cancelled() {
        let f = fixture(WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
        .with_acme()
        .await;
        let event = f.enqueue_event("acme").await;
        f.http.respond_with_status(ACME_URL, 200);

        let shutdown = CancellationToken::new();
        let worker = f.worker.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        let tenant = TenantId::from("acme");
        for _ in 0..100 {
            if f.events.get(&tenant, &event.event_id).await.unwrap().status == EventStatus::Delivered {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            f.events.get(&tenant, &event.event_id).await.unwrap().status,
            EventStatus::Delivered
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker stops on shutdown")
            .unwrap();
    }
}
