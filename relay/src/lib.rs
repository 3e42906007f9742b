//! Relay: a multi-tenant webhook delivery engine.
//!
//! Tenants submit events through the [`ingest::IngestionGateway`]. Each event is
//! persisted as `PENDING` and a pointer to it is placed on a [`queue::MessageQueue`].
//! A [`worker::Worker`] pulls pointers off the queue, signs the stored payload with
//! the tenant's secret ([`signing`]), POSTs it to the tenant's endpoint
//! ([`delivery::DeliveryClient`]) and records the outcome on the event.
//!
//! Delivery is at-least-once. A message that the worker fails to acknowledge becomes
//! visible again after its visibility timeout, with exponential backoff between
//! receives. After [`queue::DEFAULT_MAX_RECEIVE_COUNT`] receives it is moved to a
//! dead-letter queue, which operators drain with [`retry::RetryController`].
//!
//! Storage and queueing are trait seams ([`store::EventStore`],
//! [`store::TenantConfigStore`], [`store::TenantIdentityStore`],
//! [`queue::MessageQueue`]) with in-memory and PostgreSQL implementations.

pub mod delivery;
pub mod error;
pub mod event;
pub mod http;
pub mod ingest;
pub mod queue;
pub mod retry;
pub mod signing;
pub mod store;
pub mod tenant;
pub mod worker;

pub use delivery::{DeliveryClient, DeliverySwitch};
pub use error::{RelayError, Result};
pub use event::{DeliveryOutcome, Event, EventFilter, EventId, EventPage, EventStatus, NewEvent, TenantId};
pub use ingest::IngestionGateway;
pub use queue::{MessageQueue, QueueMessage, QueuePolicy, ReceivedMessage, Receipt};
pub use retry::{RequeueReport, RetryController};
pub use store::{EventStore, TenantConfigStore, TenantIdentityStore, TenantRegistry};
pub use tenant::{TenantConfigPatch, TenantIdentity, TenantWebhookConfig};
pub use worker::{Disposition, Worker, WorkerConfig};

/// Get the relay database migrator.
///
/// Covers the event store, tenant tables and the PostgreSQL-backed queue.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
