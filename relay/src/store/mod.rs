//! Persistence seams for events and tenants.
//!
//! Every event read and write is keyed by `(tenant_id, event_id)`. An event stored
//! under another tenant is indistinguishable from one that doesn't exist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::event::{DeliveryOutcome, Event, EventFilter, EventId, EventPage, NewEvent, TenantId};
use crate::tenant::{TenantConfigPatch, TenantIdentity, TenantWebhookConfig};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryEventStore, InMemoryTenantStore};
pub use postgres::{PostgresEventStore, PostgresTenantStore};

/// Durable record of every event and its delivery state.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new `PENDING` event with `attempts = 0`.
    async fn create(&self, new: NewEvent) -> Result<Event>;

    /// Fetch one of the tenant's events.
    ///
    /// # Errors
    /// - `NotFound` if the event doesn't exist under this tenant
    async fn get(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event>;

    /// List the tenant's events newest first, optionally filtered by status.
    ///
    /// # Errors
    /// - `Validation` if the cursor can't be decoded
    async fn list(&self, tenant_id: &TenantId, filter: &EventFilter) -> Result<EventPage>;

    /// Record the outcome of a delivery attempt.
    ///
    /// Increments `attempts` atomically and sets the status the outcome implies.
    /// Concurrent redeliveries may both record; the last write wins.
    ///
    /// # Errors
    /// - `NotFound` if the event no longer exists
    async fn record_outcome(&self, tenant_id: &TenantId, event_id: &EventId, outcome: &DeliveryOutcome)
        -> Result<Event>;

    /// Move a `FAILED` event back to `PENDING`, clearing its error and keeping
    /// `attempts`. The status check and the write happen atomically.
    ///
    /// # Errors
    /// - `NotFound` if the event doesn't exist under this tenant
    /// - `PreconditionFailed` if the event isn't `FAILED`
    async fn reset_for_retry(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event>;

    /// Delete events whose retention has expired as of `now`. Returns how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Tenant delivery settings. Written by configuration updates, only read by workers.
#[async_trait]
pub trait TenantConfigStore: Send + Sync {
    /// `None` when the tenant has no webhook configuration.
    async fn get_config(&self, tenant_id: &TenantId) -> Result<Option<TenantWebhookConfig>>;

    /// Create the configuration, generating a secret if none is given.
    ///
    /// # Errors
    /// - `Conflict` if the tenant already has one
    async fn create_config(
        &self,
        tenant_id: &TenantId,
        target_url: &str,
        webhook_secret: Option<String>,
    ) -> Result<TenantWebhookConfig>;

    /// Apply a partial update.
    ///
    /// # Errors
    /// - `Validation` if the patch is empty
    /// - `NotFound` if the tenant has no configuration
    async fn update_config(&self, tenant_id: &TenantId, patch: &TenantConfigPatch) -> Result<TenantWebhookConfig>;
}

/// API key to tenant mapping used by the ingestion surface.
#[async_trait]
pub trait TenantIdentityStore: Send + Sync {
    /// Look up an API key directly. `None` for unknown keys.
    async fn resolve_api_key(&self, api_key: &str) -> Result<Option<TenantIdentity>>;

    /// # Errors
    /// - `Conflict` if the key is already issued
    async fn create_identity(&self, api_key: &str, tenant_id: &TenantId) -> Result<TenantIdentity>;
}

/// Onboarding of a tenant: its webhook configuration and first API key are written
/// together, or not at all.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// # Errors
    /// - `Conflict` if the tenant already has a configuration or the key is already issued
    async fn create_tenant(
        &self,
        tenant_id: &TenantId,
        target_url: &str,
        webhook_secret: Option<String>,
        api_key: &str,
    ) -> Result<(TenantWebhookConfig, TenantIdentity)>;
}
