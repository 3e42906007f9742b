//! In-memory stores.
//!
//! Suitable for tests and single-process deployments. Everything is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;

use crate::error::{RelayError, Result};
use crate::event::{
    DeliveryOutcome, Event, EventFilter, EventId, EventPage, NewEvent, TenantId, DEFAULT_EVENT_TTL,
};
use crate::tenant::{TenantConfigPatch, TenantIdentity, TenantWebhookConfig};

use super::{EventStore, TenantConfigStore, TenantIdentityStore, TenantRegistry};

type EventKey = (TenantId, EventId);

/// Events in a shared map keyed by `(tenant_id, event_id)`.
#[derive(Clone)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<HashMap<EventKey, Event>>>,
    retention: Duration,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            retention: DEFAULT_EVENT_TTL,
        }
    }

    /// How long events are kept before they become eligible for purging.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn key(tenant_id: &TenantId, event_id: &EventId) -> EventKey {
        (tenant_id.clone(), event_id.clone())
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create(&self, new: NewEvent) -> Result<Event> {
        let event = Event::pending(new, Utc::now(), self.retention)?;
        let key = Self::key(&event.tenant_id, &event.event_id);
        let mut events = self.events.write();
        if events.contains_key(&key) {
            return Err(RelayError::Conflict(format!("event {} already exists", event.event_id)));
        }
        events.insert(key, event.clone());
        Ok(event)
    }

    async fn get(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event> {
        self.events
            .read()
            .get(&Self::key(tenant_id, event_id))
            .cloned()
            .ok_or_else(|| RelayError::not_found("Event", event_id))
    }

    async fn list(&self, tenant_id: &TenantId, filter: &EventFilter) -> Result<EventPage> {
        let cursor = filter.decoded_cursor()?;
        let limit = filter.effective_limit();

        let mut matching: Vec<Event> = self
            .events
            .read()
            .values()
            .filter(|e| &e.tenant_id == tenant_id)
            .filter(|e| filter.status.map_or(true, |status| e.status == status))
            .filter(|e| cursor.as_ref().map_or(true, |c| c.precedes(e)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.created_at, &b.event_id).cmp(&(a.created_at, &a.event_id)));

        let has_more = matching.len() > limit;
        matching.truncate(limit);
        let next_cursor = if has_more {
            matching.last().map(|e| e.cursor().encode())
        } else {
            None
        };

        Ok(EventPage {
            events: matching,
            next_cursor,
        })
    }

    async fn record_outcome(
        &self,
        tenant_id: &TenantId,
        event_id: &EventId,
        outcome: &DeliveryOutcome,
    ) -> Result<Event> {
        let mut events = self.events.write();
        let event = events
            .get_mut(&Self::key(tenant_id, event_id))
            .ok_or_else(|| RelayError::not_found("Event", event_id))?;
        event.apply_outcome(outcome, Utc::now());
        Ok(event.clone())
    }

    async fn reset_for_retry(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event> {
        let mut events = self.events.write();
        let event = events
            .get_mut(&Self::key(tenant_id, event_id))
            .ok_or_else(|| RelayError::not_found("Event", event_id))?;
        event.reset_for_retry()?;
        Ok(event.clone())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|_, event| event.ttl > now);
        Ok((before - events.len()) as u64)
    }
}

#[derive(Default)]
struct TenantTables {
    configs: HashMap<TenantId, TenantWebhookConfig>,
    identities: HashMap<String, TenantIdentity>,
}

/// Tenant configs and identities in shared maps.
#[derive(Clone, Default)]
pub struct InMemoryTenantStore {
    tables: Arc<RwLock<TenantTables>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantConfigStore for InMemoryTenantStore {
    async fn get_config(&self, tenant_id: &TenantId) -> Result<Option<TenantWebhookConfig>> {
        Ok(self.tables.read().configs.get(tenant_id).cloned())
    }

    async fn create_config(
        &self,
        tenant_id: &TenantId,
        target_url: &str,
        webhook_secret: Option<String>,
    ) -> Result<TenantWebhookConfig> {
        let mut tables = self.tables.write();
        if tables.configs.contains_key(tenant_id) {
            return Err(RelayError::Conflict(format!("tenant {tenant_id} already has a webhook config")));
        }
        let config = TenantWebhookConfig::new(tenant_id.clone(), target_url.to_string(), webhook_secret);
        tables.configs.insert(tenant_id.clone(), config.clone());
        Ok(config)
    }

    async fn update_config(&self, tenant_id: &TenantId, patch: &TenantConfigPatch) -> Result<TenantWebhookConfig> {
        if patch.is_empty() {
            return Err(RelayError::Validation("no fields to update".to_string()));
        }
        let mut tables = self.tables.write();
        let config = tables
            .configs
            .get_mut(tenant_id)
            .ok_or_else(|| RelayError::not_found("Tenant config", tenant_id))?;
        config.apply(patch);
        Ok(config.clone())
    }
}

#[async_trait]
impl TenantIdentityStore for InMemoryTenantStore {
    async fn resolve_api_key(&self, api_key: &str) -> Result<Option<TenantIdentity>> {
        Ok(self.tables.read().identities.get(api_key).cloned())
    }

    async fn create_identity(&self, api_key: &str, tenant_id: &TenantId) -> Result<TenantIdentity> {
        let mut tables = self.tables.write();
        if tables.identities.contains_key(api_key) {
            return Err(RelayError::Conflict("API key already issued".to_string()));
        }
        let identity = TenantIdentity {
            api_key: api_key.to_string(),
            tenant_id: tenant_id.clone(),
            active: true,
            created_at: Utc::now().trunc_subsecs(6),
        };
        tables.identities.insert(api_key.to_string(), identity.clone());
        Ok(identity)
    }
}

#[async_trait]
impl TenantRegistry for InMemoryTenantStore {
    async fn create_tenant(
        &self,
        tenant_id: &TenantId,
        target_url: &str,
        webhook_secret: Option<String>,
        api_key: &str,
    ) -> Result<(TenantWebhookConfig, TenantIdentity)> {
        let mut tables = self.tables.write();
        if tables.configs.contains_key(tenant_id) {
            return Err(RelayError::Conflict(format!("tenant {tenant_id} already has a webhook config")));
        }
        if tables.identities.contains_key(api_key) {
            return Err(RelayError::Conflict("API key already issued".to_string()));
        }

        let config = TenantWebhookConfig::new(tenant_id.clone(), target_url.to_string(), webhook_secret);
        let identity = TenantIdentity {
            api_key: api_key.to_string(),
            tenant_id: tenant_id.clone(),
            active: true,
            created_at: Utc::now().trunc_subsecs(6),
        };
        tables.configs.insert(tenant_id.clone(), config.clone());
        tables.identities.insert(api_key.to_string(), identity.clone());
        Ok((config, identity))
    }
}
