//! PostgreSQL stores.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;

use crate::error::{RelayError, Result};
use crate::event::{
    DeliveryOutcome, Event, EventFilter, EventId, EventPage, EventStatus, NewEvent, TenantId, DEFAULT_EVENT_TTL,
};
use crate::tenant::{TenantConfigPatch, TenantIdentity, TenantWebhookConfig};

use super::{EventStore, TenantConfigStore, TenantIdentityStore, TenantRegistry};

#[derive(Debug, FromRow)]
struct EventRow {
    tenant_id: String,
    event_id: String,
    status: String,
    payload: serde_json::Value,
    target_url: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = RelayError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Event {
            event_id: row.event_id.into(),
            tenant_id: row.tenant_id.into(),
            status: row.status.parse()?,
            payload: row.payload,
            target_url: row.target_url,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            error_message: row.error_message,
            ttl: row.expires_at,
        })
    }
}

const EVENT_COLUMNS: &str =
    "tenant_id, event_id, status, payload, target_url, attempts, created_at, last_attempt_at, error_message, expires_at";

/// Event store backed by the `events` table.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    retention: Duration,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retention: DEFAULT_EVENT_TTL,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    async fn fetch(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE tenant_id = $1 AND event_id = $2"
        ))
        .bind(tenant_id.as_str())
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Event::try_from).transpose()
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, new), fields(tenant_id = %new.tenant_id), err)]
    async fn create(&self, new: NewEvent) -> Result<Event> {
        let event = Event::pending(new, Utc::now(), self.retention)?;
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO events (tenant_id, event_id, status, payload, target_url, attempts, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.tenant_id.as_str())
        .bind(event.event_id.as_str())
        .bind(event.status.as_str())
        .bind(&event.payload)
        .bind(&event.target_url)
        .bind(event.created_at)
        .bind(event.ttl)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, event_id = %event_id), err)]
    async fn get(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event> {
        self.fetch(tenant_id, event_id)
            .await?
            .ok_or_else(|| RelayError::not_found("Event", event_id))
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id, status = ?filter.status), err)]
    async fn list(&self, tenant_id: &TenantId, filter: &EventFilter) -> Result<EventPage> {
        let cursor = filter.decoded_cursor()?;
        let limit = filter.effective_limit();

        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR (created_at, event_id) < ($3, $4))
            ORDER BY created_at DESC, event_id DESC
            LIMIT $5
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(cursor.as_ref().map(|c| c.created_at))
        .bind(cursor.as_ref().map(|c| c.event_id.as_str().to_string()))
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows.into_iter().map(Event::try_from).collect::<Result<Vec<_>>>()?;
        let has_more = events.len() > limit;
        events.truncate(limit);
        let next_cursor = if has_more {
            events.last().map(|e| e.cursor().encode())
        } else {
            None
        };

        Ok(EventPage { events, next_cursor })
    }

    #[instrument(skip(self, outcome), fields(tenant_id = %tenant_id, event_id = %event_id, success = outcome.success), err)]
    async fn record_outcome(
        &self,
        tenant_id: &TenantId,
        event_id: &EventId,
        outcome: &DeliveryOutcome,
    ) -> Result<Event> {
        let status = if outcome.success {
            EventStatus::Delivered
        } else {
            EventStatus::Failed
        };
        let error_message = if outcome.success { None } else { outcome.error.clone() };

        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET status = $3, attempts = attempts + 1, last_attempt_at = $4, error_message = $5
            WHERE tenant_id = $1 AND event_id = $2
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(event_id.as_str())
        .bind(status.as_str())
        .bind(Utc::now().trunc_subsecs(6))
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| RelayError::not_found("Event", event_id))?.try_into()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, event_id = %event_id), err)]
    async fn reset_for_retry(&self, tenant_id: &TenantId, event_id: &EventId) -> Result<Event> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET status = 'PENDING', error_message = NULL
            WHERE tenant_id = $1 AND event_id = $2 AND status = 'FAILED'
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(event_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.try_into();
        }

        // Nothing updated: tell apart a missing event from one in the wrong state
        match self.fetch(tenant_id, event_id).await? {
            None => Err(RelayError::not_found("Event", event_id)),
            Some(event) => Err(RelayError::PreconditionFailed(format!(
                "event {} is {}, only FAILED events can be retried",
                event.event_id, event.status
            ))),
        }
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct TenantConfigRow {
    tenant_id: String,
    target_url: String,
    webhook_secret: String,
    updated_at: DateTime<Utc>,
}

impl From<TenantConfigRow> for TenantWebhookConfig {
    fn from(row: TenantConfigRow) -> Self {
        Self {
            tenant_id: row.tenant_id.into(),
            target_url: row.target_url,
            webhook_secret: row.webhook_secret,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TenantIdentityRow {
    api_key: String,
    tenant_id: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<TenantIdentityRow> for TenantIdentity {
    fn from(row: TenantIdentityRow) -> Self {
        Self {
            api_key: row.api_key,
            tenant_id: row.tenant_id.into(),
            active: row.active,
            created_at: row.created_at,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

const INSERT_CONFIG: &str = r#"
    INSERT INTO tenant_webhook_configs (tenant_id, target_url, webhook_secret, updated_at)
    VALUES ($1, $2, $3, $4)
    RETURNING tenant_id, target_url, webhook_secret, updated_at
"#;

const INSERT_IDENTITY: &str = r#"
    INSERT INTO tenant_identities (api_key, tenant_id, active)
    VALUES ($1, $2, TRUE)
    RETURNING api_key, tenant_id, active, created_at
"#;

fn config_conflict(tenant_id: &TenantId) -> impl FnOnce(sqlx::Error) -> RelayError + '_ {
    move |e| {
        if is_unique_violation(&e) {
            RelayError::Conflict(format!("tenant {tenant_id} already has a webhook config"))
        } else {
            e.into()
        }
    }
}

fn identity_conflict(e: sqlx::Error) -> RelayError {
    if is_unique_violation(&e) {
        RelayError::Conflict("API key already issued".to_string())
    } else {
        e.into()
    }
}

/// Tenant configs and identities in the `tenant_webhook_configs` and
/// `tenant_identities` tables.
#[derive(Clone)]
pub struct PostgresTenantStore {
    pool: PgPool,
}

impl PostgresTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantConfigStore for PostgresTenantStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn get_config(&self, tenant_id: &TenantId) -> Result<Option<TenantWebhookConfig>> {
        let row = sqlx::query_as::<_, TenantConfigRow>(
            "SELECT tenant_id, target_url, webhook_secret, updated_at FROM tenant_webhook_configs WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, webhook_secret), fields(tenant_id = %tenant_id), err)]
    async fn create_config(
        &self,
        tenant_id: &TenantId,
        target_url: &str,
        webhook_secret: Option<String>,
    ) -> Result<TenantWebhookConfig> {
        let config = TenantWebhookConfig::new(tenant_id.clone(), target_url.to_string(), webhook_secret);
        let row = sqlx::query_as::<_, TenantConfigRow>(INSERT_CONFIG)
            .bind(config.tenant_id.as_str())
            .bind(&config.target_url)
            .bind(&config.webhook_secret)
            .bind(config.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(config_conflict(tenant_id))?;
        Ok(row.into())
    }

    #[instrument(skip(self, patch), fields(tenant_id = %tenant_id), err)]
    async fn update_config(&self, tenant_id: &TenantId, patch: &TenantConfigPatch) -> Result<TenantWebhookConfig> {
        if patch.is_empty() {
            return Err(RelayError::Validation("no fields to update".to_string()));
        }
        let row = sqlx::query_as::<_, TenantConfigRow>(
            r#"
            UPDATE tenant_webhook_configs SET
                target_url = COALESCE($2, target_url),
                webhook_secret = COALESCE($3, webhook_secret),
                updated_at = $4
            WHERE tenant_id = $1
            RETURNING tenant_id, target_url, webhook_secret, updated_at
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(patch.target_url.as_deref())
        .bind(patch.webhook_secret.as_deref())
        .bind(Utc::now().trunc_subsecs(6))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Into::into)
            .ok_or_else(|| RelayError::not_found("Tenant config", tenant_id))
    }
}

#[async_trait]
impl TenantIdentityStore for PostgresTenantStore {
    #[instrument(skip_all, err)]
    async fn resolve_api_key(&self, api_key: &str) -> Result<Option<TenantIdentity>> {
        let row = sqlx::query_as::<_, TenantIdentityRow>(
            "SELECT api_key, tenant_id, active, created_at FROM tenant_identities WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, api_key), fields(tenant_id = %tenant_id), err)]
    async fn create_identity(&self, api_key: &str, tenant_id: &TenantId) -> Result<TenantIdentity> {
        let row = sqlx::query_as::<_, TenantIdentityRow>(INSERT_IDENTITY)
            .bind(api_key)
            .bind(tenant_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(identity_conflict)?;
        Ok(row.into())
    }
}

#[async_trait]
impl TenantRegistry for PostgresTenantStore {
    #[instrument(skip(self, webhook_secret, api_key), fields(tenant_id = %tenant_id), err)]
    async fn create_tenant(
        &self,
        tenant_id: &TenantId,
        target_url: &str,
        webhook_secret: Option<String>,
        api_key: &str,
    ) -> Result<(TenantWebhookConfig, TenantIdentity)> {
        let config = TenantWebhookConfig::new(tenant_id.clone(), target_url.to_string(), webhook_secret);
        let mut tx = self.pool.begin().await?;

        let config_row = sqlx::query_as::<_, TenantConfigRow>(INSERT_CONFIG)
            .bind(config.tenant_id.as_str())
            .bind(&config.target_url)
            .bind(&config.webhook_secret)
            .bind(config.updated_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(config_conflict(tenant_id))?;

        // Dropping the transaction on a key clash rolls the config back
        let identity_row = sqlx::query_as::<_, TenantIdentityRow>(INSERT_IDENTITY)
            .bind(api_key)
            .bind(tenant_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(identity_conflict)?;

        tx.commit().await?;
        Ok((config_row.into(), identity_row.into()))
    }
}
