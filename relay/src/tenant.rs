//! Tenant webhook configuration and API key identities.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RelayError, Result};
use crate::event::{epoch_seconds, TenantId};
use crate::signing;

/// Where and how a tenant receives webhooks. Read fresh by the worker for every
/// delivery, so secret rotation and URL changes take effect immediately.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantWebhookConfig {
    pub tenant_id: TenantId,
    pub target_url: String,
    pub webhook_secret: String,
    #[serde(with = "epoch_seconds")]
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for TenantWebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantWebhookConfig")
            .field("tenant_id", &self.tenant_id)
            .field("target_url", &self.target_url)
            .field("webhook_secret", &"<redacted>")
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl TenantWebhookConfig {
    pub fn new(tenant_id: TenantId, target_url: String, webhook_secret: Option<String>) -> Self {
        Self {
            tenant_id,
            target_url,
            webhook_secret: webhook_secret.unwrap_or_else(signing::generate_secret),
            updated_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// Apply each present field of `patch`, bumping `updated_at`.
    pub fn apply(&mut self, patch: &TenantConfigPatch) {
        if let Some(target_url) = &patch.target_url {
            self.target_url = target_url.clone();
        }
        if let Some(secret) = &patch.webhook_secret {
            self.webhook_secret = secret.clone();
        }
        self.updated_at = Utc::now().trunc_subsecs(6);
    }
}

/// Partial update of a tenant's webhook configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TenantConfigPatch {
    pub target_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl TenantConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.target_url.is_none() && self.webhook_secret.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(RelayError::Validation("no fields to update".to_string()));
        }
        if let Some(target_url) = &self.target_url {
            validate_target_url(target_url, true)?;
        }
        if matches!(&self.webhook_secret, Some(secret) if secret.is_empty()) {
            return Err(RelayError::Validation("webhook_secret must not be empty".to_string()));
        }
        Ok(())
    }
}

/// An API key and the tenant it authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantIdentity {
    pub api_key: String,
    pub tenant_id: TenantId,
    pub active: bool,
    #[serde(with = "epoch_seconds")]
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for TenantIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantIdentity")
            .field("tenant_id", &self.tenant_id)
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Default API key issued to a tenant.
pub fn default_api_key(tenant_id: &TenantId) -> String {
    format!("tenant_{tenant_id}_key")
}

/// Validate a tenant identifier: non-empty ASCII alphanumerics, `-` and `_`.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RelayError::Validation(format!(
            "invalid tenant id '{tenant_id}': use 1-64 letters, digits, '-' or '_'"
        )))
    }
}

/// Validate a webhook target URL. Plain `http` is only accepted when `allow_insecure`.
pub fn validate_target_url(target_url: &str, allow_insecure: bool) -> Result<()> {
    let invalid = |reason: &str| RelayError::Validation(format!("invalid target_url '{target_url}': {reason}"));
    let url = Url::parse(target_url).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        "http" => return Err(invalid("https is required")),
        _ => return Err(invalid("scheme must be http or https")),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}
