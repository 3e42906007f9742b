//! API request/response models for tenants.

use chrono::{DateTime, Utc};
use relay::event::epoch_seconds;
use relay::{TenantConfigPatch, TenantId, TenantWebhookConfig};
use serde::{Deserialize, Serialize};

/// Body of `POST /v1/tenants`.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantCreate {
    pub tenant_id: String,
    pub target_url: String,
    /// Generated when omitted
    pub webhook_secret: Option<String>,
    /// Defaults to `tenant_<tenant_id>_key`
    pub api_key: Option<String>,
}

/// Credentials of a new tenant. The only response that carries both the API key
/// and the webhook secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCreateResponse {
    pub tenant_id: TenantId,
    pub api_key: String,
    pub target_url: String,
    pub webhook_secret: String,
}

/// Body of `PATCH /v1/tenants/me`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantUpdate {
    pub target_url: Option<String>,
    pub webhook_secret: Option<String>,
    /// Replace the secret with a freshly generated one
    #[serde(default)]
    pub rotate_secret: bool,
}

impl TenantUpdate {
    /// Resolve to a store patch, generating a secret when rotation was requested.
    pub fn into_patch(self) -> TenantConfigPatch {
        let webhook_secret = if self.rotate_secret && self.webhook_secret.is_none() {
            Some(relay::signing::generate_secret())
        } else {
            self.webhook_secret
        };
        TenantConfigPatch {
            target_url: self.target_url,
            webhook_secret,
        }
    }
}

/// A tenant's webhook configuration without its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantResponse {
    pub tenant_id: TenantId,
    pub target_url: String,
    #[serde(with = "epoch_seconds")]
    pub updated_at: DateTime<Utc>,
    /// Only present in the response to a secret change
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub webhook_secret: Option<String>,
}

impl From<TenantWebhookConfig> for TenantResponse {
    fn from(config: TenantWebhookConfig) -> Self {
        Self {
            tenant_id: config.tenant_id,
            target_url: config.target_url,
            updated_at: config.updated_at,
            webhook_secret: None,
        }
    }
}
