//! Reference webhook receiver.
//!
//! Verifies deliveries the way a tenant's endpoint should: recompute the HMAC over the
//! raw request body with the tenant's current secret and compare it against the
//! signature header.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use relay::TenantId;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::AppState;
use crate::errors::{Error, Result};

#[tracing::instrument(skip_all, fields(tenant_id = %tenant_id))]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    if !state.switch.is_enabled() {
        return Err(Error::Unavailable {
            message: "Webhook reception temporarily disabled".to_string(),
        });
    }

    let header_name = state.config.delivery.signature_header.as_str();
    let signature = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Unauthenticated {
            message: Some(format!("Missing {header_name} header")),
        })?;

    let tenant_id = TenantId::from(tenant_id);
    let config = state
        .tenant_configs
        .get_config(&tenant_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Tenant".to_string(),
            id: tenant_id.to_string(),
        })?;

    if !relay::signing::verify(
        &config.webhook_secret,
        &body,
        signature,
        state.config.receiver.max_signature_age,
    ) {
        warn!("Invalid webhook signature");
        return Err(Error::Unauthenticated {
            message: Some("Invalid signature".to_string()),
        });
    }

    let event_id = serde_json::from_slice::<Value>(&body).ok().and_then(|payload| {
        payload
            .get("event_id")
            .or_else(|| payload.get("eventId"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    info!(event_id = ?event_id, "Valid webhook received");

    Ok(Json(json!({ "status": "received", "tenant_id": tenant_id })))
}
