use axum::{Json, extract::State, http::StatusCode};
use relay::tenant::{default_api_key, validate_target_url, validate_tenant_id};
use relay::TenantId;
use tracing::info;

use crate::AppState;
use crate::api::models::tenants::{TenantCreate, TenantCreateResponse, TenantResponse, TenantUpdate};
use crate::auth::{AdminAccess, CurrentTenant};
use crate::errors::{Error, Result};

/// Create a tenant with its webhook configuration and API key.
///
/// The API key and webhook secret are returned here and nowhere else.
#[tracing::instrument(skip_all, fields(tenant_id = %request.tenant_id))]
pub async fn create_tenant(
    State(state): State<AppState>,
    _: AdminAccess,
    Json(request): Json<TenantCreate>,
) -> Result<(StatusCode, Json<TenantCreateResponse>)> {
    validate_tenant_id(&request.tenant_id)?;
    validate_target_url(&request.target_url, state.config.allow_insecure_urls)?;
    if matches!(&request.webhook_secret, Some(secret) if secret.is_empty()) {
        return Err(Error::BadRequest {
            message: "webhook_secret must not be empty".to_string(),
        });
    }

    let tenant_id = TenantId::from(request.tenant_id);
    let api_key = request.api_key.unwrap_or_else(|| default_api_key(&tenant_id));

    let (config, _) = state
        .tenants
        .create_tenant(&tenant_id, &request.target_url, request.webhook_secret, &api_key)
        .await?;

    info!("Tenant created");
    Ok((
        StatusCode::CREATED,
        Json(TenantCreateResponse {
            tenant_id,
            api_key,
            target_url: config.target_url,
            webhook_secret: config.webhook_secret,
        }),
    ))
}

#[tracing::instrument(skip_all, fields(tenant_id = %tenant.tenant_id))]
pub async fn get_current_tenant(State(state): State<AppState>, tenant: CurrentTenant) -> Result<Json<TenantResponse>> {
    let config = state
        .tenant_configs
        .get_config(&tenant.tenant_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Tenant configuration".to_string(),
            id: tenant.tenant_id.to_string(),
        })?;
    Ok(Json(config.into()))
}

/// Change the target URL and/or the webhook secret. Takes effect for the next delivery,
/// including events already queued.
#[tracing::instrument(skip_all, fields(tenant_id = %tenant.tenant_id))]
pub async fn update_current_tenant(
    State(state): State<AppState>,
    tenant: CurrentTenant,
    Json(update): Json<TenantUpdate>,
) -> Result<Json<TenantResponse>> {
    let patch = update.into_patch();
    patch.validate()?;
    if let Some(target_url) = &patch.target_url {
        validate_target_url(target_url, state.config.allow_insecure_urls)?;
    }

    let config = state.tenant_configs.update_config(&tenant.tenant_id, &patch).await?;
    info!(secret_changed = patch.webhook_secret.is_some(), "Tenant configuration updated");

    let secret = patch.webhook_secret.is_some().then(|| config.webhook_secret.clone());
    let mut response = TenantResponse::from(config);
    response.webhook_secret = secret;
    Ok(Json(response))
}
