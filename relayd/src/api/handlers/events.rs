use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use relay::{Event, EventId, EventPage};
use serde_json::Value;

use crate::AppState;
use crate::api::models::events::{EventCreateResponse, ListEventsQuery};
use crate::auth::CurrentTenant;
use crate::errors::{Error, Result};

/// Ingest an event. The request body is the payload, stored and delivered verbatim.
#[tracing::instrument(skip_all, fields(tenant_id = %tenant.tenant_id))]
pub async fn create_event(
    State(state): State<AppState>,
    tenant: CurrentTenant,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<EventCreateResponse>)> {
    let config = state
        .tenant_configs
        .get_config(&tenant.tenant_id)
        .await?
        .ok_or_else(|| Error::BadRequest {
            message: "Tenant has no webhook configuration".to_string(),
        })?;

    let event = state.gateway.ingest(&tenant.tenant_id, &config.target_url, payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(EventCreateResponse {
            event_id: event.event_id,
            status: event.status,
        }),
    ))
}

#[tracing::instrument(skip_all, fields(tenant_id = %tenant.tenant_id))]
pub async fn list_events(
    State(state): State<AppState>,
    tenant: CurrentTenant,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<EventPage>> {
    let filter = query.into_filter()?;
    let page = state.events.list(&tenant.tenant_id, &filter).await?;
    Ok(Json(page))
}

#[tracing::instrument(skip_all, fields(tenant_id = %tenant.tenant_id, event_id = %event_id))]
pub async fn get_event(
    State(state): State<AppState>,
    tenant: CurrentTenant,
    Path(event_id): Path<String>,
) -> Result<Json<Event>> {
    let event = state.events.get(&tenant.tenant_id, &EventId::from(event_id)).await?;
    Ok(Json(event))
}

/// Reset a `FAILED` event to `PENDING` and enqueue it again. 409 for any other status.
#[tracing::instrument(skip_all, fields(tenant_id = %tenant.tenant_id, event_id = %event_id))]
pub async fn retry_event(
    State(state): State<AppState>,
    tenant: CurrentTenant,
    Path(event_id): Path<String>,
) -> Result<(StatusCode, Json<Event>)> {
    let event = state.retries.retry_event(&tenant.tenant_id, &EventId::from(event_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}
