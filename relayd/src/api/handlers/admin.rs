use axum::{Json, extract::State};
use relay::RequeueReport;
use tracing::info;

use crate::AppState;
use crate::api::models::admin::{DeliveryState, HealthResponse, RequeueRequest};
use crate::auth::AdminAccess;
use crate::errors::Result;

/// Move up to `max_messages` dead letters back onto the delivery queue.
#[tracing::instrument(skip_all, fields(max_messages = request.max_messages))]
pub async fn requeue_dead_letters(
    State(state): State<AppState>,
    _: AdminAccess,
    Json(request): Json<RequeueRequest>,
) -> Result<Json<RequeueReport>> {
    let report = state.retries.requeue_dead_letters(request.max_messages).await?;
    Ok(Json(report))
}

pub async fn get_delivery_state(State(state): State<AppState>, _: AdminAccess) -> Json<DeliveryState> {
    Json(DeliveryState {
        enabled: state.switch.is_enabled(),
    })
}

/// Flip the delivery switch. Affects ingestion, outbound delivery and the reference
/// receiver until changed again or the process restarts.
#[tracing::instrument(skip_all, fields(enabled = request.enabled))]
pub async fn set_delivery_state(
    State(state): State<AppState>,
    _: AdminAccess,
    Json(request): Json<DeliveryState>,
) -> Json<DeliveryState> {
    state.switch.set(request.enabled);
    info!("Delivery {}", if request.enabled { "enabled" } else { "disabled" });
    Json(DeliveryState {
        enabled: state.switch.is_enabled(),
    })
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        delivery_enabled: state.switch.is_enabled(),
    })
}
