//! API request/response models for operator routes.

use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEUE_MAX_MESSAGES: usize = 100;

/// Body of `POST /v1/admin/dead-letters/requeue`.
#[derive(Debug, Clone, Deserialize)]
pub struct RequeueRequest {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    DEFAULT_REQUEUE_MAX_MESSAGES
}

/// State of the delivery switch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryState {
    pub enabled: bool,
}

/// Body of `GET /healthz`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub delivery_enabled: bool,
}
