use thiserror::Error;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur in the delivery engine.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The requested resource does not exist, or belongs to another tenant.
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// The caller supplied invalid input.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The resource exists but is not in a state that allows the operation.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is switched off by an operator.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn not_found(resource: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the failure comes from infrastructure and may succeed if retried.
    ///
    /// Workers leave the queue message unacknowledged on transient errors so it is
    /// redelivered after its visibility timeout.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Queue(_) | Self::Other(_))
    }
}
