use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay::RelayError;
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Missing or unknown API key
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found, or owned by another tenant
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// The resource is not in a state that allows the operation
    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Switched off by an operator
    #[error("Unavailable: {message}")]
    Unavailable { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::PreconditionFailed { .. } | Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} {id} not found"),
            Error::PreconditionFailed { message } | Error::Conflict { message } | Error::Unavailable { message } => {
                message.clone()
            }
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl From<RelayError> for Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound { resource, id } => Error::NotFound {
                resource: resource.to_string(),
                id,
            },
            RelayError::Validation(message) => Error::BadRequest { message },
            RelayError::PreconditionFailed(message) => Error::PreconditionFailed { message },
            RelayError::Conflict(message) => Error::Conflict { message },
            RelayError::Unavailable(message) => Error::Unavailable { message },
            other => Error::Other(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Unauthenticated { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::Unavailable { .. } | Error::Conflict { .. } => {
                tracing::warn!("Request refused: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } | Error::PreconditionFailed { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        (status, Json(json!({ "error": self.user_message() }))).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
