//! Bearer token extractors.

use axum::{extract::FromRequestParts, http::request::Parts};
use relay::{TenantId, TenantIdentity};
use tracing::{debug, instrument, trace};

use crate::AppState;
use crate::errors::{Error, Result};

/// The tenant authenticated by the request's API key.
#[derive(Debug, Clone)]
pub struct CurrentTenant {
    pub tenant_id: TenantId,
}

/// An operator presenting the configured `admin_api_key`.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

/// Extract the token from `Authorization: Bearer <token>`.
fn bearer_token(parts: &Parts) -> Result<&str> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| Error::Unauthenticated {
            message: Some("Missing Authorization header".to_string()),
        })?;

    let value = header.to_str().map_err(|e| Error::BadRequest {
        message: format!("Invalid authorization header: {e}"),
    })?;

    value.strip_prefix("Bearer ").map(str::trim).ok_or_else(|| Error::Unauthenticated {
        message: Some("Expected a Bearer token".to_string()),
    })
}

impl FromRequestParts<AppState> for CurrentTenant {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let api_key = bearer_token(parts)?;

        let identity = state.identities.resolve_api_key(api_key).await?;
        match identity {
            Some(TenantIdentity {
                tenant_id, active: true, ..
            }) => {
                debug!(%tenant_id, "Authenticated tenant");
                Ok(CurrentTenant { tenant_id })
            }
            Some(_) => {
                trace!("API key belongs to an inactive tenant");
                Err(Error::Unauthenticated {
                    message: Some("Invalid API key".to_string()),
                })
            }
            None => Err(Error::Unauthenticated {
                message: Some("Invalid API key".to_string()),
            }),
        }
    }
}

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let Some(expected) = state.config.admin_api_key.as_deref() else {
            return Err(Error::Unauthenticated {
                message: Some("Operator routes are disabled".to_string()),
            });
        };

        let presented = bearer_token(parts)?;
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(Error::Unauthenticated {
                message: Some("Invalid admin key".to_string()),
            });
        }
        Ok(AdminAccess)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
