//! HTTP surface of the relay service.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response bodies
//!
//! Tenant routes (`/v1/events`, `/v1/tenants/me`) authenticate with the tenant's API key
//! as a bearer token. Operator routes (`POST /v1/tenants`, `/v1/admin/*`) use the
//! configured `admin_api_key`. The reference receiver at `/receiver/{tenant_id}/webhook`
//! authenticates deliveries by their signature header alone.

pub mod handlers;
pub mod models;
