//! Axum route handlers, one module per resource.
//!
//! - [`events`]: ingestion, listing, lookup and manual retry of the caller's events
//! - [`tenants`]: tenant creation (operator) and self-service webhook configuration
//! - [`admin`]: dead-letter requeue, the delivery switch and health
//! - [`receiver`]: reference webhook receiver that verifies signatures

pub mod admin;
pub mod events;
pub mod receiver;
pub mod tenants;
