//! API request/response models.

pub mod admin;
pub mod events;
pub mod tenants;
