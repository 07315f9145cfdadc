//! Core data models for the tenant provisioner.
//!
//! A `Tenant` is the persisted record owned by the tenant store; the
//! notification types describe what the lifecycle code hands to the
//! notifier. Both serialize via `serde`.

pub mod notification;
pub mod tenant;
