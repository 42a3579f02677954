//! Request admission for the admin API.
//!
//! Every routed request is identified (by bearer token or device
//! fingerprint) and charged against sliding-window quotas held in a shared
//! store before it reaches a handler. The library exists so that the binary
//! and the integration tests share one implementation.

pub mod admission;
pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod keys;
pub mod rate_limit;
pub mod store;
pub mod telemetry;
