//! apigate - HTTP reverse proxy / API gateway
//!
//! A declarative routing table in front of health-checked, load-balanced,
//! circuit-broken backend pools, with token-bucket rate limiting, an admin
//! control plane and Prometheus metrics. Configuration swaps atomically at
//! runtime; in-flight requests always complete against the snapshot they
//! started on.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod errors;
pub mod infrastructure;

// Re-export the types most callers need.
pub use application::Gateway;
pub use config::Config;
pub use errors::GatewayError;
