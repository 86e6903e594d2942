//! Inbound adapters - the proxy, admin and metrics listeners.

pub mod admin_server;
pub mod metrics_server;
pub mod proxy_server;
