//! Outbound adapters - upstream HTTP client and metrics sink.

pub mod http_forwarder;
pub mod metrics_store;

pub use http_forwarder::HttpForwarder;
pub use metrics_store::GatewayMetrics;
