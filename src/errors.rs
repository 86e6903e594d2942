//! Gateway error kinds.
//!
//! Every failure a request can hit inside the pipeline maps to exactly one
//! client-facing status code. Raw upstream transport errors never reach the
//! client; the forwarder collapses them into `UpstreamUnavailable` after
//! logging the underlying cause.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors produced by the request pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No enabled route matched the request path.
    #[error("no route matched")]
    NoRoute,

    /// A route matched the path but not the request method.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The route's rate-limit policy denied the request.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The route's auth policy denied the request.
    #[error("unauthorized")]
    Unauthorized,

    /// The backend's circuit breaker is open.
    #[error("circuit open for backend {0}")]
    CircuitOpen(String),

    /// The backend has no healthy endpoint in rotation.
    #[error("no healthy endpoint for backend {0}")]
    NoHealthyEndpoint(String),

    /// Upstream connect / reset / protocol failure.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The route deadline expired before the upstream answered.
    #[error("upstream timeout")]
    UpstreamTimeout,

    /// Anything the pipeline could not classify.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Client status code for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoRoute => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::CircuitOpen(_) | GatewayError::NoHealthyEndpoint(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
