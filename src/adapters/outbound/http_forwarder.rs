//! HTTP Forwarder
//!
//! Streams a client request to the selected upstream endpoint and the
//! response back, preserving path, query, status and headers. Hop-by-hop
//! headers are stripped in both directions, an `X-Forwarded-For` element is
//! appended for the immediate peer, and the route timeout is a hard
//! deadline on the upstream exchange.
//!
//! Transport failures never reach the client verbatim: they are logged and
//! collapsed into the gateway error kinds.

use crate::errors::GatewayError;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response};
use std::net::SocketAddr;
use std::time::Duration;

/// Hop-by-hop headers (RFC 7230 §6.1) plus the framing headers the
/// forwarder re-derives itself.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream HTTP client wrapper.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// Build the shared upstream client. Timeouts are per-request (the
    /// route decides), so the client itself carries none.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Forward `req` to `endpoint_url`, honoring `timeout` as the deadline
    /// for the whole upstream exchange.
    pub async fn forward(
        &self,
        endpoint_url: &str,
        req: Request,
        peer: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<Response<Body>, GatewayError> {
        let (parts, body) = req.into_parts();

        let target = build_target_url(endpoint_url, parts.uri.path(), parts.uri.query())
            .map_err(|e| GatewayError::Internal(format!("invalid target url: {}", e)))?;

        let mut headers = filter_headers(&parts.headers);
        append_forwarded_for(&mut headers, &parts.headers, peer);

        let upstream = self
            .client
            .request(parts.method.clone(), target)
            .headers(headers)
            .timeout(timeout)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| classify_send_error(endpoint_url, e))?;

        let status = upstream.status();
        let response_headers = filter_headers(upstream.headers());

        let mut builder = Response::builder().status(status);
        if let Some(header_map) = builder.headers_mut() {
            *header_map = response_headers;
        }
        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("response assembly failed: {}", e)))
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite the target: endpoint base, original path and query.
fn build_target_url(
    endpoint_url: &str,
    path: &str,
    query: Option<&str>,
) -> Result<reqwest::Url, url::ParseError> {
    let base: reqwest::Url = endpoint_url.parse()?;
    let mut target = base.clone();

    let base_path = base.path().trim_end_matches('/');
    if base_path.is_empty() {
        target.set_path(path);
    } else {
        target.set_path(&format!("{}{}", base_path, path));
    }
    target.set_query(query);
    Ok(target)
}

/// Copy headers minus hop-by-hop, `Host` (re-derived from the target) and
/// `Content-Length` (the streamed body is re-framed).
fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if lower == "host"
            || lower == "content-length"
            || lower.starts_with("proxy-")
            || HOP_BY_HOP.contains(&lower)
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Append the immediate peer to `X-Forwarded-For`.
fn append_forwarded_for(out: &mut HeaderMap, original: &HeaderMap, peer: Option<SocketAddr>) {
    let Some(peer) = peer else { return };
    let peer_ip = peer.ip().to_string();

    let value = match original
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, peer_ip),
        _ => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        out.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}

fn classify_send_error(endpoint: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        tracing::warn!(endpoint, error = %err, "upstream exchange timed out");
        GatewayError::UpstreamTimeout
    } else {
        tracing::warn!(endpoint, error = %err, "upstream exchange failed");
        GatewayError::UpstreamUnavailable(endpoint.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Target Rewrite =====

    #[test]
    fn test_target_preserves_path_and_query() {
        let url = build_target_url("http://upstream:9000", "/api/v1/users", Some("page=2")).unwrap();
        assert_eq!(url.as_str(), "http://upstream:9000/api/v1/users?page=2");
    }

    #[test]
    fn test_target_without_query() {
        let url = build_target_url("http://upstream:9000", "/api/v1/users", None).unwrap();
        assert_eq!(url.as_str(), "http://upstream:9000/api/v1/users");
    }

    #[test]
    fn test_target_joins_base_path() {
        let url = build_target_url("http://upstream:9000/base/", "/users", None).unwrap();
        assert_eq!(url.as_str(), "http://upstream:9000/base/users");
    }

    #[test]
    fn test_target_rejects_garbage() {
        assert!(build_target_url("not a url", "/x", None).is_err());
    }

    // ===== Header Filtering =====

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                value.parse::<HeaderValue>().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_filter_strips_hop_by_hop() {
        let filtered = filter_headers(&headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("te", "trailers"),
            ("trailer", "expires"),
            ("proxy-authorization", "basic xyz"),
            ("accept", "application/json"),
        ]));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_filter_strips_host_and_content_length() {
        let filtered = filter_headers(&headers(&[
            ("host", "gateway.internal"),
            ("content-length", "42"),
            ("content-type", "application/json"),
        ]));
        assert!(filtered.get("host").is_none());
        assert!(filtered.get("content-length").is_none());
        assert_eq!(filtered.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_filter_keeps_duplicate_values() {
        let filtered = filter_headers(&headers(&[
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]));
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
    }

    // ===== X-Forwarded-For =====

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.7:4711".parse().unwrap())
    }

    #[test]
    fn test_xff_appends_to_existing_chain() {
        let original = headers(&[("x-forwarded-for", "203.0.113.9")]);
        let mut out = filter_headers(&original);
        append_forwarded_for(&mut out, &original, peer());
        assert_eq!(
            out.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 192.0.2.7"
        );
    }

    #[test]
    fn test_xff_created_when_absent() {
        let original = HeaderMap::new();
        let mut out = HeaderMap::new();
        append_forwarded_for(&mut out, &original, peer());
        assert_eq!(out.get("x-forwarded-for").unwrap(), "192.0.2.7");
    }

    #[test]
    fn test_xff_skipped_without_peer() {
        let original = HeaderMap::new();
        let mut out = HeaderMap::new();
        append_forwarded_for(&mut out, &original, None);
        assert!(out.get("x-forwarded-for").is_none());
    }
}
