//! Integration tests for circuit breaking on the proxy path
//!
//! Verifies that a failing backend trips its breaker, that tripped
//! backends are not contacted, and that the half-open probe sequence
//! closes the circuit once the upstream recovers.

use apigate::adapters::inbound::proxy_server;
use apigate::adapters::outbound::GatewayMetrics;
use apigate::application::Gateway;
use apigate::config::Config;
use apigate::domain::entities::{BackendService, EndpointConfig, RouteConfig};
use apigate::infrastructure::circuit_breaker::CircuitState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn breaker_backend(url: &str, timeout_ms: u64) -> BackendService {
    let mut backend = BackendService {
        id: "api".to_string(),
        name: "API".to_string(),
        endpoints: vec![EndpointConfig {
            url: url.to_string(),
            weight: 1,
            metadata: None,
        }],
        load_balancer: Default::default(),
        health_check: Default::default(),
        circuit_breaker: Default::default(),
        retry_policy: Default::default(),
        enabled: true,
        created_at: None,
        updated_at: None,
    };
    backend.circuit_breaker.enabled = true;
    backend.circuit_breaker.minimum_requests = 3;
    backend.circuit_breaker.failure_ratio = 0.6;
    backend.circuit_breaker.timeout_ms = timeout_ms;
    backend.circuit_breaker.max_requests = 3;
    backend
}

fn config(backend: BackendService) -> Config {
    Config {
        routes: vec![RouteConfig {
            id: "r1".to_string(),
            path: "/api/*".to_string(),
            method: vec!["GET".to_string()],
            backend: "api".to_string(),
            timeout_ms: 5_000,
            priority: 0,
            enabled: true,
            rate_limit: None,
            auth: None,
            created_at: None,
            updated_at: None,
        }],
        backends: vec![backend],
        ..Default::default()
    }
}

async fn start_proxy(cfg: Config) -> (Arc<Gateway>, String) {
    cfg.validate().expect("test config must be valid");
    let gateway = Gateway::new(cfg, Arc::new(GatewayMetrics::new())).await;
    let app = proxy_server::router(gateway.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (gateway, format!("http://{}", addr))
}

#[tokio::test]
async fn test_breaker_trips_and_stops_contacting_upstream() {
    let upstream = MockServer::start().await;
    // Exactly three requests may reach the upstream; the breaker must
    // absorb the rest.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&upstream)
        .await;

    let cfg = config(breaker_backend(&upstream.uri(), 60_000));
    let (gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let url = format!("{}/api/x", base);

    // Three failing exchanges, upstream status preserved to the client.
    for _ in 0..3 {
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 500);
    }

    // Requests 4-8 are rejected by the open breaker without an upstream
    // attempt; wiremock's expect(3) verifies the contact count on drop.
    for _ in 0..5 {
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    assert_eq!(
        gateway.snapshot().breaker_stats("api").unwrap().state,
        CircuitState::Open
    );
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open_probes() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    // Short dwell so the test can wait it out.
    let cfg = config(breaker_backend(&upstream.uri(), 300));
    let (gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let url = format!("{}/api/x", base);

    for _ in 0..3 {
        assert_eq!(client.get(&url).send().await.unwrap().status(), 500);
    }
    assert_eq!(client.get(&url).send().await.unwrap().status(), 503);

    // Upstream recovers.
    upstream.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("back"))
        .mount(&upstream)
        .await;

    tokio::time::sleep(Duration::from_millis(350)).await;

    // First request after the dwell is the probe and reaches the upstream.
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        gateway.snapshot().breaker_stats("api").unwrap().state,
        CircuitState::HalfOpen
    );

    // Two more successes close the circuit (max_requests = 3).
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(
        gateway.snapshot().breaker_stats("api").unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let cfg = config(breaker_backend(&upstream.uri(), 200));
    let (gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let url = format!("{}/api/x", base);

    for _ in 0..3 {
        client.get(&url).send().await.unwrap();
    }
    assert_eq!(
        gateway.snapshot().breaker_stats("api").unwrap().state,
        CircuitState::Open
    );

    tokio::time::sleep(Duration::from_millis(250)).await;

    // The probe still fails: straight back to open with a fresh dwell.
    assert_eq!(client.get(&url).send().await.unwrap().status(), 500);
    assert_eq!(
        gateway.snapshot().breaker_stats("api").unwrap().state,
        CircuitState::Open
    );
    assert_eq!(client.get(&url).send().await.unwrap().status(), 503);
}

#[tokio::test]
async fn test_connection_refused_maps_to_502() {
    // No server listens on port 1.
    let mut backend = breaker_backend("http://127.0.0.1:1", 60_000);
    backend.circuit_breaker.enabled = false;
    let cfg = config(backend);
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/api/x", base)).await.unwrap();
    assert_eq!(resp.status(), 502);
}
