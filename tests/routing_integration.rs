//! Integration tests for the routing pipeline
//!
//! A real proxy listener in front of wiremock upstreams, driven with
//! reqwest.

use apigate::adapters::inbound::proxy_server;
use apigate::adapters::outbound::GatewayMetrics;
use apigate::application::Gateway;
use apigate::config::Config;
use apigate::domain::entities::{
    AuthConfig, AuthType, BackendService, EndpointConfig, RateLimitConfig, RateLimitKey,
    RateLimitPeriod, RouteConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(id: &str, urls: &[&str]) -> BackendService {
    BackendService {
        id: id.to_string(),
        name: id.to_uppercase(),
        endpoints: urls
            .iter()
            .map(|url| EndpointConfig {
                url: url.to_string(),
                weight: 1,
                metadata: None,
            })
            .collect(),
        load_balancer: Default::default(),
        health_check: Default::default(),
        circuit_breaker: Default::default(),
        retry_policy: Default::default(),
        enabled: true,
        created_at: None,
        updated_at: None,
    }
}

fn route(id: &str, pattern: &str, methods: &[&str], backend: &str, priority: u32) -> RouteConfig {
    RouteConfig {
        id: id.to_string(),
        path: pattern.to_string(),
        method: methods.iter().map(|m| m.to_string()).collect(),
        backend: backend.to_string(),
        timeout_ms: 5_000,
        priority,
        enabled: true,
        rate_limit: None,
        auth: None,
        created_at: None,
        updated_at: None,
    }
}

fn config(routes: Vec<RouteConfig>, backends: Vec<BackendService>) -> Config {
    Config {
        routes,
        backends,
        ..Default::default()
    }
}

/// Bind the proxy app on an ephemeral port and return its base URL.
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
async fn test_basic_routing_forwards_path_and_body() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string("user list"))
        .expect(1)
        .mount(&upstream)
        .await;

    let cfg = config(
        vec![route("r1", "/api/v1/*", &["GET", "POST"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/api/v1/users", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "user list");
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let upstream = MockServer::start().await;
    let cfg = config(
        vec![route("r1", "/api/v1/*", &["GET"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/unknown", base)).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_wrong_method_is_405() {
    let upstream = MockServer::start().await;
    let cfg = config(
        vec![route("r1", "/api/v1/*", &["GET"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{}/api/v1/users", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn test_priority_selects_specific_route() {
    let upstream_lo = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("general"))
        .mount(&upstream_lo)
        .await;

    let upstream_hi = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("special"))
        .mount(&upstream_hi)
        .await;

    let cfg = config(
        vec![
            route("lo", "/a/*", &["GET"], "general", 10),
            route("hi", "/a/special", &["GET"], "special", 100),
        ],
        vec![
            backend("general", &[&upstream_lo.uri()]),
            backend("special", &[&upstream_hi.uri()]),
        ],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/a/special", base)).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "special");

    let resp = reqwest::get(format!("{}/a/other", base)).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "general");
}

#[tokio::test]
async fn test_query_string_and_forwarded_for_are_propagated() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/search"))
        .and(query_param("q", "rust"))
        .and(header_exists("x-forwarded-for"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let cfg = config(
        vec![route("r1", "/api/*", &["GET"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/api/search?q=rust", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_upstream_status_is_preserved() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
        .mount(&upstream)
        .await;

    let cfg = config(
        vec![route("r1", "/api/*", &["GET"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/api/x", base)).await.unwrap();
    assert_eq!(resp.status(), 418);
    assert_eq!(resp.text().await.unwrap(), "teapot");
}

#[tokio::test]
async fn test_post_body_reaches_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/users"))
        .and(wiremock::matchers::body_string("{\"name\":\"ada\"}"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&upstream)
        .await;

    let cfg = config(
        vec![route("r1", "/api/v1/*", &["GET", "POST"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/v1/users", base))
        .body("{\"name\":\"ada\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
}

#[tokio::test]
async fn test_rate_limit_returns_429_after_burst() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut limited = route("r1", "/api/*", &["GET"], "api", 0);
    limited.rate_limit = Some(RateLimitConfig {
        enabled: true,
        rate: 1,
        period: RateLimitPeriod::Hour,
        burst_size: 2,
        key_type: RateLimitKey::Ip,
        white_list: vec![],
    });

    let cfg = config(vec![limited], vec![backend("api", &[&upstream.uri()])]);
    let (_gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let url = format!("{}/api/x", base);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 429);
}

#[tokio::test]
async fn test_auth_required_rejects_and_admits() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret data"))
        .mount(&upstream)
        .await;

    let mut protected = route("r1", "/api/*", &["GET"], "api", 0);
    protected.auth = Some(AuthConfig {
        enabled: true,
        auth_type: AuthType::Bearer,
        required: true,
        roles: vec![],
    });

    let cfg = config(vec![protected], vec![backend("api", &[&upstream.uri()])]);
    let (_gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let url = format!("{}/api/x", base);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(&url)
        .header("authorization", "Bearer token-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "secret data");
}

#[tokio::test]
async fn test_round_robin_spreads_over_endpoints() {
    let upstream_a = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a"))
        .mount(&upstream_a)
        .await;
    let upstream_b = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("b"))
        .mount(&upstream_b)
        .await;

    let cfg = config(
        vec![route("r1", "/api/*", &["GET"], "api", 0)],
        vec![backend("api", &[&upstream_a.uri(), &upstream_b.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let client = reqwest::Client::new();
    let mut bodies = Vec::new();
    for _ in 0..4 {
        let resp = client.get(format!("{}/api/x", base)).send().await.unwrap();
        bodies.push(resp.text().await.unwrap());
    }
    assert!(bodies.contains(&"a".to_string()));
    assert!(bodies.contains(&"b".to_string()));
}

#[tokio::test]
async fn test_gateway_health_endpoint() {
    let upstream = MockServer::start().await;
    let cfg = config(
        vec![route("r1", "/api/*", &["GET"], "api", 0)],
        vec![backend("api", &[&upstream.uri()])],
    );
    let (_gateway, base) = start_proxy(cfg).await;

    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["status"].is_string());
    assert!(body["services"]["api"]["status"].is_string());
}
