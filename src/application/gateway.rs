//! Gateway - the router core
//!
//! Owns the current configuration snapshot and all runtime state derived
//! from it: the route table, one endpoint pool and optional circuit breaker
//! per backend, per-route rate limiters, and the health checker bound to
//! the snapshot's pools.
//!
//! The snapshot sits behind one atomic pointer. Requests load it once and
//! run entirely against that load; `reload` builds a replacement, swaps the
//! pointer, and only then stops the retiring health checker, so in-flight
//! requests complete against the state they started on.

use crate::adapters::outbound::{GatewayMetrics, HttpForwarder};
use crate::config::{Config, ConfigError};
use crate::domain::entities::{AuthConfig, AuthType, BackendService};
use crate::domain::route_table::{MatchOutcome, RouteTable};
use crate::errors::GatewayError;
use crate::infrastructure::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitState};
use crate::infrastructure::endpoint_pool::EndpointPool;
use crate::infrastructure::health_checker::{BackendHealth, HealthChecker, HealthTarget};
use crate::infrastructure::rate_limiter::{self, RateLimiter};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, Response, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Runtime state for one enabled backend.
pub struct BackendRuntime {
    pub service: BackendService,
    pub pool: Arc<EndpointPool>,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

/// One immutable configuration generation.
pub struct Snapshot {
    pub config: Config,
    pub routes: RouteTable,
    pub backends: HashMap<String, Arc<BackendRuntime>>,
    /// Rate limiters for routes that carry an enabled policy, by route ID.
    pub limiters: HashMap<String, Arc<RateLimiter>>,
}

impl Snapshot {
    fn build(config: Config) -> Self {
        let mut backends = HashMap::new();
        for service in config.backends.iter().filter(|b| b.enabled) {
            // Health-checked pools start down until the first probe sweep;
            // unchecked pools have nothing that would ever mark them up.
            let pool = EndpointPool::new(
                &service.endpoints,
                service.load_balancer.algorithm,
                !service.health_check.enabled,
            );
            let breaker = service.circuit_breaker.enabled.then(|| {
                Arc::new(CircuitBreaker::new(
                    service.id.clone(),
                    service.circuit_breaker.clone(),
                ))
            });
            backends.insert(
                service.id.clone(),
                Arc::new(BackendRuntime {
                    service: service.clone(),
                    pool,
                    breaker,
                }),
            );
        }

        let mut limiters = HashMap::new();
        for route in &config.routes {
            if let Some(policy) = &route.rate_limit {
                if policy.enabled {
                    limiters.insert(
                        route.id.clone(),
                        Arc::new(RateLimiter::new(policy.clone())),
                    );
                }
            }
        }

        let routes = RouteTable::new(config.routes.clone());

        Self {
            config,
            routes,
            backends,
            limiters,
        }
    }

    fn health_targets(&self) -> Vec<HealthTarget> {
        self.backends
            .values()
            .map(|runtime| HealthTarget {
                backend_id: runtime.service.id.clone(),
                config: runtime.service.health_check.clone(),
                endpoints: runtime
                    .service
                    .endpoints
                    .iter()
                    .map(|ep| ep.url.clone())
                    .collect(),
                pool: runtime.pool.clone(),
            })
            .collect()
    }

    /// Breaker states for the metrics exposition.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.backends
            .values()
            .filter_map(|r| r.breaker.as_ref().map(|b| (r.service.id.clone(), b.state())))
            .collect()
    }

    /// Pool health for the metrics exposition.
    pub fn backend_health_flags(&self) -> Vec<(String, bool)> {
        self.backends
            .values()
            .map(|r| (r.service.id.clone(), r.pool.has_healthy()))
            .collect()
    }

    /// Breaker stats for the admin surface.
    pub fn breaker_stats(&self, backend_id: &str) -> Option<BreakerStats> {
        self.backends
            .get(backend_id)
            .and_then(|r| r.breaker.as_ref())
            .map(|b| b.stats())
    }
}

/// The router core.
pub struct Gateway {
    snapshot: ArcSwap<Snapshot>,
    /// Current health checker; the slot doubles as the reload serializer.
    checker: Mutex<Option<HealthChecker>>,
    forwarder: HttpForwarder,
    metrics: Arc<GatewayMetrics>,
}

impl Gateway {
    /// Build the runtime for an already-validated configuration and start
    /// its health checker.
    pub async fn new(config: Config, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        let snapshot = Arc::new(Snapshot::build(config));
        let checker = HealthChecker::start(snapshot.health_targets());

        Arc::new(Self {
            snapshot: ArcSwap::from(snapshot),
            checker: Mutex::new(Some(checker)),
            forwarder: HttpForwarder::new(),
            metrics,
        })
    }

    /// The snapshot currently in force.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Atomically install a new configuration.
    ///
    /// Validation failure leaves the running snapshot untouched. On
    /// success the pointer swap happens before the old health checker is
    /// stopped, so requests on the retiring snapshot still complete.
    pub async fn reload(&self, mut new_config: Config) -> Result<(), ConfigError> {
        new_config.normalize();
        new_config.validate()?;

        let mut checker_slot = self.checker.lock().await;

        let snapshot = Arc::new(Snapshot::build(new_config));
        let new_checker = HealthChecker::start(snapshot.health_targets());
        self.snapshot.store(snapshot);

        let old_checker = checker_slot.replace(new_checker);
        drop(checker_slot);

        if let Some(old) = old_checker {
            old.stop().await;
        }

        tracing::info!("configuration reloaded");
        Ok(())
    }

    /// Stop background work. Used on process shutdown.
    pub async fn stop(&self) {
        if let Some(checker) = self.checker.lock().await.take() {
            checker.stop().await;
        }
    }

    /// Wait for every in-flight request to finish, up to `timeout`.
    ///
    /// Reads the same gauge `dispatch` maintains, so the count covers
    /// exactly the requests this gateway accepted and nothing else.
    pub async fn drain_in_flight(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self.metrics.in_flight();
            if in_flight == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(in_flight, "shutdown drain timed out");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Health record for one backend, from the current checker.
    pub async fn backend_health(&self, backend_id: &str) -> Option<BackendHealth> {
        let checker = self.checker.lock().await;
        checker.as_ref().and_then(|c| c.status(backend_id))
    }

    /// Health records for every backend.
    pub async fn all_backend_health(&self) -> Vec<BackendHealth> {
        let checker = self.checker.lock().await;
        checker
            .as_ref()
            .map(|c| c.all_statuses())
            .unwrap_or_default()
    }

    /// Run one request through the pipeline:
    /// match -> rate limit -> auth -> breaker -> pick -> forward -> record.
    pub async fn dispatch(&self, req: Request, peer: Option<SocketAddr>) -> Response<Body> {
        let _in_flight = self.metrics.in_flight_guard();
        let started = Instant::now();

        let snapshot = self.snapshot.load_full();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        let route = match snapshot.routes.find(&path, &method) {
            MatchOutcome::Matched(route) => route,
            MatchOutcome::MethodNotAllowed => {
                self.metrics.record_unrouted();
                return error_response(&GatewayError::MethodNotAllowed);
            }
            MatchOutcome::NotFound => {
                self.metrics.record_unrouted();
                return error_response(&GatewayError::NoRoute);
            }
        };

        // Rate limiting, when the route carries an enabled policy.
        if let Some(limiter) = snapshot.limiters.get(&route.id) {
            let principal = bearer_principal(req.headers());
            let key = rate_limiter::derive_key(
                limiter.config().key_type,
                req.headers(),
                peer,
                principal.as_deref(),
            );
            if !limiter.allow(&key) {
                self.metrics.record_rate_limited(&route.id);
                tracing::info!(route = %route.id, key = %key, "request rate limited");
                return error_response(&GatewayError::RateLimited);
            }
        }

        // Auth gate: credential presence only, verification is external.
        if let Some(auth) = &route.auth {
            if auth.enabled && auth.required && !is_authenticated(auth, req.headers()) {
                self.metrics.record_unauthorized(&route.id);
                tracing::info!(route = %route.id, "request rejected by auth policy");
                return error_response(&GatewayError::Unauthorized);
            }
        }

        let Some(runtime) = snapshot.backends.get(&route.backend) else {
            tracing::warn!(route = %route.id, backend = %route.backend, "backend missing or disabled");
            let err = GatewayError::NoHealthyEndpoint(route.backend.clone());
            self.metrics.record_request(
                &route.id,
                &route.backend,
                err.status().as_u16(),
                started.elapsed(),
            );
            return error_response(&err);
        };

        // Circuit breaker admission.
        let token = match &runtime.breaker {
            Some(breaker) => match breaker.allow() {
                Some(token) => Some(token),
                None => {
                    let err = GatewayError::CircuitOpen(route.backend.clone());
                    self.metrics.record_request(
                        &route.id,
                        &route.backend,
                        err.status().as_u16(),
                        started.elapsed(),
                    );
                    return error_response(&err);
                }
            },
            None => None,
        };

        // Endpoint selection. The lease releases any least-connections
        // slot when it drops, on every exit path below.
        let Some(lease) = runtime.pool.next() else {
            // An admitted call must still report an outcome, or a
            // half-open slot would leak.
            if let (Some(breaker), Some(token)) = (&runtime.breaker, token) {
                breaker.record(token, false);
            }
            let err = GatewayError::NoHealthyEndpoint(route.backend.clone());
            self.metrics.record_request(
                &route.id,
                &route.backend,
                err.status().as_u16(),
                started.elapsed(),
            );
            return error_response(&err);
        };

        let result = self
            .forwarder
            .forward(lease.url(), req, peer, route.timeout())
            .await;
        let duration = started.elapsed();

        match result {
            Ok(response) => {
                let status = response.status();
                if let (Some(breaker), Some(token)) = (&runtime.breaker, token) {
                    breaker.record(token, status.as_u16() < 500);
                }
                self.metrics
                    .record_request(&route.id, &route.backend, status.as_u16(), duration);
                tracing::info!(
                    method = %method,
                    route = %route.id,
                    backend = %route.backend,
                    endpoint = %lease.url(),
                    status = status.as_u16(),
                    duration_ms = duration.as_millis() as u64,
                    "request forwarded"
                );
                response
            }
            Err(err) => {
                if let (Some(breaker), Some(token)) = (&runtime.breaker, token) {
                    breaker.record(token, false);
                }
                self.metrics.record_request(
                    &route.id,
                    &route.backend,
                    err.status().as_u16(),
                    duration,
                );
                tracing::warn!(
                    method = %method,
                    route = %route.id,
                    backend = %route.backend,
                    endpoint = %lease.url(),
                    error = %err,
                    duration_ms = duration.as_millis() as u64,
                    "request failed"
                );
                error_response(&err)
            }
        }
    }
}

/// Plain-text response for a pipeline error. The detailed cause stays in
/// the logs.
pub fn error_response(err: &GatewayError) -> Response<Body> {
    let status = err.status();
    let reason = status.canonical_reason().unwrap_or("Error");
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(reason))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::from("Internal Server Error"));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

/// The authenticated principal visible to the gateway: the bearer token,
/// when one is present.
fn bearer_principal(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}

/// Does the request carry credentials of the required shape?
fn is_authenticated(auth: &AuthConfig, headers: &HeaderMap) -> bool {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match auth.auth_type {
        AuthType::None => true,
        AuthType::Basic => authorization
            .strip_prefix("Basic ")
            .is_some_and(|rest| !rest.is_empty()),
        AuthType::Bearer | AuthType::Jwt | AuthType::Oauth2 => authorization
            .strip_prefix("Bearer ")
            .is_some_and(|rest| !rest.is_empty()),
        AuthType::ApiKey => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|key| !key.is_empty()),
    }
}
