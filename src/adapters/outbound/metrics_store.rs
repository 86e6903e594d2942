//! Gateway Metrics Store
//!
//! Request counters and gauges kept in lock-free atomics, rendered in
//! Prometheus text exposition format on demand.

use crate::infrastructure::circuit_breaker::CircuitState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-route counters.
#[derive(Debug, Default)]
pub struct RouteCounters {
    pub requests_total: AtomicU64,
    pub responses_2xx: AtomicU64,
    pub responses_4xx: AtomicU64,
    pub responses_5xx: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub unauthorized_total: AtomicU64,
    pub duration_sum_ms: AtomicU64,
    pub duration_count: AtomicU64,
}

impl RouteCounters {
    pub fn avg_duration_ms(&self) -> f64 {
        let count = self.duration_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.duration_sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }
}

/// Per-backend counters.
#[derive(Debug, Default)]
pub struct BackendCounters {
    pub requests_total: AtomicU64,
    pub failures_total: AtomicU64,
}

/// Central metrics store shared by the dispatch path and the exposition
/// listener.
pub struct GatewayMetrics {
    routes: DashMap<String, Arc<RouteCounters>>,
    backends: DashMap<String, Arc<BackendCounters>>,
    requests_total: AtomicU64,
    /// Shared with in-flight guards so a late drop can still decrement.
    requests_in_flight: Arc<AtomicI64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            backends: DashMap::new(),
            requests_total: AtomicU64::new(0),
            requests_in_flight: Arc::new(AtomicI64::new(0)),
        }
    }

    fn route(&self, route_id: &str) -> Arc<RouteCounters> {
        self.routes
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(RouteCounters::default()))
            .clone()
    }

    fn backend(&self, backend_id: &str) -> Arc<BackendCounters> {
        self.backends
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(BackendCounters::default()))
            .clone()
    }

    /// Record a completed, routed request.
    pub fn record_request(
        &self,
        route_id: &str,
        backend_id: &str,
        status: u16,
        duration: Duration,
    ) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let route = self.route(route_id);
        route.requests_total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => route.responses_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => route.responses_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => route.responses_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        route
            .duration_sum_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        route.duration_count.fetch_add(1, Ordering::Relaxed);

        let backend = self.backend(backend_id);
        backend.requests_total.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            backend.failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self, route_id: &str) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.route(route_id)
            .rate_limited_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unauthorized(&self, route_id: &str) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.route(route_id)
            .unauthorized_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count an unrouted request (404/405).
    pub fn record_unrouted(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a request for the in-flight gauge; the guard releases on drop.
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            gauge: self.requests_in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.requests_in_flight.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn route_counters(&self, route_id: &str) -> Option<Arc<RouteCounters>> {
        self.routes.get(route_id).map(|c| c.clone())
    }

    /// Render everything in Prometheus text format. Breaker and health
    /// gauges come from the current snapshot, which the caller owns.
    pub fn export_prometheus(
        &self,
        breaker_states: &[(String, CircuitState)],
        backend_health: &[(String, bool)],
    ) -> String {
        let mut out = String::new();

        out.push_str("# HELP apigate_requests_total Total requests handled\n");
        out.push_str("# TYPE apigate_requests_total counter\n");
        out.push_str(&format!(
            "apigate_requests_total {}\n",
            self.requests_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP apigate_requests_in_flight Requests currently being proxied\n");
        out.push_str("# TYPE apigate_requests_in_flight gauge\n");
        out.push_str(&format!(
            "apigate_requests_in_flight {}\n",
            self.requests_in_flight.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP apigate_route_requests_total Requests per route\n");
        out.push_str("# TYPE apigate_route_requests_total counter\n");
        out.push_str("# HELP apigate_route_responses_total Responses per route by status class\n");
        out.push_str("# TYPE apigate_route_responses_total counter\n");
        out.push_str("# HELP apigate_route_rate_limited_total Requests rejected by rate limiting\n");
        out.push_str("# TYPE apigate_route_rate_limited_total counter\n");
        out.push_str("# HELP apigate_route_unauthorized_total Requests rejected by auth\n");
        out.push_str("# TYPE apigate_route_unauthorized_total counter\n");
        out.push_str("# HELP apigate_route_duration_ms_sum Summed forwarding duration per route\n");
        out.push_str("# TYPE apigate_route_duration_ms_sum counter\n");
        out.push_str("# HELP apigate_route_duration_ms_count Observations per route\n");
        out.push_str("# TYPE apigate_route_duration_ms_count counter\n");

        for entry in self.routes.iter() {
            let route = entry.key();
            let c = entry.value();
            out.push_str(&format!(
                "apigate_route_requests_total{{route=\"{}\"}} {}\n",
                route,
                c.requests_total.load(Ordering::Relaxed)
            ));
            for (class, counter) in [
                ("2xx", &c.responses_2xx),
                ("4xx", &c.responses_4xx),
                ("5xx", &c.responses_5xx),
            ] {
                out.push_str(&format!(
                    "apigate_route_responses_total{{route=\"{}\",class=\"{}\"}} {}\n",
                    route,
                    class,
                    counter.load(Ordering::Relaxed)
                ));
            }
            out.push_str(&format!(
                "apigate_route_rate_limited_total{{route=\"{}\"}} {}\n",
                route,
                c.rate_limited_total.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "apigate_route_unauthorized_total{{route=\"{}\"}} {}\n",
                route,
                c.unauthorized_total.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "apigate_route_duration_ms_sum{{route=\"{}\"}} {}\n",
                route,
                c.duration_sum_ms.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "apigate_route_duration_ms_count{{route=\"{}\"}} {}\n",
                route,
                c.duration_count.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP apigate_backend_requests_total Requests per backend\n");
        out.push_str("# TYPE apigate_backend_requests_total counter\n");
        out.push_str("# HELP apigate_backend_failures_total 5xx outcomes per backend\n");
        out.push_str("# TYPE apigate_backend_failures_total counter\n");

        for entry in self.backends.iter() {
            let backend = entry.key();
            let c = entry.value();
            out.push_str(&format!(
                "apigate_backend_requests_total{{backend=\"{}\"}} {}\n",
                backend,
                c.requests_total.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "apigate_backend_failures_total{{backend=\"{}\"}} {}\n",
                backend,
                c.failures_total.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP apigate_backend_healthy Backend health (1 = healthy)\n");
        out.push_str("# TYPE apigate_backend_healthy gauge\n");
        for (backend, healthy) in backend_health {
            out.push_str(&format!(
                "apigate_backend_healthy{{backend=\"{}\"}} {}\n",
                backend,
                if *healthy { 1 } else { 0 }
            ));
        }

        out.push_str(
            "# HELP apigate_circuit_breaker_state Breaker state (0 closed, 1 open, 2 half-open)\n",
        );
        out.push_str("# TYPE apigate_circuit_breaker_state gauge\n");
        for (backend, state) in breaker_states {
            let value = match state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            };
            out.push_str(&format!(
                "apigate_circuit_breaker_state{{backend=\"{}\"}} {}\n",
                backend, value
            ));
        }

        out
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for the in-flight gauge.
pub struct InFlightGuard {
    gauge: Arc<AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
