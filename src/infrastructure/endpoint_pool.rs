//! Endpoint Pool & Load Balancer
//!
//! One pool per backend: the mutable runtime set of endpoints with health
//! flags plus the selection bookkeeping for the configured algorithm.
//!
//! Selection never returns an unhealthy endpoint. Health transitions come
//! exclusively from the health checker via `mark_healthy` / `mark_unhealthy`.
//! A least-connections pick is handed out as an `EndpointLease`; the active
//! count is released when the lease drops, whatever the exit path.

use crate::domain::entities::{EndpointConfig, LoadBalancerAlgorithm};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runtime view of a single endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
}

#[derive(Debug)]
struct PoolInner {
    endpoints: Vec<Endpoint>,
    /// Expanded index list for weighted selection: each healthy endpoint
    /// appears `weight` times. Rebuilt on every health transition.
    weighted: Vec<usize>,
}

impl PoolInner {
    fn rebuild_weighted(&mut self) {
        self.weighted.clear();
        for (i, ep) in self.endpoints.iter().enumerate() {
            if ep.healthy {
                for _ in 0..ep.weight {
                    self.weighted.push(i);
                }
            }
        }
    }
}

/// Active request counts for least-connections, keyed by endpoint URL.
/// Shared with the leases so a drop can release its slot after the pool
/// itself is gone.
type ActiveCounts = Arc<Mutex<HashMap<String, u32>>>;

/// Per-backend endpoint pool.
pub struct EndpointPool {
    algorithm: LoadBalancerAlgorithm,
    inner: RwLock<PoolInner>,
    active: ActiveCounts,
    /// Selection counter for round-robin / weighted / random. Reset with
    /// the pool, so fairness is scoped to a snapshot lifetime.
    counter: AtomicUsize,
}

impl EndpointPool {
    /// Build a pool from the configured endpoints.
    ///
    /// `initially_healthy` is true for backends without an active health
    /// check (nothing would ever mark them up); health-checked backends
    /// start down until the first probe sweep.
    pub fn new(
        endpoints: &[EndpointConfig],
        algorithm: LoadBalancerAlgorithm,
        initially_healthy: bool,
    ) -> Arc<Self> {
        let endpoints: Vec<Endpoint> = endpoints
            .iter()
            .map(|ep| Endpoint {
                url: ep.url.clone(),
                weight: ep.weight,
                healthy: initially_healthy,
            })
            .collect();

        let active: HashMap<String, u32> =
            endpoints.iter().map(|ep| (ep.url.clone(), 0)).collect();

        let mut inner = PoolInner {
            endpoints,
            weighted: Vec::new(),
        };
        inner.rebuild_weighted();

        Arc::new(Self {
            algorithm,
            inner: RwLock::new(inner),
            active: Arc::new(Mutex::new(active)),
            counter: AtomicUsize::new(0),
        })
    }

    pub fn algorithm(&self) -> LoadBalancerAlgorithm {
        self.algorithm
    }

    /// Pick one healthy endpoint, or None when the pool has none.
    pub fn next(&self) -> Option<EndpointLease> {
        match self.algorithm {
            LoadBalancerAlgorithm::RoundRobin | LoadBalancerAlgorithm::Random => {
                // Same counter walk; random's contract is uniformity over
                // the healthy subset, which the rotating counter satisfies.
                let inner = self.inner.read();
                let healthy: Vec<&Endpoint> =
                    inner.endpoints.iter().filter(|ep| ep.healthy).collect();
                if healthy.is_empty() {
                    return None;
                }
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Some(EndpointLease::uncounted(healthy[index].url.clone()))
            }
            LoadBalancerAlgorithm::Weighted => {
                let inner = self.inner.read();
                if inner.weighted.is_empty() {
                    return None;
                }
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % inner.weighted.len();
                let endpoint = &inner.endpoints[inner.weighted[index]];
                Some(EndpointLease::uncounted(endpoint.url.clone()))
            }
            LoadBalancerAlgorithm::LeastConn => {
                let inner = self.inner.read();
                // The count map stays locked across scan and increment so
                // concurrent selections observe each other.
                let mut active = self.active.lock();
                let mut selected: Option<(String, u32)> = None;
                for ep in inner.endpoints.iter().filter(|ep| ep.healthy) {
                    let count = active.get(&ep.url).copied().unwrap_or(0);
                    match &selected {
                        Some((_, min)) if count >= *min => {}
                        _ => selected = Some((ep.url.clone(), count)),
                    }
                }
                let (url, _) = selected?;
                *active.entry(url.clone()).or_insert(0) += 1;
                Some(EndpointLease::counted(self.active.clone(), url))
            }
        }
    }

    /// Mark an endpoint healthy. No-op for unknown URLs.
    pub fn mark_healthy(&self, url: &str) {
        self.set_health(url, true);
    }

    /// Mark an endpoint unhealthy. No-op for unknown URLs.
    pub fn mark_unhealthy(&self, url: &str) {
        self.set_health(url, false);
    }

    fn set_health(&self, url: &str, healthy: bool) {
        let mut inner = self.inner.write();
        let mut changed = false;
        for ep in inner.endpoints.iter_mut() {
            if ep.url == url && ep.healthy != healthy {
                ep.healthy = healthy;
                changed = true;
                break;
            }
        }
        if changed {
            inner.rebuild_weighted();
        }
    }

    /// Snapshot of the endpoint states.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.read().endpoints.clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.inner.read().endpoints.iter().filter(|ep| ep.healthy).count()
    }

    /// True when at least one endpoint is healthy.
    pub fn has_healthy(&self) -> bool {
        self.inner.read().endpoints.iter().any(|ep| ep.healthy)
    }

    /// Current least-connections count for an endpoint.
    pub fn active_count(&self, url: &str) -> u32 {
        self.active.lock().get(url).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("algorithm", &self.algorithm)
            .field("endpoints", &self.inner.read().endpoints)
            .finish()
    }
}

/// A selected endpoint.
///
/// For least-connections pools the lease holds the slot; dropping it
/// releases the active count on every exit path - success, error, timeout,
/// panic unwind, client disconnect.
pub struct EndpointLease {
    active: Option<ActiveCounts>,
    url: String,
}

impl EndpointLease {
    fn uncounted(url: String) -> Self {
        Self { active: None, url }
    }

    fn counted(active: ActiveCounts, url: String) -> Self {
        Self {
            active: Some(active),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some(count) = active.lock().get_mut(&self.url) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl std::fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointLease")
            .field("url", &self.url)
            .field("counted", &self.active.is_some())
            .finish()
    }
}
