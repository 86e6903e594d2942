//! Health Checker
//!
//! One background worker per health-checked backend. Each worker probes
//! every endpoint of its backend immediately on start and then once per
//! interval, flips endpoint health in the pool when the consecutive-outcome
//! thresholds are met, and maintains the per-backend status record served
//! by the admin health endpoint.
//!
//! `stop()` returns only after every worker has exited; no probe runs after
//! it returns.

use crate::domain::entities::HealthCheckConfig;
use crate::infrastructure::endpoint_pool::EndpointPool;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Overall backend health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Last observed state of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated backend health: healthy iff at least one endpoint is.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend_id: String,
    pub status: HealthState,
    pub endpoints: Vec<EndpointHealth>,
}

impl BackendHealth {
    fn unknown(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            status: HealthState::Unknown,
            endpoints: Vec::new(),
        }
    }
}

/// One backend to watch.
pub struct HealthTarget {
    pub backend_id: String,
    pub config: HealthCheckConfig,
    pub endpoints: Vec<String>,
    pub pool: Arc<EndpointPool>,
}

/// Outcome of a single probe.
enum ProbeOutcome {
    Up { status: u16, elapsed: Duration },
    Down { error: String, status: Option<u16>, elapsed: Duration },
}

/// Background health checker bound to one configuration snapshot.
pub struct HealthChecker {
    statuses: Arc<DashMap<String, BackendHealth>>,
    shutdown: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl HealthChecker {
    /// Spawn one worker per target with an enabled policy. Targets with a
    /// disabled policy only get a registry entry.
    pub fn start(targets: Vec<HealthTarget>) -> Self {
        let statuses: Arc<DashMap<String, BackendHealth>> = Arc::new(DashMap::new());
        let (shutdown, _) = broadcast::channel(1);

        let client = reqwest::Client::new();
        let mut workers = Vec::new();

        for target in targets {
            statuses.insert(
                target.backend_id.clone(),
                BackendHealth::unknown(&target.backend_id),
            );
            if !target.config.enabled {
                continue;
            }

            tracing::info!(
                backend = %target.backend_id,
                interval_ms = target.config.interval_ms,
                path = %target.config.path,
                "starting health check worker"
            );

            let statuses = statuses.clone();
            let client = client.clone();
            let mut shutdown_rx = shutdown.subscribe();

            workers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(target.config.interval());
                // Per-endpoint consecutive-outcome bookkeeping. `None`
                // until the first sample, which sets the initial state
                // directly; thresholds gate subsequent flips.
                let mut trackers: HashMap<String, EndpointTracker> = target
                    .endpoints
                    .iter()
                    .map(|url| (url.clone(), EndpointTracker::default()))
                    .collect();

                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            sweep(&target, &client, &statuses, &mut trackers).await;
                        }
                    }
                }
                tracing::debug!(backend = %target.backend_id, "health check worker stopped");
            }));
        }

        Self {
            statuses,
            shutdown,
            workers,
        }
    }

    /// Health record for one backend.
    pub fn status(&self, backend_id: &str) -> Option<BackendHealth> {
        self.statuses.get(backend_id).map(|s| s.clone())
    }

    /// All backend health records.
    pub fn all_statuses(&self) -> Vec<BackendHealth> {
        self.statuses.iter().map(|s| s.clone()).collect()
    }

    /// Signal every worker and wait for them to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[derive(Default)]
struct EndpointTracker {
    /// None until the first sample.
    healthy: Option<bool>,
    consecutive_ok: u32,
    consecutive_fail: u32,
}

/// Probe every endpoint of the target once and apply the results.
async fn sweep(
    target: &HealthTarget,
    client: &reqwest::Client,
    statuses: &DashMap<String, BackendHealth>,
    trackers: &mut HashMap<String, EndpointTracker>,
) {
    let mut endpoint_reports = Vec::with_capacity(target.endpoints.len());

    for url in &target.endpoints {
        let outcome = probe(client, url, &target.config).await;
        let tracker = trackers.entry(url.clone()).or_default();

        let (up, elapsed, status_code, error) = match outcome {
            ProbeOutcome::Up { status, elapsed } => (true, elapsed, Some(status), None),
            ProbeOutcome::Down {
                error,
                status,
                elapsed,
            } => (false, elapsed, status, Some(error)),
        };

        if up {
            tracker.consecutive_ok += 1;
            tracker.consecutive_fail = 0;
        } else {
            tracker.consecutive_fail += 1;
            tracker.consecutive_ok = 0;
        }

        let flipped = apply_thresholds(tracker, up, &target.config);
        if let Some(new_state) = flipped {
            if new_state {
                target.pool.mark_healthy(url);
                tracing::info!(
                    backend = %target.backend_id,
                    endpoint = %url,
                    "endpoint is now healthy"
                );
            } else {
                target.pool.mark_unhealthy(url);
                tracing::warn!(
                    backend = %target.backend_id,
                    endpoint = %url,
                    error = error.as_deref().unwrap_or("unexpected status"),
                    "endpoint is now unhealthy"
                );
            }
        }

        endpoint_reports.push(EndpointHealth {
            url: url.clone(),
            healthy: tracker.healthy.unwrap_or(false),
            last_check: Utc::now(),
            response_time_ms: elapsed.as_millis() as u64,
            status_code,
            error,
        });
    }

    let any_healthy = endpoint_reports.iter().any(|ep| ep.healthy);
    statuses.insert(
        target.backend_id.clone(),
        BackendHealth {
            backend_id: target.backend_id.clone(),
            status: if any_healthy {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            endpoints: endpoint_reports,
        },
    );
}

/// Returns `Some(new_state)` when the tracker flipped.
///
/// The first sample sets the initial state unconditionally; after that a
/// flip requires the configured number of consecutive identical outcomes
/// (values <= 1 flip on the first differing sample).
fn apply_thresholds(
    tracker: &mut EndpointTracker,
    up: bool,
    config: &HealthCheckConfig,
) -> Option<bool> {
    match tracker.healthy {
        None => {
            tracker.healthy = Some(up);
            Some(up)
        }
        Some(current) if current == up => None,
        Some(_) => {
            let needed = if up {
                config.healthy_threshold.max(1)
            } else {
                config.unhealthy_threshold.max(1)
            };
            let streak = if up {
                tracker.consecutive_ok
            } else {
                tracker.consecutive_fail
            };
            if streak >= needed {
                tracker.healthy = Some(up);
                Some(up)
            } else {
                None
            }
        }
    }
}

async fn probe(client: &reqwest::Client, url: &str, config: &HealthCheckConfig) -> ProbeOutcome {
    let probe_url = format!("{}{}", url.trim_end_matches('/'), config.path);
    let start = Instant::now();

    match client
        .get(&probe_url)
        .timeout(config.timeout())
        .send()
        .await
    {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let elapsed = start.elapsed();
            if config.is_expected_status(status) {
                ProbeOutcome::Up { status, elapsed }
            } else {
                ProbeOutcome::Down {
                    error: format!("unexpected status: {}", status),
                    status: Some(status),
                    elapsed,
                }
            }
        }
        Err(e) => ProbeOutcome::Down {
            error: e.to_string(),
            status: None,
            elapsed: start.elapsed(),
        },
    }
}
