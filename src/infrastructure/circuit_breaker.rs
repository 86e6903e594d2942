//! Circuit Breaker
//!
//! One breaker per backend, gating admission on the recent failure ratio.
//! The breaker knows nothing about endpoints; the pool already removes
//! unhealthy ones from rotation. It guards against the case where every
//! endpoint is failing in a way the health checks have not caught yet.
//!
//! Contract: `allow()` returns a token when the call is admitted;
//! `record(token, success)` reports the outcome. Each takes the per-breaker
//! lock exactly once, and no I/O happens under the lock.

use crate::domain::entities::CircuitBreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - admit everything
    Closed,
    /// Tripped - reject until the dwell expires
    Open,
    /// Trial - admit a bounded number of probes
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Admission token returned by `allow`.
///
/// The generation ties the token to the breaker state that admitted it, so
/// an outcome recorded after the state has moved on cannot corrupt the
/// half-open bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct BreakerToken {
    generation: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every state transition.
    generation: u64,
    /// Rolling-window counters (closed state).
    requests: u32,
    failures: u32,
    interval_start: Instant,
    /// Half-open bookkeeping.
    half_open_inflight: u32,
    consecutive_successes: u32,
    /// Earliest instant an open breaker admits a probe.
    next_attempt_at: Option<Instant>,
}

/// Point-in-time breaker statistics, exposed on the admin health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub requests: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
}

/// Per-backend circuit breaker.
pub struct CircuitBreaker {
    backend_id: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                requests: 0,
                failures: 0,
                interval_start: Instant::now(),
                half_open_inflight: 0,
                consecutive_successes: 0,
                next_attempt_at: None,
            }),
        }
    }

    /// Ask for admission. Returns a token when the call may proceed.
    pub fn allow(&self) -> Option<BreakerToken> {
        let mut s = self.state.lock();
        let now = Instant::now();

        match s.state {
            CircuitState::Closed => Some(BreakerToken {
                generation: s.generation,
            }),
            CircuitState::Open => {
                let due = s.next_attempt_at.map(|at| now >= at).unwrap_or(true);
                if !due {
                    return None;
                }
                // Dwell expired: move to half-open and admit this call as
                // the first probe.
                self.transition(&mut s, CircuitState::HalfOpen, "open dwell expired");
                s.half_open_inflight = 1;
                s.consecutive_successes = 0;
                Some(BreakerToken {
                    generation: s.generation,
                })
            }
            CircuitState::HalfOpen => {
                if s.half_open_inflight < self.config.max_requests {
                    s.half_open_inflight += 1;
                    Some(BreakerToken {
                        generation: s.generation,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Report the outcome of an admitted call.
    pub fn record(&self, token: BreakerToken, success: bool) {
        let mut s = self.state.lock();
        let now = Instant::now();

        // Rolling window for the interval counters.
        if now.duration_since(s.interval_start) > self.config.interval() {
            s.requests = 0;
            s.failures = 0;
            s.interval_start = now;
        }
        s.requests += 1;
        if !success {
            s.failures += 1;
        }

        match s.state {
            CircuitState::Closed => {
                if !success
                    && s.requests >= self.config.minimum_requests
                    && f64::from(s.failures) / f64::from(s.requests) >= self.config.failure_ratio
                {
                    self.transition(&mut s, CircuitState::Open, "failure ratio exceeded");
                    s.next_attempt_at = Some(now + self.config.timeout());
                    s.consecutive_successes = 0;
                }
            }
            CircuitState::HalfOpen => {
                if token.generation != s.generation {
                    // The probe that produced this outcome belongs to an
                    // earlier state; its slot no longer exists.
                    return;
                }
                s.half_open_inflight = s.half_open_inflight.saturating_sub(1);
                if success {
                    s.consecutive_successes += 1;
                    if s.consecutive_successes >= self.config.max_requests {
                        self.transition(&mut s, CircuitState::Closed, "recovered");
                        s.requests = 0;
                        s.failures = 0;
                        s.interval_start = now;
                        s.consecutive_successes = 0;
                        s.half_open_inflight = 0;
                        s.next_attempt_at = None;
                    }
                } else {
                    self.transition(&mut s, CircuitState::Open, "probe failed");
                    s.next_attempt_at = Some(now + self.config.timeout());
                    s.consecutive_successes = 0;
                    s.half_open_inflight = 0;
                }
            }
            // Open admits nothing, so a late record only feeds the
            // rolling counters above.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState, reason: &str) {
        let from = s.state;
        s.state = to;
        s.generation += 1;
        tracing::info!(
            backend = %self.backend_id,
            from = %from,
            to = %to,
            reason,
            "circuit breaker transition"
        );
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let s = self.state.lock();
        BreakerStats {
            state: s.state,
            requests: s.requests,
            failures: s.failures,
            consecutive_successes: s.consecutive_successes,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend_id", &self.backend_id)
            .field("state", &self.state.lock().state)
            .finish()
    }
}
