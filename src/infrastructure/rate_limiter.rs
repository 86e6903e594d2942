//! Rate Limiter
//!
//! Token-bucket admission keyed by a policy-derived client identifier.
//! Buckets hold real-valued tokens and refill continuously; they are
//! created lazily on a key's first request and evicted after an hour of
//! inactivity by a sweep that runs at most once per hour, piggybacked on
//! the admission path.

use crate::domain::entities::{RateLimitConfig, RateLimitKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// A single token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Refill for elapsed time, then try to take one token. A denial does
    /// not consume anything.
    fn try_take(&mut self, capacity: f64, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket rate limiter for one route policy.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Mutex<TokenBucket>>,
    /// Next instant the idle-bucket sweep may run.
    sweep_after: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            sweep_after: Mutex::new(Instant::now() + SWEEP_INTERVAL),
        }
    }

    /// Check whether a request for this key is admitted.
    pub fn allow(&self, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        if self.config.is_whitelisted(key) {
            return true;
        }

        self.maybe_sweep();

        let capacity = self.config.capacity();
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity)));
        let allowed = bucket
            .lock()
            .try_take(capacity, self.config.refill_per_sec());
        drop(bucket);

        if !allowed {
            tracing::debug!(key, "rate limit exceeded");
        }
        allowed
    }

    /// Remaining tokens for a key, rounded down. Unknown keys report the
    /// full capacity.
    pub fn remaining(&self, key: &str) -> u64 {
        self.buckets
            .get(key)
            .map(|b| b.lock().tokens.floor() as u64)
            .unwrap_or_else(|| self.config.capacity() as u64)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Evict buckets idle for over an hour, at most once per hour.
    fn maybe_sweep(&self) {
        {
            let mut sweep_after = self.sweep_after.lock();
            if Instant::now() < *sweep_after {
                return;
            }
            *sweep_after = Instant::now() + SWEEP_INTERVAL;
        }

        let before = self.buckets.len();
        let cutoff = Instant::now() - BUCKET_IDLE_EVICTION;
        self.buckets
            .retain(|_, bucket| bucket.lock().last_refill >= cutoff);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, "rate limiter swept idle buckets");
        }
    }

    #[cfg(test)]
    fn force_sweep(&self, idle_for: Duration) {
        let cutoff = Instant::now() - idle_for;
        self.buckets
            .retain(|_, bucket| bucket.lock().last_refill >= cutoff);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

/// Derive the bucket key for a request according to the policy.
///
/// `IP`: first `X-Forwarded-For` element, then `X-Real-IP`, then the socket
/// peer. `API_KEY`: the `X-API-Key` header. `USER_ID`: the authenticated
/// principal when one is present, else the IP derivation. `GLOBAL`: one
/// shared bucket.
pub fn derive_key(
    key_type: RateLimitKey,
    headers: &axum::http::HeaderMap,
    peer: Option<SocketAddr>,
    principal: Option<&str>,
) -> String {
    match key_type {
        RateLimitKey::Ip => client_ip(headers, peer),
        RateLimitKey::ApiKey => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
        RateLimitKey::UserId => match principal {
            Some(principal) if !principal.is_empty() => principal.to_string(),
            _ => client_ip(headers, peer),
        },
        RateLimitKey::Global => "global".to_string(),
    }
}

/// Best-effort client IP: X-Forwarded-For (first element), X-Real-IP, then
/// the socket peer address.
pub fn client_ip(headers: &axum::http::HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.is_empty() {
            return xri.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::RateLimitPeriod;
    use axum::http::HeaderMap;

    fn limiter(rate: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            rate,
            period: RateLimitPeriod::Second,
            burst_size: burst,
            key_type: RateLimitKey::Ip,
            white_list: vec![],
        })
    }

    #[test]
    fn test_allows_initial_burst_then_denies() {
        let limiter = limiter(1, 5);

        for _ in 0..5 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn test_denial_does_not_consume_tokens() {
        let limiter = limiter(1, 2);

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        assert!(!limiter.allow("k"));
        // Still roughly zero, not negative.
        assert_eq!(limiter.remaining("k"), 0);
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = limiter(1, 1);

        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_disabled_policy_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            rate: 1,
            period: RateLimitPeriod::Second,
            burst_size: 1,
            key_type: RateLimitKey::Ip,
            white_list: vec![],
        });
        for _ in 0..100 {
            assert!(limiter.allow("k"));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_whitelist_bypasses_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            rate: 1,
            period: RateLimitPeriod::Second,
            burst_size: 1,
            key_type: RateLimitKey::Ip,
            white_list: vec!["10.0.0.1".to_string()],
        });
        for _ in 0..10 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let limiter = limiter(100, 2);

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::sleep(Duration::from_millis(50)).await;

        // 100/s refill: ~5 tokens accrued, capped at burst 2.
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_admission_bounded_by_capacity_plus_refill() {
        let limiter = limiter(10, 10);

        let mut admitted = 0;
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(100) {
            if limiter.allow("k") {
                admitted += 1;
            }
        }
        // capacity + dt * rate, with slack for timer jitter.
        assert!(admitted <= 13, "admitted {} requests", admitted);
    }

    #[test]
    fn test_sweep_evicts_idle_buckets() {
        let limiter = limiter(1, 1);
        limiter.allow("a");
        limiter.allow("b");
        assert_eq!(limiter.bucket_count(), 2);

        std::thread::sleep(Duration::from_millis(10));
        limiter.force_sweep(Duration::from_millis(1));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_active_buckets() {
        let limiter = limiter(1, 1);
        limiter.allow("a");
        limiter.force_sweep(Duration::from_secs(60));
        assert_eq!(limiter.bucket_count(), 1);
    }

    // ===== Key Derivation =====

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.7:4711".parse().unwrap())
    }

    #[test]
    fn test_derive_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        let key = derive_key(RateLimitKey::Ip, &headers, peer(), None);
        assert_eq!(key, "203.0.113.9");
    }

    #[test]
    fn test_derive_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        let key = derive_key(RateLimitKey::Ip, &headers, peer(), None);
        assert_eq!(key, "198.51.100.2");
    }

    #[test]
    fn test_derive_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let key = derive_key(RateLimitKey::Ip, &headers, peer(), None);
        assert_eq!(key, "192.0.2.7");
    }

    #[test]
    fn test_derive_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret-123".parse().unwrap());
        let key = derive_key(RateLimitKey::ApiKey, &headers, peer(), None);
        assert_eq!(key, "secret-123");
    }

    #[test]
    fn test_derive_user_id_uses_principal() {
        let headers = HeaderMap::new();
        let key = derive_key(RateLimitKey::UserId, &headers, peer(), Some("user-9"));
        assert_eq!(key, "user-9");
    }

    #[test]
    fn test_derive_user_id_without_principal_uses_ip() {
        let headers = HeaderMap::new();
        let key = derive_key(RateLimitKey::UserId, &headers, peer(), None);
        assert_eq!(key, "192.0.2.7");
    }

    #[test]
    fn test_derive_global_shares_one_key() {
        let headers = HeaderMap::new();
        assert_eq!(
            derive_key(RateLimitKey::Global, &headers, peer(), None),
            derive_key(RateLimitKey::Global, &headers, None, Some("u"))
        );
    }

    #[test]
    fn test_concurrent_admission() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(limiter(1, 100));
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    if limiter.allow("shared") {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // 400 attempts against a burst of 100 with negligible refill.
        let total = admitted.load(Ordering::Relaxed);
        assert!(total >= 100 && total <= 101, "admitted {}", total);
    }
}
