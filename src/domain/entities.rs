//! Domain Entities - Core configuration objects
//!
//! Routes, backends, endpoints and the policy records attached to them.
//! These types carry their own validation and defaulting; everything else
//! in the gateway consumes them read-only out of a configuration snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Validation failure for a configuration object.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A route binds a path pattern and method set to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Unique route identifier
    pub id: String,
    /// Path pattern: exact, or a prefix ending in `*`
    pub path: String,
    /// Allowed HTTP methods; `*` admits any method
    pub method: Vec<String>,
    /// Backend service ID this route forwards to
    pub backend: String,
    /// Hard deadline for the upstream exchange, in milliseconds
    #[serde(default = "RouteConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Higher priority wins when several routes match (0-1000)
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RouteConfig {
    fn default_timeout_ms() -> u64 {
        30_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Zero-valued fields mean "use the default".
    pub fn normalize(&mut self) {
        if self.timeout_ms == 0 {
            self.timeout_ms = Self::default_timeout_ms();
        }
        if let Some(rl) = &mut self.rate_limit {
            rl.normalize();
        }
    }

    /// Validate this route in isolation. Backend resolution is checked at
    /// the configuration level where all backend IDs are known.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::Required { field: "route id" });
        }
        if self.path.is_empty() {
            return Err(ValidationError::Required { field: "route path" });
        }
        if !self.path.starts_with('/') {
            return Err(ValidationError::invalid(
                "route path",
                format!("{} must start with '/'", self.path),
            ));
        }
        // Wildcards are trailing-star only; a '*' anywhere else is a
        // config error rather than a silently different match.
        if let Some(star) = self.path.find('*') {
            if star != self.path.len() - 1 {
                return Err(ValidationError::invalid(
                    "route path",
                    format!("{}: '*' is only allowed as the final character", self.path),
                ));
            }
        }
        if self.method.is_empty() {
            return Err(ValidationError::Required {
                field: "route method",
            });
        }
        for method in &self.method {
            if !is_valid_http_method(method) {
                return Err(ValidationError::invalid("route method", method.clone()));
            }
        }
        if self.backend.is_empty() {
            return Err(ValidationError::Required {
                field: "route backend",
            });
        }
        if self.timeout_ms == 0 || self.timeout_ms > 300_000 {
            return Err(ValidationError::invalid(
                "route timeout_ms",
                format!("{} must be within (0, 300000]", self.timeout_ms),
            ));
        }
        if self.priority > 1000 {
            return Err(ValidationError::invalid(
                "route priority",
                format!("{} exceeds 1000", self.priority),
            ));
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        Ok(())
    }

    /// Does the method set admit this request method?
    pub fn matches_method(&self, method: &str) -> bool {
        self.method.iter().any(|m| m == method || m == "*")
    }

    /// Does the path pattern match this request path?
    ///
    /// Exact match, or prefix-before-star followed by any suffix when the
    /// pattern ends in `*`.
    pub fn matches_path(&self, path: &str) -> bool {
        match self.path.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.path == path,
        }
    }
}

fn is_valid_http_method(method: &str) -> bool {
    matches!(
        method,
        "GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS" | "CONNECT" | "TRACE"
            | "*"
    )
}

/// A backend service: one or more interchangeable endpoints plus the
/// balancing, health-check, breaker and retry policies that govern them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendService {
    pub id: String,
    pub name: String,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BackendService {
    /// Zero-valued policy fields mean "use the default".
    pub fn normalize(&mut self) {
        self.health_check.normalize();
        self.circuit_breaker.normalize();
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::Required { field: "backend id" });
        }
        if self.name.is_empty() {
            return Err(ValidationError::Required {
                field: "backend name",
            });
        }
        if self.name.len() > 255 {
            return Err(ValidationError::invalid(
                "backend name",
                "exceeds 255 characters",
            ));
        }
        if self.endpoints.is_empty() {
            return Err(ValidationError::Required {
                field: "backend endpoints",
            });
        }
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        if self.load_balancer.sticky_session {
            tracing::warn!(
                backend = %self.id,
                "sticky_session is declared but not implemented; ignoring"
            );
        }
        self.health_check.validate()?;
        self.circuit_breaker.validate()?;
        self.retry_policy.validate()?;
        Ok(())
    }
}

/// A single upstream address inside a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Absolute http(s) URL
    pub url: String,
    /// Relative selection weight (1-100)
    #[serde(default = "EndpointConfig::default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<std::collections::HashMap<String, String>>,
}

impl EndpointConfig {
    fn default_weight() -> u32 {
        1
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::Required {
                field: "endpoint url",
            });
        }
        let parsed: reqwest::Url = self.url.parse().map_err(|e| {
            ValidationError::invalid("endpoint url", format!("{}: {}", self.url, e))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ValidationError::invalid(
                "endpoint url",
                format!("{} must use http or https", self.url),
            ));
        }
        if self.weight < 1 || self.weight > 100 {
            return Err(ValidationError::invalid(
                "endpoint weight",
                format!("{} must be within [1, 100]", self.weight),
            ));
        }
        Ok(())
    }
}

/// Endpoint selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerAlgorithm {
    #[default]
    RoundRobin,
    Weighted,
    LeastConn,
    Random,
}

impl std::fmt::Display for LoadBalancerAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancerAlgorithm::RoundRobin => write!(f, "round-robin"),
            LoadBalancerAlgorithm::Weighted => write!(f, "weighted"),
            LoadBalancerAlgorithm::LeastConn => write!(f, "least-conn"),
            LoadBalancerAlgorithm::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub algorithm: LoadBalancerAlgorithm,
    /// Declared in the schema but not consumed by the pool.
    #[serde(default)]
    pub sticky_session: bool,
}

/// Active health-check policy for a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Probe path appended to each endpoint URL
    #[serde(default = "HealthCheckConfig::default_path")]
    pub path: String,
    #[serde(default = "HealthCheckConfig::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "HealthCheckConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive successes before an endpoint flips healthy
    #[serde(default = "HealthCheckConfig::default_healthy_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive failures before an endpoint flips unhealthy
    #[serde(default = "HealthCheckConfig::default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "HealthCheckConfig::default_expected_status")]
    pub expected_status: Vec<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Self::default_path(),
            interval_ms: Self::default_interval_ms(),
            timeout_ms: Self::default_timeout_ms(),
            healthy_threshold: Self::default_healthy_threshold(),
            unhealthy_threshold: Self::default_unhealthy_threshold(),
            expected_status: Self::default_expected_status(),
        }
    }
}

impl HealthCheckConfig {
    fn default_path() -> String {
        "/health".to_string()
    }
    fn default_interval_ms() -> u64 {
        30_000
    }
    fn default_timeout_ms() -> u64 {
        5_000
    }
    fn default_healthy_threshold() -> u32 {
        2
    }
    fn default_unhealthy_threshold() -> u32 {
        3
    }
    fn default_expected_status() -> Vec<u16> {
        vec![200]
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_expected_status(&self, status: u16) -> bool {
        self.expected_status.contains(&status)
    }

    /// Zero or empty fields mean "use the default".
    pub fn normalize(&mut self) {
        if self.path.is_empty() {
            self.path = Self::default_path();
        }
        if self.interval_ms == 0 {
            self.interval_ms = Self::default_interval_ms();
        }
        if self.timeout_ms == 0 {
            self.timeout_ms = Self::default_timeout_ms();
        }
        if self.healthy_threshold == 0 {
            self.healthy_threshold = Self::default_healthy_threshold();
        }
        if self.unhealthy_threshold == 0 {
            self.unhealthy_threshold = Self::default_unhealthy_threshold();
        }
        if self.expected_status.is_empty() {
            self.expected_status = Self::default_expected_status();
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval_ms < 100 {
            return Err(ValidationError::invalid(
                "health_check interval_ms",
                format!("{} must be at least 100", self.interval_ms),
            ));
        }
        if self.timeout_ms == 0 || self.timeout_ms >= self.interval_ms {
            return Err(ValidationError::invalid(
                "health_check timeout_ms",
                format!(
                    "{} must be non-zero and strictly less than interval {}",
                    self.timeout_ms, self.interval_ms
                ),
            ));
        }
        for status in &self.expected_status {
            if *status < 100 || *status > 599 {
                return Err(ValidationError::invalid(
                    "health_check expected_status",
                    format!("{} is not a valid status code", status),
                ));
            }
        }
        Ok(())
    }
}

/// Circuit-breaker policy for a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Concurrent probes admitted in half-open
    #[serde(default = "CircuitBreakerConfig::default_max_requests")]
    pub max_requests: u32,
    /// Rolling window for the closed-state counters
    #[serde(default = "CircuitBreakerConfig::default_interval_ms")]
    pub interval_ms: u64,
    /// Dwell in open before the first probe is admitted
    #[serde(default = "CircuitBreakerConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "CircuitBreakerConfig::default_failure_ratio")]
    pub failure_ratio: f64,
    /// Request floor before the ratio may trip the breaker
    #[serde(default = "CircuitBreakerConfig::default_minimum_requests")]
    pub minimum_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: Self::default_max_requests(),
            interval_ms: Self::default_interval_ms(),
            timeout_ms: Self::default_timeout_ms(),
            failure_ratio: Self::default_failure_ratio(),
            minimum_requests: Self::default_minimum_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    fn default_max_requests() -> u32 {
        3
    }
    fn default_interval_ms() -> u64 {
        60_000
    }
    fn default_timeout_ms() -> u64 {
        30_000
    }
    fn default_failure_ratio() -> f64 {
        0.6
    }
    fn default_minimum_requests() -> u32 {
        3
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Zero-valued fields mean "use the default".
    pub fn normalize(&mut self) {
        if self.max_requests == 0 {
            self.max_requests = Self::default_max_requests();
        }
        if self.interval_ms == 0 {
            self.interval_ms = Self::default_interval_ms();
        }
        if self.timeout_ms == 0 {
            self.timeout_ms = Self::default_timeout_ms();
        }
        if self.failure_ratio == 0.0 {
            self.failure_ratio = Self::default_failure_ratio();
        }
        if self.minimum_requests == 0 {
            self.minimum_requests = Self::default_minimum_requests();
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_requests == 0 {
            return Err(ValidationError::invalid(
                "circuit_breaker max_requests",
                "must be at least 1",
            ));
        }
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            return Err(ValidationError::invalid(
                "circuit_breaker interval_ms/timeout_ms",
                "must be non-zero",
            ));
        }
        if self.failure_ratio <= 0.0 || self.failure_ratio > 1.0 {
            return Err(ValidationError::invalid(
                "circuit_breaker failure_ratio",
                format!("{} must be within (0, 1]", self.failure_ratio),
            ));
        }
        if self.minimum_requests == 0 {
            return Err(ValidationError::invalid(
                "circuit_breaker minimum_requests",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Retry backoff strategy. Declared shape only; the forwarder does not
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    Constant,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "RetryPolicyConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: RetryBackoff,
    #[serde(default = "RetryPolicyConfig::default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "RetryPolicyConfig::default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: Self::default_max_attempts(),
            backoff: RetryBackoff::default(),
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
        }
    }
}

impl RetryPolicyConfig {
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_initial_interval_ms() -> u64 {
        100
    }
    fn default_max_interval_ms() -> u64 {
        10_000
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_attempts < 1 || self.max_attempts > 10 {
            return Err(ValidationError::invalid(
                "retry_policy max_attempts",
                format!("{} must be within [1, 10]", self.max_attempts),
            ));
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Err(ValidationError::invalid(
                "retry_policy initial_interval_ms",
                "cannot exceed max_interval_ms",
            ));
        }
        Ok(())
    }
}

/// What a rate-limit bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RateLimitKey {
    #[serde(rename = "IP")]
    #[default]
    Ip,
    #[serde(rename = "API_KEY")]
    ApiKey,
    #[serde(rename = "USER_ID")]
    UserId,
    #[serde(rename = "GLOBAL")]
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPeriod {
    #[default]
    Second,
    Minute,
    Hour,
}

impl RateLimitPeriod {
    pub fn as_secs(&self) -> f64 {
        match self {
            RateLimitPeriod::Second => 1.0,
            RateLimitPeriod::Minute => 60.0,
            RateLimitPeriod::Hour => 3600.0,
        }
    }
}

/// Token-bucket rate-limit policy attached to a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Tokens granted per period
    pub rate: u32,
    #[serde(default)]
    pub period: RateLimitPeriod,
    /// Bucket capacity; 0 means "same as rate"
    #[serde(default)]
    pub burst_size: u32,
    #[serde(default)]
    pub key_type: RateLimitKey,
    /// Keys that bypass the limit entirely
    #[serde(default)]
    pub white_list: Vec<String>,
}

impl RateLimitConfig {
    /// Effective bucket capacity.
    pub fn capacity(&self) -> f64 {
        if self.burst_size == 0 {
            self.rate as f64
        } else {
            self.burst_size as f64
        }
    }

    /// Refill rate in tokens per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.rate as f64 / self.period.as_secs()
    }

    pub fn is_whitelisted(&self, key: &str) -> bool {
        self.white_list.iter().any(|wl| wl == key)
    }

    /// A zero burst size means "same as rate".
    pub fn normalize(&mut self) {
        if self.burst_size == 0 {
            self.burst_size = self.rate;
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.rate == 0 {
            return Err(ValidationError::invalid(
                "rate_limit rate",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Authentication scheme required by a route. Credential verification
/// against an identity provider is an external collaborator; the gateway
/// checks credential presence and shape only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
    ApiKey,
    Jwt,
    Oauth2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.auth_type == AuthType::None && self.required {
            return Err(ValidationError::invalid(
                "auth type",
                "'none' cannot be required",
            ));
        }
        Ok(())
    }
}
