//! Gateway Configuration
//!
//! The full configuration record: listener parameters, admin and metrics
//! surfaces, ordered backends and ordered routes. Loaded from a JSON file
//! with environment overrides; the YAML front-end (when deployed behind
//! one) hands the gateway this same validated record.

use crate::domain::entities::{BackendService, RouteConfig, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading / validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Conflict(String),
}

fn default_true() -> bool {
    true
}

/// Main listener parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "RouterConfig::default_port")]
    pub port: u16,
    #[serde(default = "RouterConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "RouterConfig::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "RouterConfig::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
        }
    }
}

impl RouterConfig {
    fn default_port() -> u16 {
        8080
    }
    fn default_read_timeout_ms() -> u64 {
        30_000
    }
    fn default_write_timeout_ms() -> u64 {
        30_000
    }
    fn default_idle_timeout_ms() -> u64 {
        120_000
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Admin API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "AdminConfig::default_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            port: Self::default_port(),
        }
    }
}

impl AdminConfig {
    fn default_port() -> u16 {
        8081
    }
}

/// Prometheus exposition surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "MetricsConfig::default_path")]
    pub path: String,
    #[serde(default = "MetricsConfig::default_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Self::default_path(),
            port: Self::default_port(),
        }
    }
}

impl MetricsConfig {
    fn default_path() -> String {
        "/metrics".to_string()
    }
    fn default_port() -> u16 {
        9090
    }
}

/// Structured-logging parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
    fn default_format() -> String {
        "json".to_string()
    }
}

/// The complete gateway configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backends: Vec<BackendService>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Config {
    /// Load a configuration file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Map zero-valued fields to their documented defaults, the same way
    /// an omitted field gets them.
    pub fn normalize(&mut self) {
        for backend in &mut self.backends {
            backend.normalize();
        }
        for route in &mut self.routes {
            route.normalize();
        }
    }

    /// Environment wins over the file for operational knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("APIGATE_PORT") {
            if let Ok(port) = port.parse() {
                self.router.port = port;
            }
        }
        if let Ok(api_key) = std::env::var("ADMIN_API_KEY") {
            self.admin.api_key = api_key;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the whole record: every object in isolation, uniqueness of
    /// ids, route-to-backend resolution, and port disjointness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin.enabled {
            if self.admin.api_key.is_empty() {
                return Err(ConfigError::Conflict(
                    "admin api_key is required when admin is enabled".to_string(),
                ));
            }
            if self.admin.port == self.router.port {
                return Err(ConfigError::Conflict(
                    "admin port cannot equal router port".to_string(),
                ));
            }
        }
        if self.metrics.enabled
            && (self.metrics.port == self.router.port
                || (self.admin.enabled && self.metrics.port == self.admin.port))
        {
            return Err(ConfigError::Conflict(
                "metrics port must differ from router and admin ports".to_string(),
            ));
        }

        let mut backend_ids = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !backend_ids.insert(backend.id.as_str()) {
                return Err(ConfigError::Conflict(format!(
                    "duplicate backend ID: {}",
                    backend.id
                )));
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !route_ids.insert(route.id.as_str()) {
                return Err(ConfigError::Conflict(format!(
                    "duplicate route ID: {}",
                    route.id
                )));
            }
            if !backend_ids.contains(route.backend.as_str()) {
                return Err(ConfigError::Conflict(format!(
                    "route {} references non-existent backend: {}",
                    route.id, route.backend
                )));
            }
        }

        Ok(())
    }

    pub fn backend(&self, id: &str) -> Option<&BackendService> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn route(&self, id: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.id == id)
    }
}

/// Config file path: `APIGATE_CONFIG` or `./apigate.json`.
pub fn config_path() -> String {
    std::env::var("APIGATE_CONFIG").unwrap_or_else(|_| "apigate.json".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::EndpointConfig;

    fn backend(id: &str) -> BackendService {
        BackendService {
            id: id.to_string(),
            name: id.to_uppercase(),
            endpoints: vec![EndpointConfig {
                url: "http://upstream:9000".to_string(),
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
        }
    }

    fn route(id: &str, backend: &str) -> RouteConfig {
        RouteConfig {
            id: id.to_string(),
            path: format!("/{}/*", id),
            method: vec!["GET".to_string()],
            backend: backend.to_string(),
            timeout_ms: 30_000,
            priority: 0,
            enabled: true,
            rate_limit: None,
            auth: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            backends: vec![backend("api")],
            routes: vec![route("r1", "api")],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.router.port, 8080);
        assert_eq!(config.admin.port, 8081);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.path, "/metrics");
        assert_eq!(config.metrics.port, 9090);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_duplicate_backend_id_rejected() {
        let mut config = valid_config();
        config.backends.push(backend("api"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_route_id_rejected() {
        let mut config = valid_config();
        config.routes.push(route("r1", "api"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_route_to_missing_backend_rejected() {
        let mut config = valid_config();
        config.routes.push(route("r2", "ghost"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("non-existent backend"));
    }

    #[test]
    fn test_admin_requires_api_key() {
        let mut config = valid_config();
        config.admin.enabled = true;
        assert!(config.validate().is_err());

        config.admin.api_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_conflicts_rejected() {
        let mut config = valid_config();
        config.admin.enabled = true;
        config.admin.api_key = "secret".to_string();
        config.admin.port = config.router.port;
        assert!(config.validate().is_err());

        config.admin.port = 8081;
        config.metrics.port = 8081;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_port_may_collide_when_disabled() {
        let mut config = valid_config();
        config.metrics.enabled = false;
        config.metrics.port = config.router.port;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_helpers() {
        let config = valid_config();
        assert!(config.backend("api").is_some());
        assert!(config.backend("ghost").is_none());
        assert!(config.route("r1").is_some());
        assert!(config.route("ghost").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("apigate-cfg-{}.json", std::process::id()));
        let json = serde_json::json!({
            "router": {"port": 18080},
            "backends": [{
                "id": "api",
                "name": "API",
                "endpoints": [{"url": "http://upstream:9000"}]
            }],
            "routes": [{
                "id": "r1",
                "path": "/api/v1/*",
                "method": ["GET", "POST"],
                "backend": "api"
            }]
        });
        std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.router.port, 18080);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.routes[0].timeout_ms, 30_000);
        assert_eq!(config.backends[0].endpoints[0].weight, 1);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Config::load("/nonexistent/apigate.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_invalid_json_errors() {
        let path = std::env::temp_dir().join(format!("apigate-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_rejects_invalid_record() {
        let path = std::env::temp_dir().join(format!("apigate-inv-{}.json", std::process::id()));
        let json = serde_json::json!({
            "routes": [{
                "id": "r1",
                "path": "/api/*",
                "method": ["GET"],
                "backend": "missing"
            }]
        });
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
        assert!(Config::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
