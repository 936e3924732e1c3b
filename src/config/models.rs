//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to
//! `GATEWAY__*` environment variables. They are intentionally serde‑friendly and
//! include defaults so that a gateway can start with no file at all: the defaults
//! describe the stock two-service deployment (`usuarios`, `productos`).
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_body_limit_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Deployment environment. `Development` relaxes CORS for local front-ends and
/// exposes internal error detail in 500 responses.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
            Environment::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Log output format.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_service_timeout_ms() -> u64 {
    30_000
}

/// A backend service the gateway can forward to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Human readable name shown on the info endpoint
    #[serde(default)]
    pub display_name: Option<String>,
    /// Base URL, e.g. `http://localhost:8080`
    pub url: String,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    /// Upstream forward timeout in milliseconds
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,
}

impl ServiceConfig {
    pub fn new(display_name: &str, url: &str) -> Self {
        Self {
            display_name: Some(display_name.to_string()),
            url: url.to_string(),
            health_check_path: default_health_check_path(),
            timeout_ms: default_service_timeout_ms(),
        }
    }
}

/// Which stages a proxied route goes through.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Public authentication endpoints: auth rate limit, health gate, forward.
    AuthProxy,
    /// Token-protected service endpoints: verify token, api rate limit, health gate, forward.
    Protected,
}

/// Prefix replacement applied to the upstream path.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

/// A proxied route binding a path prefix to a service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
    pub kind: RouteKind,
    #[serde(default)]
    pub path_rewrite: Option<PathRewrite>,
}

impl RouteConfig {
    pub fn new(prefix: &str, service: &str, kind: RouteKind) -> Self {
        Self {
            prefix: prefix.to_string(),
            service: service.to_string(),
            kind,
            path_rewrite: None,
        }
    }
}

/// Fixed window limiter settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WindowLimitConfig {
    /// Window length, parsed by humantime, e.g. "15m", "60s"
    pub window: String,
    /// Maximum admitted requests per client per window
    pub max_requests: u32,
    pub message: String,
}

impl WindowLimitConfig {
    pub fn new(window: &str, max_requests: u32, message: &str) -> Self {
        Self {
            window: window.to_string(),
            max_requests,
            message: message.to_string(),
        }
    }

    /// Parse the configured window length.
    pub fn window_duration(&self) -> Result<Duration, String> {
        humantime::parse_duration(&self.window)
            .map_err(|e| format!("Invalid window '{window}': {e}", window = self.window))
    }
}

/// One limiter per traffic class.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub global: WindowLimitConfig,
    pub auth: WindowLimitConfig,
    pub api: WindowLimitConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            global: WindowLimitConfig::new("15m", 100, "Too many requests from this IP"),
            auth: WindowLimitConfig::new("15m", 10, "Too many authentication attempts"),
            api: WindowLimitConfig::new("1m", 50, "Too many API requests"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HealthCacheConfig {
    pub ttl_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for HealthCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}

impl HealthCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Overrides the port of `listen_addr` when set
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub environment: Environment,
    /// Token verification secret. There is deliberately no default.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub health_cache: HealthCacheConfig,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_services() -> BTreeMap<String, ServiceConfig> {
    let mut services = BTreeMap::new();
    services.insert(
        "usuarios".to_string(),
        ServiceConfig::new("Users Service", "http://localhost:8080"),
    );
    services.insert(
        "productos".to_string(),
        ServiceConfig::new("Products Service", "http://localhost:3001"),
    );
    services
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new("/api/auth", "usuarios", RouteKind::AuthProxy),
        RouteConfig::new("/api/usuarios", "usuarios", RouteKind::Protected),
        RouteConfig::new("/api/productos", "productos", RouteKind::Protected),
    ]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: None,
            environment: Environment::default(),
            jwt_secret: None,
            cors_origins: Vec::new(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            services: default_services(),
            routes: default_routes(),
            rate_limits: RateLimitsConfig::default(),
            health_cache: HealthCacheConfig::default(),
            body_limit_bytes: default_body_limit_bytes(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            otlp_endpoint: None,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// The configured secret, byte for byte. A blank value counts as absent.
    pub fn jwt_secret(&self) -> Option<&str> {
        self.jwt_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    /// Listen address with the `port` override applied.
    pub fn effective_listen_addr(&self) -> String {
        match self.port {
            Some(port) => {
                let host = self
                    .listen_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or("0.0.0.0");
                format!("{host}:{port}")
            }
            None => self.listen_addr.clone(),
        }
    }

    /// Allowed CORS origins, including local front-ends in development.
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self
            .cors_origins
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if self.environment.is_development() {
            for local in [
                "http://localhost:3000",
                "http://localhost:3001",
                "http://localhost:4200",
            ] {
                if !origins.iter().any(|o| o == local) {
                    origins.push(local.to_string());
                }
            }
        }
        origins
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Builder for GatewayConfig, mostly useful for tests and embedding.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt_secret = Some(secret.into());
        self
    }

    pub fn cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.cors_origins.push(origin.into());
        self
    }

    /// Replace (or add) a service definition
    pub fn service(mut self, name: impl Into<String>, service: ServiceConfig) -> Self {
        self.config.services.insert(name.into(), service);
        self
    }

    pub fn route(mut self, route: RouteConfig) -> Self {
        self.config.routes.push(route);
        self
    }

    pub fn rate_limits(mut self, rate_limits: RateLimitsConfig) -> Self {
        self.config.rate_limits = rate_limits;
        self
    }

    pub fn health_cache(mut self, health_cache: HealthCacheConfig) -> Self {
        self.config.health_cache = health_cache;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}
