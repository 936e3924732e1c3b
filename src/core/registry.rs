//! Service registry and route table.
//!
//! Both are built once from configuration and are read-only afterwards.
use std::{collections::HashMap, fmt, time::Duration};

use thiserror::Error;
use url::Url;

use crate::config::{GatewayConfig, PathRewrite, RouteConfig, RouteKind, ServiceConfig};

/// Errors raised while building the registry
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Invalid base URL for service '{service}': {reason}")]
    InvalidUrl { service: String, reason: String },

    #[error("Route '{prefix}' references unknown service '{service}'")]
    UnknownService { prefix: String, service: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A registered upstream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub display_name: String,
    pub base_url: Url,
    pub health_check_path: String,
    pub timeout: Duration,
}

impl ServiceDescriptor {
    pub fn from_config(name: &str, config: &ServiceConfig) -> RegistryResult<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| RegistryError::InvalidUrl {
            service: name.to_string(),
            reason: e.to_string(),
        })?;

        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            return Err(RegistryError::InvalidUrl {
                service: name.to_string(),
                reason: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }

        Ok(Self {
            name: name.to_string(),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            base_url,
            health_check_path: config.health_check_path.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// Base URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// `baseUrl + healthCheckPath`
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base(), self.health_check_path)
    }

    /// Absolute upstream URL for a path (and optional query).
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base(), path_and_query)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.base())
    }
}

/// Name → descriptor lookup.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn from_config(config: &GatewayConfig) -> RegistryResult<Self> {
        let mut services = HashMap::with_capacity(config.services.len());
        for (name, service) in &config.services {
            services.insert(name.clone(), ServiceDescriptor::from_config(name, service)?);
        }
        Ok(Self { services })
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Service names in a stable (sorted) order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// A resolved proxied route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub service: String,
    pub kind: RouteKind,
    pub path_rewrite: Option<PathRewrite>,
}

impl Route {
    fn from_config(config: &RouteConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            service: config.service.clone(),
            kind: config.kind,
            path_rewrite: config.path_rewrite.clone(),
        }
    }

    /// Whether `path` falls under this route's prefix on a segment boundary.
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }

    /// Apply the configured prefix rewrite to the upstream path.
    pub fn rewrite_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        match &self.path_rewrite {
            Some(rewrite) => match path.strip_prefix(rewrite.from.as_str()) {
                Some(rest) => std::borrow::Cow::Owned(format!("{}{}", rewrite.to, rest)),
                None => std::borrow::Cow::Borrowed(path),
            },
            None => std::borrow::Cow::Borrowed(path),
        }
    }
}

/// Longest-prefix route resolution.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    /// Sorted by prefix length, longest first
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(config: &GatewayConfig, registry: &ServiceRegistry) -> RegistryResult<Self> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            if !registry.contains(&route.service) {
                return Err(RegistryError::UnknownService {
                    prefix: route.prefix.clone(),
                    service: route.service.clone(),
                });
            }
            routes.push(Route::from_config(route));
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes })
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Shortest prefix bound to a service
    pub fn public_prefix_for(&self, service: &str) -> Option<&str> {
        self.routes
            .iter()
            .filter(|route| route.service == service)
            .min_by_key(|route| route.prefix.len())
            .map(|route| route.prefix.as_str())
    }
}
