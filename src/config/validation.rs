#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{GatewayConfig, RouteConfig, ServiceConfig, WindowLimitConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.effective_listen_addr()) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }
        for (name, service) in &config.services {
            if let Err(mut service_errors) = Self::validate_service(name, service) {
                errors.append(&mut service_errors);
            }
        }

        for route in &config.routes {
            if let Err(mut route_errors) = Self::validate_route(config, route) {
                errors.append(&mut route_errors);
            }
        }

        if let Err(conflicts) = Self::check_route_conflicts(&config.routes) {
            errors.extend(conflicts);
        }

        for (class, limit) in [
            ("global", &config.rate_limits.global),
            ("auth", &config.rate_limits.auth),
            ("api", &config.rate_limits.api),
        ] {
            if let Err(e) = Self::validate_window_limit(class, limit) {
                errors.push(e);
            }
        }

        if config.health_cache.ttl_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_cache.ttl_secs".to_string(),
                message: "Health cache TTL must be greater than 0".to_string(),
            });
        }
        if config.health_cache.probe_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_cache.probe_timeout_secs".to_string(),
                message: "Health probe timeout must be greater than 0".to_string(),
            });
        }

        if config.body_limit_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "body_limit_bytes".to_string(),
                message: "Body limit must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Problems that do not stop the gateway from starting but leave part of
    /// it unusable.
    pub fn warnings(config: &GatewayConfig) -> Vec<String> {
        let mut warnings = Vec::new();

        let has_protected_routes = config
            .routes
            .iter()
            .any(|r| r.kind == crate::config::RouteKind::Protected);
        if config.jwt_secret().is_none() {
            warnings.push(if has_protected_routes {
                "JWT_SECRET is not configured: every authenticated route will answer 500 JWT_SECRET_NOT_CONFIGURED".to_string()
            } else {
                "JWT_SECRET is not configured".to_string()
            });
        }

        for name in config.services.keys() {
            if !config.routes.iter().any(|r| &r.service == name) {
                warnings.push(format!("Service '{name}' is not bound to any route"));
            }
        }

        warnings
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_url(&service.url, &format!("service '{name}' url")) {
            errors.push(e);
        }

        if !service.health_check_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{name}' health_check_path"),
                message: "Health check paths must start with '/'".to_string(),
            });
        }

        if service.timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{name}' timeout_ms"),
                message: "Service timeout must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a single route configuration
    fn validate_route(
        config: &GatewayConfig,
        route: &RouteConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let prefix = &route.prefix;

        if !prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route prefix: {prefix}"),
                message: "Route prefixes must start with '/'".to_string(),
            });
        }

        if prefix.len() > 1 && prefix.ends_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route prefix: {prefix}"),
                message: "Route prefixes must not end with '/'".to_string(),
            });
        }

        if !config.services.contains_key(&route.service) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{prefix}' service"),
                message: format!("Service '{}' is not defined", route.service),
            });
        }

        if let Some(rewrite) = &route.path_rewrite {
            if !rewrite.from.starts_with('/') || !rewrite.to.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{prefix}' path_rewrite"),
                    message: "Both 'from' and 'to' must start with '/'".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate a limiter class definition
    fn validate_window_limit(class: &str, limit: &WindowLimitConfig) -> ValidationResult<()> {
        if limit.max_requests == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("rate_limits.{class}.max_requests"),
                message: "Rate limit max_requests must be greater than 0".to_string(),
            });
        }

        match limit.window_duration() {
            Ok(window) if window.is_zero() => Err(ValidationError::InvalidField {
                field: format!("rate_limits.{class}.window"),
                message: "Window must be longer than zero".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(message) => Err(ValidationError::InvalidField {
                field: format!("rate_limits.{class}.window"),
                message,
            }),
        }
    }

    /// Check for duplicated route prefixes
    fn check_route_conflicts(routes: &[RouteConfig]) -> Result<(), Vec<ValidationError>> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();

        for route in routes {
            if !seen.insert(route.prefix.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Prefix '{}' is declared more than once", route.prefix),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} configuration errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{RouteKind, ServiceConfig};

    #[test]
    fn test_default_config_is_valid() {
        assert!(GatewayConfigValidator::validate(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = GatewayConfig::builder().listen_addr("nowhere").build();
        let result = GatewayConfigValidator::validate(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("listen address"));
    }

    #[test]
    fn test_invalid_service_url() {
        let config = GatewayConfig::builder()
            .service("usuarios", ServiceConfig::new("Users", "ftp://users"))
            .build();
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    fn test_route_to_unknown_service() {
        let config = GatewayConfig::builder()
            .route(RouteConfig::new("/api/pedidos", "pedidos", RouteKind::Protected))
            .build();
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("pedidos"));
    }

    #[test]
    fn test_duplicate_prefix() {
        let config = GatewayConfig::builder()
            .route(RouteConfig::new("/api/auth", "usuarios", RouteKind::Protected))
            .build();
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_zero_limit_and_bad_window() {
        let mut config = GatewayConfig::default();
        config.rate_limits.auth.max_requests = 0;
        config.rate_limits.api.window = "soon".to_string();
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("rate_limits.auth.max_requests"));
        assert!(text.contains("rate_limits.api.window"));
    }

    #[test]
    fn test_missing_secret_is_a_warning_not_an_error() {
        let config = GatewayConfig::default();
        assert!(GatewayConfigValidator::validate(&config).is_ok());
        let warnings = GatewayConfigValidator::warnings(&config);
        assert!(warnings.iter().any(|w| w.contains("JWT_SECRET")));

        let configured = GatewayConfig::builder().jwt_secret("k").build();
        assert!(GatewayConfigValidator::warnings(&configured).is_empty());
    }
}
