//! Core gateway composition root.
//!
//! The `GatewayService` turns an immutable [`GatewayConfig`] into the runtime
//! objects that serve traffic: service registry and route table, the rate
//! limiter set, token verifier, health cache, metrics aggregator, forwarder
//! and the request pipeline tying them together. Shared mutable state lives
//! only in the limiters, the health cache and the metrics aggregator; each is
//! owned here and injected into the pipeline, so independent gateways can
//! coexist in one process.
use std::sync::Arc;

use eyre::{Result, WrapErr, eyre};

use crate::{
    config::GatewayConfig,
    core::{
        auth::TokenVerifier,
        forwarder::ProxyForwarder,
        health_cache::HealthCache,
        pipeline::RequestPipeline,
        rate_limiter::RateLimiters,
        registry::{RouteTable, ServiceRegistry},
    },
    metrics::MetricsAggregator,
    ports::http_client::HttpClient,
};

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    routes: Arc<RouteTable>,
    limiters: Arc<RateLimiters>,
    verifier: Arc<TokenVerifier>,
    health: Arc<HealthCache>,
    metrics: Arc<MetricsAggregator>,
    pipeline: Arc<RequestPipeline>,
}

impl GatewayService {
    /// Build every runtime component from `config`, forwarding through `client`.
    pub fn new(config: Arc<GatewayConfig>, client: Arc<dyn HttpClient>) -> Result<Self> {
        let registry = Arc::new(
            ServiceRegistry::from_config(&config).wrap_err("Failed to build service registry")?,
        );
        let routes = Arc::new(
            RouteTable::from_config(&config, &registry).wrap_err("Failed to build route table")?,
        );
        let limiters = Arc::new(
            RateLimiters::from_config(&config)
                .map_err(|e| eyre!("Failed to build rate limiters: {e}"))?,
        );
        let verifier = Arc::new(TokenVerifier::from_config(&config));
        if !verifier.is_configured() {
            tracing::error!(
                "JWT_SECRET is not configured: authenticated routes will answer 500 JWT_SECRET_NOT_CONFIGURED"
            );
        }

        let health = Arc::new(HealthCache::new(
            registry.clone(),
            client.clone(),
            config.health_cache.ttl(),
            config.health_cache.probe_timeout(),
        ));
        let metrics = Arc::new(MetricsAggregator::new());
        let forwarder = Arc::new(ProxyForwarder::new(registry.clone(), client));
        let pipeline = Arc::new(RequestPipeline::new(
            limiters.clone(),
            verifier.clone(),
            health.clone(),
            forwarder,
            metrics.clone(),
            config.body_limit_bytes,
            config.environment.is_development(),
        ));

        tracing::info!(
            "Gateway service ready: {} services, {} routes",
            registry.len(),
            routes.routes().len()
        );

        Ok(Self {
            config,
            registry,
            routes,
            limiters,
            verifier,
            health,
            metrics,
            pipeline,
        })
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn limiters(&self) -> &Arc<RateLimiters> {
        &self.limiters
    }

    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    pub fn health(&self) -> &Arc<HealthCache> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use http::{Request, Response, StatusCode};

    use super::*;
    use crate::{
        config::{RouteConfig, RouteKind},
        core::rate_limiter::LimiterClass,
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    struct NoUpstream;

    #[async_trait]
    impl HttpClient for NoUpstream {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::ConnectionError("no upstream".to_string()))
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Err(HttpClientError::ConnectionError("no upstream".to_string()))
        }
    }

    #[tokio::test]
    async fn test_builds_from_default_config() {
        let gateway =
            GatewayService::new(Arc::new(GatewayConfig::default()), Arc::new(NoUpstream)).unwrap();
        assert_eq!(gateway.registry().len(), 2);
        assert_eq!(gateway.routes().routes().len(), 3);
        assert!(!gateway.verifier().is_configured());
        assert!(
            gateway
                .limiters()
                .get(&LimiterClass::Api("usuarios".to_string()))
                .is_some()
        );
        assert_eq!(gateway.metrics().total_requests(), 0);
        assert_eq!(gateway.health().ttl(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_rejects_route_to_unknown_service() {
        let config = GatewayConfig::builder()
            .route(RouteConfig::new("/api/pedidos", "pedidos", RouteKind::Protected))
            .build();
        let result = GatewayService::new(Arc::new(config), Arc::new(NoUpstream));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_rate_window() {
        let mut config = GatewayConfig::default();
        config.rate_limits.global.window = "whenever".to_string();
        let result = GatewayService::new(Arc::new(config), Arc::new(NoUpstream));
        assert!(
            result
                .err()
                .unwrap()
                .to_string()
                .contains("rate limiters")
        );
    }
}
