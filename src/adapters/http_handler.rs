use std::sync::Arc;

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::Response,
    routing::get,
};
use serde_json::{Map, Value, json};
use tower::ServiceBuilder;

use crate::{
    adapters::{
        docs,
        middleware::{
            CorsPolicy, cors_middleware, global_rate_limit_middleware, panic_boundary_middleware,
            request_context_middleware, security_headers_middleware,
        },
    },
    core::{GatewayService, context::RequestContext},
    envelope,
    error::GatewayError,
};

/// HTTP surface of the gateway: public endpoints plus the proxy fallback.
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    /// Build the application router with the full middleware stack.
    pub fn router(&self) -> Router {
        let gateway = self.gateway.clone();
        let cors = Arc::new(CorsPolicy::from_config(gateway.config()));

        let layers = ServiceBuilder::new()
            .layer(middleware::from_fn_with_state(
                gateway.clone(),
                request_context_middleware,
            ))
            .layer(middleware::from_fn(security_headers_middleware))
            .layer(middleware::from_fn_with_state(cors, cors_middleware))
            .layer(middleware::from_fn_with_state(
                gateway.clone(),
                global_rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                gateway.clone(),
                panic_boundary_middleware,
            ));

        Router::new()
            .route("/", get(gateway_info))
            .route("/health", get(health))
            .route("/api/metrics", get(metrics))
            .route("/api/docs", get(api_docs))
            .route("/api/postman-collection", get(postman_collection))
            .fallback(proxy)
            .method_not_allowed_fallback(proxy)
            .layer(layers)
            .with_state(gateway)
    }
}

async fn gateway_info(State(gateway): State<Arc<GatewayService>>) -> Response<AxumBody> {
    let registry = gateway.registry();
    let services: Map<String, Value> = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.get(name))
        .map(|service| {
            let base_url = gateway
                .routes()
                .public_prefix_for(&service.name)
                .map(str::to_string);
            (
                service.name.clone(),
                json!({
                    "name": service.display_name,
                    "status": "configured",
                    "baseUrl": base_url,
                }),
            )
        })
        .collect();

    envelope::ok(json!({
        "message": "Gatehouse API gateway is running",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": gateway.config().environment.to_string(),
        "services": services,
        "documentation": {
            "docs": "/api/docs",
            "postman": "/api/postman-collection",
            "metrics": "/api/metrics",
            "health": "/health",
        },
    }))
}

async fn health(State(gateway): State<Arc<GatewayService>>) -> Response<AxumBody> {
    let records = gateway.health().get_all().await;
    let all_healthy = records.iter().all(|r| r.is_healthy());

    let services: Map<String, Value> = records
        .into_iter()
        .map(|record| {
            (
                record.service_name.clone(),
                json!({
                    "status": record.status,
                    "url": record.url,
                    "lastCheck": record.last_checked_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "responseTimeMs": record.last_response_time_ms,
                    "error": record.last_error,
                }),
            )
        })
        .collect();

    let (status, label) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = envelope::envelope(
        all_healthy,
        json!({
            "status": label,
            "gateway": {
                "status": "healthy",
                "timestamp": envelope::timestamp(),
                "uptime": gateway.metrics().uptime().as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "services": services,
        }),
    );
    envelope::json_response(status, &body)
}

async fn metrics(State(gateway): State<Arc<GatewayService>>) -> Response<AxumBody> {
    let snapshot = gateway.metrics().snapshot();
    match serde_json::to_value(&snapshot) {
        Ok(data) => envelope::ok(json!({
            "message": "Gateway metrics",
            "data": data,
        })),
        Err(e) => GatewayError::Internal(format!("Failed to serialize metrics: {e}"))
            .into_response_with(None, gateway.pipeline().expose_detail()),
    }
}

async fn api_docs(
    State(gateway): State<Arc<GatewayService>>,
    headers: HeaderMap,
) -> Response<AxumBody> {
    let base = docs::base_url(&headers, &gateway.config().effective_listen_addr());
    envelope::ok(docs::api_docs(&gateway, &base))
}

async fn postman_collection(
    State(gateway): State<Arc<GatewayService>>,
    headers: HeaderMap,
) -> Response<AxumBody> {
    let base = docs::base_url(&headers, &gateway.config().effective_listen_addr());
    envelope::ok(docs::postman_collection(&gateway, &base))
}

/// Everything not served locally goes through the route table.
async fn proxy(State(gateway): State<Arc<GatewayService>>, req: Request) -> Response<AxumBody> {
    let ctx = match req.extensions().get::<RequestContext>() {
        Some(ctx) => ctx.clone(),
        None => RequestContext::new(req.method().clone(), req.uri().path(), None),
    };

    match gateway.routes().resolve(req.uri().path()) {
        Some(route) => {
            let route = route.clone();
            gateway.pipeline().handle(&route, ctx, req).await
        }
        None => gateway.pipeline().reject(
            &ctx,
            GatewayError::RouteNotFound {
                method: req.method().to_string(),
                path: req.uri().path().to_string(),
            },
        ),
    }
}
