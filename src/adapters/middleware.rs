//! Cross-cutting Axum middleware.
//!
//! Layers, outermost first:
//! 1. [`request_context_middleware`]: request id, access log, metrics,
//!    `X-Request-ID` / `X-Gateway` / `X-Response-Time`
//! 2. [`security_headers_middleware`]
//! 3. [`cors_middleware`]
//! 4. [`global_rate_limit_middleware`] on `/api/` paths
//! 5. [`panic_boundary_middleware`]
use std::{any::Any, net::SocketAddr, panic::AssertUnwindSafe, sync::Arc};

use axum::{
    body::Body as AxumBody,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::Response,
};
use futures_util::FutureExt;
use tracing::Instrument;

use crate::{
    config::GatewayConfig,
    core::{
        GatewayService,
        auth::AuthenticatedUser,
        context::RequestContext,
        forwarder::{GATEWAY_IDENT, X_GATEWAY, X_REQUEST_ID},
        rate_limiter::LimiterClass,
    },
    error::GatewayError,
    tracing_setup::create_request_span,
};

pub const X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");

const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS";
const ALLOWED_HEADERS: &str =
    "Origin, X-Requested-With, Content-Type, Accept, Authorization, X-Request-ID";
const EXPOSED_HEADERS: &str = "X-Request-ID, X-Gateway, X-Response-Time";
const PREFLIGHT_MAX_AGE: &str = "86400";

/// Create the [`RequestContext`], run the request inside its span, then stamp
/// gateway headers and report the outcome to the pipeline.
pub async fn request_context_middleware(
    State(gateway): State<Arc<GatewayService>>,
    mut req: Request,
    next: Next,
) -> Response {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let mut ctx = RequestContext::new(req.method().clone(), req.uri().path(), client_ip);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let span = create_request_span(ctx.method.as_str(), &ctx.path, &ctx.request_id);
    req.extensions_mut().insert(ctx.clone());

    let mut response = next.run(req).instrument(span.clone()).await;

    let elapsed = ctx.started.elapsed();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers.insert(X_GATEWAY, HeaderValue::from_static(GATEWAY_IDENT));
    if let Ok(value) = HeaderValue::from_str(&format!("{:.3}ms", elapsed.as_secs_f64() * 1000.0))
    {
        headers.insert(X_RESPONSE_TIME, value);
    }

    ctx.user = response.extensions().get::<AuthenticatedUser>().cloned();
    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", elapsed.as_millis() as u64);
    span.in_scope(|| {
        gateway
            .pipeline()
            .complete(&ctx, response.status(), user_agent.as_deref())
    });

    response
}

/// Add common security hardening headers.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("cross-origin"),
    );
    headers.insert(
        header::X_DNS_PREFETCH_CONTROL,
        HeaderValue::from_static("off"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=15552000; includeSubDomains"),
    );

    response
}

/// Origins allowed to call the gateway from a browser.
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    origins: Vec<String>,
    allow_any: bool,
}

impl CorsPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let origins = config.allowed_origins();
        let allow_any = origins.iter().any(|o| o == "*");
        Self { origins, allow_any }
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.allow_any || self.origins.iter().any(|o| o == origin)
    }

    fn apply(&self, headers: &mut HeaderMap, origin: &HeaderValue) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
        headers.append(header::VARY, HeaderValue::from_static("origin"));
    }
}

/// Answer preflights with 204 and decorate responses for allowed origins.
///
/// Requests from origins outside the policy get no CORS headers, which makes
/// the browser refuse them.
pub async fn cors_middleware(
    State(policy): State<Arc<CorsPolicy>>,
    req: Request,
    next: Next,
) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let allowed_origin = origin.filter(|o| o.to_str().map(|o| policy.allows(o)).unwrap_or(false));

    let is_preflight = req.method() == Method::OPTIONS
        && req
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

    if is_preflight {
        let mut response = Response::new(AxumBody::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        if let Some(origin) = &allowed_origin {
            let headers = response.headers_mut();
            policy.apply(headers, origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOWED_METHODS),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(ALLOWED_HEADERS),
            );
            headers.insert(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static(PREFLIGHT_MAX_AGE),
            );
        }
        return response;
    }

    let mut response = next.run(req).await;
    if let Some(origin) = &allowed_origin {
        policy.apply(response.headers_mut(), origin);
    }
    response
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

/// Count every `/api/` request against the global limiter.
pub async fn global_rate_limit_middleware(
    State(gateway): State<Arc<GatewayService>>,
    req: Request,
    next: Next,
) -> Response {
    if !is_api_path(req.uri().path()) {
        return next.run(req).await;
    }

    let ctx = match req.extensions().get::<RequestContext>() {
        Some(ctx) => ctx.clone(),
        None => RequestContext::new(req.method().clone(), req.uri().path(), None),
    };

    let pipeline = gateway.pipeline();
    match pipeline.rate_limit(&LimiterClass::Global, &ctx).await {
        Ok(quota) => {
            let mut response = next.run(req).await;
            quota.apply(response.headers_mut(), false);
            response
        }
        Err(err) => pipeline.reject(&ctx, err),
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Convert a panic further down the stack into a generic 500 envelope
/// carrying the request id. The panic message is only exposed in development.
pub async fn panic_boundary_middleware(
    State(gateway): State<Arc<GatewayService>>,
    req: Request,
    next: Next,
) -> Response {
    let ctx = match req.extensions().get::<RequestContext>() {
        Some(ctx) => ctx.clone(),
        None => RequestContext::new(req.method().clone(), req.uri().path(), None),
    };

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            tracing::error!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                url = %ctx.path,
                ip = %ctx.client_key(),
                error = %detail,
                "Unhandled panic while processing request"
            );
            ctx.response_state.commit();
            GatewayError::Internal(detail)
                .into_response_with(Some(&ctx.request_id), gateway.pipeline().expose_detail())
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use http_body_util::BodyExt;
    use std::time::Duration;

    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::Environment,
        ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    };

    fn ok_router() -> Router {
        Router::new().route(
            "/",
            get(|| async {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(AxumBody::empty())
                    .unwrap()
            }),
        )
    }

    #[tokio::test]
    async fn test_security_headers_middleware() {
        let app = ok_router().layer(middleware::from_fn(security_headers_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();
        let headers = response.headers();

        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers["cross-origin-resource-policy"], "cross-origin");
        assert!(headers.contains_key(header::REFERRER_POLICY));
    }

    fn cors_app(config: &GatewayConfig) -> Router {
        let policy = Arc::new(CorsPolicy::from_config(config));
        ok_router().layer(middleware::from_fn_with_state(policy, cors_middleware))
    }

    #[tokio::test]
    async fn test_cors_allowed_origin() {
        let config = GatewayConfig::builder()
            .environment(Environment::Production)
            .cors_origin("https://shop.example.com")
            .build();
        let response = cors_app(&config)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "https://shop.example.com")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://shop.example.com"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], EXPOSED_HEADERS);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let config = GatewayConfig::default();
        let response = cors_app(&config)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/productos")
                    .header(header::ORIGIN, "http://localhost:4200")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[tokio::test]
    async fn test_cors_disallowed_origin_gets_no_headers() {
        let config = GatewayConfig::builder()
            .environment(Environment::Production)
            .build();
        let response = cors_app(&config)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "https://evil.example")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            !response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
    }

    #[test]
    fn test_wildcard_policy() {
        let config = GatewayConfig::builder()
            .environment(Environment::Production)
            .cors_origin("*")
            .build();
        assert!(CorsPolicy::from_config(&config).allows("https://anything.example"));
    }

    async fn boom() -> &'static str {
        panic!("database exploded")
    }

    struct Offline;

    #[async_trait::async_trait]
    impl HttpClient for Offline {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::ConnectionError("offline".to_string()))
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Err(HttpClientError::ConnectionError("offline".to_string()))
        }
    }

    fn panicking_app(environment: Environment) -> Router {
        let config = GatewayConfig::builder().environment(environment).build();
        let gateway = Arc::new(GatewayService::new(Arc::new(config), Arc::new(Offline)).unwrap());
        Router::new()
            .route("/boom", get(boom))
            .layer(middleware::from_fn_with_state(
                gateway.clone(),
                panic_boundary_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                gateway,
                request_context_middleware,
            ))
    }

    async fn boom_response(environment: Environment) -> (StatusCode, HeaderMap, serde_json::Value) {
        let response = panicking_app(environment)
            .oneshot(
                Request::builder()
                    .uri("/boom")
                    .extension(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 5000))))
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error_envelope() {
        let (status, headers, body) = boom_response(Environment::Production).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "INTERNAL_SERVER_ERROR");
        assert!(body.get("detail").is_none());
        assert_eq!(body["requestId"], headers[X_REQUEST_ID].to_str().unwrap());
    }

    #[tokio::test]
    async fn test_panic_detail_exposed_in_development() {
        let (_, headers, body) = boom_response(Environment::Development).await;
        assert_eq!(body["detail"], "database exploded");
        assert_eq!(body["requestId"], headers[X_REQUEST_ID].to_str().unwrap());
    }

    #[test]
    fn test_api_path_detection() {
        assert!(is_api_path("/api/metrics"));
        assert!(is_api_path("/api"));
        assert!(!is_api_path("/apis"));
        assert!(!is_api_path("/health"));
    }
}
