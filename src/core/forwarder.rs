//! Upstream forwarding.
//!
//! [`ProxyForwarder`] rewrites the request URI onto the target service, runs
//! the interceptor chain and sends the request through the [`HttpClient`]
//! port. Every transport failure, including the per-service timeout, comes
//! back as [`GatewayError::ServiceUnavailable`] naming the service.
use std::sync::Arc;

use axum::body::Body as AxumBody;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, header};

use crate::{
    core::{
        context::RequestContext,
        registry::{Route, ServiceDescriptor, ServiceRegistry},
    },
    error::GatewayError,
    ports::http_client::{HttpClient, HttpClientError},
};

pub const X_GATEWAY: HeaderName = HeaderName::from_static("x-gateway");
pub const X_SERVICE: HeaderName = HeaderName::from_static("x-service");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_GATEWAY_REQUEST_ID: HeaderName = HeaderName::from_static("x-gateway-request-id");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_USERNAME: HeaderName = HeaderName::from_static("x-user-username");

/// Value of the `X-Gateway` header.
pub const GATEWAY_IDENT: &str = concat!("gatehouse/", env!("CARGO_PKG_VERSION"));

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// What an interceptor knows about the forward in progress.
pub struct ProxyTarget<'a> {
    pub service: &'a ServiceDescriptor,
    pub context: &'a RequestContext,
}

/// Hooks invoked around one upstream forward.
///
/// `on_request` runs before transmission, `on_response` on the upstream
/// answer and `on_error` on any failure. Returning an error from the first
/// two ends the forward with that error.
pub trait ProxyInterceptor: Send + Sync {
    fn on_request(
        &self,
        _target: &ProxyTarget<'_>,
        req: Request<AxumBody>,
    ) -> Result<Request<AxumBody>, GatewayError> {
        Ok(req)
    }

    fn on_response(
        &self,
        _target: &ProxyTarget<'_>,
        resp: Response<AxumBody>,
    ) -> Result<Response<AxumBody>, GatewayError> {
        Ok(resp)
    }

    fn on_error(&self, _target: &ProxyTarget<'_>, err: GatewayError) -> GatewayError {
        err
    }
}

/// Adds request id, forwarded-for and verified identity headers so upstreams
/// need not re-verify the token.
pub struct IdentityHeaders;

impl ProxyInterceptor for IdentityHeaders {
    fn on_request(
        &self,
        target: &ProxyTarget<'_>,
        mut req: Request<AxumBody>,
    ) -> Result<Request<AxumBody>, GatewayError> {
        let ctx = target.context;
        let headers = req.headers_mut();

        let request_id = header_value(&ctx.request_id)?;
        headers.insert(X_GATEWAY_REQUEST_ID, request_id.clone());
        headers.insert(X_REQUEST_ID, request_id);

        if let Some(ip) = ctx.client_ip {
            let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
                _ => ip.to_string(),
            };
            headers.insert(X_FORWARDED_FOR, header_value(&forwarded)?);
        }

        // Never trust identity headers supplied by the client
        headers.remove(&X_USER_ID);
        headers.remove(&X_USER_USERNAME);
        if let Some(user) = &ctx.user {
            headers.insert(X_USER_ID, header_value(&user.id)?);
            if let Some(username) = &user.username {
                headers.insert(X_USER_USERNAME, header_value(username)?);
            }
        }

        Ok(req)
    }
}

/// Stamps `X-Gateway` and `X-Service` on upstream responses.
pub struct GatewayStamp;

impl ProxyInterceptor for GatewayStamp {
    fn on_response(
        &self,
        target: &ProxyTarget<'_>,
        mut resp: Response<AxumBody>,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let headers = resp.headers_mut();
        headers.insert(X_GATEWAY, HeaderValue::from_static(GATEWAY_IDENT));
        headers.insert(X_SERVICE, header_value(&target.service.name)?);
        Ok(resp)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Internal(format!("Invalid header value '{value}': {e}")))
}

pub struct ProxyForwarder {
    registry: Arc<ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    interceptors: Vec<Arc<dyn ProxyInterceptor>>,
}

impl ProxyForwarder {
    /// Forwarder with the default interceptor chain.
    pub fn new(registry: Arc<ServiceRegistry>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            registry,
            client,
            interceptors: vec![Arc::new(IdentityHeaders), Arc::new(GatewayStamp)],
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ProxyInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Forward `req` to the service bound to `route`.
    pub async fn forward(
        &self,
        route: &Route,
        ctx: &RequestContext,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let service = self
            .registry
            .get(&route.service)
            .ok_or_else(|| GatewayError::service_unavailable(&route.service))?;
        let target = ProxyTarget {
            service,
            context: ctx,
        };

        match self.forward_to(&target, route, req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                let err = self
                    .interceptors
                    .iter()
                    .fold(err, |err, interceptor| interceptor.on_error(&target, err));
                tracing::warn!(
                    request_id = %ctx.request_id,
                    "Proxy error for service '{}' ({} {}): {}",
                    service.name,
                    ctx.method,
                    ctx.path,
                    err
                );
                Err(err)
            }
        }
    }

    async fn forward_to(
        &self,
        target: &ProxyTarget<'_>,
        route: &Route,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let service = target.service;
        let (mut parts, body) = req.into_parts();

        let path = route.rewrite_path(parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.into_owned(),
        };
        parts.uri = service
            .upstream_url(&path_and_query)
            .parse::<Uri>()
            .map_err(|e| GatewayError::Internal(format!("Invalid upstream URI: {e}")))?;
        strip_hop_by_hop(&mut parts.headers);

        let mut req = Request::from_parts(parts, body);
        for interceptor in &self.interceptors {
            req = interceptor.on_request(target, req)?;
        }

        // Late errors must not be written twice
        if target.context.response_state.is_committed() {
            return Err(GatewayError::Internal(
                "Response already committed before forwarding".to_string(),
            ));
        }

        let sent = tokio::time::timeout(service.timeout, self.client.send_request(req)).await;
        let mut resp = match sent {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(transport_failure(service, e)),
            Err(_) => return Err(transport_failure(service, HttpClientError::timeout(service.timeout))),
        };

        strip_hop_by_hop(resp.headers_mut());
        for interceptor in &self.interceptors {
            resp = interceptor.on_response(target, resp)?;
        }
        Ok(resp)
    }
}

fn transport_failure(service: &ServiceDescriptor, error: HttpClientError) -> GatewayError {
    tracing::debug!("Upstream transport failure for {}: {}", service, error);
    GatewayError::service_unavailable(&service.name)
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use http::{Method, StatusCode};

    use super::*;
    use crate::{
        config::{GatewayConfig, RouteConfig, RouteKind, ServiceConfig},
        core::{auth::AuthenticatedUser, registry::RouteTable},
        ports::http_client::HttpClientResult,
    };

    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Vec<(Uri, HeaderMap)>>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            self.seen
                .lock()
                .unwrap()
                .push((req.uri().clone(), req.headers().clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header(header::CONNECTION, "keep-alive")
                .body(AxumBody::from("ok"))
                .unwrap())
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Ok(StatusCode::OK)
        }
    }

    fn setup(config: &GatewayConfig, client: Arc<RecordingClient>) -> (ProxyForwarder, RouteTable) {
        let registry = Arc::new(ServiceRegistry::from_config(config).unwrap());
        let routes = RouteTable::from_config(config, &registry).unwrap();
        (ProxyForwarder::new(registry, client), routes)
    }

    fn request(uri: &str) -> Request<AxumBody> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(X_USER_ID, "spoofed")
            .header(header::CONNECTION, "close")
            .body(AxumBody::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_forward_injects_identity_and_stamps_response() {
        let client = Arc::new(RecordingClient::default());
        let config = GatewayConfig::default();
        let (forwarder, routes) = setup(&config, client.clone());
        let route = routes.resolve("/api/productos/9").unwrap().clone();

        let mut ctx = RequestContext::new(
            Method::POST,
            "/api/productos/9",
            Some("192.168.1.20".parse().unwrap()),
        );
        ctx.user = Some(AuthenticatedUser {
            id: "42".to_string(),
            username: Some("ana".to_string()),
        });

        let resp = forwarder
            .forward(&route, &ctx, request("/api/productos/9?page=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()[X_GATEWAY], GATEWAY_IDENT);
        assert_eq!(resp.headers()[X_SERVICE], "productos");
        assert!(!resp.headers().contains_key(header::CONNECTION));

        let seen = client.seen.lock().unwrap();
        let (uri, headers) = &seen[0];
        assert_eq!(uri.to_string(), "http://localhost:3001/api/productos/9?page=2");
        assert_eq!(headers[X_GATEWAY_REQUEST_ID], ctx.request_id.as_str());
        assert_eq!(headers[X_FORWARDED_FOR], "192.168.1.20");
        assert_eq!(headers[X_USER_ID], "42");
        assert_eq!(headers[X_USER_USERNAME], "ana");
        assert!(!headers.contains_key(header::CONNECTION));
    }

    #[tokio::test]
    async fn test_anonymous_forward_drops_spoofed_identity() {
        let client = Arc::new(RecordingClient::default());
        let config = GatewayConfig::default();
        let (forwarder, routes) = setup(&config, client.clone());
        let route = routes.resolve("/api/auth/login").unwrap().clone();
        let ctx = RequestContext::new(Method::POST, "/api/auth/login", None);

        forwarder
            .forward(&route, &ctx, request("/api/auth/login"))
            .await
            .unwrap();

        let seen = client.seen.lock().unwrap();
        let (uri, headers) = &seen[0];
        assert_eq!(uri.to_string(), "http://localhost:8080/api/auth/login");
        assert!(!headers.contains_key(X_USER_ID));
        assert!(!headers.contains_key(X_FORWARDED_FOR));
    }

    #[tokio::test]
    async fn test_path_rewrite_applied() {
        let client = Arc::new(RecordingClient::default());
        let mut route_config = RouteConfig::new("/api/pedidos", "pedidos", RouteKind::Protected);
        route_config.path_rewrite = Some(crate::config::PathRewrite {
            from: "/api/pedidos".to_string(),
            to: "/orders".to_string(),
        });
        let config = GatewayConfig::builder()
            .service("pedidos", ServiceConfig::new("Orders", "http://orders:7000"))
            .route(route_config)
            .build();
        let (forwarder, routes) = setup(&config, client.clone());
        let route = routes.resolve("/api/pedidos/1").unwrap().clone();
        let ctx = RequestContext::new(Method::GET, "/api/pedidos/1", None);

        forwarder
            .forward(&route, &ctx, request("/api/pedidos/1"))
            .await
            .unwrap();
        assert_eq!(
            client.seen.lock().unwrap()[0].0.to_string(),
            "http://orders:7000/orders/1"
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_service_unavailable() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..Default::default()
        });
        let config = GatewayConfig::default();
        let (forwarder, routes) = setup(&config, client);
        let route = routes.resolve("/api/usuarios").unwrap().clone();
        let ctx = RequestContext::new(Method::GET, "/api/usuarios", None);

        let err = forwarder
            .forward(&route, &ctx, request("/api/usuarios"))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::service_unavailable("usuarios"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_timeout_is_service_unavailable() {
        let client = Arc::new(RecordingClient {
            delay: Some(Duration::from_secs(120)),
            ..Default::default()
        });
        let config = GatewayConfig::default();
        let (forwarder, routes) = setup(&config, client);
        let route = routes.resolve("/api/productos").unwrap().clone();
        let ctx = RequestContext::new(Method::GET, "/api/productos", None);

        let err = forwarder
            .forward(&route, &ctx, request("/api/productos"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_committed_response_is_not_forwarded() {
        let client = Arc::new(RecordingClient::default());
        let config = GatewayConfig::default();
        let (forwarder, routes) = setup(&config, client.clone());
        let route = routes.resolve("/api/productos").unwrap().clone();
        let ctx = RequestContext::new(Method::GET, "/api/productos", None);
        assert!(ctx.response_state.commit());

        let err = forwarder
            .forward(&route, &ctx, request("/api/productos"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL_SERVER_ERROR");
        assert!(client.seen.lock().unwrap().is_empty());
    }

    struct Reject;

    impl ProxyInterceptor for Reject {
        fn on_request(
            &self,
            _target: &ProxyTarget<'_>,
            _req: Request<AxumBody>,
        ) -> Result<Request<AxumBody>, GatewayError> {
            Err(GatewayError::Validation("blocked".to_string()))
        }
    }

    #[tokio::test]
    async fn test_interceptor_can_terminate() {
        let client = Arc::new(RecordingClient::default());
        let config = GatewayConfig::default();
        let (forwarder, routes) = setup(&config, client.clone());
        let forwarder = forwarder.with_interceptor(Arc::new(Reject));
        let route = routes.resolve("/api/productos").unwrap().clone();
        let ctx = RequestContext::new(Method::GET, "/api/productos", None);

        let err = forwarder
            .forward(&route, &ctx, request("/api/productos"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(client.seen.lock().unwrap().is_empty());
    }
}
