//! Per-request stage machine.
//!
//! A proxied request runs through a fixed list of [`Stage`]s determined by its
//! route kind. Any stage may end the request early with a [`GatewayError`];
//! every outcome, early or not, is reported back through
//! [`RequestPipeline::complete`] by the outermost middleware.
use std::sync::Arc;

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::{
    config::RouteKind,
    core::{
        auth::TokenVerifier,
        context::RequestContext,
        forwarder::ProxyForwarder,
        health_cache::HealthCache,
        rate_limiter::{LimiterClass, RateLimitQuota, RateLimiters},
        registry::Route,
    },
    error::GatewayError,
    metrics::MetricsAggregator,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Buffer and validate JSON bodies
    ParseBody,
    /// Verify the bearer token and attach the identity
    Authenticate,
    RateLimit(LimiterClass),
    /// Refuse when the target service is not healthy
    HealthGate,
    Forward,
}

/// The ordered stages for a proxied route.
pub fn stages_for(route: &Route) -> Vec<Stage> {
    match route.kind {
        RouteKind::AuthProxy => vec![
            Stage::ParseBody,
            Stage::RateLimit(LimiterClass::Auth),
            Stage::HealthGate,
            Stage::Forward,
        ],
        RouteKind::Protected => vec![
            Stage::ParseBody,
            Stage::Authenticate,
            Stage::RateLimit(LimiterClass::Api(route.service.clone())),
            Stage::HealthGate,
            Stage::Forward,
        ],
    }
}

fn is_json(req: &Request<AxumBody>) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

pub struct RequestPipeline {
    limiters: Arc<RateLimiters>,
    verifier: Arc<TokenVerifier>,
    health: Arc<HealthCache>,
    forwarder: Arc<ProxyForwarder>,
    metrics: Arc<MetricsAggregator>,
    body_limit: usize,
    expose_detail: bool,
}

impl RequestPipeline {
    pub fn new(
        limiters: Arc<RateLimiters>,
        verifier: Arc<TokenVerifier>,
        health: Arc<HealthCache>,
        forwarder: Arc<ProxyForwarder>,
        metrics: Arc<MetricsAggregator>,
        body_limit: usize,
        expose_detail: bool,
    ) -> Self {
        Self {
            limiters,
            verifier,
            health,
            forwarder,
            metrics,
            body_limit,
            expose_detail,
        }
    }

    /// Run a proxied request to completion, always producing a response.
    pub async fn handle(
        &self,
        route: &Route,
        mut ctx: RequestContext,
        req: Request<AxumBody>,
    ) -> Response<AxumBody> {
        let mut resp = match self.run(route, &mut ctx, req).await {
            Ok((mut resp, quota)) => {
                if let Some(quota) = quota {
                    quota.apply(resp.headers_mut(), true);
                }
                if !ctx.response_state.commit() {
                    tracing::warn!(request_id = %ctx.request_id, "Response committed twice");
                }
                resp
            }
            Err(err) => self.reject(&ctx, err),
        };
        // Lets the access log report who made the request.
        if let Some(user) = ctx.user {
            resp.extensions_mut().insert(user);
        }
        resp
    }

    async fn run(
        &self,
        route: &Route,
        ctx: &mut RequestContext,
        mut req: Request<AxumBody>,
    ) -> Result<(Response<AxumBody>, Option<RateLimitQuota>), GatewayError> {
        let mut quota = None;

        for stage in stages_for(route) {
            match stage {
                Stage::ParseBody => {
                    req = self.parse_body(req).await?;
                }
                Stage::Authenticate => {
                    let verified = self.verifier.authenticate(req.headers())?;
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        "Authenticated user {}",
                        verified.user.id
                    );
                    ctx.user = Some(verified.user);
                }
                Stage::RateLimit(class) => {
                    quota = Some(self.rate_limit(&class, ctx).await?);
                }
                Stage::HealthGate => {
                    let record = self.health.get_status(&route.service).await;
                    if !record.is_healthy() {
                        return Err(GatewayError::service_unavailable(&route.service));
                    }
                }
                Stage::Forward => {
                    let resp = self.forwarder.forward(route, ctx, req).await?;
                    return Ok((resp, quota));
                }
            }
        }

        Err(GatewayError::Internal(format!(
            "Pipeline for '{}' ended without forwarding",
            route.prefix
        )))
    }

    /// Count the request against `class` for this client.
    pub async fn rate_limit(
        &self,
        class: &LimiterClass,
        ctx: &RequestContext,
    ) -> Result<RateLimitQuota, GatewayError> {
        self.limiters.check(class, &ctx.client_key()).await
    }

    /// Buffer a JSON body (bounded) and check that it parses.
    pub async fn parse_body(
        &self,
        req: Request<AxumBody>,
    ) -> Result<Request<AxumBody>, GatewayError> {
        if !is_json(&req) {
            return Ok(req);
        }

        let (parts, body) = req.into_parts();
        let bytes: Bytes = match Limited::new(body, self.body_limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(GatewayError::Validation(format!(
                    "Request body exceeds the {} byte limit",
                    self.body_limit
                )));
            }
            Err(e) => {
                return Err(GatewayError::Validation(format!(
                    "Failed to read request body: {e}"
                )));
            }
        };

        if !bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_slice::<serde::de::IgnoredAny>(&bytes)
                .map_err(|e| GatewayError::MalformedBody(e.to_string()))?;
        }

        Ok(Request::from_parts(parts, AxumBody::from(bytes)))
    }

    /// Turn an error into the response for this request.
    pub fn reject(&self, ctx: &RequestContext, err: GatewayError) -> Response<AxumBody> {
        err.log(&ctx.request_id);
        if !ctx.response_state.commit() {
            tracing::warn!(
                request_id = %ctx.request_id,
                "Response already committed, dropping late error: {}",
                err
            );
        }
        err.into_response_with(Some(&ctx.request_id), self.expose_detail)
    }

    /// Final stage for every request: record metrics and emit the access log.
    pub fn complete(&self, ctx: &RequestContext, status: StatusCode, user_agent: Option<&str>) {
        let elapsed = ctx.started.elapsed();
        self.metrics
            .record(ctx.method.as_str(), status.as_u16(), elapsed);

        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            url = %ctx.path,
            status = status.as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            ip = %ctx.client_key(),
            user_agent = user_agent.unwrap_or("-"),
            user_id = ctx.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
            "HTTP request"
        );
    }

    pub fn expose_detail(&self) -> bool {
        self.expose_detail
    }
}
