//! API documentation and Postman collection, generated from the route table.
use axum::http::{HeaderMap, header};
use serde_json::{Value, json};

use crate::{
    config::RouteKind,
    core::{GatewayService, LimiterClass, Route},
};

const POSTMAN_SCHEMA: &str =
    "https://schema.getpostman.com/json/collection/v2.1.0/collection.json";

/// Public base URL as seen by the caller, from `X-Forwarded-Proto` and `Host`.
pub fn base_url(headers: &HeaderMap, fallback_host: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| *v == "http" || *v == "https")
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback_host);
    format!("{scheme}://{host}")
}

fn limiter_class(route: &Route) -> LimiterClass {
    match route.kind {
        RouteKind::AuthProxy => LimiterClass::Auth,
        RouteKind::Protected => LimiterClass::Api(route.service.clone()),
    }
}

fn limit_summary(gateway: &GatewayService, class: &LimiterClass) -> Value {
    match gateway.limiters().get(class) {
        Some(limiter) => json!({
            "window": humantime::format_duration(limiter.window()).to_string(),
            "maxRequests": limiter.max_requests(),
        }),
        None => Value::Null,
    }
}

fn display_name(gateway: &GatewayService, service: &str) -> String {
    gateway
        .registry()
        .get(service)
        .map(|s| s.display_name.clone())
        .unwrap_or_else(|| service.to_string())
}

/// Documentation payload for `GET /api/docs`.
pub fn api_docs(gateway: &GatewayService, base_url: &str) -> Value {
    let routes: Vec<Value> = gateway
        .routes()
        .routes()
        .iter()
        .map(|route| {
            let protected = route.kind == RouteKind::Protected;
            json!({
                "prefix": route.prefix,
                "methods": "ANY",
                "service": route.service,
                "serviceName": display_name(gateway, &route.service),
                "authRequired": protected,
                "rateLimit": limit_summary(gateway, &limiter_class(route)),
                "healthChecked": true,
            })
        })
        .collect();

    let auth_prefixes: Vec<&str> = gateway
        .routes()
        .routes()
        .iter()
        .filter(|r| r.kind == RouteKind::AuthProxy)
        .map(|r| r.prefix.as_str())
        .collect();

    json!({
        "data": {
            "title": "Gatehouse API Gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Single entry point for the backend services",
            "baseUrl": base_url,
            "authentication": {
                "type": "Bearer Token (JWT)",
                "header": "Authorization: Bearer <token>",
                "publicPrefixes": auth_prefixes,
            },
            "endpoints": [
                { "method": "GET", "path": "/", "description": "Gateway information" },
                { "method": "GET", "path": "/health", "description": "Aggregate service health" },
                { "method": "GET", "path": "/api/metrics", "description": "Request metrics" },
                { "method": "GET", "path": "/api/docs", "description": "This document" },
                { "method": "GET", "path": "/api/postman-collection", "description": "Postman collection" },
            ],
            "routes": routes,
            "rateLimits": {
                "global": limit_summary(gateway, &LimiterClass::Global),
                "auth": limit_summary(gateway, &LimiterClass::Auth),
            },
        }
    })
}

fn postman_request(method: &str, path: &str, authenticated: bool, body: Option<Value>) -> Value {
    let mut headers = Vec::new();
    if authenticated {
        headers.push(json!({ "key": "Authorization", "value": "Bearer {{token}}" }));
    }
    let mut request = json!({
        "method": method,
        "header": headers,
        "url": {
            "raw": format!("{{{{baseUrl}}}}{path}"),
            "host": ["{{baseUrl}}"],
            "path": path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>(),
        },
    });
    if let Some(body) = body {
        if let Some(list) = request["header"].as_array_mut() {
            list.push(json!({ "key": "Content-Type", "value": "application/json" }));
        }
        request["body"] = json!({
            "mode": "raw",
            "raw": serde_json::to_string_pretty(&body).unwrap_or_default(),
        });
    }
    request
}

fn route_folder(gateway: &GatewayService, route: &Route) -> Value {
    let name = format!("{} ({})", display_name(gateway, &route.service), route.prefix);
    let items = match route.kind {
        RouteKind::AuthProxy => vec![
            json!({
                "name": "Login",
                "request": postman_request(
                    "POST",
                    &format!("{}/login", route.prefix),
                    false,
                    Some(json!({ "correo": "user@example.com", "contrasena": "password123" })),
                ),
            }),
            json!({
                "name": "Register",
                "request": postman_request(
                    "POST",
                    &format!("{}/registro", route.prefix),
                    false,
                    Some(json!({ "correo": "user@example.com", "contrasena": "password123" })),
                ),
            }),
        ],
        RouteKind::Protected => vec![
            json!({
                "name": "List",
                "request": postman_request("GET", &route.prefix, true, None),
            }),
            json!({
                "name": "Get by id",
                "request": postman_request("GET", &format!("{}/:id", route.prefix), true, None),
            }),
        ],
    };
    json!({ "name": name, "item": items })
}

/// Postman v2.1 collection for `GET /api/postman-collection`.
pub fn postman_collection(gateway: &GatewayService, base_url: &str) -> Value {
    let mut folders = vec![json!({
        "name": "Gateway",
        "item": [
            { "name": "Info", "request": postman_request("GET", "/", false, None) },
            { "name": "Health", "request": postman_request("GET", "/health", false, None) },
            { "name": "Metrics", "request": postman_request("GET", "/api/metrics", false, None) },
            { "name": "Docs", "request": postman_request("GET", "/api/docs", false, None) },
        ],
    })];
    folders.extend(
        gateway
            .routes()
            .routes()
            .iter()
            .map(|route| route_folder(gateway, route)),
    );

    json!({
        "data": {
            "info": {
                "name": "Gatehouse API Gateway",
                "description": "Requests for every route exposed by the gateway",
                "version": env!("CARGO_PKG_VERSION"),
                "schema": POSTMAN_SCHEMA,
            },
            "variable": [
                { "key": "baseUrl", "value": base_url },
                { "key": "token", "value": "" },
            ],
            "item": folders,
        }
    })
}
