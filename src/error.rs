//! Gateway error taxonomy.
//!
//! Every way a request can end without reaching an upstream is a
//! [`GatewayError`]. Each variant carries a stable machine readable code, an
//! HTTP status and a message that is safe to show to clients.
use axum::{
    body::Body as AxumBody,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use crate::envelope;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Route {method} {path} does not exist")]
    RouteNotFound { method: String, path: String },

    #[error("{message}")]
    RateLimitExceeded {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Access token required")]
    MissingToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token verification secret is not configured")]
    SecretNotConfigured,

    #[error("Service {service} is not available")]
    ServiceUnavailable { service: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn service_unavailable(service: impl Into<String>) -> Self {
        GatewayError::ServiceUnavailable {
            service: service.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::MissingToken | GatewayError::TokenExpired => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidToken(_) => StatusCode::FORBIDDEN,
            GatewayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Validation(_) | GatewayError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::SecretNotConfigured | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable code for programmatic error handling
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::MissingToken => "MISSING_TOKEN",
            GatewayError::TokenExpired => "TOKEN_EXPIRED",
            GatewayError::InvalidToken(_) => "INVALID_TOKEN",
            GatewayError::SecretNotConfigured => "JWT_SECRET_NOT_CONFIGURED",
            GatewayError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::MalformedBody(_) => "INVALID_JSON",
            GatewayError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Client facing message (never includes internal detail)
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::InvalidToken(_) => "Invalid token".to_string(),
            GatewayError::MalformedBody(_) => "Malformed JSON body".to_string(),
            GatewayError::Internal(_) => "Internal server error".to_string(),
            GatewayError::SecretNotConfigured => {
                "The token verification secret is not configured on the gateway".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Build the JSON error envelope.
    pub fn to_envelope(&self, request_id: Option<&str>, expose_detail: bool) -> Value {
        let mut body = json!({
            "error": self.error_code(),
            "message": self.user_message(),
        });

        match self {
            GatewayError::RateLimitExceeded {
                retry_after_secs, ..
            } => {
                body["retryAfter"] = json!(retry_after_secs);
            }
            GatewayError::ServiceUnavailable { service } => {
                body["service"] = json!(service);
            }
            GatewayError::Internal(detail) if expose_detail => {
                body["detail"] = json!(detail);
            }
            _ => {}
        }

        if let Some(request_id) = request_id {
            body["requestId"] = json!(request_id);
        }

        envelope::envelope(false, body)
    }

    /// Convert into a response carrying the request id.
    pub fn into_response_with(
        self,
        request_id: Option<&str>,
        expose_detail: bool,
    ) -> Response<AxumBody> {
        let mut response =
            envelope::json_response(self.status_code(), &self.to_envelope(request_id, expose_detail));

        if let GatewayError::RateLimitExceeded {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }

    /// Log with a level matching the error class.
    pub fn log(&self, request_id: &str) {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(request_id = %request_id, error.code = code, "{}", self);
        } else {
            tracing::warn!(request_id = %request_id, error.code = code, "{}", self);
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with(None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_codes() {
        let cases = [
            (GatewayError::MissingToken, 401, "MISSING_TOKEN"),
            (GatewayError::TokenExpired, 401, "TOKEN_EXPIRED"),
            (
                GatewayError::InvalidToken("bad signature".into()),
                403,
                "INVALID_TOKEN",
            ),
            (
                GatewayError::SecretNotConfigured,
                500,
                "JWT_SECRET_NOT_CONFIGURED",
            ),
            (
                GatewayError::service_unavailable("productos"),
                503,
                "SERVICE_UNAVAILABLE",
            ),
            (
                GatewayError::MalformedBody("eof".into()),
                400,
                "INVALID_JSON",
            ),
            (
                GatewayError::Validation("too big".into()),
                400,
                "VALIDATION_ERROR",
            ),
        ];

        for (error, status, code) in cases {
            assert_eq!(error.status_code().as_u16(), status);
            assert_eq!(error.error_code(), code);
        }
    }

    #[test]
    fn test_rate_limit_envelope_and_header() {
        let error = GatewayError::RateLimitExceeded {
            message: "Too many requests from this IP".into(),
            retry_after_secs: 42,
        };
        let body = error.to_envelope(Some("req-1"), false);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retryAfter"], 42);
        assert_eq!(body["requestId"], "req-1");

        let response = error.into_response_with(None, false);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_internal_detail_only_when_exposed() {
        let error = GatewayError::Internal("db pool exhausted".into());
        let hidden = error.to_envelope(None, false);
        assert!(hidden.get("detail").is_none());
        assert_eq!(hidden["message"], "Internal server error");

        let shown = error.to_envelope(None, true);
        assert_eq!(shown["detail"], "db pool exhausted");
    }

    #[test]
    fn test_invalid_token_message_hides_cause() {
        let body = GatewayError::InvalidToken("InvalidSignature".into()).to_envelope(None, true);
        assert_eq!(body["message"], "Invalid token");
    }
}
