//! Bearer token verification.
//!
//! Tokens are HS256 JWTs signed with the configured secret. There is no
//! fallback secret: when none is configured every verification fails with
//! [`GatewayError::SecretNotConfigured`].
use http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{config::GatewayConfig, error::GatewayError};

/// Identity decoded from a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub username: Option<String>,
}

/// A successfully verified token.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub user: AuthenticatedUser,
    pub claims: Map<String, Value>,
}

#[derive(Clone)]
pub struct TokenVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is honoured when present but not mandatory
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.jwt_secret())
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// The token is the second word of `Authorization: Bearer <token>`.
    pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let mut parts = value.split_whitespace();
        let scheme = parts.next()?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        parts.next()
    }

    /// Verify the bearer token carried by `headers`.
    ///
    /// Failure order: missing token, missing secret, then signature/expiry.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<VerifiedToken, GatewayError> {
        let token = Self::extract_bearer(headers).ok_or(GatewayError::MissingToken)?;
        self.verify(token)
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedToken, GatewayError> {
        let key = self.key.as_ref().ok_or(GatewayError::SecretNotConfigured)?;

        let data = decode::<Map<String, Value>>(token, key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::TokenExpired,
                _ => GatewayError::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        let id = claims
            .get("id")
            .or_else(|| claims.get("sub"))
            .and_then(claim_to_string)
            .ok_or_else(|| GatewayError::InvalidToken("token carries no user id".to_string()))?;
        let username = claims.get("username").and_then(claim_to_string);

        Ok(VerifiedToken {
            user: AuthenticatedUser { id, username },
            claims,
        })
    }
}

fn claim_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    const SECRET: &str = "test-secret";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn token(claims: Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_valid_token() {
        let verifier = TokenVerifier::new(Some(SECRET));
        let jwt = token(
            json!({ "id": 7, "username": "ana", "exp": now() + 3600 }),
            SECRET,
        );
        let verified = verifier.authenticate(&bearer(&jwt)).unwrap();
        assert_eq!(
            verified.user,
            AuthenticatedUser {
                id: "7".to_string(),
                username: Some("ana".to_string())
            }
        );
        assert_eq!(verified.claims["username"], "ana");
    }

    #[test]
    fn test_sub_claim_and_no_expiry() {
        let verifier = TokenVerifier::new(Some(SECRET));
        let jwt = token(json!({ "sub": "u-1" }), SECRET);
        let verified = verifier.verify(&jwt).unwrap();
        assert_eq!(verified.user.id, "u-1");
        assert_eq!(verified.user.username, None);
    }

    #[test]
    fn test_missing_token() {
        let verifier = TokenVerifier::new(Some(SECRET));
        assert_eq!(
            verifier.authenticate(&HeaderMap::new()).unwrap_err(),
            GatewayError::MissingToken
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(
            verifier.authenticate(&headers).unwrap_err(),
            GatewayError::MissingToken
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(
            verifier.authenticate(&headers).unwrap_err(),
            GatewayError::MissingToken
        );
    }

    #[test]
    fn test_missing_secret_checked_after_token_presence() {
        let verifier = TokenVerifier::new(None);
        assert!(!verifier.is_configured());
        assert_eq!(
            verifier.authenticate(&HeaderMap::new()).unwrap_err(),
            GatewayError::MissingToken
        );
        let jwt = token(json!({ "id": 1 }), SECRET);
        assert_eq!(
            verifier.authenticate(&bearer(&jwt)).unwrap_err(),
            GatewayError::SecretNotConfigured
        );
    }

    #[test]
    fn test_expired_is_distinct_from_invalid() {
        let verifier = TokenVerifier::new(Some(SECRET));

        let expired = token(json!({ "id": 1, "exp": now() - 120 }), SECRET);
        assert_eq!(
            verifier.verify(&expired).unwrap_err(),
            GatewayError::TokenExpired
        );

        let forged = token(json!({ "id": 1, "exp": now() + 3600 }), "other-secret");
        let err = verifier.verify(&forged).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TOKEN");

        let err = verifier.verify("not.a.jwt").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TOKEN");
    }

    #[test]
    fn test_wrong_algorithm_is_invalid() {
        let verifier = TokenVerifier::new(Some(SECRET));
        let jwt = encode(
            &Header::new(Algorithm::HS512),
            &json!({ "id": 1 }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(verifier.verify(&jwt).unwrap_err().error_code(), "INVALID_TOKEN");
    }

    #[test]
    fn test_padded_secret_signs_and_verifies() {
        let config = GatewayConfig::builder().jwt_secret("  padded-secret ").build();
        let verifier = TokenVerifier::from_config(&config);
        let jwt = token(json!({ "id": 3 }), "  padded-secret ");
        assert_eq!(verifier.verify(&jwt).unwrap().user.id, "3");

        let trimmed = token(json!({ "id": 3 }), "padded-secret");
        assert_eq!(verifier.verify(&trimmed).unwrap_err().error_code(), "INVALID_TOKEN");
    }

    #[test]
    fn test_token_without_identity_is_invalid() {
        let verifier = TokenVerifier::new(Some(SECRET));
        let jwt = token(json!({ "role": "admin" }), SECRET);
        assert_eq!(verifier.verify(&jwt).unwrap_err().error_code(), "INVALID_TOKEN");
    }
}
