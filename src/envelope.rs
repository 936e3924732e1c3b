//! JSON response envelope shared by every gateway-generated response.
//!
//! Successful bodies look like `{ "success": true, ...payload, "timestamp": ... }`;
//! error bodies are produced by [`crate::error::GatewayError`] with the same
//! `success` / `timestamp` framing.
use axum::{
    body::Body as AxumBody,
    http::{StatusCode, header},
    response::Response,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Frame a payload with `success` and `timestamp`. Non-object payloads are
/// nested under `data`.
pub fn envelope(success: bool, payload: Value) -> Value {
    let mut body = Map::new();
    body.insert("success".to_string(), Value::Bool(success));
    match payload {
        Value::Object(fields) => body.extend(fields),
        Value::Null => {}
        other => {
            body.insert("data".to_string(), other);
        }
    }
    body.entry("timestamp")
        .or_insert_with(|| Value::String(timestamp()));
    Value::Object(body)
}

/// Serialize a JSON value into a response with the given status.
pub fn json_response(status: StatusCode, body: &Value) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

/// `200 OK` with a success envelope.
pub fn ok(payload: Value) -> Response<AxumBody> {
    json_response(StatusCode::OK, &envelope(true, payload))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_merges_object_payload() {
        let body = envelope(true, json!({ "message": "hi" }));
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "hi");
        assert!(body["timestamp"].is_string());
    }

    #[test]
    fn test_envelope_nests_scalars() {
        let body = envelope(false, json!([1, 2]));
        assert_eq!(body["success"], false);
        assert_eq!(body["data"], json!([1, 2]));
    }

    #[test]
    fn test_timestamp_is_iso8601_utc() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
