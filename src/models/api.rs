use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Uniform body for every non-streaming response the gateway produces.
///
/// Proxied upstream bodies are re-emitted inside `data`; gateway-generated
/// failures carry `data: null` (rate-limit rejections carry the retry hint).
/// Streaming routes bypass the envelope entirely and relay raw SSE frames.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// HTTP status code mirrored into the body
    pub code: u16,
    /// Short human-readable outcome ("OK" on success)
    pub message: String,
    /// Upstream payload or error detail, `null` when there is none
    pub data: Option<Value>,
}

impl Envelope {
    /// Successful envelope wrapping an upstream or local payload.
    pub fn ok(data: Value) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            message: "OK".to_string(),
            data: Some(data),
        }
    }

    /// Envelope for an arbitrary status with a payload.
    pub fn with_status(status: StatusCode, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
            data,
        }
    }

    /// Failure envelope with no payload.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self::with_status(status, message, None)
    }
}

/// Health check response, nested in the envelope `data`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Per-upstream status snapshot returned by `GET /services`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Upstream name (`auth-service`, `model-service`)
    pub name: String,
    /// Base URL requests are forwarded to
    pub base_url: String,
    /// Circuit state: `closed`, `open` or `half-open`
    pub circuit_state: String,
    /// Consecutive failures observed while closed
    pub consecutive_failures: u32,
    /// Times the circuit has opened since startup
    pub times_opened: u32,
    /// Seconds until the next recovery probe, when open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_seconds: Option<u64>,
}

/// Response payload for `GET /services`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServicesResponse {
    /// One entry per configured upstream
    pub services: Vec<ServiceStatus>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_envelope_shape() {
        let envelope = Envelope::ok(json!({"user": "fox"}));
        let json = serde_json::to_string(&envelope).expect("Serialization should succeed");

        assert!(json.contains("\"code\":200"));
        assert!(json.contains("\"message\":\"OK\""));
        assert!(json.contains("\"user\":\"fox\""));
    }

    #[test]
    fn test_error_envelope_has_null_data() {
        let envelope = Envelope::error(StatusCode::NOT_FOUND, "not found");
        let json = serde_json::to_string(&envelope).expect("Serialization should succeed");

        assert!(json.contains("\"code\":404"));
        assert!(json.contains("\"data\":null"));
    }

    #[test]
    fn test_retry_after_payload_round_trips() {
        let envelope = Envelope::with_status(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
            Some(json!({"retry_after": 42})),
        );
        let parsed: Envelope = serde_json::from_str(
            &serde_json::to_string(&envelope).expect("Serialization should succeed"),
        )
        .expect("Deserialization should succeed");

        assert_eq!(parsed.code, 429);
        assert_eq!(parsed.data.unwrap()["retry_after"], 42);
    }

    #[test]
    fn test_service_status_omits_retry_when_closed() {
        let status = ServiceStatus {
            name: "auth-service".to_string(),
            base_url: "http://localhost:8000".to_string(),
            circuit_state: "closed".to_string(),
            consecutive_failures: 0,
            times_opened: 0,
            retry_in_seconds: None,
        };

        let json = serde_json::to_string(&status).expect("Serialization should succeed");
        assert!(!json.contains("retry_in_seconds"));
    }
}
