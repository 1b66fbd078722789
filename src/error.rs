use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::models::Envelope;
use crate::router::UpstreamId;

/// Rate-limit headers attached to every throttled route's response.
///
/// Lowercase per `HeaderName::from_static` requirements; HTTP header
/// names are case-insensitive on the wire.
pub const X_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Gateway-wide error types with appropriate HTTP status codes.
///
/// # Upstream Errors
///
/// Failures while talking to a backing service are split into specific
/// variants so the circuit breaker and retry logic can pattern match on
/// them:
///
/// - `UpstreamTimeout` - The per-upstream deadline elapsed before a response
/// - `UpstreamUnreachable` - Connection refused, reset, or DNS failure
/// - `UpstreamBadResponse` - The upstream answered with something we cannot relay
///
/// All three count against the upstream's circuit breaker; `CircuitOpen`
/// is what callers see once the breaker has tripped and is produced
/// without any outbound attempt.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Rate limit of {limit} exceeded, retry in {retry_after}s")]
    RateLimited {
        limit: u32,
        retry_after: u64,
        reset_epoch: i64,
    },

    #[error("Circuit breaker open for {upstream}")]
    CircuitOpen { upstream: UpstreamId },

    #[error("Timed out waiting for {upstream}")]
    UpstreamTimeout { upstream: UpstreamId },

    #[error("Failed to reach {upstream}: {detail}")]
    UpstreamUnreachable { upstream: UpstreamId, detail: String },

    #[error("Unusable response from {upstream}: {detail}")]
    UpstreamBadResponse { upstream: UpstreamId, detail: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::warn!(error = %self, status = %status, "Request rejected");
        }

        // Throttled requests carry the standard rate-limit headers plus a
        // machine-readable retry hint in the body
        if let GatewayError::RateLimited {
            limit,
            retry_after,
            reset_epoch,
        } = &self
        {
            let body = Envelope::with_status(
                status,
                "rate limit exceeded",
                Some(serde_json::json!({ "retry_after": retry_after })),
            );
            let mut response = (status, axum::Json(body)).into_response();
            let headers = response.headers_mut();
            headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(*limit));
            headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(0u16));
            headers.insert(X_RATE_LIMIT_RESET, HeaderValue::from(*reset_epoch));
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
            return response;
        }

        let message = match &self {
            // Client errors - safe to show the message as it's user-facing
            GatewayError::RouteNotFound { .. } => "route not found",
            GatewayError::Unauthenticated(msg) => msg.as_str(),
            GatewayError::BadRequest(msg) => msg.as_str(),

            // Availability errors - fixed wording, no upstream details
            GatewayError::CircuitOpen { .. } => "service unavailable",
            GatewayError::UpstreamTimeout { .. } => "upstream timeout",
            GatewayError::UpstreamUnreachable { .. } => "upstream unreachable",
            GatewayError::UpstreamBadResponse { .. } => "invalid upstream response",

            // Internal errors - never expose internal details to clients
            GatewayError::Config(_) => "service configuration error",
            GatewayError::Internal(_) => "internal server error",

            // Returned above with its extra headers
            GatewayError::RateLimited { .. } => "rate limit exceeded",
        };

        let body = Envelope::error(status, message);
        let mut response = (status, axum::Json(body)).into_response();
        if matches!(self, GatewayError::Unauthenticated(_)) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl GatewayError {
    /// HTTP status this error maps to, also mirrored into the envelope body.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnreachable { .. } | GatewayError::UpstreamBadResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
