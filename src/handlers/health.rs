//! Liveness endpoint.
//!
//! # Endpoints
//!
//! - `GET /health` - Gateway process liveness
//!
//! Health reports only the gateway itself and always returns 200; upstream
//! circuit state is a separate concern served by `GET /services`. Keeping
//! the two apart means a dead model service never fails load balancer
//! probes of the gateway.

use axum::Json;
use chrono::Utc;
use tracing::instrument;

use crate::error::{GatewayError, GatewayResult};
use crate::models::{Envelope, HealthResponse};

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "code": 200,
///   "message": "OK",
///   "data": {
///     "status": "healthy",
///     "version": "0.1.0",
///     "timestamp": "2026-01-15T10:30:00Z"
///   }
/// }
/// ```
#[instrument]
pub async fn health_check() -> GatewayResult<Json<Envelope>> {
    let health = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    let data = serde_json::to_value(&health)
        .map_err(|e| GatewayError::Internal(format!("failed to serialize health body: {e}")))?;
    Ok(Json(Envelope::ok(data)))
}
