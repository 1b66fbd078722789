//! Upstream status endpoint.
//!
//! # Endpoints
//!
//! - `GET /services` - Circuit state snapshot for every upstream
//!
//! Read-only and lock-light: the numbers come from breaker snapshots, so
//! polling this endpoint cannot disturb admission decisions.

use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::error::{GatewayError, GatewayResult};
use crate::models::{Envelope, ServiceStatus, ServicesResponse};
use crate::state::AppState;

/// Upstream status endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "code": 200,
///   "message": "OK",
///   "data": {
///     "services": [
///       {
///         "name": "auth-service",
///         "base_url": "http://localhost:8000",
///         "circuit_state": "closed",
///         "consecutive_failures": 0,
///         "times_opened": 0
///       }
///     ]
///   }
/// }
/// ```
///
/// `retry_in_seconds` appears only while a circuit is open.
#[instrument(skip(state))]
pub async fn list_services(State(state): State<AppState>) -> GatewayResult<Json<Envelope>> {
    let services: Vec<ServiceStatus> = state
        .breakers
        .snapshots()
        .into_iter()
        .map(|snapshot| ServiceStatus {
            name: snapshot.upstream.to_string(),
            base_url: state.config.upstream_url(snapshot.upstream).to_string(),
            circuit_state: snapshot.state.to_string(),
            consecutive_failures: snapshot.consecutive_failures,
            times_opened: snapshot.times_opened,
            retry_in_seconds: snapshot.retry_in.map(|d| d.as_secs()),
        })
        .collect();

    let body = ServicesResponse { services };
    let data = serde_json::to_value(&body)
        .map_err(|e| GatewayError::Internal(format!("failed to serialize service list: {e}")))?;
    Ok(Json(Envelope::ok(data)))
}
