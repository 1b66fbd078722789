//! The proxy pipeline: fallback handler for every routed path.
//!
//! # Flow
//!
//! ```text
//! resolved route (extension) → buffer body → breaker permit →
//!     unary:     forward, buffer response, re-frame into envelope
//!     streaming: open exchange, relay chunks verbatim
//! ```
//!
//! The route was matched and admission-checked by middleware before the
//! request reaches this handler; requests with no match get a 404 envelope
//! here. The `X-Request-ID` header survives header filtering and rides to
//! the upstream unchanged.
//!
//! # Body Buffering
//!
//! The request body is read completely before the breaker permit is
//! acquired. A client that fails mid-upload therefore never charges a
//! failure against the upstream's breaker.

use std::time::Instant;

use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::middleware::client_ip;
use crate::middleware::request_id::RequestIdExt;
use crate::models::Envelope;
use crate::router::{ResolvedRoute, Route, UpstreamId};
use crate::state::AppState;
use crate::upstream::{CallPermit, ProxyRequest, ProxyResponse, forwardable_headers};

/// Forward a request to its upstream, per the resolved route.
#[instrument(skip(state, req), fields(method = %req.method(), path = %req.uri().path()))]
pub async fn proxy_request(
    State(state): State<AppState>,
    req: Request<Body>,
) -> GatewayResult<Response> {
    let Some(ResolvedRoute(route)) = req.extensions().get::<ResolvedRoute>().cloned() else {
        return Err(GatewayError::RouteNotFound {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
        });
    };

    // Local routes are served by their own handlers, never the fallback
    let Some(upstream) = route.upstream else {
        return Err(GatewayError::RouteNotFound {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
        });
    };

    let client = client_ip(&req, &state.trusted_proxies).into_owned();
    let request_id = req.request_id();
    let (parts, body) = req.into_parts();

    let body = to_bytes(body, state.config.max_request_body_size)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {e}")))?;

    let path = route.upstream_path(parts.uri.path()).ok_or_else(|| {
        GatewayError::Internal("resolved route no longer matches request path".to_string())
    })?;

    let proxy_request = ProxyRequest {
        method: parts.method.clone(),
        path,
        query: parts.uri.query().map(str::to_string),
        headers: forward_headers(&parts.headers, &client),
        body,
    };

    let breaker = state.breakers.breaker(upstream);
    let Some(permit) = breaker.try_acquire() else {
        metrics::record_breaker_rejection(upstream.as_str());
        return Err(GatewayError::CircuitOpen { upstream });
    };

    debug!(
        upstream = %upstream,
        upstream_path = %proxy_request.path,
        request_id = request_id.as_deref().unwrap_or("unknown"),
        streaming = route.streaming,
        trial = permit.is_trial(),
        "Forwarding request"
    );

    if route.streaming {
        relay_stream(&state, upstream, proxy_request, permit).await
    } else {
        forward_unary(&state, upstream, &route, proxy_request, permit).await
    }
}

/// Buffer the upstream response and re-frame it into the envelope.
async fn forward_unary(
    state: &AppState,
    upstream: UpstreamId,
    route: &Route,
    request: ProxyRequest,
    permit: CallPermit,
) -> GatewayResult<Response> {
    let started = Instant::now();
    let response = state
        .upstream
        .call(upstream, &request, permit, route.retry_safe)
        .await?;
    metrics::record_upstream_latency(upstream.as_str(), started.elapsed());

    let envelope = envelope_from_upstream(upstream, response)?;
    let status = StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(envelope)).into_response())
}

/// Open the streaming exchange and hand the relay to the client.
async fn relay_stream(
    state: &AppState,
    upstream: UpstreamId,
    request: ProxyRequest,
    permit: CallPermit,
) -> GatewayResult<Response> {
    let streaming = state.upstream.call_stream(upstream, &request, permit).await?;

    let mut response = Response::new(Body::from_stream(streaming.body));
    *response.status_mut() = streaming.status;
    *response.headers_mut() = streaming.headers;
    response
        .headers_mut()
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("text/event-stream"));

    Ok(response)
}

/// Build the outbound header set: connection-scoped headers dropped, this
/// hop appended to the forwarding chain.
fn forward_headers(inbound: &HeaderMap, client_ip: &str) -> HeaderMap {
    let mut headers = forwardable_headers(inbound);

    let chain = match inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }

    if let Some(host) = inbound.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

    headers
}

/// Re-frame a buffered upstream response as an envelope.
///
/// The upstream status code is preserved in `code` and as the HTTP status.
/// Success bodies ride in `data` under message "OK"; error bodies
/// contribute their `detail`/`message`/`error` field as the message when
/// one is present.
fn envelope_from_upstream(
    upstream: UpstreamId,
    response: ProxyResponse,
) -> GatewayResult<Envelope> {
    let status = response.status;

    if response.body.is_empty() {
        let message = if status.is_success() {
            "OK"
        } else {
            "upstream error"
        };
        return Ok(Envelope::with_status(status, message, None));
    }

    let value: Value = serde_json::from_slice(&response.body).map_err(|e| {
        warn!(
            upstream = %upstream,
            status = %status,
            error = %e,
            "Upstream returned a non-JSON body"
        );
        GatewayError::UpstreamBadResponse {
            upstream,
            detail: "non-JSON response body".to_string(),
        }
    })?;

    if status.is_success() {
        Ok(Envelope::with_status(status, "OK", Some(value)))
    } else {
        let message = value
            .get("detail")
            .or_else(|| value.get("message"))
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string();
        Ok(Envelope::with_status(status, message, Some(value)))
    }
}
