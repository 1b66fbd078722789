//! Outbound HTTP plumbing for the backing services.
//!
//! # Features
//!
//! - **Per-Upstream Deadlines**: Every exchange is bounded by the target
//!   service's configured timeout
//! - **Bounded Retries**: Connection failures and timeouts are retried a
//!   small fixed number of times with jittered exponential backoff, and only
//!   for routes marked replayable
//! - **Circuit Breaker Integration**: Calls run under a [`CallPermit`];
//!   exactly one outcome per permitted call reaches the breaker, and only
//!   the final outcome after retries
//! - **Streaming Passthrough**: SSE bodies are relayed chunk-by-chunk
//!   without buffering (see [`streaming`])
//!
//! # Module Organization
//!
//! - `circuit_breaker` - Per-upstream failure tracking with fail-fast
//! - `streaming` - Chunk relay with sentinel detection

pub mod circuit_breaker;
pub mod streaming;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::time::sleep;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::router::UpstreamId;
use crate::upstream::streaming::relay_sse;

// Re-exports for public API
pub use circuit_breaker::{
    BreakerSnapshot, CallPermit, CircuitBreaker, CircuitBreakerBank, CircuitBreakerConfig,
    CircuitState,
};

// =============================================================================
// Constants
// =============================================================================

/// Jitter percentage for exponential backoff (±20%).
///
/// Randomizing retry delays keeps a burst of failed requests from hitting
/// a recovering upstream in lockstep.
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Minimum delay between retry attempts in milliseconds.
///
/// Even with negative jitter, we never retry faster than this.
const MIN_RETRY_DELAY_MS: u64 = 50;

/// Connection-scoped headers that are never forwarded in either direction
/// (RFC 7230 §6.1).
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copy of `headers` without connection-scoped entries.
///
/// `host` and `content-length` are dropped too: both are derived fresh for
/// the rewritten request, and relayed responses are re-framed.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

// =============================================================================
// Request / Response values
// =============================================================================

/// A request ready to forward, already rewritten for the upstream.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Upstream-facing path (the route's rewrite applied).
    pub path: String,
    /// Raw query string, forwarded untouched.
    pub query: Option<String>,
    /// Filtered and augmented headers (forwarding headers added by the caller).
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A complete non-streaming upstream response.
///
/// Headers are not carried: unary responses are re-emitted inside the
/// gateway's envelope, which replaces the upstream framing wholesale.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Response head plus the live relay for a streaming route.
pub struct StreamingResponse {
    pub status: StatusCode,
    /// Upstream response headers minus connection-scoped ones.
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, Infallible>>,
}

/// Why a single attempt failed. Both kinds are transport-level and count
/// against the breaker; a completed exchange never lands here regardless
/// of its status code.
enum AttemptError {
    Timeout,
    Unreachable(String),
}

impl AttemptError {
    fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            AttemptError::Timeout
        } else {
            AttemptError::Unreachable(e.to_string())
        }
    }

    fn into_gateway_error(self, upstream: UpstreamId) -> GatewayError {
        match self {
            AttemptError::Timeout => GatewayError::UpstreamTimeout { upstream },
            AttemptError::Unreachable(detail) => {
                GatewayError::UpstreamUnreachable { upstream, detail }
            }
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Timeout => write!(f, "deadline elapsed"),
            AttemptError::Unreachable(detail) => write!(f, "{detail}"),
        }
    }
}

// =============================================================================
// UpstreamClient
// =============================================================================

/// Shared HTTP client for all upstream traffic.
///
/// One connection pool serves both upstreams; deadlines and retry policy
/// come from configuration per target.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl UpstreamClient {
    /// Build the client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the underlying HTTP client cannot
    /// be constructed.
    pub fn new(config: Arc<Config>) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Forward a non-streaming request and buffer the complete response.
    ///
    /// Transport failures (connect error, timeout) are retried with
    /// jittered exponential backoff when `retry_safe` allows it, never for
    /// half-open trial calls, and the permit records only the final
    /// outcome: transient blips inside one logical call must not flap the
    /// breaker.
    #[instrument(skip(self, request, permit), fields(upstream = %upstream))]
    pub async fn call(
        &self,
        upstream: UpstreamId,
        request: &ProxyRequest,
        permit: CallPermit,
        retry_safe: bool,
    ) -> GatewayResult<ProxyResponse> {
        let deadline = self.config.upstream_timeout(upstream);
        let max_retries = if retry_safe && !permit.is_trial() {
            self.config.upstream_max_retries
        } else {
            0
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(upstream, request, deadline).await {
                Ok(response) => {
                    permit.succeed();
                    return Ok(response);
                }
                Err(e) if attempt <= max_retries => {
                    let delay = retry_delay(
                        attempt,
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                    );
                    warn!(
                        upstream = %upstream,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream attempt failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    permit.fail();
                    return Err(e.into_gateway_error(upstream));
                }
            }
        }
    }

    /// Open a streaming exchange and hand back the live relay.
    ///
    /// The deadline covers connect through response headers; chunk gaps are
    /// bounded separately by the relay's read timeout. Never retried: once
    /// output may have started flowing there is nothing safe to replay.
    #[instrument(skip(self, request, permit), fields(upstream = %upstream))]
    pub async fn call_stream(
        &self,
        upstream: UpstreamId,
        request: &ProxyRequest,
        permit: CallPermit,
    ) -> GatewayResult<StreamingResponse> {
        let deadline = self.config.upstream_timeout(upstream);
        let send = self.request_builder(upstream, request).send();

        let response = match tokio::time::timeout(deadline, send).await {
            Err(_) => {
                permit.fail();
                return Err(GatewayError::UpstreamTimeout { upstream });
            }
            Ok(Err(e)) => {
                let attempt_error = AttemptError::from_reqwest(&e);
                permit.fail();
                return Err(attempt_error.into_gateway_error(upstream));
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let headers = forwardable_headers(response.headers());
        let body = relay_sse(
            upstream,
            response.bytes_stream(),
            permit,
            self.config.stream_read_timeout,
        );

        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }

    /// One bounded request/response exchange.
    async fn attempt(
        &self,
        upstream: UpstreamId,
        request: &ProxyRequest,
        deadline: Duration,
    ) -> Result<ProxyResponse, AttemptError> {
        let exchange = async {
            let response = self.request_builder(upstream, request).send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(ProxyResponse { status, body })
        };

        match tokio::time::timeout(deadline, exchange).await {
            Err(_) => Err(AttemptError::Timeout),
            Ok(Err(e)) => Err(AttemptError::from_reqwest(&e)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn request_builder(
        &self,
        upstream: UpstreamId,
        request: &ProxyRequest,
    ) -> reqwest::RequestBuilder {
        let url = build_url(self.config.upstream_url(upstream), request);
        self.http
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .body(request.body.clone())
    }
}

/// Join base URL, rewritten path and original query string.
fn build_url(base: &str, request: &ProxyRequest) -> String {
    let base = base.trim_end_matches('/');
    match &request.query {
        Some(query) => format!("{base}{}?{query}", request.path),
        None => format!("{base}{}", request.path),
    }
}

/// Backoff delay before retry number `attempt` (1-indexed): doubling from
/// the base, capped, with ±20% jitter.
fn retry_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms =
        (base_ms * 2u64.saturating_pow(attempt.saturating_sub(1))).min(cap.as_millis() as u64);

    let jitter = (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
    let final_delay = (delay_ms as i64 + jitter).max(MIN_RETRY_DELAY_MS as i64) as u64;
    Duration::from_millis(final_delay)
}

/// Random value in 0.0..1.0 from the thread-local RNG.
fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwardable_headers_strips_connection_scoped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("host", HeaderValue::from_static("gateway.local"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        let filtered = forwardable_headers(&headers);

        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(filtered.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_forwardable_headers_keeps_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let filtered = forwardable_headers(&headers);
        let values: Vec<_> = filtered.get_all("x-tag").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_build_url_joins_base_path_and_query() {
        let request = ProxyRequest {
            method: Method::GET,
            path: "/api/auth/me".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };

        assert_eq!(
            build_url("http://localhost:8000", &request),
            "http://localhost:8000/api/auth/me"
        );
        assert_eq!(
            build_url("http://localhost:8000/", &request),
            "http://localhost:8000/api/auth/me"
        );

        let request = ProxyRequest {
            query: Some("page=2&limit=10".to_string()),
            ..request
        };
        assert_eq!(
            build_url("http://localhost:8000", &request),
            "http://localhost:8000/api/auth/me?page=2&limit=10"
        );
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);

        // Bounds widened by the ±20% jitter
        let first = retry_delay(1, base, cap).as_millis() as u64;
        assert!((80..=120).contains(&first), "first delay {first}ms");

        let second = retry_delay(2, base, cap).as_millis() as u64;
        assert!((160..=240).contains(&second), "second delay {second}ms");

        // Far past the cap, the delay stays at cap ± jitter
        let capped = retry_delay(8, base, cap).as_millis() as u64;
        assert!((800..=1200).contains(&capped), "capped delay {capped}ms");
    }

    #[test]
    fn test_retry_delay_respects_floor() {
        let tiny = retry_delay(1, Duration::from_millis(1), Duration::from_millis(1));
        assert!(tiny >= Duration::from_millis(MIN_RETRY_DELAY_MS));
    }

    #[test]
    fn test_rand_jitter_stays_in_unit_range() {
        for _ in 0..100 {
            let value = rand_jitter();
            assert!((0.0..1.0).contains(&value));
        }
    }
}
