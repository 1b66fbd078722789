//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed by a dedicated HTTP listener on the configured
//! metrics port, keeping scrape traffic off the proxy listener.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Admitted requests (label: tier)
//! - `gateway_requests_rejected_total` - Rate-limited requests (label: tier)
//! - `gateway_breaker_rejections_total` - Requests refused while a circuit
//!   is open (label: upstream)
//! - `gateway_stream_chunks_total` - SSE chunks relayed (label: upstream)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - End-to-end latency at the gateway
//!   (labels: method, status)
//! - `gateway_upstream_latency_seconds` - Unary upstream exchange latency
//!   (label: upstream)
//!
//! ## Gauges
//! - `gateway_circuit_breaker_state` - 0 = closed, 1 = half-open, 2 = open
//!   (label: upstream)
//! - `gateway_active_streams` - Streams currently being relayed
//! - `gateway_rate_limit_keys` - Live entries in the rate-limit table
//!
//! # Usage
//!
//! ```rust,ignore
//! use lilfox_gateway::metrics::{try_init_metrics, record_request};
//!
//! // Initialize once at startup
//! try_init_metrics("0.0.0.0:9090".parse()?);
//!
//! // Record from the hot path
//! record_request("authenticated");
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUESTS_REJECTED_TOTAL: &str = "gateway_requests_rejected_total";
    pub const BREAKER_REJECTIONS_TOTAL: &str = "gateway_breaker_rejections_total";
    pub const STREAM_CHUNKS_TOTAL: &str = "gateway_stream_chunks_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const UPSTREAM_LATENCY_SECONDS: &str = "gateway_upstream_latency_seconds";
    pub const CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
    pub const ACTIVE_STREAMS: &str = "gateway_active_streams";
    pub const RATE_LIMIT_KEYS: &str = "gateway_rate_limit_keys";
}

/// Initialize the Prometheus metrics exporter.
///
/// Starts the scrape listener on `metrics_addr` and registers metric
/// descriptions.
///
/// # Errors
///
/// Returns an error message if the exporter cannot be installed (port in
/// use, or a second install in the same process).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Prometheus exporter install failed: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Requests admitted past rate limiting");
    describe_counter!(
        names::REQUESTS_REJECTED_TOTAL,
        "Requests rejected by rate limiting"
    );
    describe_counter!(
        names::BREAKER_REJECTIONS_TOTAL,
        "Requests rejected while an upstream circuit was open"
    );
    describe_counter!(
        names::STREAM_CHUNKS_TOTAL,
        "SSE chunks relayed to streaming clients"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "End-to-end request duration at the gateway in seconds"
    );
    describe_histogram!(
        names::UPSTREAM_LATENCY_SECONDS,
        "Unary upstream exchange duration in seconds"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state per upstream (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_gauge!(names::ACTIVE_STREAMS, "Streams currently being relayed");
    describe_gauge!(
        names::RATE_LIMIT_KEYS,
        "Live (tier, key) entries in the rate-limit table"
    );

    info!(addr = %metrics_addr, "Prometheus exporter listening");
    Ok(())
}

/// Best-effort variant of [`init_metrics`].
///
/// Proxying works without the exporter; a lost scrape endpoint is not a
/// reason to refuse traffic.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Metrics exporter unavailable, continuing without it");
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Record an admitted request.
pub fn record_request(tier: &str) {
    counter!(names::REQUESTS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a rate-limit rejection.
pub fn record_rate_limit_rejection(tier: &str) {
    counter!(names::REQUESTS_REJECTED_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a request refused because the upstream circuit was open.
pub fn record_breaker_rejection(upstream: &str) {
    counter!(names::BREAKER_REJECTIONS_TOTAL, "upstream" => upstream.to_string()).increment(1);
}

/// Record one relayed SSE chunk.
pub fn record_chunk_forwarded(upstream: &str) {
    counter!(names::STREAM_CHUNKS_TOTAL, "upstream" => upstream.to_string()).increment(1);
}

// =============================================================================
// Histograms
// =============================================================================

/// Record end-to-end request duration.
pub fn record_request_duration(method: &str, status: u16, duration: Duration) {
    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a completed unary upstream exchange.
pub fn record_upstream_latency(upstream: &str, duration: Duration) {
    histogram!(names::UPSTREAM_LATENCY_SECONDS, "upstream" => upstream.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Gauges
// =============================================================================

/// Update the circuit breaker state gauge for one upstream.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(upstream: &str, state: u8) {
    gauge!(names::CIRCUIT_BREAKER_STATE, "upstream" => upstream.to_string())
        .set(f64::from(state));
}

/// A relay started.
pub fn record_stream_opened() {
    gauge!(names::ACTIVE_STREAMS).increment(1.0);
}

/// A relay finished, cleanly or not.
pub fn record_stream_closed() {
    gauge!(names::ACTIVE_STREAMS).decrement(1.0);
}

/// Update the live rate-limit key count.
pub fn set_rate_limit_keys(count: usize) {
    gauge!(names::RATE_LIMIT_KEYS).set(count as f64);
}
