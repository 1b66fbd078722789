//! Chunk-by-chunk relay of streaming upstream responses.
//!
//! The relay forwards Server-Sent-Events bytes to the client exactly as they
//! arrive: no buffering of the full body, no reframing, order preserved. The
//! stream ends when the upstream sends its `data: [DONE]` control frame
//! (forwarded, then closed), when the upstream connection closes, or when a
//! read stays silent past the configured timeout.
//!
//! Once any chunk has been forwarded the response is committed: a mid-stream
//! upstream failure closes the client stream without a retrofitted error
//! chunk, and the failure is recorded against the upstream's circuit
//! breaker. Dropping the relay (client disconnected) drops the upstream body
//! with it, which aborts the outbound read instead of draining data nobody
//! will see.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::{debug, warn};

use crate::metrics;
use crate::router::UpstreamId;
use crate::upstream::circuit_breaker::CallPermit;

/// SSE control line that terminates a generation stream.
const DONE_SENTINEL: &[u8] = b"data: [DONE]";

/// Longest line the sentinel scanner tracks. Data lines can be arbitrarily
/// long; anything past this cannot be the control frame.
const MAX_SCAN_LINE: usize = 8 * 1024;

/// Relay an upstream SSE body to the client.
///
/// Consumes the breaker permit for the call: the sentinel frame or a clean
/// upstream close records success, everything else (transport error, silent
/// upstream, client disconnect) records failure. The returned stream never
/// yields an error item; partial output already sent cannot be retracted,
/// so failures just end it.
pub fn relay_sse<S, E>(
    upstream_id: UpstreamId,
    body: S,
    permit: CallPermit,
    read_timeout: Duration,
) -> BoxStream<'static, Result<Bytes, Infallible>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut body = Box::pin(body);
        let mut guard = StreamGuard::new(permit);
        let mut scanner = SentinelScanner::default();

        loop {
            match tokio::time::timeout(read_timeout, body.next()).await {
                Err(_) => {
                    warn!(
                        upstream = %upstream_id,
                        timeout_secs = read_timeout.as_secs(),
                        "Stream went silent, closing relay"
                    );
                    guard.fail();
                    break;
                }
                Ok(None) => {
                    debug!(upstream = %upstream_id, "Upstream closed stream");
                    guard.succeed();
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(upstream = %upstream_id, error = %e, "Stream failed mid-relay");
                    guard.fail();
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    let done = scanner.observe(&chunk);
                    metrics::record_chunk_forwarded(upstream_id.as_str());
                    yield Ok(chunk);
                    if done {
                        debug!(upstream = %upstream_id, "Stream finished with sentinel");
                        guard.succeed();
                        break;
                    }
                }
            }
        }
    };

    stream.boxed()
}

/// Ties the relay's lifetime to its breaker permit and the active-stream
/// gauge. If the relay is dropped before an explicit outcome, the contained
/// permit drops unconsumed and records a failure on its own.
struct StreamGuard {
    permit: Option<CallPermit>,
}

impl StreamGuard {
    fn new(permit: CallPermit) -> Self {
        metrics::record_stream_opened();
        Self {
            permit: Some(permit),
        }
    }

    fn succeed(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.succeed();
        }
    }

    fn fail(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.fail();
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        metrics::record_stream_closed();
    }
}

/// Detects the `data: [DONE]` control line across arbitrary chunk splits.
///
/// Line-based on purpose: a data frame whose JSON payload merely contains
/// the sentinel text must not end the stream.
#[derive(Default)]
struct SentinelScanner {
    line: Vec<u8>,
    discarding: bool,
}

impl SentinelScanner {
    /// Feed one chunk; returns true if a completed line matched the sentinel.
    fn observe(&mut self, chunk: &[u8]) -> bool {
        let mut found = false;
        for &byte in chunk {
            if byte == b'\n' {
                if !self.discarding && line_matches_sentinel(&self.line) {
                    found = true;
                }
                self.line.clear();
                self.discarding = false;
            } else if !self.discarding {
                self.line.push(byte);
                if self.line.len() > MAX_SCAN_LINE {
                    self.line.clear();
                    self.discarding = true;
                }
            }
        }
        found
    }
}

fn line_matches_sentinel(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line == DONE_SENTINEL
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures::stream;

    use crate::upstream::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitState,
    };

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Stand-in for a transport error; reqwest errors cannot be constructed
    /// directly in tests.
    #[derive(Debug)]
    struct BrokenPipe;

    impl std::fmt::Display for BrokenPipe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "connection reset by peer")
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            UpstreamId::ModelService,
            CircuitBreakerConfig::new(threshold, Duration::from_secs(30), 1),
        )
    }

    fn chunk(text: &str) -> Result<Bytes, BrokenPipe> {
        Ok(Bytes::from(text.to_string()))
    }

    async fn collect(
        mut relayed: BoxStream<'static, Result<Bytes, Infallible>>,
    ) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(item) = relayed.next().await {
            let bytes = item.unwrap();
            out.push(String::from_utf8(bytes.to_vec()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_relay_preserves_order_and_stops_after_sentinel() {
        let cb = breaker(1);
        let permit = cb.try_acquire().unwrap();

        let body = stream::iter(vec![
            chunk("data: {\"delta\":\"he\"}\n\n"),
            chunk("data: {\"delta\":\"llo\"}\n\n"),
            chunk("data: [DONE]\n\n"),
            chunk("data: {\"delta\":\"never\"}\n\n"),
        ]);

        let relayed = relay_sse(UpstreamId::ModelService, body, permit, READ_TIMEOUT);
        let chunks = collect(relayed).await;

        assert_eq!(
            chunks,
            vec![
                "data: {\"delta\":\"he\"}\n\n",
                "data: {\"delta\":\"llo\"}\n\n",
                "data: [DONE]\n\n",
            ]
        );
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_clean_upstream_close_counts_as_success() {
        let cb = breaker(2);
        // One prior failure; a successful relay must reset the counter
        cb.try_acquire().unwrap().fail();

        let permit = cb.try_acquire().unwrap();
        let body = stream::iter(vec![chunk("data: {\"delta\":\"hi\"}\n\n")]);

        let relayed = relay_sse(UpstreamId::ModelService, body, permit, READ_TIMEOUT);
        let chunks = collect(relayed).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_close_without_sentinel_is_clean_termination() {
        let cb = breaker(1);
        let permit = cb.try_acquire().unwrap();

        let body = stream::iter(vec![
            chunk("data: {\"delta\":\"par\"}\n\n"),
            chunk("data: {\"delta\":\"tial\"}\n\n"),
        ]);

        let relayed = relay_sse(UpstreamId::ModelService, body, permit, READ_TIMEOUT);
        let chunks = collect(relayed).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transport_error_closes_quietly_and_records_failure() {
        let cb = breaker(1);
        let permit = cb.try_acquire().unwrap();

        // Upstream dies after two chunks without ever sending the sentinel
        let body = stream::iter(vec![
            chunk("data: {\"delta\":\"par\"}\n\n"),
            chunk("data: {\"delta\":\"tial\"}\n\n"),
            Err(BrokenPipe),
        ]);

        let relayed = relay_sse(UpstreamId::ModelService, body, permit, READ_TIMEOUT);
        let chunks = collect(relayed).await;

        // Both forwarded chunks arrive, then the stream just ends: no
        // retrofitted error frame after partial output
        assert_eq!(chunks.len(), 2);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out_and_records_failure() {
        let cb = breaker(1);
        let permit = cb.try_acquire().unwrap();

        let body = stream::pending::<Result<Bytes, BrokenPipe>>();
        let relayed = relay_sse(
            UpstreamId::ModelService,
            body,
            permit,
            Duration::from_millis(20),
        );
        let chunks = collect(relayed).await;

        assert!(chunks.is_empty());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_client_disconnect_aborts_relay_and_records_failure() {
        let cb = breaker(1);
        let permit = cb.try_acquire().unwrap();

        let body = stream::iter(vec![
            chunk("data: {\"n\":1}\n\n"),
            chunk("data: {\"n\":2}\n\n"),
        ])
        .chain(stream::pending());

        let mut relayed = relay_sse(UpstreamId::ModelService, body, permit, READ_TIMEOUT);
        assert!(relayed.next().await.is_some());
        assert!(relayed.next().await.is_some());

        // Client goes away after two chunks: dropping the relay must record
        // the abandoned call as a failure instead of draining upstream
        drop(relayed);

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_sentinel_detected_across_chunk_boundaries() {
        let mut scanner = SentinelScanner::default();
        assert!(!scanner.observe(b"data: [DO"));
        assert!(scanner.observe(b"NE]\n\n"));
    }

    #[test]
    fn test_sentinel_accepts_crlf_line_endings() {
        let mut scanner = SentinelScanner::default();
        assert!(scanner.observe(b"data: [DONE]\r\n\r\n"));
    }

    #[test]
    fn test_sentinel_inside_payload_is_ignored() {
        let mut scanner = SentinelScanner::default();
        assert!(!scanner.observe(b"data: {\"text\":\"data: [DONE]\"}\n\n"));

        let mut scanner = SentinelScanner::default();
        assert!(!scanner.observe(b"data: [DONE] trailing\n"));
    }

    #[test]
    fn test_oversized_line_cannot_match() {
        let mut scanner = SentinelScanner::default();
        let long = vec![b'x'; MAX_SCAN_LINE + 10];
        assert!(!scanner.observe(&long));
        // The discarded line's newline resets scanning for the next line
        assert!(!scanner.observe(b"\n"));
        assert!(scanner.observe(b"data: [DONE]\n"));
    }
}
