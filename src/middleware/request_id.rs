//! Request ID and response timing middleware.
//!
//! # Features
//!
//! - Generates UUIDv4 request IDs for incoming requests without one
//! - Propagates existing `X-Request-ID` headers (clients can correlate)
//! - Stamps `X-Request-ID` and `X-Response-Time` on every response
//! - Records the request-duration histogram
//!
//! The ID is written back into the request headers before the inner
//! service runs, so downstream layers and the proxy handler can forward
//! the same ID to upstream calls:
//!
//! ```bash
//! curl -H "X-Request-ID: my-correlation-id" http://localhost:8080/health
//! ```

use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

use crate::metrics;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header name for total gateway processing time.
pub const RESPONSE_TIME_HEADER: &str = "x-response-time";

/// Longest inbound ID honored. The ID is client-controlled bytes that get
/// forwarded upstream and logged; anything longer is replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Stamps every request with an `x-request-id` and times the round trip.
///
/// Sits outermost in the stack so rejections from inner layers still carry
/// the tracking headers. A unit struct; apply it with `.layer(RequestIdLayer)`.
#[derive(Clone, Copy, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Service half of [`RequestIdLayer`].
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Response<Body>, S::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let (request_id, id_value) = resolve_request_id(&req);
        let method = req.method().clone();

        // Write the ID back so handlers and upstream calls see the same one
        req.headers_mut().insert(REQUEST_ID_HEADER, id_value.clone());

        Span::current().record("request_id", request_id.as_str());

        let started = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let elapsed = started.elapsed();

            response.headers_mut().insert(REQUEST_ID_HEADER, id_value);

            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            if let Ok(value) = HeaderValue::from_str(&format!("{elapsed_ms:.2}ms")) {
                response.headers_mut().insert(RESPONSE_TIME_HEADER, value);
            }

            metrics::record_request_duration(method.as_str(), response.status().as_u16(), elapsed);
            debug!(
                request_id = %request_id,
                status = response.status().as_u16(),
                elapsed_ms = format!("{elapsed_ms:.2}"),
                "Request completed"
            );

            Ok(response)
        })
    }
}

/// The request's ID as both a loggable string and a ready header value.
///
/// An inbound `X-Request-ID` is honored when it is non-empty and within the
/// length bound; otherwise a fresh UUID is minted. Resolving the header
/// value here means request and response stamping never re-parse the ID.
fn resolve_request_id<B>(req: &Request<B>) -> (String, HeaderValue) {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(id) = value.to_str()
        && !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
    {
        return (id.to_string(), value.clone());
    }

    let fresh = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value
    let value = HeaderValue::from_str(&fresh)
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    (fresh, value)
}

/// Read-side access to the ID this middleware stamped on a request.
pub trait RequestIdExt {
    /// The `x-request-id` value, if one is present yet.
    fn request_id(&self) -> Option<String>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<String> {
        let raw = self.headers().get(REQUEST_ID_HEADER)?;
        raw.to_str().ok().map(str::to_owned)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_request_id_is_honored() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        let (id, value) = resolve_request_id(&req);
        assert_eq!(id, "existing-id-123");
        assert_eq!(value, "existing-id-123");
    }

    #[test]
    fn test_missing_header_mints_uuid() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let (id, value) = resolve_request_id(&req);
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(value.to_str().unwrap(), id);
    }

    #[test]
    fn test_empty_header_mints_fresh_id() {
        let req = Request::builder()
            .header("x-request-id", "")
            .body(Body::empty())
            .unwrap();

        let (id, _) = resolve_request_id(&req);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_oversized_inbound_id_is_replaced() {
        let oversized = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        let req = Request::builder()
            .header("x-request-id", oversized)
            .body(Body::empty())
            .unwrap();

        let (id, _) = resolve_request_id(&req);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_ext_reads_stamped_header() {
        let req = Request::builder()
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(req.request_id().as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_ext_without_header_is_none() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(req.request_id().is_none());
    }
}
