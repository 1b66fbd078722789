//! Request admission middleware over the fixed-window limiter.
//!
//! # Keying
//!
//! Each matched request is charged against exactly one `(tier, key)`
//! counter:
//!
//! - **tier** comes from the resolved route and the presence of a verified
//!   identity (see [`Route::tier`])
//! - **key** is the verified user id when one exists, else the client IP
//!
//! Counters are shared across all routes of the same tier, so a caller
//! cannot multiply their quota by spreading requests over paths.
//!
//! # Response Headers
//!
//! Admitted responses carry `X-RateLimit-Limit`, `X-RateLimit-Remaining`
//! and `X-RateLimit-Reset` (epoch seconds). Rejections get a 429 envelope
//! with `retry_after` in the data payload plus the same headers.
//!
//! Unmatched requests bypass admission entirely; they terminate at the 404
//! fallback without consuming anyone's quota.
//!
//! [`Route::tier`]: crate::router::Route::tier

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use crate::config::Config;
use crate::error::{
    GatewayError, X_RATE_LIMIT_LIMIT, X_RATE_LIMIT_REMAINING, X_RATE_LIMIT_RESET,
};
use crate::limiter::{Decision, LimitKey, RateLimiter};
use crate::metrics;
use crate::middleware::auth::Identity;
use crate::middleware::ip::{TrustedProxyConfig, client_ip};
use crate::router::ResolvedRoute;

/// Admission layer for the Tower middleware stack.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    config: Arc<Config>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitLayer {
    /// Create the layer. Tier limits and the window come from `config`.
    pub fn new(
        limiter: Arc<RateLimiter>,
        config: Arc<Config>,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        Self {
            limiter,
            config,
            trusted_proxies,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            inner,
        }
    }
}

/// Admission service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    limiter: Arc<RateLimiter>,
    config: Arc<Config>,
    trusted_proxies: Arc<TrustedProxyConfig>,
    inner: S,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let limiter = self.limiter.clone();
        let config = self.config.clone();
        let trusted_proxies = self.trusted_proxies.clone();

        Box::pin(async move {
            let Some(ResolvedRoute(route)) = req.extensions().get::<ResolvedRoute>().cloned()
            else {
                return inner.call(req).await;
            };

            let identity = req.extensions().get::<Identity>().cloned();
            let tier = route.tier(identity.is_some());
            let key = match identity {
                Some(identity) => LimitKey::User(identity.user_id),
                None => LimitKey::Ip(client_ip(&req, &trusted_proxies).into_owned()),
            };
            let limit = config.tier_limit(tier);

            match limiter.admit(tier, key.clone(), limit) {
                Decision::Admitted {
                    limit,
                    remaining,
                    reset_epoch,
                } => {
                    metrics::record_request(tier.as_str());
                    let mut response = inner.call(req).await?;
                    let headers = response.headers_mut();
                    headers.insert(X_RATE_LIMIT_LIMIT, HeaderValue::from(limit));
                    headers.insert(X_RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
                    headers.insert(X_RATE_LIMIT_RESET, HeaderValue::from(reset_epoch));
                    Ok(response)
                }
                Decision::Rejected {
                    limit,
                    retry_after,
                    reset_epoch,
                } => {
                    metrics::record_rate_limit_rejection(tier.as_str());
                    warn!(
                        key = %key,
                        tier = %tier,
                        path = %req.uri().path(),
                        retry_after_secs = retry_after,
                        "Rate limit exceeded"
                    );
                    let error = GatewayError::RateLimited {
                        limit,
                        retry_after,
                        reset_epoch,
                    };
                    Ok(error.into_response())
                }
            }
        })
    }
}
