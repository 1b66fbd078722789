//! Bearer token identity middleware.
//!
//! # Responsibilities
//!
//! - **Route resolution**: the route table is consulted exactly once per
//!   request; the match is shared with later layers and the proxy handler
//!   through a request extension
//! - **Identity**: `Authorization: Bearer <jwt>` tokens are verified
//!   locally (HS256 against the shared secret) and the subject claim is
//!   attached as [`Identity`] for rate-limit keying
//! - **Enforcement**: routes flagged as protected get a 401 unless a
//!   verified identity is present
//! - **Brute force protection**: repeated verification failures from one
//!   client IP are answered with 429 instead of 401 once the per-IP
//!   failure budget is spent
//!
//! # Degraded Mode
//!
//! With no signing secret configured, verification is skipped entirely:
//! protected routes still forward the `Authorization` header and the auth
//! upstream enforces identity itself. Callers are then limited under the
//! unauthenticated tier.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, header};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as KeyedLimiter};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::middleware::ip::{TrustedProxyConfig, client_ip};
use crate::router::{ResolvedRoute, RouteTable};
use crate::utils::epoch_seconds;

/// Maximum token verification failures per IP per minute.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Burst allowance on top of the sustained failure rate.
const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

/// Per-IP limiter tracking verification failures.
type AuthFailureLimiter = KeyedLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Verified caller identity, attached as a request extension.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Subject claim of the verified token: the upstream user id.
    pub user_id: String,
}

/// Claims required from a bearer token. Extra claims are ignored.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Identity layer for the Tower middleware stack.
#[derive(Clone)]
pub struct AuthLayer {
    table: Arc<RouteTable>,
    decoding_key: Option<Arc<DecodingKey>>,
    validation: Arc<Validation>,
    trusted_proxies: Arc<TrustedProxyConfig>,
    /// Present only when verification is enabled.
    failure_limiter: Option<Arc<AuthFailureLimiter>>,
}

impl AuthLayer {
    /// Create the layer. `secret` of `None` disables local verification.
    pub fn new(
        table: Arc<RouteTable>,
        secret: Option<&str>,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        let decoding_key = secret.map(|s| Arc::new(DecodingKey::from_secret(s.as_bytes())));
        let failure_limiter = decoding_key.is_some().then(|| {
            let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
            Arc::new(KeyedLimiter::keyed(quota))
        });

        Self {
            table,
            decoding_key,
            validation: Arc::new(Validation::new(Algorithm::HS256)),
            trusted_proxies,
            failure_limiter,
        }
    }

    /// Whether bearer tokens are verified locally.
    pub fn verification_enabled(&self) -> bool {
        self.decoding_key.is_some()
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            table: self.table.clone(),
            decoding_key: self.decoding_key.clone(),
            validation: self.validation.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            failure_limiter: self.failure_limiter.clone(),
            inner,
        }
    }
}

/// Identity service wrapper.
#[derive(Clone)]
pub struct AuthService<S> {
    table: Arc<RouteTable>,
    decoding_key: Option<Arc<DecodingKey>>,
    validation: Arc<Validation>,
    trusted_proxies: Arc<TrustedProxyConfig>,
    failure_limiter: Option<Arc<AuthFailureLimiter>>,
    inner: S,
}

impl<S> Service<Request<Body>> for AuthService<S>
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
        // Resolve once; every later decision reuses this match
        let route = self.table.resolve(req.method(), req.uri().path()).cloned();
        if let Some(ref route) = route {
            req.extensions_mut().insert(ResolvedRoute(route.clone()));
        }

        let decoding_key = self.decoding_key.clone();
        let validation = self.validation.clone();
        let trusted_proxies = self.trusted_proxies.clone();
        let failure_limiter = self.failure_limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(route) = route else {
                // Unmatched requests fall through to the 404 fallback
                return inner.call(req).await;
            };

            let token = bearer_token(&req).map(str::to_string);

            match (&token, &decoding_key) {
                (Some(token), Some(key)) => {
                    match decode_identity(token, key, &validation) {
                        Ok(identity) => {
                            debug!(user_id = %identity.user_id, "Bearer token verified");
                            req.extensions_mut().insert(identity);
                        }
                        Err(e) => {
                            let ip = client_ip(&req, &trusted_proxies).into_owned();

                            // Each failure spends one cell; an empty budget
                            // turns further failures into 429s
                            if let Some(ref limiter) = failure_limiter
                                && let Err(not_until) = limiter.check_key(&ip)
                            {
                                let wait =
                                    not_until.wait_time_from(DefaultClock::default().now());
                                let retry_after = wait.as_secs().max(1);
                                warn!(
                                    client_ip = %ip,
                                    retry_after_secs = retry_after,
                                    "Throttling token verification after repeated failures"
                                );
                                let error = GatewayError::RateLimited {
                                    limit: AUTH_FAILURE_LIMIT.get(),
                                    retry_after,
                                    reset_epoch: epoch_seconds() + retry_after as i64,
                                };
                                return Ok(error.into_response());
                            }

                            warn!(
                                client_ip = %ip,
                                path = %req.uri().path(),
                                error = %e,
                                "Bearer token rejected"
                            );
                            if route.requires_auth {
                                let error = GatewayError::Unauthenticated(
                                    "invalid or expired token".to_string(),
                                );
                                return Ok(error.into_response());
                            }
                            // Open routes treat a bad token as anonymous
                        }
                    }
                }
                (None, Some(_)) if route.requires_auth => {
                    let error =
                        GatewayError::Unauthenticated("missing bearer token".to_string());
                    return Ok(error.into_response());
                }
                // Verification disabled: the auth upstream enforces identity
                _ => {}
            }

            inner.call(req).await
        })
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
///
/// Scheme matching is case-insensitive per RFC 7235.
fn bearer_token<B>(req: &Request<B>) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Verify signature and expiry, yielding the caller identity.
fn decode_identity(
    token: &str,
    key: &DecodingKey,
    validation: &Validation,
) -> Result<Identity, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(token, key, validation)?;
    Ok(Identity {
        user_id: data.claims.sub,
    })
}
