//! Router assembly: the two local routes, the proxy fallback, and the
//! middleware wrapped around them.
//!
//! # Middleware Stack
//!
//! Runtime order, outermost first:
//!
//! ```text
//! request id -> auth -> rate limit -> trace -> cors -> body cap -> handler
//! ```
//!
//! Request ID stamps tracking headers on everything, including rejections
//! from the layers inside it. Auth resolves the route once and attaches the
//! match plus any verified identity; rate limiting charges the right
//! counter based on both. Tracing and CORS are stock tower-http.
//!
//! # Route Groups
//!
//! - `/health`, `/services` - served locally by the gateway itself
//! - Everything else falls through to the proxy handler, which forwards
//!   table-matched paths upstream and returns 404 for the rest
//!
//! The proxy lives in the fallback rather than in per-path routes so the
//! route table stays the single source of truth for what the gateway
//! forwards. Note that axum answers 405 for a known path with the wrong
//! method before the fallback runs; only the local routes are affected,
//! since proxied paths are never registered with the router.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers;
use crate::middleware::{AuthLayer, RateLimitLayer, RequestIdLayer};
use crate::state::AppState;

/// Build the application router: local routes, the proxy fallback, and the
/// middleware stack.
///
/// What each configurable layer takes from `state.config`:
///
/// - **Authentication**: bearer verification enabled if `JWT_SECRET` is set;
///   without it, tokens pass through to the auth service unverified
/// - **Rate Limiting**: always on, with per-tier limits from config
/// - **CORS**: configured from `cors_allowed_origins`
///
/// # Arguments
///
/// * `state` - Shared application state (route table, limiter, breakers)
///
/// # Returns
///
/// The router, ready to serve.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let cors = build_cors_layer(&config.cors_allowed_origins);

    let mut router = Router::new()
        // Gateway-local endpoints (never proxied)
        .route("/health", get(handlers::health_check))
        .route("/services", get(handlers::list_services))
        // Everything else goes through the proxy
        .fallback(handlers::proxy_request);

    // =========================================================================
    // Middleware stack (order matters: applied bottom to top)
    // =========================================================================

    // 1. Request body cap - proxied bodies are buffered, so bound them
    info!(
        max_bytes = config.max_request_body_size,
        "Request body limit configured"
    );
    let body_cap = DefaultBodyLimit::max(config.max_request_body_size);

    // 2. CORS, from the configured origin list
    // 3. Request/response tracing outside it
    router = router
        .layer(body_cap)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // 4. Rate limiting - reads the route and identity the auth layer attaches
    info!(
        window_secs = config.rate_limit_window.as_secs(),
        unauthenticated = config.rate_limit_unauthenticated,
        authenticated = config.rate_limit_authenticated,
        default = config.rate_limit_default,
        "Rate limiting enabled"
    );
    router = router.layer(RateLimitLayer::new(
        state.limiter.clone(),
        state.config.clone(),
        state.trusted_proxies.clone(),
    ));

    // 5. Authentication - resolves the route and verifies bearer tokens
    let auth_layer = AuthLayer::new(
        state.table.clone(),
        config.jwt_secret.as_deref(),
        state.trusted_proxies.clone(),
    );
    if auth_layer.verification_enabled() {
        info!("Bearer token verification enabled");
    } else {
        info!("Bearer token verification disabled (no JWT_SECRET set), tokens forwarded upstream unverified");
    }
    router = router.layer(auth_layer);

    // 6. Request ID - applied last so every response, including middleware
    //    rejections, carries the tracking headers
    router = router.layer(RequestIdLayer);

    // Add state
    router.with_state(state)
}

/// CORS policy from the configured origin list.
///
/// A literal `"*"` anywhere in the list opens the surface to any origin,
/// which suits development; deployments should list explicit origins.
/// Entries that fail to parse as an origin are logged and skipped.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            let parsed = origin.parse::<HeaderValue>().ok();
            if parsed.is_none() {
                warn!(origin = %origin, "Invalid CORS origin ignored");
            }
            parsed
        })
        .collect();

    base.allow_origin(origins)
}
