//! # LilFox Gateway
//!
//! A resilient API gateway that fronts the LilFox auth and model services,
//! featuring:
//!
//! - **Resilience**: Per-upstream circuit breakers, retries with jittered
//!   exponential backoff, request and stream timeouts
//! - **Admission Control**: Fixed-window rate limiting keyed by user or
//!   client IP, with per-tier limits
//! - **Security**: Local JWT verification, trusted-proxy gating for
//!   forwarded headers, auth-failure throttling
//! - **Observability**: Request IDs, structured logging, Prometheus
//!   metrics, health and service-status endpoints
//!
//! ## Architecture
//!
//! Request flow, top to bottom:
//!
//! 1. Axum listener with the middleware stack (request ID, auth, rate
//!    limit, trace, CORS)
//! 2. Handlers: `/health` and `/services` answered locally, everything
//!    else through the proxy fallback
//! 3. [`UpstreamClient`] with retries, per-upstream timeouts, and the SSE
//!    relay for streaming routes
//! 4. A [`CircuitBreakerBank`] holding one breaker per upstream
//! 5. The auth service (`:8000`) and the model service (`:8001`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lilfox_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = AppState::new(Config::from_env()?)?;
//!     let router = build_router(state);
//!     // hand `router` to axum::serve
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Enable local bearer token verification:
//! ```bash
//! JWT_SECRET=your-secret-key cargo run
//! ```
//!
//! Honor forwarded client-IP headers from a reverse proxy:
//! ```bash
//! TRUSTED_PROXIES=10.0.0.0/8,127.0.0.1 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod router;
pub mod routes;
pub mod state;
pub mod upstream;
pub mod utils;

// Convenience re-exports of the assembly types
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use router::{Route, RouteTable, Tier, UpstreamId};
pub use routes::build_router;
pub use state::AppState;
pub use upstream::{CircuitBreaker, CircuitBreakerBank, CircuitState, UpstreamClient};
