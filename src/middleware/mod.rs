//! HTTP middleware for identity, admission control, and observability.
//!
//! # Pipeline
//!
//! ```text
//! Request → Request ID → Auth (resolve route, verify bearer) → Rate Limit → Handler
//!               ↓              ↓                                    ↓
//!        X-Request-ID     401 Unauthorized                  429 Too Many Requests
//!        X-Response-Time  ResolvedRoute / Identity ext      X-RateLimit-* headers
//! ```
//!
//! Route resolution happens once, in the auth layer; the admission layer
//! and the proxy handler read the match from request extensions rather
//! than re-running it.
//!
//! # Security Considerations
//!
//! - Bearer tokens are verified locally; repeated verification failures
//!   from one IP are throttled
//! - Forwarding headers are honored only from trusted proxy peers
//! - Unmatched paths skip admission and terminate at the 404 fallback

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod request_id;

pub use auth::{AuthLayer, Identity};
pub use ip::{TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::RateLimitLayer;
pub use request_id::{REQUEST_ID_HEADER, RESPONSE_TIME_HEADER, RequestIdExt, RequestIdLayer};
