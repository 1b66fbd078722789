//! Runtime configuration for the gateway process.
//!
//! Everything is read from environment variables once at startup. A `.env`
//! file is honored when present, and the fallback values are chosen so that
//! running against local upstreams needs no setup at all.
//!
//! # Security Knobs
//!
//! - `JWT_SECRET`: When set, bearer tokens are verified at the edge before
//!   authenticated routes are forwarded
//! - `CORS_ALLOWED_ORIGINS`: comma-separated origin allowlist, `*` by default
//! - `TRUSTED_PROXIES`: CIDR ranges whose `X-Forwarded-For` headers are honored
//!
//! # Traffic Shaping
//!
//! - `RATE_LIMIT_UNAUTHENTICATED` / `RATE_LIMIT_AUTHENTICATED` / `RATE_LIMIT_DEFAULT`:
//!   Requests admitted per fixed window for each tier (default window: 60s)
//! - `CIRCUIT_BREAKER_FAILURE_THRESHOLD`: Consecutive failures before an upstream
//!   is taken out of rotation (default: 5)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};
use crate::router::{Tier, UpstreamId};

/// Every tunable the gateway reads at startup, assembled once and shared
/// behind an `Arc` for the life of the process.
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// tracing::info!("listening on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Listener
    // =========================================================================
    /// Interface the listener binds (default `0.0.0.0`)
    pub host: String,

    /// Listener port (default 8080)
    pub port: u16,

    /// Cap on buffered request bodies in bytes (default 10 MiB).
    /// Proxied bodies are held in memory, so this bound is load-bearing.
    pub max_request_body_size: usize,

    // =========================================================================
    // Upstreams
    // =========================================================================
    /// Base URL of the auth service (default `http://localhost:8000`)
    pub auth_service_url: String,

    /// Base URL of the model service (default `http://localhost:8001`)
    pub model_service_url: String,

    /// Connect timeout applied to every outbound connection (default: 5s)
    pub connect_timeout: Duration,

    /// Deadline for a complete auth service exchange (default: 5s)
    pub auth_service_timeout: Duration,

    /// Deadline for a complete model service exchange (default: 30s)
    /// Generation endpoints are slow; keep this well above typical inference time
    pub model_service_timeout: Duration,

    /// Maximum silent gap between streamed chunks before the relay gives up
    /// and the attempt counts as a failure (default: 25s)
    pub stream_read_timeout: Duration,

    // =========================================================================
    // Retries
    // =========================================================================
    /// Maximum retries after the initial attempt, idempotent requests only
    /// (default: 2, 0 = never retry)
    pub upstream_max_retries: u32,

    /// Base delay before the first retry (exponential backoff applies)
    pub retry_base_delay: Duration,

    /// Cap on the backoff delay between retries
    pub retry_max_delay: Duration,

    // =========================================================================
    // Circuit Breakers
    // =========================================================================
    /// Consecutive failures that open a breaker (default 5)
    pub circuit_breaker_failure_threshold: u32,

    /// How long the circuit stays open before probing the upstream again (default: 30s)
    pub circuit_breaker_open_duration: Duration,

    /// In-flight probe budget while half-open (default: 1)
    pub circuit_breaker_max_trial_calls: u32,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// Fixed window length for all rate-limit tiers (default: 60s)
    pub rate_limit_window: Duration,

    /// Requests per window for callers without a verified identity (default: 20)
    /// The strictest tier; keyed by client IP
    pub rate_limit_unauthenticated: u32,

    /// Requests per window for callers with a verified identity (default: 100)
    /// Keyed by user id
    pub rate_limit_authenticated: u32,

    /// Requests per window for routes the gateway answers itself (default: 120)
    pub rate_limit_default: u32,

    /// Windows a counter may sit idle before it is evicted (default: 2)
    pub rate_limit_idle_windows: u32,

    /// Interval for the background eviction sweep (default: 60s)
    pub rate_limit_sweep_interval: Duration,

    // =========================================================================
    // Security
    // =========================================================================
    /// HMAC secret for verifying bearer tokens issued by the auth service.
    /// When unset, tokens are forwarded without edge verification and
    /// authenticated routes rely on the upstream to reject them.
    pub jwt_secret: Option<String>,

    /// Origin allowlist for CORS responses. A literal `*` entry admits any
    /// origin; keep that to development.
    pub cors_allowed_origins: Vec<String>,

    /// CIDR ranges whose `X-Forwarded-For` headers are believed, for example
    /// `10.0.0.0/8,172.16.0.0/12`. Empty means every peer's forwarded headers
    /// are taken at face value, acceptable only in development.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability
    // =========================================================================
    /// Tracing filter sourced from `RUST_LOG` (default `info`)
    pub log_level: String,

    /// Prometheus exporter port; `0` turns the exporter off (default 9090)
    pub metrics_port: u16,
}

impl Config {
    /// Read every variable, apply fallbacks, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` when a variable is set but malformed,
    /// or when the assembled configuration is inconsistent.
    pub fn from_env() -> GatewayResult<Self> {
        // A .env file is optional; a missing one is not an error
        let _ = dotenvy::dotenv();

        let config = Self {
            host: Self::env_or("HOST", "0.0.0.0"),
            port: Self::parse_env("PORT", 8080)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?,

            auth_service_url: Self::env_or("AUTH_SERVICE_URL", "http://localhost:8000"),
            model_service_url: Self::env_or("MODEL_SERVICE_URL", "http://localhost:8001"),
            connect_timeout: Self::parse_secs("CONNECT_TIMEOUT_SECS", 5)?,
            auth_service_timeout: Self::parse_secs("AUTH_SERVICE_TIMEOUT_SECS", 5)?,
            model_service_timeout: Self::parse_secs("MODEL_SERVICE_TIMEOUT_SECS", 30)?,
            stream_read_timeout: Self::parse_secs("STREAM_READ_TIMEOUT_SECS", 25)?,

            upstream_max_retries: Self::parse_env("UPSTREAM_MAX_RETRIES", 2)?,
            retry_base_delay: Self::parse_millis("RETRY_BASE_DELAY_MS", 100)?,
            retry_max_delay: Self::parse_millis("RETRY_MAX_DELAY_MS", 1000)?,

            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_open_duration: Self::parse_secs(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?,
            circuit_breaker_max_trial_calls: Self::parse_env("CIRCUIT_BREAKER_MAX_TRIAL_CALLS", 1)?,

            rate_limit_window: Self::parse_secs("RATE_LIMIT_WINDOW_SECS", 60)?,
            rate_limit_unauthenticated: Self::parse_env("RATE_LIMIT_UNAUTHENTICATED", 20)?,
            rate_limit_authenticated: Self::parse_env("RATE_LIMIT_AUTHENTICATED", 100)?,
            rate_limit_default: Self::parse_env("RATE_LIMIT_DEFAULT", 120)?,
            rate_limit_idle_windows: Self::parse_env("RATE_LIMIT_IDLE_WINDOWS", 2)?,
            rate_limit_sweep_interval: Self::parse_secs("RATE_LIMIT_SWEEP_INTERVAL_SECS", 60)?,

            jwt_secret: env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            cors_allowed_origins: Self::parse_env_list("CORS_ALLOWED_ORIGINS", "*"),
            trusted_proxies: Self::parse_env_list("TRUSTED_PROXIES", ""),

            log_level: Self::env_or("RUST_LOG", "info"),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` naming the offending variable.
    pub fn validate(&self) -> GatewayResult<()> {
        for (name, url) in [
            ("AUTH_SERVICE_URL", &self.auth_service_url),
            ("MODEL_SERVICE_URL", &self.model_service_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(GatewayError::Config(format!(
                    "{name} must start with http:// or https:// (got {url:?})"
                )));
            }
        }

        // Counts and sizes that are meaningless at zero
        let counts: [(&str, u64); 6] = [
            (
                "RATE_LIMIT_UNAUTHENTICATED",
                self.rate_limit_unauthenticated.into(),
            ),
            (
                "RATE_LIMIT_AUTHENTICATED",
                self.rate_limit_authenticated.into(),
            ),
            ("RATE_LIMIT_DEFAULT", self.rate_limit_default.into()),
            ("RATE_LIMIT_IDLE_WINDOWS", self.rate_limit_idle_windows.into()),
            (
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                self.circuit_breaker_failure_threshold.into(),
            ),
            (
                "CIRCUIT_BREAKER_MAX_TRIAL_CALLS",
                self.circuit_breaker_max_trial_calls.into(),
            ),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(GatewayError::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.max_request_body_size == 0 {
            return Err(GatewayError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".into(),
            ));
        }

        if self.rate_limit_window.is_zero() {
            return Err(GatewayError::Config(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".into(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(GatewayError::Config(format!(
                "RETRY_BASE_DELAY_MS ({:?}) must be <= RETRY_MAX_DELAY_MS ({:?})",
                self.retry_base_delay, self.retry_max_delay
            )));
        }

        // The unauthenticated tier is the strictest by contract
        if self.rate_limit_unauthenticated > self.rate_limit_authenticated {
            return Err(GatewayError::Config(format!(
                "RATE_LIMIT_UNAUTHENTICATED ({}) must be <= RATE_LIMIT_AUTHENTICATED ({})",
                self.rate_limit_unauthenticated, self.rate_limit_authenticated
            )));
        }

        Ok(())
    }

    /// Address string the listener binds, `host:port`.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL of the given upstream.
    pub fn upstream_url(&self, upstream: UpstreamId) -> &str {
        match upstream {
            UpstreamId::AuthService => &self.auth_service_url,
            UpstreamId::ModelService => &self.model_service_url,
        }
    }

    /// Per-upstream deadline for a complete (non-streaming) exchange.
    pub fn upstream_timeout(&self, upstream: UpstreamId) -> Duration {
        match upstream {
            UpstreamId::AuthService => self.auth_service_timeout,
            UpstreamId::ModelService => self.model_service_timeout,
        }
    }

    /// Requests admitted per window for the given tier.
    pub fn tier_limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Unauthenticated => self.rate_limit_unauthenticated,
            Tier::Authenticated => self.rate_limit_authenticated,
            Tier::Default => self.rate_limit_default,
        }
    }

    /// Check if bearer tokens are verified at the edge.
    pub fn auth_verification_enabled(&self) -> bool {
        self.jwt_secret.is_some()
    }

    /// Whether forwarded-for headers are restricted to declared proxy ranges.
    ///
    /// With no ranges configured, any peer can plant an `X-Forwarded-For`
    /// header and have it believed.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Whether a Prometheus exporter should be started at all.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Exporter bind address, or `None` when `METRICS_PORT=0`.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// String lookup with a fallback for unset variables.
    fn env_or(name: &str, default: &str) -> String {
        env::var(name).unwrap_or_else(|_| default.to_string())
    }

    /// Typed lookup with a fallback for unset variables.
    ///
    /// A variable that is set but malformed is a hard error rather than
    /// silently becoming the default.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Ok(raw) = env::var(name) else {
            return Ok(default);
        };
        raw.parse()
            .map_err(|e| GatewayError::Config(format!("Invalid {name}={raw}: {e}")))
    }

    /// Whole-second duration from the environment.
    fn parse_secs(name: &str, default: u64) -> GatewayResult<Duration> {
        Ok(Duration::from_secs(Self::parse_env(name, default)?))
    }

    /// Millisecond duration from the environment.
    fn parse_millis(name: &str, default: u64) -> GatewayResult<Duration> {
        Ok(Duration::from_millis(Self::parse_env(name, default)?))
    }

    /// Comma-separated environment list; entries are trimmed, empties dropped.
    fn parse_env_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                (!entry.is_empty()).then(|| entry.to_string())
            })
            .collect()
    }
}

/// The values `from_env` falls back to, without touching the environment.
/// Meant for tests; deployments go through [`Config::from_env`].
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_request_body_size: 10 * 1024 * 1024,
            auth_service_url: "http://localhost:8000".to_string(),
            model_service_url: "http://localhost:8001".to_string(),
            connect_timeout: Duration::from_secs(5),
            auth_service_timeout: Duration::from_secs(5),
            model_service_timeout: Duration::from_secs(30),
            stream_read_timeout: Duration::from_secs(25),
            upstream_max_retries: 2,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(1000),
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_open_duration: Duration::from_secs(30),
            circuit_breaker_max_trial_calls: 1,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_unauthenticated: 20,
            rate_limit_authenticated: 100,
            rate_limit_default: 120,
            rate_limit_idle_windows: 2,
            rate_limit_sweep_interval: Duration::from_secs(60),
            jwt_secret: None,
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![],
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}
