//! Process-wide state behind every handler and middleware layer.
//!
//! One [`AppState`] is built at startup and cloned cheaply into each
//! request task. It bundles:
//!
//! - **RouteTable**: immutable route lookup
//! - **RateLimiter**: fixed-window admission counters
//! - **CircuitBreakerBank**: per-upstream failure isolation
//! - **UpstreamClient**: the shared outbound HTTP client
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! A background maintenance task evicts idle rate-limit windows and
//! refreshes the breaker state gauges. It is managed with
//! `tokio_util::task::TaskTracker` and a `CancellationToken`; call
//! `shutdown()` to stop it cleanly before process exit.

use std::sync::Arc;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::GatewayResult;
use crate::limiter::RateLimiter;
use crate::metrics;
use crate::middleware::TrustedProxyConfig;
use crate::router::RouteTable;
use crate::upstream::{CircuitBreakerBank, CircuitBreakerConfig, CircuitState, UpstreamClient};

/// Shared application state.
///
/// Cloned per request handler; every field is either `Arc`-wrapped or
/// internally shared, so clones observe the same counters and breakers.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Immutable route table, built at startup
    pub table: Arc<RouteTable>,
    /// Request admission counters
    pub limiter: Arc<RateLimiter>,
    /// Per-upstream circuit breakers
    pub breakers: CircuitBreakerBank,
    /// Outbound HTTP client
    pub upstream: UpstreamClient,
    /// Which peers may inject forwarding headers
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    /// Background tasks joined during shutdown
    task_tracker: TaskTracker,
    /// Tells background tasks to wind down
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state and spawn the maintenance task.
    ///
    /// # Errors
    ///
    /// Fails only if the outbound HTTP client cannot be constructed.
    pub fn new(config: Config) -> GatewayResult<Self> {
        let config = Arc::new(config);
        let table = Arc::new(RouteTable::new());
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_idle_windows,
        ));
        let breakers = CircuitBreakerBank::new(CircuitBreakerConfig::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_open_duration,
            config.circuit_breaker_max_trial_calls,
        ));
        let upstream = UpstreamClient::new(config.clone())?;
        let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));

        let state = Self {
            config,
            table,
            limiter,
            breakers,
            upstream,
            trusted_proxies,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_maintenance_task();

        Ok(state)
    }

    /// Spawn the background maintenance task.
    ///
    /// Each tick evicts rate-limit windows idle past the configured
    /// horizon and refreshes the per-upstream circuit state gauges.
    fn spawn_maintenance_task(&self) {
        let limiter = self.limiter.clone();
        let breakers = self.breakers.clone();
        let sweep_interval = self.config.rate_limit_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await; // The first tick fires immediately

            loop {
                tokio::select! {
                    biased; // Shutdown wins over another sweep

                    _ = cancel.cancelled() => {
                        debug!("Maintenance task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle rate-limit windows");
                        }
                        metrics::set_rate_limit_keys(limiter.tracked_keys());

                        for snapshot in breakers.snapshots() {
                            metrics::set_circuit_breaker_state(
                                snapshot.upstream.as_str(),
                                circuit_state_code(snapshot.state),
                            );
                        }
                    }
                }
            }

            debug!("Maintenance task shutting down");
        });
    }

    /// Gracefully shut down background tasks.
    ///
    /// Signals cancellation, closes the tracker so nothing new spawns,
    /// then waits for completion.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }
}

/// Gauge encoding of a breaker state.
fn circuit_state_code(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::limiter::LimitKey;
    use crate::router::Tier;

    #[tokio::test]
    async fn test_clones_share_counters() {
        let state = AppState::new(Config::default()).unwrap();
        let clone = state.clone();

        state.limiter.admit(
            Tier::Default,
            LimitKey::Ip("203.0.113.9".to_string()),
            10,
        );

        assert_eq!(clone.limiter.tracked_keys(), 1);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_maintenance_task_evicts_idle_windows() {
        let mut config = Config::default();
        config.rate_limit_window = Duration::from_millis(10);
        config.rate_limit_idle_windows = 1;
        config.rate_limit_sweep_interval = Duration::from_millis(20);

        let state = AppState::new(config).unwrap();
        state.limiter.admit(
            Tier::Default,
            LimitKey::Ip("203.0.113.10".to_string()),
            10,
        );
        assert_eq!(state.limiter.tracked_keys(), 1);

        // Two sweep intervals with margin
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(state.limiter.tracked_keys(), 0);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let state = AppState::new(Config::default()).unwrap();
        state.shutdown().await;
    }

    #[test]
    fn test_circuit_state_codes() {
        assert_eq!(circuit_state_code(CircuitState::Closed), 0);
        assert_eq!(circuit_state_code(CircuitState::HalfOpen), 1);
        assert_eq!(circuit_state_code(CircuitState::Open), 2);
    }
}
