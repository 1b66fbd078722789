//! Per-upstream circuit breaker.
//!
//! Fails fast while an upstream is known to be down instead of queueing
//! doomed calls behind timeouts.
//!
//! # States
//!
//! ```text
//! Closed   -- failures reach threshold --> Open
//! Open     -- cooldown elapses --------->  HalfOpen (bounded trial calls)
//! HalfOpen -- a trial succeeds --------->  Closed
//! HalfOpen -- a trial fails ------------>  Open (cooldown restarts)
//! ```
//!
//! # Permits
//!
//! Admission is expressed as an RAII [`CallPermit`]: acquiring one reserves
//! the right to make exactly one upstream call, and exactly one outcome is
//! recorded per permit. Dropping a permit without an explicit outcome counts
//! as a failure, so a cancelled request (client gone mid-stream) can never
//! leave a half-open probe slot reserved forever.
//!
//! The first request to arrive after the cooldown performs the Open →
//! HalfOpen transition and takes the first trial slot in the same critical
//! section; concurrent requests observe either the old state (rejected) or
//! an exhausted trial budget (rejected, without waiting).
//!
//! # Usage
//!
//! ```rust,ignore
//! let Some(permit) = breaker.try_acquire() else {
//!     return Err(GatewayError::CircuitOpen { upstream });
//! };
//!
//! match operation().await {
//!     Ok(result) => {
//!         permit.succeed();
//!         Ok(result)
//!     }
//!     Err(e) => {
//!         permit.fail();
//!         Err(e)
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::router::UpstreamId;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
    /// Testing recovery - a bounded number of trial requests allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and the status endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before probing the upstream again.
    pub open_duration: Duration,
    /// In-flight trial calls allowed while half-open.
    pub max_trial_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            max_trial_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    pub fn new(failure_threshold: u32, open_duration: Duration, max_trial_calls: u32) -> Self {
        Self {
            failure_threshold,
            open_duration,
            max_trial_calls,
        }
    }
}

/// Mutable breaker state, always touched under the one mutex.
struct BreakerInner {
    state: CircuitState,
    /// Consecutive failures observed while closed.
    consecutive_failures: u32,
    /// Last transition into Open. Only meaningful while `state == Open`.
    opened_at: Instant,
    /// Trial calls currently in flight while half-open.
    trials_in_flight: u32,
}

/// Thread-safe circuit breaker for one upstream.
///
/// All state changes happen in short lock-held sections; the lock is never
/// held across an upstream call. Outcome recording is synchronous so it can
/// run from a `Drop` impl.
pub struct CircuitBreaker {
    upstream: UpstreamId,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    /// Total number of times the circuit has been opened (for status reporting).
    times_opened: AtomicU32,
    /// Total number of requests rejected due to open circuit (for status reporting).
    requests_rejected: AtomicU64,
}

/// Point-in-time view of one breaker, for the status endpoint.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub upstream: UpstreamId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub times_opened: u32,
    pub requests_rejected: u64,
    /// Time until the next probe is allowed. `None` unless open.
    pub retry_in: Option<Duration>,
}

impl CircuitBreaker {
    /// Create a circuit breaker for the given upstream.
    pub fn new(upstream: UpstreamId, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: Instant::now(),
                trials_in_flight: 0,
            }),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        })
    }

    /// Ask permission for one upstream call.
    ///
    /// Returns `None` when the call must be rejected with `CircuitOpen`:
    /// either the circuit is open and the cooldown has not elapsed, or it is
    /// half-open with the trial budget exhausted. Neither rejection waits.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(self.permit(false)),
            CircuitState::Open => {
                if inner.opened_at.elapsed() >= self.config.open_duration {
                    // First arrival after the cooldown: transition and claim
                    // the first trial slot in one critical section
                    inner.state = CircuitState::HalfOpen;
                    inner.trials_in_flight = 1;
                    info!(upstream = %self.upstream, "Circuit breaker half-open, probing upstream");
                    Some(self.permit(true))
                } else {
                    self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.max_trial_calls {
                    inner.trials_in_flight += 1;
                    Some(self.permit(true))
                } else {
                    self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        }
    }

    /// Current state (for status reporting).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Which upstream this breaker guards.
    pub fn upstream(&self) -> UpstreamId {
        self.upstream
    }

    /// Total number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Total number of requests rejected without an upstream attempt.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    /// Point-in-time view for the status endpoint.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let retry_in = match inner.state {
            CircuitState::Open => Some(
                self.config
                    .open_duration
                    .saturating_sub(inner.opened_at.elapsed()),
            ),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        };
        BreakerSnapshot {
            upstream: self.upstream,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            times_opened: self.times_opened(),
            requests_rejected: self.requests_rejected(),
            retry_in,
        }
    }

    fn permit(self: &Arc<Self>, trial: bool) -> CallPermit {
        CallPermit {
            breaker: Arc::clone(self),
            trial,
            completed: false,
        }
    }

    /// Apply one call outcome. Runs in a single short critical section.
    fn record_outcome(&self, trial: bool, success: bool) {
        let mut inner = self.lock();

        if trial {
            match inner.state {
                CircuitState::HalfOpen => {
                    if success {
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.trials_in_flight = 0;
                        info!(upstream = %self.upstream, "Circuit breaker closed, upstream recovered");
                    } else {
                        self.reopen(&mut inner, "trial call failed");
                    }
                }
                CircuitState::Closed | CircuitState::Open => {
                    // Another trial already decided the state; this outcome
                    // only returns its slot.
                    inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                }
            }
            return;
        }

        // Outcomes of calls permitted while closed only matter if the
        // breaker is still closed: late results must neither refresh an
        // open breaker's cooldown clock nor close it early.
        if inner.state != CircuitState::Closed {
            return;
        }

        if success {
            inner.consecutive_failures = 0;
        } else {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.config.failure_threshold {
                self.reopen(&mut inner, "failure threshold reached");
            }
        }
    }

    /// Transition into Open and restart the cooldown clock.
    fn reopen(&self, inner: &mut BreakerInner, reason: &str) {
        inner.state = CircuitState::Open;
        inner.opened_at = Instant::now();
        inner.trials_in_flight = 0;
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        warn!(
            upstream = %self.upstream,
            consecutive_failures = inner.consecutive_failures,
            cooldown_secs = self.config.open_duration.as_secs(),
            "Circuit breaker opened: {reason}"
        );
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Poisoning only happens if a panic occurred mid-section; the state
        // is still internally consistent, so keep serving.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("upstream", &self.upstream)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Permission for exactly one upstream call.
///
/// Consumed by [`CallPermit::succeed`] or [`CallPermit::fail`]; dropping it
/// without either records a failure.
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    completed: bool,
}

impl CallPermit {
    /// Whether this permit is a half-open trial call. Trial calls are never
    /// retried: their single outcome decides the next state.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the call as successful.
    pub fn succeed(mut self) {
        self.finish(true);
    }

    /// Record the call as failed.
    pub fn fail(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        if !self.completed {
            self.completed = true;
            self.breaker.record_outcome(self.trial, success);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        // An abandoned call (task cancelled, client disconnected) never
        // produced a response, which is a failure from the caller's view.
        self.finish(false);
    }
}

/// One breaker per upstream, built at startup.
///
/// The set of upstreams is fixed, so the bank itself needs no lock; each
/// breaker synchronizes its own state.
#[derive(Debug, Clone)]
pub struct CircuitBreakerBank {
    auth: Arc<CircuitBreaker>,
    model: Arc<CircuitBreaker>,
}

impl CircuitBreakerBank {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            auth: CircuitBreaker::new(UpstreamId::AuthService, config.clone()),
            model: CircuitBreaker::new(UpstreamId::ModelService, config),
        }
    }

    /// The breaker guarding the given upstream.
    pub fn breaker(&self, upstream: UpstreamId) -> &Arc<CircuitBreaker> {
        match upstream {
            UpstreamId::AuthService => &self.auth,
            UpstreamId::ModelService => &self.model,
        }
    }

    /// Snapshots of every breaker, in display order.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        UpstreamId::ALL
            .iter()
            .map(|upstream| self.breaker(*upstream).snapshot())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration, trials: u32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            UpstreamId::ModelService,
            CircuitBreakerConfig::new(threshold, cooldown, trials),
        )
    }

    #[tokio::test]
    async fn test_breaker_starts_closed() {
        let cb = breaker(5, Duration::from_secs(30), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(30), 1);

        for _ in 0..2 {
            cb.try_acquire().unwrap().fail();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 1);

        // The next call is rejected without an upstream attempt
        assert!(cb.try_acquire().is_none());
        assert_eq!(cb.requests_rejected(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let cb = breaker(3, Duration::from_secs(30), 1);

        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().succeed();

        // Counter restarted: three more failures needed
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_cooldown_gates_the_probe() {
        let cb = breaker(1, Duration::from_millis(20), 1);

        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;

        let permit = cb.try_acquire().expect("cooldown elapsed, probe allowed");
        assert!(permit.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        permit.succeed();
    }

    #[tokio::test]
    async fn test_successful_trial_closes_and_resets_counter() {
        let cb = breaker(1, Duration::from_millis(10), 1);

        cb.try_acquire().unwrap().fail();
        tokio::time::sleep(Duration::from_millis(20)).await;

        cb.try_acquire().unwrap().succeed();
        assert_eq!(cb.state(), CircuitState::Closed);

        // A fresh single failure is needed to open again
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let cb = breaker(1, Duration::from_millis(30), 1);

        cb.try_acquire().unwrap().fail();
        tokio::time::sleep(Duration::from_millis(40)).await;

        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);

        // Cooldown clock restarted by the failed trial
        assert!(cb.try_acquire().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_single_trial_slot_contention() {
        let cb = breaker(1, Duration::from_millis(10), 1);

        cb.try_acquire().unwrap().fail();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = cb.try_acquire().expect("first probe takes the slot");
        // Concurrent probes are rejected immediately, not queued
        assert!(cb.try_acquire().is_none());
        assert!(cb.try_acquire().is_none());
        assert_eq!(cb.requests_rejected(), 2);

        first.succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trial_budget_above_one() {
        let cb = breaker(1, Duration::from_millis(10), 2);

        cb.try_acquire().unwrap().fail();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = cb.try_acquire().expect("first trial");
        let second = cb.try_acquire().expect("second trial within budget");
        assert!(cb.try_acquire().is_none());

        first.succeed();
        assert_eq!(cb.state(), CircuitState::Closed);

        // The straggler's outcome must not flap the freshly closed circuit
        second.fail();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_dropped_permit_counts_as_failure() {
        let cb = breaker(1, Duration::from_millis(10), 1);

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);

        // An abandoned trial reopens rather than wedging half-open
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);
    }

    #[tokio::test]
    async fn test_late_outcome_does_not_flap_open_circuit() {
        let cb = breaker(1, Duration::from_secs(30), 1);

        let slow = cb.try_acquire().unwrap();
        let fast = cb.try_acquire().unwrap();

        fast.fail();
        assert_eq!(cb.state(), CircuitState::Open);

        // The request that started while closed finishes after the trip;
        // its success must not close the circuit
        slow.succeed();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_reports_retry_hint() {
        let cb = breaker(1, Duration::from_secs(30), 1);
        assert!(cb.snapshot().retry_in.is_none());

        cb.try_acquire().unwrap().fail();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        let retry_in = snapshot.retry_in.expect("open breaker reports retry hint");
        assert!(retry_in <= Duration::from_secs(30));
        assert!(retry_in > Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_bank_isolates_upstreams() {
        let bank = CircuitBreakerBank::new(CircuitBreakerConfig::new(
            1,
            Duration::from_secs(30),
            1,
        ));

        bank.breaker(UpstreamId::ModelService)
            .try_acquire()
            .unwrap()
            .fail();

        assert_eq!(
            bank.breaker(UpstreamId::ModelService).state(),
            CircuitState::Open
        );
        assert_eq!(
            bank.breaker(UpstreamId::AuthService).state(),
            CircuitState::Closed
        );

        let snapshots = bank.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].upstream, UpstreamId::AuthService);
    }
}
