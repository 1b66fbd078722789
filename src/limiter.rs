//! Fixed-window request rate limiting.
//!
//! Counters live in a concurrent map keyed by `(Tier, LimitKey)`, so every
//! distinct caller owns an independent window per tier and admission for one
//! caller never waits on another. The check-and-increment for a single key
//! runs under that key's shard lock, which keeps the count monotonically
//! non-decreasing under concurrent admits: two requests can never both
//! observe `count < limit` and push it past the limit.
//!
//! Counters for callers that go quiet are evicted by a background sweep
//! (see `AppState`) to bound memory.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::router::Tier;
use crate::utils::epoch_seconds;

/// Identity a request is counted against: the verified user id when one is
/// present, otherwise the client IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitKey {
    User(String),
    Ip(String),
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKey::User(id) => write!(f, "user:{id}"),
            LimitKey::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Outcome of an admission check.
///
/// Both variants carry everything the HTTP layer needs for the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted {
        limit: u32,
        /// Requests left in the current window after this one.
        remaining: u32,
        /// When the current window ends, in epoch seconds.
        reset_epoch: i64,
    },
    Rejected {
        limit: u32,
        /// Whole seconds until the window resets, never below 1.
        retry_after: u64,
        reset_epoch: i64,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// Per-key counter state for one fixed window.
#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
    /// Last admission attempt, admitted or not. Drives idle eviction.
    last_seen: Instant,
}

/// Fixed-window rate limiter shared by all requests.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<(Tier, LimitKey), RateWindow>,
    window: Duration,
    idle_windows: u32,
}

impl RateLimiter {
    /// Create a limiter with the given window length.
    ///
    /// `idle_windows` is how many windows a key may sit unused before
    /// [`RateLimiter::evict_idle`] drops its counter.
    pub fn new(window: Duration, idle_windows: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            idle_windows,
        }
    }

    /// Admit or reject one request for `key` within `tier`.
    ///
    /// Fetch-or-create the key's window; reset it when a full window has
    /// elapsed since its start; admit while the count is below `limit`.
    /// Rejections never mutate the count, so a burst past the limit cannot
    /// starve the caller once the window turns over.
    pub fn admit(&self, tier: Tier, key: LimitKey, limit: u32) -> Decision {
        self.admit_at(tier, key, limit, Instant::now())
    }

    /// Clock-explicit admission, the whole algorithm. Tests drive this
    /// directly with synthetic instants.
    fn admit_at(&self, tier: Tier, key: LimitKey, limit: u32, now: Instant) -> Decision {
        let mut window = self
            .windows
            .entry((tier, key))
            .or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
                last_seen: now,
            });

        // A request arriving exactly at start + window sees a fresh window
        if now.saturating_duration_since(window.window_start) >= self.window {
            window.window_start = now;
            window.count = 0;
        }
        window.last_seen = now;

        let elapsed = now.saturating_duration_since(window.window_start);
        let reset_in = self.window.saturating_sub(elapsed);
        let reset_epoch = epoch_seconds() + reset_in.as_secs() as i64;

        if window.count < limit {
            window.count += 1;
            Decision::Admitted {
                limit,
                remaining: limit - window.count,
                reset_epoch,
            }
        } else {
            Decision::Rejected {
                limit,
                retry_after: reset_in.as_secs().max(1),
                reset_epoch,
            }
        }
    }

    /// Drop counters idle for at least `idle_windows` full windows.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let idle_cutoff = self.window * self.idle_windows;
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.saturating_duration_since(window.last_seen) < idle_cutoff);
        before.saturating_sub(self.windows.len())
    }

    /// Number of live counters, for the tracking gauge.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> RateLimiter {
        RateLimiter::new(WINDOW, 2)
    }

    fn ip_key(addr: &str) -> LimitKey {
        LimitKey::Ip(addr.to_string())
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let limiter = limiter();
        let t0 = Instant::now();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 3, t0);
            match decision {
                Decision::Admitted { remaining, .. } => assert_eq!(remaining, expected_remaining),
                Decision::Rejected { .. } => panic!("admission under the limit was rejected"),
            }
        }

        let decision = limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 3, t0);
        assert!(!decision.is_admitted());
    }

    #[test]
    fn test_rejections_do_not_mutate_count() {
        let limiter = limiter();
        let t0 = Instant::now();

        assert!(
            limiter
                .admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0)
                .is_admitted()
        );

        // A burst of rejections must not inflate the counter
        for _ in 0..5 {
            assert!(
                !limiter
                    .admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0)
                    .is_admitted()
            );
        }

        // One window later the very first request is admitted again
        let decision = limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0 + WINDOW);
        assert!(decision.is_admitted());
    }

    #[test]
    fn test_window_resets_exactly_at_boundary() {
        let limiter = limiter();
        let t0 = Instant::now();

        for _ in 0..2 {
            limiter.admit_at(Tier::Authenticated, LimitKey::User("u1".into()), 2, t0);
        }
        assert!(
            !limiter
                .admit_at(Tier::Authenticated, LimitKey::User("u1".into()), 2, t0)
                .is_admitted()
        );

        // Arriving exactly at start + window lands in a fresh window with
        // count == 1 after admission, so remaining == limit - 1
        let decision =
            limiter.admit_at(Tier::Authenticated, LimitKey::User("u1".into()), 2, t0 + WINDOW);
        match decision {
            Decision::Admitted { remaining, .. } => assert_eq!(remaining, 1),
            Decision::Rejected { .. } => panic!("boundary arrival must start a fresh window"),
        }
    }

    #[test]
    fn test_retry_after_counts_down_and_clamps_to_one() {
        let limiter = limiter();
        let t0 = Instant::now();

        limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0);

        let rejected = limiter.admit_at(
            Tier::Unauthenticated,
            ip_key("10.0.0.1"),
            1,
            t0 + Duration::from_secs(10),
        );
        match rejected {
            Decision::Rejected { retry_after, .. } => assert_eq!(retry_after, 50),
            Decision::Admitted { .. } => panic!("over-limit request was admitted"),
        }

        // Sub-second remainder still reports at least one second
        let rejected = limiter.admit_at(
            Tier::Unauthenticated,
            ip_key("10.0.0.1"),
            1,
            t0 + WINDOW - Duration::from_millis(100),
        );
        match rejected {
            Decision::Rejected { retry_after, .. } => assert_eq!(retry_after, 1),
            Decision::Admitted { .. } => panic!("over-limit request was admitted"),
        }
    }

    #[test]
    fn test_keys_are_counted_independently() {
        let limiter = limiter();
        let t0 = Instant::now();

        assert!(
            limiter
                .admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0)
                .is_admitted()
        );
        assert!(
            limiter
                .admit_at(Tier::Unauthenticated, ip_key("10.0.0.2"), 1, t0)
                .is_admitted()
        );
        assert!(
            !limiter
                .admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0)
                .is_admitted()
        );
    }

    #[test]
    fn test_tiers_are_counted_independently() {
        let limiter = limiter();
        let t0 = Instant::now();

        assert!(
            limiter
                .admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 1, t0)
                .is_admitted()
        );
        // Same caller, different tier: separate window
        assert!(
            limiter
                .admit_at(Tier::Default, ip_key("10.0.0.1"), 1, t0)
                .is_admitted()
        );
    }

    #[test]
    fn test_idle_keys_are_evicted() {
        let limiter = limiter();
        let t0 = Instant::now();

        limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.1"), 5, t0);
        limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.2"), 5, t0);
        assert_eq!(limiter.tracked_keys(), 2);

        // Keep one key active past the other's idle cutoff
        limiter.admit_at(Tier::Unauthenticated, ip_key("10.0.0.2"), 5, t0 + WINDOW);

        let evicted = limiter.evict_idle_at(t0 + 2 * WINDOW);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 1);

        let evicted = limiter.evict_idle_at(t0 + 4 * WINDOW);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_concurrent_admits_never_exceed_limit() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(WINDOW, 2));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0u32;
                for _ in 0..10 {
                    if limiter
                        .admit(Tier::Authenticated, LimitKey::User("shared".into()), 20)
                        .is_admitted()
                    {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_limit_key_display_is_prefixed() {
        assert_eq!(LimitKey::User("42".into()).to_string(), "user:42");
        assert_eq!(ip_key("10.0.0.1").to_string(), "ip:10.0.0.1");
    }
}
