//! Per-identity admission control with fixed windows.

use crate::config::RateLimiterConfig;
use crate::errors::GatewayError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Composite identity the limiter counts by.
///
/// When no authenticated user id is available the key degrades to the
/// network address alone; NATed clients sharing an address then share a
/// counter, so callers needing per-user isolation should authenticate first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Peer network address.
    pub addr: IpAddr,
    /// Authenticated user id, when available.
    pub user_id: Option<String>,
}

impl RateLimitKey {
    /// Creates a key for an authenticated caller.
    pub fn new(addr: IpAddr, user_id: impl Into<String>) -> Self {
        Self {
            addr,
            user_id: Some(user_id.into()),
        }
    }

    /// Creates an address-only key for an unauthenticated caller.
    pub fn anonymous(addr: IpAddr) -> Self {
        Self {
            addr,
            user_id: None,
        }
    }
}

/// Standard over-limit response produced by the rejection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// HTTP-equivalent status code; 429 from the default handler.
    pub status: u16,
    /// Time remaining in the current window.
    pub retry_after: Duration,
}

impl From<RateLimitRejection> for GatewayError {
    fn from(rejection: RateLimitRejection) -> Self {
        GatewayError::rate_limited(rejection.retry_after).with_status(rejection.status)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request admitted; `remaining` counts what is left in this window.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    /// Request rejected with the handler's response.
    Rejected(RateLimitRejection),
}

impl RateLimitDecision {
    /// Returns true when the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Rejection handler signature; receives the offending key and the time
/// remaining in its window.
pub type RejectionHandler =
    Box<dyn Fn(&RateLimitKey, Duration) -> RateLimitRejection + Send + Sync>;

/// Rate limiter statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Checks performed.
    pub total_requests: u64,
    /// Requests admitted.
    pub allowed_requests: u64,
    /// Requests rejected.
    pub rejected_requests: u64,
}

struct WindowState {
    started: Instant,
    count: u32,
}

/// Fixed-window admission gate keyed by caller identity.
///
/// Counters for distinct identities are fully independent; each counter
/// resets once its window has elapsed. Increment-and-compare is atomic per
/// key under the map lock.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<RateLimitKey, WindowState>>,
    on_reject: RejectionHandler,
    stats: Mutex<RateLimiterStats>,
}

impl RateLimiter {
    /// Creates a limiter with the standard 429 rejection handler.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            on_reject: Box::new(|_, retry_after| RateLimitRejection {
                status: 429,
                retry_after,
            }),
            stats: Mutex::new(RateLimiterStats::default()),
        }
    }

    /// Replaces the rejection handler.
    pub fn with_rejection_handler(mut self, handler: RejectionHandler) -> Self {
        self.on_reject = handler;
        self
    }

    /// Checks the identity against the window containing the current instant.
    pub fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    /// Checks the identity against the window containing `now`.
    pub fn check_at(&self, key: &RateLimitKey, now: Instant) -> RateLimitDecision {
        let mut windows = self.windows.lock().unwrap();
        let state = windows.entry(key.clone()).or_insert(WindowState {
            started: now,
            count: 0,
        });

        let elapsed = now.duration_since(state.started);
        if elapsed >= self.config.window {
            state.started = now;
            state.count = 0;
        }

        state.count += 1;
        let mut stats = self.stats.lock().unwrap();
        stats.total_requests += 1;

        if state.count > self.config.max {
            stats.rejected_requests += 1;
            let retry_after = self
                .config
                .window
                .saturating_sub(now.duration_since(state.started));
            drop(stats);
            drop(windows);
            tracing::debug!(addr = %key.addr, user_id = ?key.user_id, "Request rejected by rate limiter");
            RateLimitDecision::Rejected((self.on_reject)(key, retry_after))
        } else {
            stats.allowed_requests += 1;
            RateLimitDecision::Allowed {
                remaining: self.config.max - state.count,
            }
        }
    }

    /// Returns a snapshot of the limiter statistics.
    pub fn stats(&self) -> RateLimiterStats {
        self.stats.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig { max, window })
    }

    fn local_key(user: &str) -> RateLimitKey {
        RateLimitKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), user)
    }

    #[test]
    fn test_second_request_in_window_rejected() {
        let limiter = limiter(1, Duration::from_millis(100));
        let key = local_key("user-1");
        let now = Instant::now();

        assert!(limiter.check_at(&key, now).is_allowed());

        match limiter.check_at(&key, now + Duration::from_millis(10)) {
            RateLimitDecision::Rejected(rejection) => {
                assert_eq!(rejection.status, 429);
                assert!(rejection.retry_after <= Duration::from_millis(100));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_window_elapse_resets_counter() {
        let limiter = limiter(1, Duration::from_millis(100));
        let key = local_key("user-1");
        let now = Instant::now();

        assert!(limiter.check_at(&key, now).is_allowed());
        assert!(!limiter.check_at(&key, now + Duration::from_millis(50)).is_allowed());
        assert!(limiter.check_at(&key, now + Duration::from_millis(100)).is_allowed());
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter(1, Duration::from_millis(100));
        let now = Instant::now();

        assert!(limiter.check_at(&local_key("user-1"), now).is_allowed());
        assert!(limiter.check_at(&local_key("user-2"), now).is_allowed());
        // Address-only key is distinct from user-qualified keys.
        assert!(limiter
            .check_at(&RateLimitKey::anonymous(IpAddr::V4(Ipv4Addr::LOCALHOST)), now)
            .is_allowed());
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = limiter(3, Duration::from_secs(1));
        let key = local_key("user-1");
        let now = Instant::now();

        assert_eq!(
            limiter.check_at(&key, now),
            RateLimitDecision::Allowed { remaining: 2 }
        );
        assert_eq!(
            limiter.check_at(&key, now),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check_at(&key, now),
            RateLimitDecision::Allowed { remaining: 0 }
        );
        assert!(!limiter.check_at(&key, now).is_allowed());
    }

    #[test]
    fn test_custom_rejection_handler() {
        let limiter = limiter(1, Duration::from_millis(100)).with_rejection_handler(Box::new(
            |_, retry_after| RateLimitRejection {
                status: 503,
                retry_after,
            },
        ));
        let key = local_key("user-1");
        let now = Instant::now();

        limiter.check_at(&key, now);
        match limiter.check_at(&key, now) {
            RateLimitDecision::Rejected(rejection) => assert_eq!(rejection.status, 503),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_stats_track_outcomes() {
        let limiter = limiter(1, Duration::from_millis(100));
        let key = local_key("user-1");
        let now = Instant::now();

        limiter.check_at(&key, now);
        limiter.check_at(&key, now);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.allowed_requests, 1);
        assert_eq!(stats.rejected_requests, 1);
    }
}
