//! Retry backoff and the circuit breaker guarding the upstream API.

use crate::core::config::{CircuitBreakerSettings, RetrySettings};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff before retry number `attempt + 1`: `base_delay * 2^attempt`, capped
/// at `max_delay`, plus up to 10% jitter when enabled.
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let delay = settings
        .base_delay
        .checked_mul(factor)
        .unwrap_or(settings.max_delay)
        .min(settings.max_delay);

    if settings.jitter && !delay.is_zero() {
        let jitter = delay.mul_f64(rand::random::<f64>() * 0.1);
        (delay + jitter).min(settings.max_delay)
    } else {
        delay
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Upstream presumed unhealthy, calls fail fast
    Open,
    /// One trial call decides between closing and re-opening
    HalfOpen,
}

/// Read-only view of the breaker for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Calls admitted since process start
    pub request_count: u64,
    /// Remaining cooldown while open
    #[serde(with = "humantime_serde")]
    pub time_until_retry: Duration,
    /// Cooldown applied the next time the circuit is open
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    request_count: u64,
    trial_in_flight: bool,
    reopen_count: u32,
    cooldown: Duration,
}

/// Circuit breaker for preventing hammering of a degraded upstream.
///
/// One instance is shared by every query of the process. All transitions
/// happen under a single lock, so concurrent callers observe a serialized
/// sequence of outcomes.
///
/// Rate limits are weighted more heavily than generic errors: a failure that
/// is itself a rate limit opens the circuit once `rate_limit_threshold`
/// consecutive failures have accumulated, while generic failures need
/// `failure_threshold`.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        let cooldown = settings.cooldown;
        Self {
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                request_count: 0,
                trial_in_flight: false,
                reopen_count: 0,
                cooldown,
            }),
        }
    }

    /// Decide whether an outbound call may proceed.
    ///
    /// Returns false while open and cooling down, or while half-open with the
    /// single trial call still outstanding.
    pub fn admit(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.request_count += 1;
                true
            },
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .map_or(true, |at| at.elapsed() >= inner.cooldown);
                if !cooled_down {
                    return false;
                }

                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                inner.consecutive_successes = 0;
                inner.request_count += 1;
                tracing::info!("Circuit breaker transitioning to half-open, admitting trial call");
                true
            },
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    inner.request_count += 1;
                    true
                }
            },
        }
    }

    /// Record a successful upstream call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.trial_in_flight = false;
            inner.reopen_count = 0;
            inner.cooldown = self.settings.cooldown;
            tracing::info!("Circuit breaker closed after successful trial call");
        }
    }

    /// Record a failed upstream call.
    pub fn record_failure(&self, is_rate_limit: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                let threshold = if is_rate_limit {
                    self.settings.rate_limit_threshold.min(self.settings.failure_threshold)
                } else {
                    self.settings.failure_threshold
                };

                if inner.consecutive_failures >= threshold {
                    inner.state = CircuitState::Open;
                    inner.cooldown = self.settings.cooldown;
                    tracing::error!(
                        failures = inner.consecutive_failures,
                        rate_limited = is_rate_limit,
                        cooldown = ?inner.cooldown,
                        "Circuit breaker opened"
                    );
                } else if is_rate_limit {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "Upstream rate limit detected"
                    );
                }
            },
            CircuitState::HalfOpen => {
                inner.reopen_count += 1;
                inner.cooldown = self.grown_cooldown(inner.reopen_count);
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                tracing::error!(
                    reopen_count = inner.reopen_count,
                    cooldown = ?inner.cooldown,
                    "Circuit breaker trial call failed, re-opening"
                );
            },
            CircuitState::Open => {},
        }
    }

    /// Free an admitted trial slot for a call that never reached the upstream.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of the breaker counters.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        let time_until_retry = match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(at)) => inner.cooldown.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        };

        BreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            request_count: inner.request_count,
            time_until_retry,
            cooldown: inner.cooldown,
        }
    }

    fn grown_cooldown(&self, reopen_count: u32) -> Duration {
        let factor = 1u32.checked_shl(reopen_count.min(16)).unwrap_or(u32::MAX);
        self.settings
            .cooldown
            .checked_mul(factor)
            .unwrap_or(self.settings.max_cooldown)
            .min(self.settings.max_cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(failure_threshold: u32, cooldown: Duration) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold,
            rate_limit_threshold: 3,
            cooldown,
            max_cooldown: cooldown * 8,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetrySettings {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(backoff_delay(&retry, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(500));
        assert_eq!(backoff_delay(&retry, 40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let retry = RetrySettings {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff_delay(&retry, 1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(220));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let cb = CircuitBreaker::new(settings(10, Duration::from_secs(60)));

        for _ in 0..9 {
            cb.record_failure(false);
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.admit());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.admit());
        assert!(cb.status().time_until_retry <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let cb = CircuitBreaker::new(settings(2, Duration::from_secs(60)));
        cb.record_failure(false);
        cb.record_failure(false);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(cb.admit());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.admit(), "only one trial may be in flight");

        cb.record_success();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        assert!(cb.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_grows_cooldown() {
        let cb = CircuitBreaker::new(settings(1, Duration::from_secs(10)));
        cb.record_failure(false);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.admit());
        cb.record_failure(false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().cooldown, Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!cb.admit());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.admit());
        cb.record_failure(false);
        assert_eq!(cb.status().cooldown, Duration::from_secs(40));

        // Capped at max_cooldown (80s) from here on
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(80)).await;
            assert!(cb.admit());
            cb.record_failure(false);
        }
        assert_eq!(cb.status().cooldown, Duration::from_secs(80));

        tokio::time::advance(Duration::from_secs(80)).await;
        assert!(cb.admit());
        cb.record_success();
        assert_eq!(cb.status().cooldown, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_trip_earlier() {
        let cb = CircuitBreaker::new(settings(10, Duration::from_secs(60)));
        cb.record_failure(true);
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_storm_then_recovery() {
        let cb = CircuitBreaker::new(settings(10, Duration::from_secs(60)));

        for _ in 0..12 {
            cb.admit();
            cb.record_failure(true);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.status().consecutive_failures, 12);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.admit());
        cb.record_success();

        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_trial_frees_slot() {
        let cb = CircuitBreaker::new(settings(1, Duration::from_secs(5)));
        cb.record_failure(false);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(cb.admit());
        assert!(!cb.admit());
        cb.release_trial();
        assert!(cb.admit());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new(settings(3, Duration::from_secs(5)));
        cb.record_failure(false);
        cb.record_failure(false);
        cb.record_success();
        cb.record_failure(false);
        cb.record_failure(false);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().consecutive_failures, 2);
        assert!(cb.admit());
        assert_eq!(cb.status().request_count, 1);
    }
}
