//! Circuit breaker guarding delivery to the ingestion endpoint.
//!
//! A three-state machine:
//!
//! - **Closed**: calls pass through; outcomes land in a sliding window of the
//!   most recent calls. Once the window holds at least `minimum_calls`
//!   outcomes and the failure ratio reaches `failure_rate_threshold`, the
//!   breaker opens.
//! - **Open**: calls are rejected without being attempted. After `cooldown`
//!   the next call moves the breaker to half-open.
//! - **HalfOpen**: up to `half_open_calls` trial calls are let through. All
//!   of them succeeding closes the breaker; any failure re-opens it and
//!   restarts the cooldown.
//!
//! State lives behind a single mutex shared by all callers, so concurrent
//! deliveries for different log types update it atomically. The lock is
//! never held across an await.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Tuning of the circuit breaker.
///
/// Defaults match the stock settings of common breaker libraries: 50% failure
/// rate over the last 100 calls, 60s cooldown, 10 trial calls.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in (0, 1] at or above which the breaker opens
    pub failure_rate_threshold: f64,

    /// Number of most recent outcomes considered while closed
    pub sliding_window_size: usize,

    /// Outcomes required in the window before the ratio is evaluated
    pub minimum_calls: usize,

    /// Time spent open before trial calls are allowed
    pub cooldown: Duration,

    /// Trial calls permitted while half-open
    pub half_open_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 100,
            minimum_calls: 100,
            cooldown: Duration::from_secs(60),
            half_open_calls: 10,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of a call made through the breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The call was short-circuited without being attempted
    #[error("circuit breaker is open")]
    Open,

    /// The call was attempted and failed
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitMetrics {
    pub state: CircuitState,

    /// Outcomes currently in the sliding window
    pub buffered_calls: usize,

    /// Failures currently in the sliding window
    pub failed_calls: usize,

    /// Calls rejected since the breaker was created
    pub rejected_calls: u64,
}

struct Inner {
    state: CircuitState,

    /// Sliding window; `true` marks a failure
    outcomes: VecDeque<bool>,
    failures: usize,

    last_transition: Instant,

    /// Bumped on every transition so late outcomes from an older state are ignored
    generation: u64,

    half_open_issued: usize,
    half_open_successes: usize,

    rejected_calls: u64,
}

/// Three-state circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// An admitted call. Dropping it without recording releases a trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    recorded: bool,
}

impl Permit<'_> {
    fn record(mut self, success: bool) {
        self.recorded = true;
        self.breaker.on_outcome(self.generation, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.on_abandoned(self.generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// Out-of-range settings are clamped: window and trial counts to at
    /// least 1, `minimum_calls` to `1..=sliding_window_size` and the failure
    /// rate to at most 1.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let sliding_window_size = config.sliding_window_size.max(1);
        let config = CircuitBreakerConfig {
            failure_rate_threshold: config.failure_rate_threshold.min(1.0),
            sliding_window_size,
            minimum_calls: config.minimum_calls.clamp(1, sliding_window_size),
            cooldown: config.cooldown,
            half_open_calls: config.half_open_calls.max(1),
        };
        let capacity = config.sliding_window_size;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(capacity),
                failures: 0,
                last_transition: Instant::now(),
                generation: 0,
                half_open_issued: 0,
                half_open_successes: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, accounting for an elapsed cooldown.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.expire_cooldown(&mut inner);
        inner.state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.lock();
        self.expire_cooldown(&mut inner);
        CircuitMetrics {
            state: inner.state,
            buffered_calls: inner.outcomes.len(),
            failed_calls: inner.failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Returns `CircuitError::Open` without invoking `f` when the call is not
    /// permitted. Otherwise the result of `f` is recorded and passed through.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(CircuitError::Open);
        };
        match f().await {
            Ok(value) => {
                permit.record(true);
                Ok(value)
            }
            Err(e) => {
                permit.record(false);
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        self.expire_cooldown(&mut inner);

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_issued < self.config.half_open_calls {
                    inner.half_open_issued += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !admitted {
            inner.rejected_calls += 1;
            return None;
        }

        Some(Permit {
            breaker: self,
            generation: inner.generation,
            recorded: false,
        })
    }

    fn expire_cooldown(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner.last_transition.elapsed() >= self.config.cooldown
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn on_outcome(&self, generation: u64, success: bool) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.outcomes.push_back(!success);
                if !success {
                    inner.failures += 1;
                }
                while inner.outcomes.len() > self.config.sliding_window_size {
                    if inner.outcomes.pop_front() == Some(true) {
                        inner.failures -= 1;
                    }
                }

                let calls = inner.outcomes.len();
                if calls >= self.config.minimum_calls {
                    let failure_rate = inner.failures as f64 / calls as f64;
                    if failure_rate >= self.config.failure_rate_threshold {
                        warn!(
                            breaker = %self.name,
                            failure_rate = failure_rate,
                            calls = calls,
                            cooldown_secs = self.config.cooldown.as_secs_f64(),
                            "Failure rate above threshold, opening circuit"
                        );
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_calls {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                } else {
                    warn!(breaker = %self.name, "Trial call failed, re-opening circuit");
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_abandoned(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_issued = inner.half_open_issued.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.generation += 1;
        inner.outcomes.clear();
        inner.failures = 0;
        inner.half_open_issued = 0;
        inner.half_open_successes = 0;

        if to != CircuitState::Open {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 0.5,
            sliding_window_size: 10,
            minimum_calls: 4,
            cooldown: Duration::from_secs(30),
            half_open_calls: 2,
        }
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CircuitError<&'static str>> {
        breaker
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), CircuitError<&'static str>> {
        breaker
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), &'static str>("boom")
            })
            .await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_rate_threshold, 0.5);
        assert_eq!(config.sliding_window_size, 100);
        assert_eq!(config.minimum_calls, 100);
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert_eq!(config.half_open_calls, 10);
    }

    #[test]
    fn test_new_clamps_config() {
        let breaker = CircuitBreaker::new(
            "clamped",
            CircuitBreakerConfig {
                failure_rate_threshold: 1.5,
                sliding_window_size: 0,
                minimum_calls: 50,
                cooldown: Duration::from_secs(5),
                half_open_calls: 0,
            },
        );
        assert_eq!(breaker.name(), "clamped");

        let config = breaker.config();
        assert_eq!(config.failure_rate_threshold, 1.0);
        assert_eq!(config.sliding_window_size, 1);
        assert_eq!(config.minimum_calls, 1);
        assert_eq!(config.half_open_calls, 1);
        assert_eq!(config.cooldown, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_trial_calls_still_recovers() {
        let config = CircuitBreakerConfig {
            sliding_window_size: 1,
            minimum_calls: 1,
            half_open_calls: 0,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("test", config);
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().rejected_calls, 0);
    }

    #[tokio::test]
    async fn test_minimum_calls_above_window_still_trips() {
        let config = CircuitBreakerConfig {
            sliding_window_size: 3,
            minimum_calls: 10,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("test", config);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            fail(&breaker, &calls).await.ok();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_results_through() {
        let breaker = CircuitBreaker::new("test", test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        let value = breaker.call(|| async { Ok::<_, ()>(42) }).await.unwrap();
        assert_eq!(value, 42);

        let err = breaker.call(|| async { Err::<(), _>("nope") }).await;
        assert!(matches!(err, Err(CircuitError::Inner("nope"))));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_does_not_trip_below_minimum_calls() {
        let breaker = CircuitBreaker::new("test", test_config());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, &calls).await, Err(CircuitError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failed_calls, 3);
    }

    #[tokio::test]
    async fn test_does_not_trip_below_failure_rate() {
        let breaker = CircuitBreaker::new("test", test_config());
        let calls = AtomicUsize::new(0);

        // 1 failure in 4 calls = 25%
        fail(&breaker, &calls).await.ok();
        for _ in 0..3 {
            succeed(&breaker, &calls).await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trips_and_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("test", test_config());
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            fail(&breaker, &calls).await.ok();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        for _ in 0..5 {
            assert!(matches!(succeed(&breaker, &calls).await, Err(CircuitError::Open)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.metrics().rejected_calls, 5);
    }

    #[tokio::test]
    async fn test_sliding_window_forgets_old_outcomes() {
        let config = CircuitBreakerConfig {
            sliding_window_size: 4,
            minimum_calls: 4,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("test", config);
        let calls = AtomicUsize::new(0);

        // F S S S -> 25%, then S pushes the failure out of the window
        fail(&breaker, &calls).await.ok();
        for _ in 0..4 {
            succeed(&breaker, &calls).await.unwrap();
        }
        let metrics = breaker.metrics();
        assert_eq!(metrics.buffered_calls, 4);
        assert_eq!(metrics.failed_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_limits_trials() {
        let breaker = CircuitBreaker::new("test", test_config());
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            fail(&breaker, &calls).await.ok();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Two trial permits are handed out; a third concurrent call is rejected
        let first = breaker.try_acquire().expect("first trial");
        let second = breaker.try_acquire().expect("second trial");
        assert!(breaker.try_acquire().is_none());

        first.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        second.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", test_config());
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            fail(&breaker, &calls).await.ok();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(matches!(fail(&breaker, &calls).await, Err(CircuitError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // Cooldown restarted at the re-open
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(succeed(&breaker, &calls).await, Err(CircuitError::Open)));
        tokio::time::advance(Duration::from_secs(20)).await;
        succeed(&breaker, &calls).await.unwrap();
        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_releases_slot() {
        let breaker = CircuitBreaker::new("test", test_config());
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            fail(&breaker, &calls).await.ok();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let first = breaker.try_acquire().expect("first trial");
        let second = breaker.try_acquire().expect("second trial");
        drop(first);
        let third = breaker.try_acquire().expect("released slot");
        second.record(true);
        third.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stale_outcome_is_ignored() {
        let config = CircuitBreakerConfig {
            minimum_calls: 1,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("test", config);

        let slow = breaker.try_acquire().expect("closed");
        let fast = breaker.try_acquire().expect("closed");
        fast.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Outcome of a call admitted before the trip does not touch the open state
        slow.record(true);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
