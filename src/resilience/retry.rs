//! Retries with exponential backoff behind a per-operation circuit breaker.

use alloc::{collections::BTreeSet, string::String, vec::Vec};
use core::{fmt, future::Future, time::Duration};
use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info, trace, warn};

use crate::{error::SimulatorError, status};

/// How an operation is retried and when its breaker opens.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Attempts per call to [`RetryManager::execute`], including the first.
    pub max_attempts: u32,
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before a trial attempt is allowed.
    pub cool_down: Duration,
    /// Error codes that may be retried. `None` retries the catalog's
    /// transient errors.
    pub retryable_codes: Option<BTreeSet<&'static str>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
            max_attempts: 3,
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            retryable_codes: None,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    #[must_use]
    pub const fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    #[must_use]
    pub fn with_retryable_codes(mut self, codes: impl IntoIterator<Item = &'static str>) -> Self {
        self.retryable_codes = Some(codes.into_iter().collect());
        self
    }

    #[must_use]
    pub fn is_retryable(&self, error: &SimulatorError) -> bool {
        let response = status::map(error);
        match self.retryable_codes {
            Some(ref codes) => codes.contains(response.error_code),
            None => response.is_transient(),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry - 1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_finite() && secs >= 0.0 && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl Breaker {
    /// Whether an attempt may proceed now.
    fn admit(&mut self, cool_down: Duration) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.opened_at.is_some_and(|at| at.elapsed() >= cool_down) {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&mut self) {
        *self = Self::default();
    }

    fn record_failure(&mut self, threshold: u32) {
        self.failures = self.failures.saturating_add(1);
        self.trial_in_flight = false;
        if self.state == BreakerState::HalfOpen || self.failures >= threshold {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
        }
    }
}

/// Records an attempt dropped before it completed as a failure, which also
/// ends a half-open trial.
struct AttemptGuard<'a> {
    breakers: &'a Mutex<HashMap<String, Breaker>>,
    operation: &'a str,
    threshold: u32,
    finished: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("{}: attempt dropped before it completed", self.operation);
        self.breakers
            .lock()
            .entry(String::from(self.operation))
            .or_default()
            .record_failure(self.threshold);
    }
}

/// The final error of [`RetryManager::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub operation: String,
    pub error: SimulatorError,
    /// Attempts actually made; 0 when the breaker rejected the call.
    pub attempts: u32,
    pub retryable: bool,
}

impl fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.operation, self.attempts, self.error
        )
    }
}

impl std::error::Error for RetryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Executes operations with retries, keeping one breaker per operation name.
#[derive(Debug, Default)]
pub struct RetryManager {
    default_policy: RetryPolicy,
    policies: Mutex<HashMap<String, RetryPolicy>>,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl RetryManager {
    #[must_use]
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            policies: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the policy of `operation`.
    pub fn register(&self, operation: &str, policy: RetryPolicy) {
        self.policies.lock().insert(String::from(operation), policy);
    }

    #[must_use]
    pub fn policy(&self, operation: &str) -> RetryPolicy {
        self.policies
            .lock()
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    #[must_use]
    pub fn breaker_state(&self, operation: &str) -> BreakerState {
        self.breakers
            .lock()
            .get(operation)
            .map_or(BreakerState::Closed, |breaker| breaker.state)
    }

    /// Consecutive failures recorded for `operation`.
    #[must_use]
    pub fn failure_count(&self, operation: &str) -> u32 {
        self.breakers
            .lock()
            .get(operation)
            .map_or(0, |breaker| breaker.failures)
    }

    /// Operations whose breaker is currently not closed.
    #[must_use]
    pub fn open_breakers(&self) -> Vec<(String, BreakerState)> {
        let mut open: Vec<_> = self
            .breakers
            .lock()
            .iter()
            .filter(|(_, breaker)| breaker.state != BreakerState::Closed)
            .map(|(operation, breaker)| (operation.clone(), breaker.state))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        open
    }

    /// Closes the breaker of `operation`.
    pub fn reset(&self, operation: &str) {
        self.breakers.lock().remove(operation);
    }

    /// Runs `block` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts, or the breaker opens.
    ///
    /// # Errors
    ///
    /// * `RetryFailure` carrying the last error, or `SimulatorError::CircuitOpen`
    ///   if the breaker rejected the call without running `block`.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut block: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SimulatorError>>,
    {
        let policy = self.policy(operation);
        let mut attempts = 0;

        loop {
            let admitted = self
                .breakers
                .lock()
                .entry(String::from(operation))
                .or_default()
                .admit(policy.cool_down);
            if !admitted {
                error!("Circuit breaker for {operation} is open, failing fast");
                return Err(RetryFailure {
                    operation: String::from(operation),
                    error: SimulatorError::CircuitOpen {
                        operation: String::from(operation),
                    },
                    attempts,
                    retryable: false,
                });
            }

            attempts += 1;
            trace!("{operation}: attempt {attempts}");
            let mut guard = AttemptGuard {
                breakers: &self.breakers,
                operation,
                threshold: policy.failure_threshold,
                finished: false,
            };
            let result = block().await;
            guard.finished = true;
            let err = match result {
                Ok(value) => {
                    if let Some(breaker) = self.breakers.lock().get_mut(operation) {
                        if breaker.state != BreakerState::Closed {
                            info!("Circuit breaker for {operation} closed");
                        }
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let opened = {
                let mut breakers = self.breakers.lock();
                let breaker = breakers.entry(String::from(operation)).or_default();
                breaker.record_failure(policy.failure_threshold);
                breaker.state == BreakerState::Open
            };
            if opened {
                warn!("Circuit breaker for {operation} opened after: {err}");
            }

            let retryable = policy.is_retryable(&err);
            if !retryable || opened || attempts >= policy.max_attempts {
                error!("{operation} failed after {attempts} attempt(s): {err}");
                return Err(RetryFailure {
                    operation: String::from(operation),
                    error: err,
                    attempts,
                    retryable,
                });
            }

            let delay = policy.delay_for(attempts);
            warn!("{operation} failed with a retryable error, retrying in {delay:?}: {err}");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> SimulatorError {
        SimulatorError::ConnectionLost {
            reason: "field lost".into(),
        }
    }

    #[test]
    fn test_delay_for() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(6), Duration::from_secs(2));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_is_retryable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&transient()));
        assert!(policy.is_retryable(&SimulatorError::PaceAuthenticationFailed {
            step: 5,
            reason: "authentication token mismatch"
        }));
        assert!(!policy.is_retryable(&SimulatorError::UnsupportedInstruction { ins: 0x88 }));

        let policy = RetryPolicy::default().with_retryable_codes(["WRONG_LENGTH"]);
        assert!(!policy.is_retryable(&transient()));
        assert!(policy.is_retryable(&SimulatorError::WrongLength {
            operation: "EXTERNAL AUTHENTICATE",
            expected: 40,
            found: 8,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let manager = RetryManager::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = manager
            .execute("bac.external_authenticate", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("authenticated")
                }
            })
            .await;
        assert_eq!(result, Ok("authenticated"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.failure_count("bac.external_authenticate"), 0);
        assert_eq!(
            manager.breaker_state("bac.external_authenticate"),
            BreakerState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let manager = RetryManager::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = manager
            .execute("select", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SimulatorError::UnsupportedClass { cla: 0x0C })
            })
            .await;
        assert!(result.is_err_and(|failure| !failure.retryable && failure.attempts == 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let manager = RetryManager::default();
        let result: Result<(), _> = manager
            .execute("pace.key_agreement", || async { Err(transient()) })
            .await;
        assert!(result.is_err_and(|failure| failure.retryable && failure.attempts == 3));
        assert_eq!(manager.failure_count("pace.key_agreement"), 3);
        assert_eq!(
            manager.breaker_state("pace.key_agreement"),
            BreakerState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let manager = RetryManager::default();
        let policy = RetryPolicy::default()
            .with_max_attempts(1)
            .with_failure_threshold(3);
        manager.register("pace.nonce", policy);

        for _ in 0..3 {
            let result: Result<(), _> = manager
                .execute("pace.nonce", || async { Err(transient()) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(manager.breaker_state("pace.nonce"), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = manager
            .execute("pace.nonce", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err_and(|failure| {
            !failure.retryable
                && failure.attempts == 0
                && matches!(failure.error, SimulatorError::CircuitOpen { .. })
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            manager.open_breakers(),
            vec![(String::from("pace.nonce"), BreakerState::Open)]
        );

        // Other operations are unaffected.
        assert_eq!(
            manager
                .execute("bac.challenge", || async { Ok::<_, SimulatorError>(1) })
                .await,
            Ok(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_reopens_breaker() {
        let manager = RetryManager::default();
        let policy = RetryPolicy::default()
            .with_max_attempts(1)
            .with_failure_threshold(1)
            .with_cool_down(Duration::from_secs(30));
        manager.register("pace.nonce", policy);

        let result: Result<(), _> = manager
            .execute("pace.nonce", || async { Err(transient()) })
            .await;
        assert!(result.is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = tokio::time::timeout(
            Duration::from_millis(10),
            manager.execute("pace.nonce", || {
                core::future::pending::<Result<(), SimulatorError>>()
            }),
        )
        .await;
        assert!(trial.is_err());
        assert_eq!(manager.breaker_state("pace.nonce"), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = manager
            .execute("pace.nonce", || async { Ok::<_, SimulatorError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(manager.breaker_state("pace.nonce"), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial() {
        let manager = RetryManager::default();
        let policy = RetryPolicy::default()
            .with_max_attempts(1)
            .with_failure_threshold(1)
            .with_cool_down(Duration::from_secs(30));
        manager.register("bac.challenge", policy);

        let result: Result<(), _> = manager
            .execute("bac.challenge", || async { Err(transient()) })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.breaker_state("bac.challenge"), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        // A failing trial reopens the breaker.
        let result: Result<(), _> = manager
            .execute("bac.challenge", || async { Err(transient()) })
            .await;
        assert!(result.is_err_and(|failure| failure.attempts == 1));
        assert_eq!(manager.breaker_state("bac.challenge"), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = manager
            .execute("bac.challenge", || async { Ok::<_, SimulatorError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(manager.breaker_state("bac.challenge"), BreakerState::Closed);
        assert_eq!(manager.failure_count("bac.challenge"), 0);
    }
}
