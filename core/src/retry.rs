//! Bounded exponential-backoff retries.
//!
//! A [`Retryer`] is an immutable strategy: the policy and the default
//! predicate are fixed at construction, and a different predicate for one
//! call is passed to [`Retryer::execute_with`] instead of being swapped in.
//! One instance can be shared freely between tasks.

use crate::{backoff, cancel::CancelSignal, errors::ConfigError, errors::RetryError};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Attempt budget and delay schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first (at least 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Optional delay jitter (0.0-1.0); zero keeps delays exact
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(ConfigError::invalid("multiplier", "must be a positive number"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid("max_delay", "must not be below base_delay"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid("jitter_factor", "must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Delay after the given zero-based attempt, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff::exponential_delay(self.base_delay, self.multiplier, attempt, self.max_delay)
    }
}

/// Decides whether a failed attempt may be retried
pub trait RetryPredicate<E: ?Sized>: Send + Sync {
    fn is_retryable(&self, error: &E) -> bool;
}

impl<E: ?Sized, F> RetryPredicate<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_retryable(&self, error: &E) -> bool {
        self(error)
    }
}

/// Default predicate: errors whose message mentions validation, invalid or
/// malformed input are permanent, everything else is retried.
///
/// Wording-dependent by nature. Prefer [`ByKind`] for error types you own.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHeuristic;

const PERMANENT_MARKERS: [&str; 3] = ["validation", "invalid", "malformed"];

impl<E: fmt::Display + ?Sized> RetryPredicate<E> for MessageHeuristic {
    fn is_retryable(&self, error: &E) -> bool {
        let message = error.to_string().to_lowercase();
        !PERMANENT_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// Error types that know whether they are transient
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Typed predicate: retries exactly the errors reporting themselves transient
#[derive(Debug, Clone, Copy, Default)]
pub struct ByKind;

impl<E: Transient + ?Sized> RetryPredicate<E> for ByKind {
    fn is_retryable(&self, error: &E) -> bool {
        error.is_transient()
    }
}

#[derive(Debug, Clone)]
pub struct Retryer<P = MessageHeuristic> {
    policy: RetryPolicy,
    predicate: P,
}

impl Retryer<MessageHeuristic> {
    pub fn new(policy: RetryPolicy) -> Result<Self, ConfigError> {
        Self::with_predicate(policy, MessageHeuristic)
    }
}

impl<P> Retryer<P> {
    pub fn with_predicate(policy: RetryPolicy, predicate: P) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self { policy, predicate })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// `cancel` fires, classifying errors with the stored predicate.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancelSignal,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        P: RetryPredicate<E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with(cancel, &self.predicate, op).await
    }

    /// Like [`execute`](Self::execute) with a predicate scoped to this call
    pub async fn execute_with<T, E, F, Fut, Q>(
        &self,
        cancel: &CancelSignal,
        predicate: &Q,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        Q: RetryPredicate<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt: u32 = 0;

        loop {
            if let Some(reason) = cancel.reason() {
                tracing::debug!(attempt = attempt + 1, %reason, "cancelled before attempt");
                return Err(RetryError::Cancelled {
                    attempt: attempt + 1,
                    reason,
                });
            }

            let error = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let attempts = attempt + 1;
            if !predicate.is_retryable(&error) {
                tracing::debug!(attempts, %error, "non-retryable error");
                return Err(RetryError::NonRetryable {
                    attempts,
                    source: error,
                });
            }

            if attempts >= max_attempts {
                tracing::error!(attempts, %error, "all retry attempts exhausted");
                return Err(RetryError::RetriesExhausted {
                    attempts,
                    last_error: error,
                });
            }

            let delay = backoff::jittered(self.policy.delay_for(attempt), self.policy.jitter_factor);
            tracing::warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying after failure"
            );

            tokio::select! {
                biased;
                reason = cancel.fired() => {
                    tracing::debug!(attempts, %reason, "cancelled while backing off");
                    return Err(RetryError::CancelledDuringRetry {
                        attempts,
                        reason,
                        last_error: error,
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt = attempts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CancelReason;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[derive(Debug)]
    enum DispatchError {
        Timeout,
        BadPayload,
    }

    impl fmt::Display for DispatchError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                DispatchError::Timeout => f.write_str("upstream timeout"),
                DispatchError::BadPayload => f.write_str("payload rejected"),
            }
        }
    }

    impl Transient for DispatchError {
        fn is_transient(&self) -> bool {
            matches!(self, DispatchError::Timeout)
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(matches!(
            Retryer::new(fast_policy(0)),
            Err(ConfigError::Invalid { field: "max_attempts", .. })
        ));

        let inverted = RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        let delays: Vec<_> = (0..5).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_message_heuristic() {
        let heuristic = MessageHeuristic;
        assert!(!heuristic.is_retryable("Validation failed: missing alertname"));
        assert!(!heuristic.is_retryable("INVALID token"));
        assert!(!heuristic.is_retryable("malformed JSON body"));
        assert!(heuristic.is_retryable("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_succeeds_after_one_failure() {
        let retryer = Retryer::new(fast_policy(3)).unwrap();
        let calls = AtomicU32::new(0);

        let result = retryer
            .execute(&CancelSignal::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("connection refused".to_string())
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let retryer = Retryer::new(fast_policy(2)).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .execute(&CancelSignal::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("503 service unavailable".to_string()) }
            })
            .await;

        match result {
            Err(RetryError::RetriesExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "503 service unavailable");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let retryer = Retryer::new(fast_policy(3)).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .execute(&CancelSignal::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("validation error: empty alerts".to_string()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::NonRetryable { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };
        let retryer = Retryer::new(policy).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancelSignal::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let counter = calls.clone();
        let result: Result<(), _> = retryer
            .execute(&cancel, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled(), "expected cancellation, got {err:?}");
        let calls = calls.load(Ordering::SeqCst);
        assert!((1..5).contains(&calls), "unexpected attempt count {calls}");
    }

    #[tokio::test]
    async fn test_deadline_reported_as_reason() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let retryer = Retryer::new(policy).unwrap();
        let cancel = CancelSignal::new().with_timeout(Duration::from_millis(20));

        let result: Result<(), _> = retryer
            .execute(&cancel, || async { Err("timeout".to_string()) })
            .await;

        match result {
            Err(RetryError::CancelledDuringRetry {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, CancelReason::DeadlineExceeded);
            }
            other => panic!("expected CancelledDuringRetry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let retryer = Retryer::new(fast_policy(3)).unwrap();
        let cancel = CancelSignal::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .execute(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unreachable".to_string()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Cancelled {
                attempt: 1,
                reason: CancelReason::Cancelled
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_typed_predicate() {
        let retryer = Retryer::with_predicate(fast_policy(3), ByKind).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .execute(&CancelSignal::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(DispatchError::Timeout)
                    } else {
                        Err(DispatchError::BadPayload)
                    }
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::NonRetryable {
                attempts: 2,
                source: DispatchError::BadPayload
            })
        ));
    }

    #[tokio::test]
    async fn test_call_scoped_predicate_does_not_leak() {
        let retryer = Arc::new(Retryer::new(fast_policy(3)).unwrap());
        let never_retry = |_: &String| false;

        let scoped = {
            let retryer = retryer.clone();
            tokio::spawn(async move {
                retryer
                    .execute_with(&CancelSignal::new(), &never_retry, || async {
                        Err::<(), _>("timeout".to_string())
                    })
                    .await
            })
        };
        let shared = {
            let retryer = retryer.clone();
            tokio::spawn(async move {
                retryer
                    .execute(&CancelSignal::new(), || async {
                        Err::<(), _>("timeout".to_string())
                    })
                    .await
            })
        };

        assert!(matches!(
            scoped.await.unwrap(),
            Err(RetryError::NonRetryable { attempts: 1, .. })
        ));
        assert!(matches!(
            shared.await.unwrap(),
            Err(RetryError::RetriesExhausted { attempts: 3, .. })
        ));
    }
}
