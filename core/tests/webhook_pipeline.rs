//! End-to-end composition: idempotency, then rate limit, then breaker, then retry

use resilience_machines::{
    CancelSignal, CircuitBreaker, CircuitState, IdempotencyManager, KeyedRateLimiter,
    RateLimitConfig, RateLimited, Rejected, RetryError, RetryPolicy, Retryer, TripPolicy,
    client_key,
};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
enum DeliveryError {
    Rejected(Rejected),
    Downstream(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Rejected(r) => write!(f, "{r}"),
            DeliveryError::Downstream(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Delivered,
    Duplicate,
}

#[derive(Debug)]
enum PipelineError {
    Limited(RateLimited),
    Failed(RetryError<DeliveryError>),
}

struct Pipeline {
    dedup: IdempotencyManager,
    limiter: KeyedRateLimiter,
    breaker: CircuitBreaker,
    retryer: Retryer,
}

impl Pipeline {
    fn new(burst: u32) -> Self {
        Self {
            dedup: IdempotencyManager::in_memory(Duration::from_secs(3600)).unwrap(),
            limiter: KeyedRateLimiter::new(RateLimitConfig {
                requests_per_second: 1.0,
                burst,
                ..RateLimitConfig::default()
            })
            .unwrap(),
            breaker: CircuitBreaker::builder("notifier")
                .trip_policy(TripPolicy::ConsecutiveFailures { threshold: 2 })
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap(),
            retryer: Retryer::new(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            })
            .unwrap(),
        }
    }

    /// `failures_before_success` failing downstream calls precede a success
    async fn handle(
        &self,
        peer: &str,
        payload: &[u8],
        downstream_calls: &AtomicU32,
        failures_before_success: u32,
    ) -> Result<Outcome, PipelineError> {
        if self.dedup.is_already_processed(payload).unwrap() {
            return Ok(Outcome::Duplicate);
        }

        let key = client_key(None, None, peer);
        self.limiter.check(&key).map_err(PipelineError::Limited)?;

        let breaker = &self.breaker;
        let only_downstream = |e: &DeliveryError| matches!(e, DeliveryError::Downstream(_));
        self.retryer
            .execute_with(&CancelSignal::new(), &only_downstream, move || async move {
                let permit = match breaker.allow() {
                    Ok(permit) => permit,
                    Err(rejected) => return Err(DeliveryError::Rejected(rejected)),
                };
                let n = downstream_calls.fetch_add(1, Ordering::SeqCst);
                if n < failures_before_success {
                    permit.failure();
                    Err(DeliveryError::Downstream(format!("503 on call {}", n + 1)))
                } else {
                    permit.success();
                    Ok::<(), DeliveryError>(())
                }
            })
            .await
            .map_err(PipelineError::Failed)?;

        self.dedup.mark_as_processed(payload).unwrap();
        Ok(Outcome::Delivered)
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried_then_deduplicated() {
    let pipeline = Pipeline::new(10);
    let calls = AtomicU32::new(0);
    let payload = br#"{"alert":"api latency","id":42}"#;

    let first = pipeline.handle("198.51.100.4:5100", payload, &calls, 1).await;
    assert!(matches!(first, Ok(Outcome::Delivered)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(pipeline.breaker.state(), CircuitState::Closed);

    let second = pipeline.handle("198.51.100.4:5100", payload, &calls, 0).await;
    assert!(matches!(second, Ok(Outcome::Duplicate)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_open_breaker_stops_retrying() {
    let pipeline = Pipeline::new(10);
    let calls = AtomicU32::new(0);

    let result = pipeline
        .handle("198.51.100.4:5100", b"outage", &calls, u32::MAX)
        .await;

    match result {
        Err(PipelineError::Failed(RetryError::NonRetryable { attempts, source })) => {
            assert_eq!(attempts, 3);
            assert!(matches!(source, DeliveryError::Rejected(Rejected::Open { .. })));
        }
        other => panic!("expected breaker rejection, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(pipeline.breaker.is_open());
    assert!(!pipeline.dedup.is_already_processed(b"outage").unwrap());
}

#[tokio::test]
async fn test_rate_limit_applies_per_client() {
    let pipeline = Pipeline::new(2);
    let calls = AtomicU32::new(0);

    for id in 0..2 {
        let payload = format!("{{\"id\":{id}}}");
        let result = pipeline.handle("203.0.113.1:1000", payload.as_bytes(), &calls, 0).await;
        assert!(matches!(result, Ok(Outcome::Delivered)));
    }

    let limited = pipeline.handle("203.0.113.1:2000", b"{\"id\":3}", &calls, 0).await;
    match limited {
        Err(PipelineError::Limited(err)) => {
            assert_eq!(err.key, "203.0.113.1");
            assert_eq!(err.quota.remaining, 0);
        }
        other => panic!("expected rate limiting, got {other:?}"),
    }

    let other_client = pipeline.handle("203.0.113.2:1000", b"{\"id\":3}", &calls, 0).await;
    assert!(matches!(other_client, Ok(Outcome::Delivered)));
}
