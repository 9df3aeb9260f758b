//! ResilienceMachines - resilience primitives for webhook-driven backends
//!
//! This crate provides four independent building blocks:
//! - Circuit breaker with lazy Closed → Open → HalfOpen transitions and
//!   generation tokens that drop results of calls started before a transition
//! - Retryer with bounded exponential backoff, interruptible by a cancellation
//!   token or deadline
//! - Per-key token-bucket rate limiter with idle bucket eviction
//! - Idempotency guard keyed by a SHA-256 digest of the payload
//!
//! They are designed to compose: idempotency check, then rate limit, then
//! circuit breaker, then retry.
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{CircuitBreaker, IdempotencyManager, TripPolicy};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::builder("slack")
//!     .trip_policy(TripPolicy::ConsecutiveFailures { threshold: 3 })
//!     .timeout(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! let dedup = IdempotencyManager::in_memory(Duration::from_secs(3600)).unwrap();
//! let payload = br#"{"alert":"disk full"}"#;
//!
//! if dedup.claim(payload).unwrap() {
//!     let result = breaker.call(|| {
//!         // Your notification call here
//!         Ok::<_, String>("delivered")
//!     });
//!     assert_eq!(result.unwrap(), "delivered");
//! }
//!
//! assert!(dedup.is_already_processed(payload).unwrap());
//! assert!(breaker.is_closed());
//! ```

pub mod backoff;
pub mod builder;
pub mod callbacks;
pub mod cancel;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod counts;
pub mod errors;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;
pub mod storage;

pub use builder::CircuitBuilder;
pub use cancel::CancelSignal;
pub use circuit::{CircuitBreaker, CircuitState, Permit, Settings};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use config::{BreakerConfig, IdempotencyConfig, RateLimitConfig, ResilienceConfig, RetryConfig};
pub use counts::{Counts, TripPolicy};
pub use errors::{
    CancelReason, CircuitError, ConfigError, RateLimited, Rejected, RetryError, StoreError,
};
pub use idempotency::IdempotencyManager;
pub use rate_limit::{Admission, KeyedRateLimiter, Quota, client_key};
pub use retry::{ByKind, MessageHeuristic, RetryPolicy, RetryPredicate, Retryer, Transient};
pub use storage::{IdempotencyStore, MemoryStore, NullStore};
pub use tokio_util::sync::CancellationToken;
