//! Error types for every resilience primitive
//!
//! Each failure kind is a distinct variant so callers can map it to their own
//! response (for example an HTTP status) without string inspection.

use crate::rate_limit::Quota;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A circuit breaker refused to run the protected call.
///
/// The wrapped function was never invoked, so there is no inner error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    /// Circuit is open, calls are being rejected
    #[error("circuit '{circuit}' is open")]
    Open { circuit: String },
    /// Circuit is half-open and every trial slot is taken
    #[error("circuit '{circuit}' is half-open and at its limit of {limit} trial requests")]
    TooManyRequests { circuit: String, limit: u32 },
}

impl Rejected {
    /// Name of the circuit that rejected the call
    pub fn circuit(&self) -> &str {
        match self {
            Rejected::Open { circuit } | Rejected::TooManyRequests { circuit, .. } => circuit,
        }
    }
}

/// Errors returned by [`CircuitBreaker::call`](crate::CircuitBreaker::call)
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker did not permit the call
    #[error(transparent)]
    Rejected(#[from] Rejected),
    /// The wrapped operation failed; the error is passed through untouched
    #[error(transparent)]
    Execution(E),
}

impl<E> CircuitError<E> {
    /// True when the breaker refused the call without invoking it
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected(_))
    }

    /// The operation's own error, if the call was permitted and failed
    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            CircuitError::Rejected(_) => None,
        }
    }
}

/// Why a cancellation signal fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The token was cancelled explicitly
    Cancelled,
    /// The signal's deadline passed
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("context cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Errors returned by [`Retryer`](crate::Retryer)
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation was observed before an attempt was started
    #[error("operation cancelled before attempt {attempt}: {reason}")]
    Cancelled { attempt: u32, reason: CancelReason },

    /// Cancellation fired while waiting between attempts
    #[error("operation cancelled during retry after {attempts} attempts: {reason}")]
    CancelledDuringRetry {
        attempts: u32,
        reason: CancelReason,
        #[source]
        last_error: E,
    },

    /// The retry predicate classified the error as permanent
    #[error("non-retryable error on attempt {attempts}: {source}")]
    NonRetryable {
        attempts: u32,
        #[source]
        source: E,
    },

    /// Every attempt failed with a retryable error
    #[error("max attempts ({attempts}) exceeded: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempt, .. } => attempt.saturating_sub(1),
            RetryError::CancelledDuringRetry { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::RetriesExhausted { attempts, .. } => *attempts,
        }
    }

    /// True for both cancellation variants
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RetryError::Cancelled { .. } | RetryError::CancelledDuringRetry { .. }
        )
    }

    /// The last error produced by the operation, if it ran at all
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::CancelledDuringRetry { last_error, .. }
            | RetryError::RetriesExhausted { last_error, .. } => Some(last_error),
            RetryError::NonRetryable { source, .. } => Some(source),
        }
    }
}

/// Admission denied by [`KeyedRateLimiter`](crate::KeyedRateLimiter)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for '{key}', retry in {retry_after:?}")]
pub struct RateLimited {
    pub key: String,
    /// Always reports zero remaining tokens
    pub quota: Quota,
    /// Time until one token becomes available
    pub retry_after: Duration,
}

/// An idempotency store could not answer or record a key
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency store backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Invalid construction arguments or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read configuration from {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
