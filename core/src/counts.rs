//! Request counters for the current circuit generation
//!
//! - `Counts`: immutable snapshot handed to trip predicates and callers
//! - `Tally`: shared counters the state machine guards read from
//! - `TripPolicy`: ready-made trip predicates

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Counters for one generation of a circuit breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    /// Fraction of completed requests that failed (0.0 when nothing completed)
    pub fn failure_ratio(&self) -> f64 {
        let completed = self.total_successes + self.total_failures;
        if completed == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(completed)
        }
    }
}

/// Thread-safe counters shared between the breaker and its state machine context.
///
/// Writers always hold the breaker's lock, so the individual atomics never
/// race with each other; they only make the tally `Sync`.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    requests: AtomicU32,
    total_successes: AtomicU32,
    total_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl Tally {
    pub(crate) fn on_request(&self) {
        bump(&self.requests);
    }

    pub(crate) fn on_success(&self) {
        bump(&self.total_successes);
        bump(&self.consecutive_successes);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn on_failure(&self) {
        bump(&self.total_failures);
        bump(&self.consecutive_failures);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        for counter in [
            &self.requests,
            &self.total_successes,
            &self.total_failures,
            &self.consecutive_successes,
            &self.consecutive_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> Counts {
        Counts {
            requests: self.requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU32) {
    // saturate instead of wrapping on very long generations
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
}

/// Ready-made trip predicates, evaluated after every failure while Closed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripPolicy {
    /// Trip once this many failures happen in a row
    ConsecutiveFailures { threshold: u32 },
    /// Trip once this many failures happen within the generation
    TotalFailures { threshold: u32 },
    /// Trip once at least `minimum_requests` were made and the failure
    /// ratio reaches `ratio` (0.0-1.0)
    FailureRate { ratio: f64, minimum_requests: u32 },
}

impl TripPolicy {
    pub fn should_trip(&self, counts: &Counts) -> bool {
        match *self {
            TripPolicy::ConsecutiveFailures { threshold } => {
                counts.consecutive_failures >= threshold.max(1)
            }
            TripPolicy::TotalFailures { threshold } => counts.total_failures >= threshold.max(1),
            TripPolicy::FailureRate {
                ratio,
                minimum_requests,
            } => counts.requests >= minimum_requests && counts.failure_ratio() >= ratio,
        }
    }
}

impl Default for TripPolicy {
    fn default() -> Self {
        TripPolicy::ConsecutiveFailures { threshold: 5 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_tracks_streaks() {
        let tally = Tally::default();

        tally.on_request();
        tally.on_success();
        tally.on_request();
        tally.on_success();
        tally.on_request();
        tally.on_failure();

        let counts = tally.snapshot();
        assert_eq!(counts.requests, 3);
        assert_eq!(counts.total_successes, 2);
        assert_eq!(counts.total_failures, 1);
        assert_eq!(counts.consecutive_successes, 0);
        assert_eq!(counts.consecutive_failures, 1);

        tally.clear();
        assert_eq!(tally.snapshot(), Counts::default());
    }

    #[test]
    fn test_failure_ratio_ignores_in_flight_requests() {
        let counts = Counts {
            requests: 4,
            total_successes: 1,
            total_failures: 1,
            ..Default::default()
        };
        assert_eq!(counts.failure_ratio(), 0.5);
        assert_eq!(Counts::default().failure_ratio(), 0.0);
    }

    #[test]
    fn test_failure_rate_policy_needs_minimum_requests() {
        let policy = TripPolicy::FailureRate {
            ratio: 0.5,
            minimum_requests: 3,
        };

        let two_of_two = Counts {
            requests: 2,
            total_failures: 2,
            consecutive_failures: 2,
            ..Default::default()
        };
        assert!(!policy.should_trip(&two_of_two));

        let two_of_three = Counts {
            requests: 3,
            total_successes: 1,
            total_failures: 2,
            consecutive_failures: 2,
            ..Default::default()
        };
        assert!(policy.should_trip(&two_of_three));
    }

    #[test]
    fn test_consecutive_policy_resets_on_success() {
        let policy = TripPolicy::ConsecutiveFailures { threshold: 2 };
        let tally = Tally::default();

        tally.on_failure();
        tally.on_success();
        tally.on_failure();
        assert!(!policy.should_trip(&tally.snapshot()));

        tally.on_failure();
        assert!(policy.should_trip(&tally.snapshot()));
    }

    #[test]
    fn test_policy_deserializes_from_tagged_toml() {
        let policy: TripPolicy =
            toml::from_str("kind = \"failure_rate\"\nratio = 0.6\nminimum_requests = 10\n")
                .expect("valid policy");
        assert_eq!(
            policy,
            TripPolicy::FailureRate {
                ratio: 0.6,
                minimum_requests: 10
            }
        );
    }
}
