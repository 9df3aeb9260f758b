//! Cancellation signal for retry loops: an explicit token plus an optional deadline.

use crate::errors::CancelReason;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow an existing token, e.g. a child of a server shutdown token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now; a timeout past the clock's range means no deadline
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the signal has fired, or `None` while it is still live
    pub fn reason(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            Some(CancelReason::Cancelled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the token is cancelled or the deadline passes
    pub async fn fired(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => CancelReason::Cancelled,
                    () = tokio::time::sleep_until(deadline.into()) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_signal_has_no_reason() {
        let signal = CancelSignal::new().with_timeout(Duration::from_secs(60));
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn test_token_cancellation_wins_over_deadline() {
        let signal = CancelSignal::new().with_deadline(Instant::now());
        signal.cancel();
        assert_eq!(signal.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_unbounded_timeout_has_no_deadline() {
        let signal = CancelSignal::new().with_timeout(Duration::MAX);
        assert_eq!(signal.deadline(), None);
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn test_clones_share_the_token() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        signal.cancel();
        assert_eq!(observer.reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_fired_reports_deadline() {
        let signal = CancelSignal::new().with_timeout(Duration::from_millis(10));
        assert_eq!(signal.fired().await, CancelReason::DeadlineExceeded);
        assert_eq!(signal.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_fired_reports_parent_cancellation() {
        let parent = CancellationToken::new();
        let signal = CancelSignal::from_token(parent.child_token());

        let waiter = tokio::spawn(async move { signal.fired().await });
        parent.cancel();
        assert_eq!(waiter.await.unwrap(), CancelReason::Cancelled);
    }
}
