//! Single-shot refetch timer.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Holds at most one pending refetch deadline.
///
/// Firing disarms the timer; it is only re-armed once a new successful
/// result arrives.
#[derive(Debug, Default)]
pub struct RefetchScheduler {
    deadline: Option<Instant>,
}

impl RefetchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for `interval` from now, replacing any pending deadline.
    /// `None` cancels instead.
    pub fn schedule(&mut self, interval: Option<Duration>) {
        self.deadline = interval.map(|interval| Instant::now() + interval);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the deadline passes; never resolves while disarmed.
    ///
    /// Cancel-safe: dropping the future keeps the deadline.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
