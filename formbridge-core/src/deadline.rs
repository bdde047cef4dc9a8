//! Caller-supplied deadlines for network steps.
//!
//! A [`Deadline`] is passed explicitly through certificate resolution, token
//! acquisition and remote API calls. Each blocking step wraps its future in
//! [`Deadline::bound`] so a stalled vault or identity provider cannot hold a
//! submission past the caller's budget.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// The deadline elapsed before a step completed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("deadline exceeded during {stage}")]
pub struct DeadlineExceeded {
    /// Name of the step that was cut off.
    pub stage: &'static str,
}

/// Point in time after which pending network steps are abandoned.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline; steps run until they finish on their own.
    pub fn none() -> Self {
        Self { at: None }
    }

    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    /// A deadline from an optional budget.
    pub fn from_budget(budget: Option<Duration>) -> Self {
        budget.map(Self::after).unwrap_or_default()
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Run `future`, giving up with [`DeadlineExceeded`] once the deadline passes.
    pub async fn bound<F, T>(&self, stage: &'static str, future: F) -> Result<T, DeadlineExceeded>
    where
        F: Future<Output = T>,
    {
        match self.at {
            None => Ok(future.await),
            Some(at) => tokio::time::timeout_at(at, future)
                .await
                .map_err(|_| DeadlineExceeded { stage }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_deadline_runs_to_completion() {
        let deadline = Deadline::none();
        assert!(deadline.remaining().is_none());
        assert!(!deadline.is_expired());

        let value = deadline.bound("noop", async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_cuts_off_slow_future() {
        let deadline = Deadline::after(Duration::from_millis(50));

        let result = deadline
            .bound("slow step", tokio::time::sleep(Duration::from_secs(5)))
            .await;

        assert_eq!(result, Err(DeadlineExceeded { stage: "slow step" }));
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_from_budget() {
        assert!(Deadline::from_budget(None).remaining().is_none());
    }
}
