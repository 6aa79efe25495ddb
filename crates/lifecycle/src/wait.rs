//! Cancellable polling.
//!
//! Every blocking wait in a run (pod termination, VM power state, cluster API
//! readiness) goes through [`poll_until`], so cancellation is observed at
//! poll-interval granularity.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Interval and budget for one polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollPolicy {
    #[must_use]
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Call `check` every `policy.interval` until it yields `Some`, the budget
/// runs out, or `cancel` fires. The first check runs immediately.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + policy.max_wait;

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }

        tokio::select! {
            () = cancel.cancelled() => return WaitOutcome::Cancelled,
            value = check() => {
                if let Some(value) = value {
                    return WaitOutcome::Ready(value);
                }
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }

        let nap = policy.interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return WaitOutcome::Cancelled,
            () = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(interval: u64, max_wait: u64) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(interval), Duration::from_secs(max_wait))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_polls() {
        let calls = &AtomicU32::new(0);
        let outcome = poll_until(policy(5, 60), &CancellationToken::new(), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            (n == 3).then_some(n)
        })
        .await;

        assert_eq!(outcome, WaitOutcome::Ready(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_budget() {
        let start = tokio::time::Instant::now();
        let outcome: WaitOutcome<()> =
            poll_until(policy(5, 30), &CancellationToken::new(), || async { None }).await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_observed_within_interval() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let outcome: WaitOutcome<()> = poll_until(policy(5, 600), &cancel, || async { None }).await;

        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(start.elapsed() <= Duration::from_secs(10));
    }
}
