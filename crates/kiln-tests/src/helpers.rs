//! Test helper functions and utilities.

use kiln_core::events::Event;
use kiln_core::result::{StepConclusion, StepOutcome, StepRecord};
use std::future::Future;
use std::time::Duration;

/// Poll `condition` every `interval` until it holds or `timeout` passes.
/// Uses tokio time, so it works on a paused clock.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}

/// `(outcome, conclusion)` per record, for compact ledger assertions.
pub fn ledger_shape(records: &[StepRecord]) -> Vec<(StepOutcome, StepConclusion)> {
    records.iter().map(|r| (r.outcome, r.conclusion)).collect()
}

/// Subjects of recorded events, in order.
pub fn subjects(events: &[Event]) -> Vec<String> {
    events.iter().map(Event::subject).collect()
}
