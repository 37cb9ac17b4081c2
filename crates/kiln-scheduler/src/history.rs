//! Retention of finished job reports.

use kiln_core::config::CleanupPolicy;
use kiln_core::result::{JobReport, JobStatus};
use std::collections::VecDeque;

/// Most recent finished jobs, successes and failures kept separately.
/// Cancelled jobs count as failures; skipped jobs are not retained.
#[derive(Debug, Clone)]
pub struct RunHistory {
    successes: VecDeque<JobReport>,
    failures: VecDeque<JobReport>,
    success_limit: usize,
    failure_limit: usize,
}

impl RunHistory {
    pub fn new(policy: &CleanupPolicy) -> Self {
        Self {
            successes: VecDeque::new(),
            failures: VecDeque::new(),
            success_limit: policy.success_history_limit,
            failure_limit: policy.failure_history_limit,
        }
    }

    pub fn record(&mut self, report: JobReport) {
        let (queue, limit) = match report.status {
            JobStatus::Success => (&mut self.successes, self.success_limit),
            JobStatus::Failure | JobStatus::Cancelled => (&mut self.failures, self.failure_limit),
            JobStatus::Skipped => return,
        };
        queue.push_back(report);
        while queue.len() > limit {
            queue.pop_front();
        }
    }

    /// Oldest first.
    pub fn successes(&self) -> impl Iterator<Item = &JobReport> {
        self.successes.iter()
    }

    /// Oldest first.
    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.failures.iter()
    }

    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
