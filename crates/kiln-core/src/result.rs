//! Step results, the per-job ledger, and job/stage reports.

use crate::Error;
use crate::ids::{JobId, RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

/// Conclusion may diverge from outcome under continue-on-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepConclusion {
    Success,
    Failure,
    Skipped,
}

/// Bounded tail of a step's output, kept for failure reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputCapture {
    lines: VecDeque<String>,
    limit: usize,
    total_lines: u64,
}

impl OutputCapture {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            limit,
            total_lines: 0,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.total_lines += 1;
        if self.limit == 0 {
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub fn is_truncated(&self) -> bool {
        self.total_lines > self.lines.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub name: String,
    pub outcome: StepOutcome,
    pub conclusion: StepConclusion,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(default)]
    pub failure: Option<StepFailureKind>,
    pub duration_ms: u64,
    pub outputs: BTreeMap<String, String>,
    pub output: OutputCapture,
    /// Child records of a composite step, in execution order.
    pub children: Vec<StepRecord>,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn skipped(step_id: StepId, name: impl Into<String>) -> Self {
        Self {
            step_id,
            name: name.into(),
            outcome: StepOutcome::Skipped,
            conclusion: StepConclusion::Skipped,
            exit_code: None,
            error: None,
            failure: None,
            duration_ms: 0,
            outputs: BTreeMap::new(),
            output: OutputCapture::default(),
            children: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Whether this record stops the job.
    pub fn is_blocking_failure(&self) -> bool {
        self.conclusion == StepConclusion::Failure
    }
}

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    /// The command ran and exited nonzero.
    Exit,
    Timeout,
    /// The channel broke before an exit status arrived.
    Channel,
    Cancelled,
    /// A child of a composite step failed.
    Child,
    /// The step never got to run its command, e.g. an action that could
    /// not be expanded.
    Setup,
}

impl StepFailureKind {
    pub fn of(error: &Error) -> Self {
        match error {
            Error::StepFailed { .. } => StepFailureKind::Exit,
            Error::StepTimeout { .. } => StepFailureKind::Timeout,
            Error::Channel(_) | Error::SandboxNotReady(_) => StepFailureKind::Channel,
            Error::Cancelled { .. } => StepFailureKind::Cancelled,
            _ => StepFailureKind::Setup,
        }
    }
}

/// Append-only ledger of step records for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultLedger {
    records: Vec<StepRecord>,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn outcomes(&self) -> Vec<StepOutcome> {
        self.records.iter().map(|r| r.outcome).collect()
    }

    /// First record whose conclusion is a failure.
    pub fn first_failure(&self) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.is_blocking_failure())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// Rejected before anything was created.
    Config { message: String },
    /// Sandbox rejected by cluster admission.
    Admission { message: String },
    /// Sandbox never became ready.
    Readiness { message: String },
    /// A step failed without continue-on-error.
    Step {
        step_id: StepId,
        exit_code: Option<i32>,
        message: String,
    },
    Cancelled { reason: String },
    Internal { message: String },
}

impl JobFailure {
    pub fn message(&self) -> &str {
        match self {
            JobFailure::Config { message }
            | JobFailure::Admission { message }
            | JobFailure::Readiness { message }
            | JobFailure::Step { message, .. }
            | JobFailure::Internal { message } => message,
            JobFailure::Cancelled { reason } => reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub failure: Option<JobFailure>,
    pub ledger: ResultLedger,
    pub sandbox: Option<String>,
    /// Tail of each service unit's log, captured on failure.
    pub service_logs: BTreeMap<String, Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl JobReport {
    /// Report for a job that never started.
    pub fn not_started(job_id: JobId, name: impl Into<String>, status: JobStatus) -> Self {
        let now = Utc::now();
        let failure = match status {
            JobStatus::Cancelled => Some(JobFailure::Cancelled {
                reason: "cancelled before start".to_string(),
            }),
            _ => None,
        };
        Self {
            job_id,
            name: name.into(),
            status,
            failure,
            ledger: ResultLedger::new(),
            sandbox: None,
            service_logs: BTreeMap::new(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    /// Process-style exit code for the job.
    pub fn exit_code(&self) -> i32 {
        match (&self.status, &self.failure) {
            (JobStatus::Success | JobStatus::Skipped, _) => 0,
            (JobStatus::Cancelled, _) => 130,
            (_, Some(JobFailure::Step { .. })) => 1,
            _ => 2,
        }
    }

    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.ledger.first_failure()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub jobs: Vec<JobReport>,
    pub skipped: bool,
}

impl StageReport {
    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_success())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub stages: Vec<StageReport>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageReport::is_success)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.stages.iter().flat_map(|s| s.jobs.iter())
    }

    /// Highest job exit code, 0 when everything passed.
    pub fn exit_code(&self) -> i32 {
        self.jobs().map(JobReport::exit_code).max().unwrap_or(0)
    }
}
