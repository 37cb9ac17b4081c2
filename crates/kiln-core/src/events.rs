//! Events emitted to callers while jobs execute.

use crate::ids::{JobId, RunId, StepId};
use crate::result::{JobStatus, StepConclusion, StepOutcome};
use crate::sandbox::SandboxState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Job lifecycle
    JobQueued(JobQueuedPayload),
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),

    // Sandbox lifecycle
    SandboxStateChanged(SandboxStateChangedPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepOutput(StepOutputPayload),
    StepCompleted(StepCompletedPayload),

    // Stage lifecycle
    StageStarted(StageStartedPayload),
    StageCompleted(StageCompletedPayload),
}

impl Event {
    /// Dotted subject used for routing and log filtering.
    pub fn subject(&self) -> String {
        match self {
            Event::JobQueued(p) => format!("job.{}.queued", p.job_id),
            Event::JobStarted(p) => format!("job.{}.started", p.job_id),
            Event::JobCompleted(p) => format!("job.{}.completed", p.job_id),
            Event::SandboxStateChanged(p) => format!("job.{}.sandbox.{}", p.job_id, p.to),
            Event::StepStarted(p) => format!("job.{}.step.{}.started", p.job_id, p.step_id),
            Event::StepOutput(p) => format!("job.{}.step.{}.output", p.job_id, p.step_id),
            Event::StepCompleted(p) => format!("job.{}.step.{}.completed", p.job_id, p.step_id),
            Event::StageStarted(p) => format!("run.{}.stage.{}.started", p.run_id, p.stage_name),
            Event::StageCompleted(p) => {
                format!("run.{}.stage.{}.completed", p.run_id, p.stage_name)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueuedPayload {
    pub job_id: JobId,
    pub job_name: String,
    pub stage_name: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartedPayload {
    pub job_id: JobId,
    pub job_name: String,
    pub sandbox: String,
    pub template: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletedPayload {
    pub job_id: JobId,
    pub job_name: String,
    pub status: JobStatus,
    pub exit_code: i32,
    pub failure: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStateChangedPayload {
    pub job_id: JobId,
    pub sandbox: String,
    pub from: SandboxState,
    pub to: SandboxState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub job_id: JobId,
    pub step_id: StepId,
    pub step_name: String,
    pub depth: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutputPayload {
    pub job_id: JobId,
    pub step_id: StepId,
    pub stream: LogStream,
    pub line_number: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub job_id: JobId,
    pub step_id: StepId,
    pub step_name: String,
    pub outcome: StepOutcome,
    pub conclusion: StepConclusion,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStartedPayload {
    pub run_id: RunId,
    pub stage_name: String,
    pub stage_index: u32,
    pub job_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCompletedPayload {
    pub run_id: RunId,
    pub stage_name: String,
    pub stage_index: u32,
    pub jobs_passed: u32,
    pub jobs_failed: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}
