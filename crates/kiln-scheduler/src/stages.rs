//! Stage scheduling.
//!
//! Stages run one after another. Inside a stage every job gets its own
//! task, but only `max_parallel` of them hold a permit, and with it a
//! sandbox, at any moment. The rest wait for a permit.

use crate::history::RunHistory;
use crate::orchestrator::JobOrchestrator;
use chrono::Utc;
use kiln_core::events::{Event, JobQueuedPayload, StageCompletedPayload, StageStartedPayload};
use kiln_core::ids::{JobId, RunId};
use kiln_core::job::Job;
use kiln_core::ports::EventSink;
use kiln_core::result::{JobFailure, JobReport, JobStatus, RunReport, StageReport};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A named group of jobs that may run concurrently.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub jobs: Vec<Job>,
    /// Let later stages run even if a job here fails.
    pub continue_on_failure: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            continue_on_failure: false,
        }
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

pub struct StageScheduler {
    orchestrator: Arc<JobOrchestrator>,
    max_parallel: usize,
    events: Option<Arc<dyn EventSink>>,
    history: Arc<Mutex<RunHistory>>,
}

impl StageScheduler {
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        let config = orchestrator.config();
        let max_parallel = config.max_parallel.max(1);
        let history = RunHistory::new(&config.cleanup);
        Self {
            orchestrator,
            max_parallel,
            events: None,
            history: Arc::new(Mutex::new(history)),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Snapshot of retained job reports.
    pub fn history(&self) -> RunHistory {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run every stage in order. Once a stage fails without
    /// `continue_on_failure`, the remaining stages are reported skipped.
    pub async fn run(&self, stages: Vec<Stage>, cancel: CancellationToken) -> RunReport {
        let run_id = RunId::new();
        let started = Instant::now();
        info!(run_id = %run_id, stages = stages.len(), max_parallel = self.max_parallel, "Starting run");

        let mut reports = Vec::with_capacity(stages.len());
        let mut halted = false;
        for (index, stage) in stages.into_iter().enumerate() {
            if halted || cancel.is_cancelled() {
                let status = if cancel.is_cancelled() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Skipped
                };
                info!(stage = %stage.name, ?status, "Stage not started");
                reports.push(StageReport {
                    jobs: stage
                        .jobs
                        .iter()
                        .map(|job| JobReport::not_started(job.id, job.name.clone(), status))
                        .collect(),
                    name: stage.name,
                    skipped: true,
                });
                continue;
            }

            let continue_on_failure = stage.continue_on_failure;
            let report = self.run_stage(run_id, index as u32, stage, &cancel).await;
            if !report.is_success() && !continue_on_failure {
                warn!(stage = %report.name, "Stage failed, skipping later stages");
                halted = true;
            }
            reports.push(report);
        }

        let report = RunReport {
            run_id,
            stages: reports,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            run_id = %run_id,
            success = report.is_success(),
            duration_ms = report.duration_ms,
            "Run finished"
        );
        report
    }

    async fn run_stage(
        &self,
        run_id: RunId,
        index: u32,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> StageReport {
        info!(stage = %stage.name, jobs = stage.jobs.len(), "Starting stage");
        self.publish(Event::StageStarted(StageStartedPayload {
            run_id,
            stage_name: stage.name.clone(),
            stage_index: index,
            job_count: stage.jobs.len() as u32,
            started_at: Utc::now(),
        }))
        .await;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let identities: Vec<(JobId, String)> =
            stage.jobs.iter().map(|j| (j.id, j.name.clone())).collect();
        let mut slots: Vec<Option<JobReport>> = vec![None; stage.jobs.len()];
        let mut tasks = JoinSet::new();

        for (slot, job) in stage.jobs.into_iter().enumerate() {
            self.publish(Event::JobQueued(JobQueuedPayload {
                job_id: job.id,
                job_name: job.name.clone(),
                stage_name: stage.name.clone(),
                queued_at: Utc::now(),
            }))
            .await;

            let job = Arc::new(job);
            let orchestrator = self.orchestrator.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let report = match permit {
                    Some(_permit) => orchestrator.run_job(job, cancel).await,
                    None => JobReport::not_started(job.id, job.name.clone(), JobStatus::Cancelled),
                };
                (slot, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, report)) => {
                    if let Ok(mut history) = self.history.lock() {
                        history.record(report.clone());
                    }
                    slots[slot] = Some(report);
                }
                Err(e) => error!(stage = %stage.name, error = %e, "Job task failed"),
            }
        }

        let jobs: Vec<JobReport> = slots
            .into_iter()
            .zip(identities)
            .map(|(report, (job_id, name))| {
                report.unwrap_or_else(|| {
                    let mut lost = JobReport::not_started(job_id, name, JobStatus::Failure);
                    lost.failure = Some(JobFailure::Internal {
                        message: "job task aborted".to_string(),
                    });
                    lost
                })
            })
            .collect();

        let jobs_passed = jobs.iter().filter(|j| j.status.is_success()).count() as u32;
        let jobs_failed = jobs.len() as u32 - jobs_passed;
        info!(stage = %stage.name, jobs_passed, jobs_failed, "Stage finished");
        self.publish(Event::StageCompleted(StageCompletedPayload {
            run_id,
            stage_name: stage.name.clone(),
            stage_index: index,
            jobs_passed,
            jobs_failed,
            completed_at: Utc::now(),
        }))
        .await;

        StageReport {
            name: stage.name,
            jobs,
            skipped: false,
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(events) = &self.events
            && let Err(e) = events.publish(event).await
        {
            warn!(error = %e, "Failed to publish event");
        }
    }
}
