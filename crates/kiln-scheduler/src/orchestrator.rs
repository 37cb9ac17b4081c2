//! Job orchestration.
//!
//! One job, end to end: resolve the placement, build and create the
//! sandbox, wait for it to become ready, drive the steps, tear it down.
//! Teardown runs on every exit path. If the `run_job` future is dropped
//! before it gets there, a guard spawns the teardown instead.

use crate::reaper::ActiveSandboxes;
use chrono::Utc;
use kiln_core::config::EngineConfig;
use kiln_core::events::{Event, JobCompletedPayload, JobStartedPayload};
use kiln_core::job::Job;
use kiln_core::ports::{ClusterApi, EventSink};
use kiln_core::result::{JobFailure, JobReport, JobStatus, ResultLedger};
use kiln_core::{Error, Result};
use kiln_platform::PlatformResolver;
use kiln_runner::{ActionHandler, DriverConfig, InlineActionHandler, StepDriver};
use kiln_sandbox::builder::service_unit_name;
use kiln_sandbox::{CommandChannel, SandboxBuilder, SandboxLifecycle};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs jobs against a cluster.
pub struct JobOrchestrator {
    cluster: Arc<dyn ClusterApi>,
    config: Arc<EngineConfig>,
    resolver: PlatformResolver,
    builder: SandboxBuilder,
    actions: Arc<dyn ActionHandler>,
    events: Option<Arc<dyn EventSink>>,
    active: ActiveSandboxes,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("namespace", &self.config.namespace)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// What the guarded section produced.
struct Guarded {
    ledger: ResultLedger,
    failure: Option<JobFailure>,
}

impl JobOrchestrator {
    /// Fails when the platform table is invalid.
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Arc<EngineConfig>) -> Result<Self> {
        let resolver = PlatformResolver::new(config.platforms.clone())?;
        let builder = SandboxBuilder::new(&config);
        Ok(Self {
            cluster,
            config,
            resolver,
            builder,
            actions: Arc::new(InlineActionHandler),
            events: None,
            active: ActiveSandboxes::default(),
        })
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionHandler>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PlatformResolver {
        &self.resolver
    }

    /// Sandboxes this orchestrator currently owns.
    pub fn active(&self) -> ActiveSandboxes {
        self.active.clone()
    }

    /// Run one job to completion. Never fails: every outcome, including
    /// invalid input, is described by the report.
    pub async fn run_job(&self, job: Arc<Job>, cancel: CancellationToken) -> JobReport {
        let started_at = Utc::now();
        let started = Instant::now();

        if let Err(e) = job.validate() {
            warn!(job = %job.name, error = %e, "Job rejected");
            let failure = JobFailure::Config {
                message: e.to_string(),
            };
            return self
                .finish(&job, None, ResultLedger::new(), Some(failure), BTreeMap::new(), started_at, started)
                .await;
        }
        if cancel.is_cancelled() {
            let report = JobReport::not_started(job.id, job.name.clone(), JobStatus::Cancelled);
            self.publish_completed(&report).await;
            return report;
        }

        let template = self.resolver.resolve(&job.placement);
        let spec = self.builder.build(&job, &template);
        let sandbox_name = spec.name.clone();
        info!(
            job = %job.name,
            sandbox = %sandbox_name,
            template = %template.name,
            "Starting job"
        );

        let mut lifecycle =
            SandboxLifecycle::new(self.cluster.clone(), spec, job.id, self.config.readiness.clone());
        if let Some(events) = &self.events {
            lifecycle = lifecycle.with_events(events.clone());
        }
        let lifecycle = Arc::new(lifecycle);

        self.active.insert(&sandbox_name);
        let mut guard = TeardownGuard::new(lifecycle.clone(), self.active.clone());

        self.publish(Event::JobStarted(JobStartedPayload {
            job_id: job.id,
            job_name: job.name.clone(),
            sandbox: sandbox_name.clone(),
            template: template.name.clone(),
            started_at,
        }))
        .await;

        let outcome = self.guarded(&job, &lifecycle, &cancel).await;

        let service_logs = if outcome.failure.is_some() {
            self.service_logs(&job, &lifecycle).await
        } else {
            BTreeMap::new()
        };

        if let Err(e) = lifecycle.teardown().await {
            error!(sandbox = %sandbox_name, error = %e, "Sandbox teardown failed");
        }
        self.active.remove(&sandbox_name);
        guard.disarm();

        self.finish(
            &job,
            Some(sandbox_name),
            outcome.ledger,
            outcome.failure,
            service_logs,
            started_at,
            started,
        )
        .await
    }

    /// Create, wait, drive. Everything here may fail or be cancelled;
    /// teardown is the caller's job.
    async fn guarded(
        &self,
        job: &Arc<Job>,
        lifecycle: &Arc<SandboxLifecycle>,
        cancel: &CancellationToken,
    ) -> Guarded {
        let prepare = async {
            lifecycle.create().await?;
            lifecycle.await_ready(self.config.readiness.timeout()).await
        };
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled {
                reason: "cancelled while provisioning".to_string(),
            }),
            result = prepare => result,
        };
        if let Err(e) = prepared {
            warn!(job = %job.name, error = %e, "Sandbox never became ready");
            return Guarded {
                ledger: ResultLedger::new(),
                failure: Some(failure_for(e)),
            };
        }

        let channel = CommandChannel::new(self.cluster.clone(), lifecycle.clone());
        let mut driver = StepDriver::new(job.clone(), channel, DriverConfig::from_engine(&self.config))
            .with_actions(self.actions.clone());
        if let Some(events) = &self.events {
            driver = driver.with_events(events.clone());
        }
        let outcome = driver.run(cancel).await;

        let failure = if cancel.is_cancelled() {
            Some(JobFailure::Cancelled {
                reason: "cancelled while running steps".to_string(),
            })
        } else {
            outcome.ledger.first_failure().map(|record| JobFailure::Step {
                step_id: record.step_id.clone(),
                exit_code: record.exit_code,
                message: record
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("step {} failed", record.step_id)),
            })
        };
        Guarded {
            ledger: outcome.ledger,
            failure,
        }
    }

    /// Tail of each service unit's log. Best effort: the sandbox may be
    /// gone already.
    async fn service_logs(
        &self,
        job: &Job,
        lifecycle: &SandboxLifecycle,
    ) -> BTreeMap<String, Vec<String>> {
        let reference = lifecycle.reference();
        let tail = u32::try_from(self.config.output_tail_lines).unwrap_or(u32::MAX);
        let mut logs = BTreeMap::new();
        for service in &job.services {
            let unit = service_unit_name(&service.name);
            match self.cluster.logs(&reference, &unit, tail).await {
                Ok(lines) => {
                    logs.insert(service.name.clone(), lines);
                }
                Err(e) => warn!(service = %service.name, error = %e, "Could not fetch service logs"),
            }
        }
        logs
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        job: &Job,
        sandbox: Option<String>,
        ledger: ResultLedger,
        failure: Option<JobFailure>,
        service_logs: BTreeMap<String, Vec<String>>,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
    ) -> JobReport {
        let status = match &failure {
            None => JobStatus::Success,
            Some(JobFailure::Cancelled { .. }) => JobStatus::Cancelled,
            Some(_) => JobStatus::Failure,
        };
        let report = JobReport {
            job_id: job.id,
            name: job.name.clone(),
            status,
            failure,
            ledger,
            sandbox,
            service_logs,
            started_at,
            completed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        match &report.failure {
            None => info!(job = %job.name, duration_ms = report.duration_ms, "Job succeeded"),
            Some(failure) => warn!(
                job = %job.name,
                status = ?report.status,
                reason = %failure.message(),
                "Job did not succeed"
            ),
        }
        self.publish_completed(&report).await;
        report
    }

    async fn publish_completed(&self, report: &JobReport) {
        self.publish(Event::JobCompleted(JobCompletedPayload {
            job_id: report.job_id,
            job_name: report.name.clone(),
            status: report.status,
            exit_code: report.exit_code(),
            failure: report.failure.as_ref().map(|f| f.message().to_string()),
            duration_ms: report.duration_ms,
            completed_at: report.completed_at,
        }))
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Some(events) = &self.events
            && let Err(e) = events.publish(event).await
        {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

/// Map a provisioning error onto the report's failure kind.
fn failure_for(error: Error) -> JobFailure {
    match error {
        Error::Admission(message) => JobFailure::Admission { message },
        Error::Cancelled { reason } => JobFailure::Cancelled { reason },
        Error::Config(message) | Error::InvalidJob(message) => JobFailure::Config { message },
        e @ (Error::ReadinessTimeout { .. }
        | Error::SandboxFailed(_)
        | Error::NodeLost(_)
        | Error::Teardown { .. }) => JobFailure::Readiness {
            message: e.to_string(),
        },
        e => JobFailure::Internal {
            message: e.to_string(),
        },
    }
}

/// Spawns teardown when dropped armed.
struct TeardownGuard {
    lifecycle: Option<Arc<SandboxLifecycle>>,
    active: ActiveSandboxes,
}

impl TeardownGuard {
    fn new(lifecycle: Arc<SandboxLifecycle>, active: ActiveSandboxes) -> Self {
        Self {
            lifecycle: Some(lifecycle),
            active,
        }
    }

    fn disarm(&mut self) {
        self.lifecycle = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(lifecycle) = self.lifecycle.take() else {
            return;
        };
        let name = lifecycle.reference().name;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(sandbox = %name, "No runtime left to tear down sandbox");
            return;
        };
        warn!(sandbox = %name, "Job abandoned, tearing down in background");
        let active = self.active.clone();
        handle.spawn(async move {
            if let Err(e) = lifecycle.teardown().await {
                error!(sandbox = %name, error = %e, "Background teardown failed");
            }
            active.remove(&name);
        });
    }
}
