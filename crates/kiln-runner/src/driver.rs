//! Step driver.
//!
//! Runs a job's steps in order over one command channel. Each step sees
//! the job env, then whatever earlier steps published through
//! `$KILN_ENV`, then its own env, each layer overriding the one before.

use crate::action::{ActionHandler, ActionPlan, InlineActionHandler};
use crate::readback;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_core::config::EngineConfig;
use kiln_core::env::EnvStore;
use kiln_core::events::{Event, StepCompletedPayload, StepOutputPayload, StepStartedPayload};
use kiln_core::interpolation::{InterpolationContext, mask};
use kiln_core::job::{Job, Step, StepKind};
use kiln_core::ports::EventSink;
use kiln_core::Error;
use kiln_core::result::{
    OutputCapture, ResultLedger, StepConclusion, StepFailureKind, StepOutcome, StepRecord,
};
use kiln_sandbox::{CommandChannel, ExecRequest, WORKSPACE_DIR};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub default_step_timeout: Duration,
    pub output_tail_lines: usize,
}

impl DriverConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            default_step_timeout: Duration::from_secs(
                u64::from(config.default_step_timeout_minutes) * 60,
            ),
            output_tail_lines: config.output_tail_lines,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// Everything the driver produced for one job.
#[derive(Debug, Clone, Default)]
pub struct DriveOutcome {
    pub ledger: ResultLedger,
    pub env: EnvStore,
}

/// Mutable per-job state threaded through the step tree.
struct RunState {
    env: EnvStore,
    outputs: BTreeMap<String, BTreeMap<String, String>>,
}

/// How one step's work ended, before it becomes a record.
#[derive(Default)]
struct Execution {
    success: bool,
    exit_code: Option<i32>,
    error: Option<String>,
    failure: Option<StepFailureKind>,
    outputs: BTreeMap<String, String>,
    output: OutputCapture,
    children: Vec<StepRecord>,
}

impl Execution {
    fn failed<'a>(error: &Error, secrets: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            error: Some(mask(&error.to_string(), secrets)),
            failure: Some(StepFailureKind::of(error)),
            ..Self::default()
        }
    }

    fn cancelled(&self) -> bool {
        self.failure == Some(StepFailureKind::Cancelled)
    }
}

/// Drives the steps of one job inside its sandbox.
pub struct StepDriver {
    job: Arc<Job>,
    channel: CommandChannel,
    config: DriverConfig,
    actions: Arc<dyn ActionHandler>,
    events: Option<Arc<dyn EventSink>>,
}

impl StepDriver {
    pub fn new(job: Arc<Job>, channel: CommandChannel, config: DriverConfig) -> Self {
        Self {
            job,
            channel,
            config,
            actions: Arc::new(InlineActionHandler),
            events: None,
        }
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionHandler>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run every step. A step failing without continue-on-error, or
    /// cancellation, records the remaining steps as skipped.
    pub async fn run(&self, cancel: &CancellationToken) -> DriveOutcome {
        let mut state = RunState {
            env: EnvStore::new(),
            outputs: BTreeMap::new(),
        };
        info!(job = %self.job.name, steps = self.job.leaf_step_count(), "Running steps");

        let records = self.run_steps(&self.job.steps, 0, &mut state, cancel).await;

        let mut ledger = ResultLedger::new();
        for record in records {
            ledger.append(record);
        }
        DriveOutcome {
            ledger,
            env: state.env,
        }
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [Step],
        depth: u32,
        state: &'a mut RunState,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Vec<StepRecord>> {
        async move {
            let mut records = Vec::with_capacity(steps.len());
            let mut blocked = false;
            for step in steps {
                if blocked || cancel.is_cancelled() {
                    let record = StepRecord::skipped(step.id.clone(), step.display_name());
                    debug!(step = %step.id, "Step skipped");
                    self.publish_completed(&record).await;
                    records.push(record);
                    continue;
                }
                let record = self.run_step(step, depth, state, cancel).await;
                blocked = record.is_blocking_failure();
                records.push(record);
            }
            records
        }
        .boxed()
    }

    async fn run_step(
        &self,
        step: &Step,
        depth: u32,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> StepRecord {
        let started = Instant::now();
        info!(step = %step.id, depth, "Starting step");
        self.publish(Event::StepStarted(StepStartedPayload {
            job_id: self.job.id,
            step_id: step.id.clone(),
            step_name: step.display_name().to_string(),
            depth,
            started_at: Utc::now(),
        }))
        .await;

        let execution = match &step.kind {
            StepKind::Run { run, shell } => self.run_command(step, run, shell, state, cancel).await,
            StepKind::Composite { steps } => self.run_children(steps, depth, state, cancel).await,
            StepKind::Action { uses, with } => {
                let inputs = self.context(state, &BTreeMap::new()).interpolate_map(with);
                match self.actions.expand(step, uses, &inputs).await {
                    Ok(ActionPlan::Command { run, shell }) => {
                        self.run_command(step, &run, &shell, state, cancel).await
                    }
                    Ok(ActionPlan::Steps(children)) => {
                        self.run_children(&children, depth, state, cancel).await
                    }
                    Err(e) => Execution::failed(&e, self.secrets()),
                }
            }
        };

        let record = self.record(step, execution, started.elapsed());
        match record.outcome {
            StepOutcome::Success => info!(step = %step.id, "Step completed successfully"),
            _ => warn!(
                step = %step.id,
                exit_code = ?record.exit_code,
                error = record.error.as_deref().unwrap_or(""),
                continue_on_error = step.continue_on_error,
                "Step failed"
            ),
        }
        self.publish_completed(&record).await;
        record
    }

    async fn run_children(
        &self,
        steps: &[Step],
        depth: u32,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Execution {
        let children = self.run_steps(steps, depth + 1, state, cancel).await;
        match children.iter().find(|c| c.is_blocking_failure()) {
            Some(failed) => Execution {
                exit_code: failed.exit_code,
                error: Some(format!("step {} failed", failed.step_id)),
                failure: Some(if cancel.is_cancelled() {
                    StepFailureKind::Cancelled
                } else {
                    StepFailureKind::Child
                }),
                children,
                ..Execution::default()
            },
            None => Execution {
                success: true,
                children,
                ..Execution::default()
            },
        }
    }

    async fn run_command(
        &self,
        step: &Step,
        run: &str,
        shell: &str,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Execution {
        let exported = self.step_env(step, state);
        let context = self.context(state, &exported);
        let command = context.interpolate(run);
        let request = ExecRequest::new(command)
            .with_shell(shell)
            .with_env(exported)
            .in_dir(workdir(step));

        let limit = step
            .timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
            .unwrap_or(self.config.default_step_timeout);

        let (tx, mut rx) = mpsc::channel(256);
        let exec = tokio::time::timeout(limit, self.channel.exec(&request, tx, cancel));
        let pump = async {
            let mut capture = OutputCapture::with_limit(self.config.output_tail_lines);
            while let Some(line) = rx.recv().await {
                let content = mask(&line.content, self.secrets());
                capture.push(content.clone());
                self.publish(Event::StepOutput(StepOutputPayload {
                    job_id: self.job.id,
                    step_id: step.id.clone(),
                    stream: line.stream,
                    line_number: line.line_number,
                    content,
                    timestamp: line.timestamp,
                }))
                .await;
            }
            capture
        };
        let (result, output) = tokio::join!(exec, pump);

        let mut execution = match result {
            Ok(Ok(status)) if status.success() => Execution {
                success: true,
                exit_code: Some(status.exit_code),
                ..Execution::default()
            },
            Ok(Ok(status)) => {
                let error = Error::StepFailed {
                    exit_code: status.exit_code,
                    message: output.lines().last().unwrap_or("no output").to_string(),
                };
                Execution {
                    exit_code: Some(status.exit_code),
                    ..Execution::failed(&error, self.secrets())
                }
            }
            Ok(Err(e)) if cancel.is_cancelled() => {
                debug!(step = %step.id, error = %e, "Step interrupted by cancellation");
                let error = Error::Cancelled {
                    reason: "step interrupted".to_string(),
                };
                Execution::failed(&error, self.secrets())
            }
            Ok(Err(e)) => Execution::failed(&e, self.secrets()),
            Err(_) => {
                // The exec future was dropped mid-command.
                self.channel.lifecycle().finish_command().await;
                let error = Error::StepTimeout {
                    seconds: limit.as_secs(),
                };
                Execution::failed(&error, self.secrets())
            }
        };
        execution.output = output;

        if execution.exit_code.is_some() {
            match self.read_back(step, state, cancel).await {
                Ok(outputs) => execution.outputs = outputs,
                Err(e) => {
                    execution.success = false;
                    execution.error = Some(format!("could not read step files: {}", e));
                    execution.failure = Some(StepFailureKind::of(&e));
                }
            }
        } else if !execution.cancelled() {
            self.discard_files(step, cancel).await;
        }
        execution
    }

    /// Drop whatever a command that never finished wrote to `$KILN_ENV` and
    /// `$KILN_OUTPUT`, so the next step's read-back starts empty.
    async fn discard_files(&self, step: &Step, cancel: &CancellationToken) {
        let request = ExecRequest::new(readback::discard_script())
            .with_env(file_env())
            .in_dir(WORKSPACE_DIR);
        match self.channel.capture(&request, cancel).await {
            Ok((status, _)) if status.success() => {
                debug!(step = %step.id, "Discarded files of unfinished step")
            }
            Ok((status, _)) => warn!(
                step = %step.id,
                exit_code = status.exit_code,
                "Could not discard files of unfinished step"
            ),
            Err(e) => warn!(
                step = %step.id,
                error = %e,
                "Could not discard files of unfinished step"
            ),
        }
    }

    /// Collect `$KILN_ENV` into the job env store and `$KILN_OUTPUT` into
    /// the step's outputs.
    async fn read_back(
        &self,
        step: &Step,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> kiln_core::Result<BTreeMap<String, String>> {
        let request = ExecRequest::new(readback::script())
            .with_env(file_env())
            .in_dir(WORKSPACE_DIR);
        let (status, lines) = self.channel.capture(&request, cancel).await?;
        if !status.success() {
            return Err(kiln_core::Error::Channel(format!(
                "read-back exited with code {}",
                status.exit_code
            )));
        }

        let stdout = lines
            .iter()
            .filter(|l| l.stream == kiln_core::events::LogStream::Stdout)
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let files = readback::split(&stdout)?;
        let appended = state.env.append_file(step.id.as_str(), &files.env)?;
        if appended > 0 {
            debug!(step = %step.id, appended, "Step published environment");
        }

        let outputs: BTreeMap<String, String> = files.outputs.into_iter().collect();
        state.outputs.insert(step.id.to_string(), outputs.clone());
        Ok(outputs)
    }

    /// Variables exported for a step: env store, then step env, then the
    /// driver's own `KILN_*` variables. Job env reaches the sandbox through
    /// its config object.
    fn step_env(&self, step: &Step, state: &RunState) -> BTreeMap<String, String> {
        let mut env = state.env.snapshot();
        let context = self.context(state, &env);
        env.extend(context.interpolate_map(&step.env));
        env.extend(file_env());
        env.insert("KILN_STEP".to_string(), step.id.to_string());
        env.insert("KILN_WORKSPACE".to_string(), WORKSPACE_DIR.to_string());
        env
    }

    fn context(
        &self,
        state: &RunState,
        exported: &BTreeMap<String, String>,
    ) -> InterpolationContext {
        let mut env = self.job.env.clone();
        env.extend(state.env.snapshot());
        env.extend(exported.clone());
        let mut context = InterpolationContext::new()
            .with_env(env)
            .with_secrets(self.job.secrets.clone());
        for (step, outputs) in &state.outputs {
            context.set_outputs(step, outputs.clone());
        }
        context
    }

    fn secrets(&self) -> impl Iterator<Item = &str> {
        self.job.secrets.values().map(String::as_str)
    }

    fn record(&self, step: &Step, execution: Execution, elapsed: Duration) -> StepRecord {
        let outcome = if execution.success {
            StepOutcome::Success
        } else {
            StepOutcome::Failure
        };
        let conclusion = match outcome {
            StepOutcome::Success => StepConclusion::Success,
            _ if step.continue_on_error && !execution.cancelled() => StepConclusion::Success,
            _ => StepConclusion::Failure,
        };
        StepRecord {
            step_id: step.id.clone(),
            name: step.display_name().to_string(),
            outcome,
            conclusion,
            exit_code: execution.exit_code,
            error: execution.error,
            failure: execution.failure,
            duration_ms: elapsed.as_millis() as u64,
            outputs: execution.outputs,
            output: execution.output,
            children: execution.children,
            completed_at: Utc::now(),
        }
    }

    async fn publish_completed(&self, record: &StepRecord) {
        self.publish(Event::StepCompleted(StepCompletedPayload {
            job_id: self.job.id,
            step_id: record.step_id.clone(),
            step_name: record.name.clone(),
            outcome: record.outcome,
            conclusion: record.conclusion,
            exit_code: record.exit_code,
            duration_ms: record.duration_ms,
            completed_at: record.completed_at,
        }))
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Some(events) = &self.events
            && let Err(e) = events.publish(event).await
        {
            warn!(error = %e, "Failed to publish step event");
        }
    }
}

fn file_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        (readback::ENV_FILE_VAR.to_string(), readback::env_file()),
        (readback::OUTPUT_FILE_VAR.to_string(), readback::output_file()),
    ])
}

/// Step working directory; relative paths are taken from the workspace.
fn workdir(step: &Step) -> String {
    match step.working_directory.as_deref() {
        Some(dir) if dir.starts_with('/') => dir.to_string(),
        Some(dir) => format!("{}/{}", WORKSPACE_DIR, dir.trim_start_matches("./")),
        None => WORKSPACE_DIR.to_string(),
    }
}
