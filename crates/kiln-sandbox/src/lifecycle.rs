//! Sandbox lifecycle manager.
//!
//! Owns the engine-side state of one sandbox. The `watch` channel holding
//! the state is the only place it lives; everything else subscribes.
//! Creation, readiness and teardown are driven from here and every
//! transition is checked against [`SandboxState::can_transition_to`].

use chrono::Utc;
use kiln_core::config::ReadinessPolicy;
use kiln_core::events::{Event, SandboxStateChangedPayload};
use kiln_core::ids::JobId;
use kiln_core::ports::{ClusterApi, EventSink};
use kiln_core::sandbox::{
    ConfigObject, JOB_ID_LABEL, SandboxPhase, SandboxRef, SandboxSpec, SandboxState,
    SandboxStatus,
};
use kiln_core::{Error, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

/// Time allowed for a forced deletion to be confirmed.
pub const FORCE_CONFIRM_WINDOW: Duration = Duration::from_secs(10);

/// Attempts for a create call failing with a transient cluster error.
const CREATE_ATTEMPTS: u32 = 3;

const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
    "ErrImageNeverPull",
];

const IMAGE_PULL_REASONS: &[&str] = &["ErrImagePull", "ImagePullBackOff"];

const NODE_LOSS_REASONS: &[&str] = &["NodeLost", "Evicted", "Preempting", "Terminated"];

/// What one observation of a waiting sandbox means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Ready,
    Pending(String),
    ImagePull(String),
    Unschedulable(String),
    NodeLost(String),
    Fatal(String),
}

/// Classify a cluster observation. Fatal conditions win over node loss,
/// node loss over image pulls, image pulls over scheduling delays.
pub fn classify(status: &SandboxStatus) -> Observation {
    match status.phase {
        SandboxPhase::Succeeded => {
            return Observation::Fatal("sandbox exited before running any step".to_string());
        }
        SandboxPhase::Failed => {
            let reason = status.reason.clone().unwrap_or_default();
            if NODE_LOSS_REASONS.contains(&reason.as_str()) {
                return Observation::NodeLost(describe(&reason, status.message.as_deref()));
            }
            return Observation::Fatal(describe(
                if reason.is_empty() { "Failed" } else { &reason },
                status.message.as_deref(),
            ));
        }
        _ => {}
    }

    for unit in &status.units {
        if let Some(waiting) = &unit.waiting
            && FATAL_WAITING_REASONS.contains(&waiting.reason.as_str())
        {
            return Observation::Fatal(format!(
                "unit {}: {}",
                unit.name,
                describe(&waiting.reason, Some(&waiting.message))
            ));
        }
        if let Some(terminated) = &unit.terminated {
            return Observation::Fatal(format!(
                "unit {} terminated with exit code {}{}",
                unit.name,
                terminated.exit_code,
                terminated
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            ));
        }
    }

    if status.deleting {
        return Observation::NodeLost("sandbox is being deleted by the cluster".to_string());
    }
    if status.phase == SandboxPhase::Unknown {
        return Observation::NodeLost(describe(
            status.reason.as_deref().unwrap_or("NodeLost"),
            status.message.as_deref(),
        ));
    }

    for unit in &status.units {
        if let Some(waiting) = &unit.waiting
            && IMAGE_PULL_REASONS.contains(&waiting.reason.as_str())
        {
            return Observation::ImagePull(format!(
                "unit {}: {}",
                unit.name,
                describe(&waiting.reason, Some(&waiting.message))
            ));
        }
    }

    if let Some(reason) = &status.unschedulable {
        return Observation::Unschedulable(reason.clone());
    }

    let all_ready = status.primary().is_some() && status.units.iter().all(|u| u.ready);
    if status.phase == SandboxPhase::Running && all_ready {
        return Observation::Ready;
    }

    let waiting = status
        .units
        .iter()
        .find_map(|u| u.waiting.as_ref().map(|w| format!("unit {}: {}", u.name, w.reason)));
    Observation::Pending(waiting.unwrap_or_else(|| "sandbox pending".to_string()))
}

fn describe(reason: &str, message: Option<&str>) -> String {
    match message {
        Some(message) if !message.is_empty() => format!("{}: {}", reason, message),
        _ => reason.to_string(),
    }
}

/// Lifecycle of one sandbox, from creation to confirmed removal.
pub struct SandboxLifecycle {
    cluster: Arc<dyn ClusterApi>,
    spec: SandboxSpec,
    job_id: JobId,
    readiness: ReadinessPolicy,
    state: watch::Sender<SandboxState>,
    events: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for SandboxLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLifecycle")
            .field("sandbox", &self.spec.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SandboxLifecycle {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        spec: SandboxSpec,
        job_id: JobId,
        readiness: ReadinessPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SandboxState::Unrequested);
        Self {
            cluster,
            spec,
            job_id,
            readiness,
            state,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SandboxState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.state.subscribe()
    }

    pub fn reference(&self) -> SandboxRef {
        self.spec.reference()
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    /// Move to `next`, rejecting moves the state machine does not allow.
    pub async fn transition(&self, next: SandboxState) -> Result<SandboxState> {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        let Some(from) = from else {
            return Err(Error::InvalidTransition {
                from: self.state().to_string(),
                to: next.to_string(),
            });
        };

        match next {
            SandboxState::Executing | SandboxState::Ready if from != SandboxState::WaitingReady => {
                debug!(sandbox = %self.spec.name, %from, to = %next, "Sandbox state changed");
            }
            _ => info!(sandbox = %self.spec.name, %from, to = %next, "Sandbox state changed"),
        }

        if let Some(events) = &self.events {
            let event = Event::SandboxStateChanged(SandboxStateChangedPayload {
                job_id: self.job_id,
                sandbox: self.spec.name.clone(),
                from,
                to: next,
                at: Utc::now(),
            });
            if let Err(e) = events.publish(event).await {
                warn!(error = %e, "Failed to publish sandbox event");
            }
        }
        Ok(from)
    }

    /// Mark the sandbox failed unless it already reached a terminal state.
    pub async fn fail(&self, cause: &str) {
        if self.state().is_terminal() || self.state() == SandboxState::Terminating {
            return;
        }
        error!(sandbox = %self.spec.name, cause, "Sandbox failed");
        let _ = self.transition(SandboxState::Failed).await;
    }

    /// Create the config objects, then the sandbox itself.
    pub async fn create(&self) -> Result<()> {
        self.transition(SandboxState::Creating).await?;
        match self.submit().await {
            Ok(()) => {
                self.transition(SandboxState::Created).await?;
                Ok(())
            }
            Err(e) => {
                self.fail(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn submit(&self) -> Result<()> {
        for object in &self.spec.config_objects {
            self.ensure_config_object(object).await?;
        }

        let cluster = &self.cluster;
        let spec = &self.spec;
        match retry_transient(&self.readiness, "create sandbox", move || {
            cluster.create_sandbox(spec)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(Error::AlreadyExists(message)) => {
                // A retried create may already have landed.
                let existing = self.cluster.get_sandbox(&self.reference()).await?;
                match existing {
                    Some(status) if self.owns(&status.labels) => {
                        debug!(sandbox = %self.spec.name, "Reusing sandbox created earlier");
                        Ok(())
                    }
                    _ => Err(Error::AlreadyExists(message)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Create-or-get: an object left by an earlier attempt of the same job
    /// is reused, anything else is a conflict.
    async fn ensure_config_object(&self, object: &ConfigObject) -> Result<()> {
        let namespace = &self.spec.namespace;
        let cluster = &self.cluster;
        match retry_transient(&self.readiness, "create config object", move || {
            cluster.create_config_object(namespace, object)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(Error::AlreadyExists(message)) => {
                let existing = self
                    .cluster
                    .get_config_object(namespace, object.kind, &object.name)
                    .await?;
                match existing {
                    Some(existing) if self.owns(&existing.labels) => {
                        debug!(object = %object.name, "Reusing existing config object");
                        Ok(())
                    }
                    _ => Err(Error::AlreadyExists(message)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn owns(&self, labels: &BTreeMap<String, String>) -> bool {
        let ours = self.spec.labels.get(JOB_ID_LABEL);
        ours.is_some() && labels.get(JOB_ID_LABEL) == ours
    }

    /// Poll until the sandbox is ready, the deadline passes, or the
    /// sandbox fails in a way waiting cannot fix.
    pub async fn await_ready(&self, deadline: Duration) -> Result<()> {
        self.transition(SandboxState::WaitingReady).await?;
        match self.poll_ready(deadline).await {
            Ok(()) => {
                self.transition(SandboxState::Ready).await?;
                Ok(())
            }
            Err(e) => {
                self.fail(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn poll_ready(&self, deadline: Duration) -> Result<()> {
        let reference = self.reference();
        let started = Instant::now();
        let deadline_at = started + deadline;
        let max_pull_attempts = self.readiness.max_attempts_within(deadline);
        let mut pull_attempts = 0u32;
        let mut recreated = false;
        let mut last_cause = Error::TransientScheduling("sandbox not observed yet".to_string());

        loop {
            let observation = match self.cluster.get_sandbox(&reference).await {
                Ok(Some(status)) => classify(&status),
                Ok(None) => Observation::NodeLost("sandbox vanished while waiting".to_string()),
                Err(e) if e.is_transient() => {
                    warn!(sandbox = %reference, error = %e, "Transient error observing sandbox");
                    Observation::Pending(e.to_string())
                }
                Err(e) => return Err(e),
            };

            let wait = match observation {
                Observation::Ready => {
                    info!(
                        sandbox = %reference,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Sandbox ready"
                    );
                    return Ok(());
                }
                Observation::Pending(cause) => {
                    debug!(sandbox = %reference, cause = %cause, "Sandbox not ready");
                    last_cause = Error::TransientScheduling(cause);
                    self.readiness.poll_interval()
                }
                Observation::Unschedulable(cause) => {
                    warn!(sandbox = %reference, cause = %cause, "Sandbox not schedulable yet");
                    last_cause = Error::TransientScheduling(format!("unschedulable: {}", cause));
                    self.readiness.poll_interval()
                }
                Observation::ImagePull(cause) => {
                    pull_attempts += 1;
                    last_cause = Error::TransientScheduling(format!("image pull failed: {}", cause));
                    if pull_attempts >= max_pull_attempts {
                        return Err(Error::ReadinessTimeout {
                            waited_secs: started.elapsed().as_secs(),
                            last_cause: last_cause.to_string(),
                        });
                    }
                    let delay = self.readiness.backoff(pull_attempts);
                    warn!(
                        sandbox = %reference,
                        attempt = pull_attempts,
                        max_attempts = max_pull_attempts,
                        delay_ms = delay.as_millis() as u64,
                        cause = %cause,
                        "Image pull failing, backing off"
                    );
                    delay
                }
                Observation::NodeLost(cause) => {
                    if recreated || !self.readiness.recreate_on_node_loss {
                        return Err(Error::NodeLost(format!("{}: {}", self.spec.name, cause)));
                    }
                    recreated = true;
                    warn!(sandbox = %reference, cause = %cause, "Node lost, re-creating sandbox");
                    self.recreate().await?;
                    last_cause = Error::TransientScheduling(format!(
                        "re-created after node loss: {}",
                        cause
                    ));
                    self.readiness.poll_interval()
                }
                Observation::Fatal(cause) => return Err(Error::SandboxFailed(cause)),
            };

            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ReadinessTimeout {
                    waited_secs: started.elapsed().as_secs(),
                    last_cause: last_cause.to_string(),
                });
            }
            sleep(wait.min(remaining)).await;
        }
    }

    /// Replace a lost sandbox: confirm the old one is gone, then submit the
    /// same spec again. Config objects are reused.
    async fn recreate(&self) -> Result<()> {
        self.delete_pod(0).await?;
        if !self.wait_for_removal(FORCE_CONFIRM_WINDOW).await? {
            return Err(Error::Teardown {
                name: self.spec.name.clone(),
                reason: "lost sandbox still present before re-creation".to_string(),
            });
        }
        self.transition(SandboxState::Creating).await?;
        self.submit().await?;
        self.transition(SandboxState::Created).await?;
        self.transition(SandboxState::WaitingReady).await?;
        Ok(())
    }

    /// Delete the sandbox and its config objects. Runs from any state and
    /// may be called again; absent objects count as deleted.
    pub async fn teardown(&self) -> Result<()> {
        match self.state() {
            SandboxState::Terminated => return Ok(()),
            SandboxState::Terminating => {}
            _ => {
                self.transition(SandboxState::Terminating).await?;
            }
        }

        let grace = self.spec.termination_grace_seconds;
        self.delete_pod(grace).await?;
        let mut removed = self.wait_for_removal(Duration::from_secs(grace)).await?;
        if !removed {
            warn!(
                sandbox = %self.spec.name,
                grace_seconds = grace,
                "Sandbox still present after grace period, forcing removal"
            );
            self.delete_pod(0).await?;
            removed = self.wait_for_removal(FORCE_CONFIRM_WINDOW).await?;
        }

        let objects = self.delete_config_objects().await;

        if !removed {
            return Err(Error::Teardown {
                name: self.spec.name.clone(),
                reason: "sandbox still present after forced deletion".to_string(),
            });
        }
        objects?;
        self.transition(SandboxState::Terminated).await?;
        Ok(())
    }

    async fn delete_pod(&self, grace_seconds: u64) -> Result<()> {
        let reference = self.reference();
        match self.cluster.delete_sandbox(&reference, grace_seconds).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(sandbox = %reference, error = %e, "Transient error deleting sandbox");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the sandbox is gone or `window` passes. Returns whether
    /// removal was observed.
    async fn wait_for_removal(&self, window: Duration) -> Result<bool> {
        let reference = self.reference();
        let until = Instant::now() + window;
        loop {
            match self.cluster.get_sandbox(&reference).await {
                Ok(None) => return Ok(true),
                Ok(Some(_)) => {}
                Err(e) if e.is_transient() => {
                    debug!(sandbox = %reference, error = %e, "Transient error confirming removal");
                }
                Err(e) => return Err(e),
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            sleep(self.readiness.poll_interval().min(remaining)).await;
        }
    }

    async fn delete_config_objects(&self) -> Result<()> {
        let mut first_error = None;
        for object in &self.spec.config_objects {
            match self
                .cluster
                .delete_config_object(&self.spec.namespace, object.kind, &object.name)
                .await
            {
                Ok(()) => debug!(object = %object.name, "Config object deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(object = %object.name, error = %e, "Failed to delete config object");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(Error::Teardown {
                name: self.spec.name.clone(),
                reason: format!("config objects not deleted: {}", e),
            }),
            None => Ok(()),
        }
    }

    /// Enter `Executing` for one command. Returns whether this call made
    /// the move, so the caller knows to leave it again.
    pub async fn begin_command(&self) -> Result<bool> {
        let state = self.state();
        if !state.accepts_commands() {
            return Err(Error::SandboxNotReady(self.spec.name.clone()));
        }
        if state == SandboxState::Ready {
            self.transition(SandboxState::Executing).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn finish_command(&self) {
        if self.state() == SandboxState::Executing {
            let _ = self.transition(SandboxState::Ready).await;
        }
    }
}

/// Run `op`, retrying transient cluster errors with the readiness backoff.
async fn retry_transient<T, F, Fut>(policy: &ReadinessPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < CREATE_ATTEMPTS => {
                let delay = policy.backoff(attempt);
                warn!(attempt, error = %e, "{} failed, retrying in {:?}", what, delay);
                sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SandboxBuilder;
    use kiln_cluster::{ClusterCall, InMemoryCluster, PodEvent};
    use kiln_core::config::EngineConfig;
    use kiln_core::job::{Job, Step};
    use kiln_core::ports::CollectingEventSink;
    use kiln_core::sandbox::{ConfigObjectKind, UnitStatus, UnitTerminated};
    use kiln_platform::PlatformResolver;
    use pretty_assertions::assert_eq;

    fn lifecycle(cluster: &InMemoryCluster) -> SandboxLifecycle {
        let config = EngineConfig::default();
        let job = Job::new("build")
            .with_step(Step::run("a", "true"))
            .with_secret("TOKEN", "t");
        let template = PlatformResolver::new(config.platforms.clone())
            .unwrap()
            .resolve(&job.placement);
        let spec = SandboxBuilder::new(&config).build(&job, &template);
        SandboxLifecycle::new(Arc::new(cluster.clone()), spec, job.id, config.readiness)
    }

    fn status_with(unit: UnitStatus) -> SandboxStatus {
        SandboxStatus {
            units: vec![unit],
            ..SandboxStatus::pending()
        }
    }

    #[test]
    fn test_classify_priorities() {
        let mut status = status_with(UnitStatus::waiting("runner", "ImagePullBackOff", "x"));
        status.unschedulable = Some("0/3 nodes available".to_string());
        assert!(matches!(classify(&status), Observation::ImagePull(_)));

        status.deleting = true;
        assert!(matches!(classify(&status), Observation::NodeLost(_)));

        status.units.push(UnitStatus::waiting("svc-db", "CrashLoopBackOff", "boom"));
        assert!(matches!(classify(&status), Observation::Fatal(_)));
    }

    #[test]
    fn test_classify_phases() {
        let mut status = SandboxStatus::pending();
        status.phase = SandboxPhase::Failed;
        status.reason = Some("Evicted".to_string());
        assert!(matches!(classify(&status), Observation::NodeLost(_)));

        status.reason = Some("DeadlineExceeded".to_string());
        assert!(matches!(classify(&status), Observation::Fatal(_)));

        let mut running = status_with(UnitStatus::ready("runner"));
        running.phase = SandboxPhase::Running;
        assert_eq!(classify(&running), Observation::Ready);

        running.units.push(UnitStatus {
            terminated: Some(UnitTerminated {
                exit_code: 1,
                reason: Some("Error".to_string()),
            }),
            ..UnitStatus::ready("svc-db")
        });
        assert!(matches!(classify(&running), Observation::Fatal(m) if m.contains("svc-db")));

        assert!(matches!(
            classify(&SandboxStatus::pending()),
            Observation::Pending(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_states_and_events() {
        let cluster = InMemoryCluster::new();
        let sink = Arc::new(CollectingEventSink::new());
        let lifecycle = lifecycle(&cluster).with_events(sink.clone());

        lifecycle.create().await.unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Created);
        assert_eq!(cluster.config_object_names().len(), 2);

        lifecycle.await_ready(Duration::from_secs(60)).await.unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Ready);

        lifecycle.teardown().await.unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Terminated);
        assert!(cluster.live_sandboxes().is_empty());
        assert!(cluster.config_object_names().is_empty());

        let states: Vec<SandboxState> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::SandboxStateChanged(p) => Some(p.to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SandboxState::Creating,
                SandboxState::Created,
                SandboxState::WaitingReady,
                SandboxState::Ready,
                SandboxState::Terminating,
                SandboxState::Terminated,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_transition_rejected() {
        let cluster = InMemoryCluster::new();
        let lifecycle = lifecycle(&cluster);
        let err = lifecycle.transition(SandboxState::Ready).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(lifecycle.state(), SandboxState::Unrequested);
        assert!(lifecycle.begin_command().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_rejection_fails_without_retry() {
        let cluster = InMemoryCluster::new();
        cluster.reject_creates("exceeded quota");
        let lifecycle = lifecycle(&cluster);

        let err = lifecycle.create().await.unwrap_err();
        assert!(matches!(err, Error::Admission(_)));
        assert_eq!(lifecycle.state(), SandboxState::Failed);
        assert!(cluster.created_specs().is_empty());

        lifecycle.teardown().await.unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_config_object_of_same_job_is_reused() {
        let cluster = InMemoryCluster::new();
        let lifecycle = lifecycle(&cluster);
        let object = lifecycle.spec().config_objects[0].clone();
        cluster.insert_config_object(&lifecycle.spec().namespace, object);

        lifecycle.create().await.unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_config_object_conflicts() {
        let cluster = InMemoryCluster::new();
        let lifecycle = lifecycle(&cluster);
        let mut object = lifecycle.spec().config_objects[0].clone();
        object.labels.insert(JOB_ID_LABEL.to_string(), "someone-else".to_string());
        cluster.insert_config_object(&lifecycle.spec().namespace, object);

        let err = lifecycle.create().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_pull_gives_up_with_cause() {
        let cluster = InMemoryCluster::new();
        cluster.script_next_sandbox(vec![PodEvent::Status(status_with(UnitStatus::waiting(
            "runner",
            "ImagePullBackOff",
            "Back-off pulling image \"nope:latest\"",
        )))]);
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();

        let started = Instant::now();
        let err = lifecycle
            .await_ready(Duration::from_secs(12))
            .await
            .unwrap_err();
        match err {
            Error::ReadinessTimeout { last_cause, .. } => {
                assert!(last_cause.contains("image pull"));
                assert!(last_cause.contains("nope:latest"));
            }
            other => panic!("expected readiness timeout, got {:?}", other),
        }
        assert!(started.elapsed() <= Duration::from_secs(12));
        assert_eq!(lifecycle.state(), SandboxState::Failed);

        lifecycle.teardown().await.unwrap();
        assert!(cluster.live_sandboxes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedulable_retries_until_deadline() {
        let cluster = InMemoryCluster::new();
        let mut status = SandboxStatus::pending();
        status.unschedulable = Some("0/3 nodes: insufficient cpu".to_string());
        cluster.script_next_sandbox(vec![PodEvent::Status(status)]);
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();

        let started = Instant::now();
        let err = lifecycle
            .await_ready(Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::ReadinessTimeout { last_cause, .. } if last_cause.contains("insufficient cpu"))
        );
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedulable_then_ready() {
        let cluster = InMemoryCluster::new();
        let mut status = SandboxStatus::pending();
        status.unschedulable = Some("insufficient memory".to_string());
        cluster.script_next_sandbox(vec![
            PodEvent::Status(status.clone()),
            PodEvent::Status(status),
            PodEvent::Ready,
        ]);
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();
        lifecycle.await_ready(Duration::from_secs(60)).await.unwrap();
        assert_eq!(lifecycle.state(), SandboxState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_loss_recreates_once() {
        let cluster = InMemoryCluster::new();
        cluster.script_next_sandbox(vec![PodEvent::Status(SandboxStatus::pending()), PodEvent::Vanish]);
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();

        lifecycle.await_ready(Duration::from_secs(60)).await.unwrap();
        assert_eq!(cluster.created_specs().len(), 2);
        assert_eq!(cluster.peak_live_sandboxes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_node_loss_is_fatal() {
        let cluster = InMemoryCluster::new();
        cluster.script_next_sandbox(vec![PodEvent::Vanish]);
        cluster.script_next_sandbox(vec![PodEvent::Vanish]);
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();

        let err = lifecycle
            .await_ready(Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeLost(_)));
        assert_eq!(cluster.created_specs().len(), 2);
        assert_eq!(lifecycle.state(), SandboxState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_is_fatal() {
        let cluster = InMemoryCluster::new();
        cluster.script_next_sandbox(vec![PodEvent::Status(status_with(UnitStatus::waiting(
            "runner",
            "CrashLoopBackOff",
            "back-off 10s restarting failed container",
        )))]);
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();

        let err = lifecycle
            .await_ready(Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SandboxFailed(m) if m.contains("CrashLoopBackOff")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_deletion_is_forced() {
        let cluster = InMemoryCluster::new();
        cluster.stick_deletions();
        let lifecycle = lifecycle(&cluster);
        lifecycle.create().await.unwrap();
        lifecycle.await_ready(Duration::from_secs(60)).await.unwrap();

        let started = Instant::now();
        lifecycle.teardown().await.unwrap();
        let name = &lifecycle.spec().name;
        assert_eq!(cluster.deletions_of(name), vec![30, 0]);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(cluster.live_sandboxes().is_empty());
        assert_eq!(lifecycle.state(), SandboxState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let lifecycle = lifecycle(&cluster);

        lifecycle.teardown().await.unwrap();
        let calls = cluster.calls().len();
        lifecycle.teardown().await.unwrap();
        assert_eq!(cluster.calls().len(), calls);
        assert!(cluster.calls().iter().any(|c| matches!(
            c,
            ClusterCall::DeleteConfigObject(name) if name.ends_with("-secrets")
        )));
        assert_eq!(lifecycle.spec().config_objects[1].kind, ConfigObjectKind::Secret);
    }
}
