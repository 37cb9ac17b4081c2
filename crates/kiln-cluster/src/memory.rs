//! In-memory cluster.
//!
//! A scriptable stand-in for a real cluster, used for dry runs and tests.
//! Sandboxes become ready after one pending observation unless a readiness
//! script says otherwise; commands run through an [`ExecHandler`], by
//! default the simulated shell. Every mutating call is recorded so callers
//! can assert on what reached the cluster.

use crate::shell::{ExecHandler, ExecSession, ScriptedShell, SharedFiles};
use async_trait::async_trait;
use kiln_core::ports::{ClusterApi, ExecStream};
use kiln_core::sandbox::{
    ConfigObject, ConfigObjectKind, EnvSource, SandboxPhase, SandboxRef, SandboxSpec,
    SandboxStatus, UnitStatus,
};
use kiln_core::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// One scripted observation of a sandbox while it is waited on.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// Report this status.
    Status(SandboxStatus),
    /// Report every unit ready and the sandbox running.
    Ready,
    /// The sandbox disappears, as when its node is lost.
    Vanish,
}

/// Calls that reached the cluster, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    CreateSandbox(String),
    DeleteSandbox { name: String, grace_seconds: u64 },
    CreateConfigObject(String),
    DeleteConfigObject(String),
    Exec { sandbox: String, unit: String },
    Logs { sandbox: String, unit: String },
}

struct Pod {
    spec: SandboxSpec,
    script: VecDeque<PodEvent>,
    status: SandboxStatus,
    files: SharedFiles,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<(String, String), Pod>,
    objects: BTreeMap<(String, ConfigObjectKind, String), ConfigObject>,
    scripts: VecDeque<Vec<PodEvent>>,
    unit_logs: BTreeMap<String, Vec<String>>,
    reject_creates: Option<String>,
    stuck_deletions: bool,
    calls: Vec<ClusterCall>,
    peak_live: usize,
    created: Vec<SandboxSpec>,
}

/// Simulated cluster implementing [`ClusterApi`].
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
    handler: Arc<dyn ExecHandler>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster").finish_non_exhaustive()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_handler(ScriptedShell)
    }

    pub fn with_handler(handler: impl ExecHandler + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            handler: Arc::new(handler),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("in-memory cluster state poisoned".to_string()))
    }

    fn locked(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Observations for the next sandbox created. Scripts are consumed in
    /// creation order; the last event of a script repeats.
    pub fn script_next_sandbox(&self, events: Vec<PodEvent>) -> &Self {
        self.locked().scripts.push_back(events);
        self
    }

    /// Reject every sandbox creation as if by cluster policy.
    pub fn reject_creates(&self, reason: impl Into<String>) -> &Self {
        self.locked().reject_creates = Some(reason.into());
        self
    }

    /// Graceful deletions leave the sandbox terminating; only a forced
    /// deletion (grace 0) removes it.
    pub fn stick_deletions(&self) -> &Self {
        self.locked().stuck_deletions = true;
        self
    }

    /// Log lines returned for any unit named `unit`.
    pub fn set_unit_logs(&self, unit: impl Into<String>, lines: Vec<String>) -> &Self {
        self.locked().unit_logs.insert(unit.into(), lines);
        self
    }

    /// Put a config object in place without recording a call.
    pub fn insert_config_object(&self, namespace: &str, object: ConfigObject) {
        self.locked()
            .objects
            .insert((namespace.to_string(), object.kind, object.name.clone()), object);
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.locked().calls.clone()
    }

    /// Sandboxes currently present, by name.
    pub fn live_sandboxes(&self) -> Vec<String> {
        self.locked()
            .pods
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn config_object_names(&self) -> Vec<String> {
        self.locked()
            .objects
            .keys()
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Every spec submitted, in order.
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.locked().created.clone()
    }

    /// Highest number of sandboxes present at the same time.
    pub fn peak_live_sandboxes(&self) -> usize {
        self.locked().peak_live
    }

    /// Deletion calls made for `name`.
    pub fn deletions_of(&self, name: &str) -> Vec<u64> {
        self.locked()
            .calls
            .iter()
            .filter_map(|c| match c {
                ClusterCall::DeleteSandbox {
                    name: n,
                    grace_seconds,
                } if n == name => Some(*grace_seconds),
                _ => None,
            })
            .collect()
    }

    /// Read a file from a sandbox's simulated filesystem.
    pub fn read_file(&self, sandbox: &str, path: &str) -> Option<String> {
        let state = self.locked();
        let pod = state.pods.iter().find(|((_, n), _)| n == sandbox)?.1;
        let files = pod.files.lock().ok()?;
        files.get(path).cloned()
    }
}

fn ready_status(spec: &SandboxSpec) -> SandboxStatus {
    SandboxStatus {
        phase: SandboxPhase::Running,
        node_name: Some("sim-node-1".to_string()),
        units: spec.units().map(|u| UnitStatus::ready(&u.name)).collect(),
        labels: spec.labels.clone(),
        ..SandboxStatus::pending()
    }
}

fn key(sandbox: &SandboxRef) -> (String, String) {
    (sandbox.namespace.clone(), sandbox.name.clone())
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<()> {
        let mut state = self.state()?;
        if let Some(reason) = &state.reject_creates {
            return Err(Error::Admission(reason.clone()));
        }
        let pod_key = (spec.namespace.clone(), spec.name.clone());
        if state.pods.contains_key(&pod_key) {
            return Err(Error::AlreadyExists(format!("sandbox {}", spec.reference())));
        }

        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![PodEvent::Status(SandboxStatus::pending()), PodEvent::Ready]);
        let mut status = SandboxStatus::pending();
        status.labels = spec.labels.clone();

        state.calls.push(ClusterCall::CreateSandbox(spec.name.clone()));
        state.created.push(spec.clone());
        state.pods.insert(
            pod_key,
            Pod {
                spec: spec.clone(),
                script: script.into(),
                status,
                files: SharedFiles::default(),
            },
        );
        state.peak_live = state.peak_live.max(state.pods.len());
        debug!(sandbox = %spec.reference(), "Simulated sandbox created");
        Ok(())
    }

    async fn get_sandbox(&self, sandbox: &SandboxRef) -> Result<Option<SandboxStatus>> {
        let mut state = self.state()?;
        let pod_key = key(sandbox);
        let Some(pod) = state.pods.get_mut(&pod_key) else {
            return Ok(None);
        };

        if !pod.status.deleting {
            let event = if pod.script.len() > 1 {
                pod.script.pop_front()
            } else {
                pod.script.front().cloned()
            };
            match event {
                Some(PodEvent::Status(mut status)) => {
                    status.labels = pod.spec.labels.clone();
                    pod.status = status;
                }
                Some(PodEvent::Ready) => pod.status = ready_status(&pod.spec),
                Some(PodEvent::Vanish) => {
                    state.pods.remove(&pod_key);
                    return Ok(None);
                }
                None => {}
            }
        }
        Ok(Some(pod.status.clone()))
    }

    async fn delete_sandbox(&self, sandbox: &SandboxRef, grace_seconds: u64) -> Result<()> {
        let mut state = self.state()?;
        state.calls.push(ClusterCall::DeleteSandbox {
            name: sandbox.name.clone(),
            grace_seconds,
        });
        let pod_key = key(sandbox);
        if !state.pods.contains_key(&pod_key) {
            return Err(Error::NotFound(format!("sandbox {}", sandbox)));
        }
        if state.stuck_deletions && grace_seconds > 0 {
            if let Some(pod) = state.pods.get_mut(&pod_key) {
                pod.status.deleting = true;
            }
        } else {
            state.pods.remove(&pod_key);
        }
        Ok(())
    }

    async fn list_sandboxes(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<(SandboxRef, SandboxStatus)>> {
        let state = self.state()?;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, pod)| {
                selector
                    .iter()
                    .all(|(k, v)| pod.spec.labels.get(k) == Some(v))
            })
            .map(|((ns, name), pod)| (SandboxRef::new(ns, name), pod.status.clone()))
            .collect())
    }

    async fn create_config_object(&self, namespace: &str, object: &ConfigObject) -> Result<()> {
        let mut state = self.state()?;
        if let Some(reason) = &state.reject_creates {
            return Err(Error::Admission(reason.clone()));
        }
        let object_key = (namespace.to_string(), object.kind, object.name.clone());
        if state.objects.contains_key(&object_key) {
            return Err(Error::AlreadyExists(format!(
                "{} {}/{}",
                object.kind, namespace, object.name
            )));
        }
        state
            .calls
            .push(ClusterCall::CreateConfigObject(object.name.clone()));
        state.objects.insert(object_key, object.clone());
        Ok(())
    }

    async fn get_config_object(
        &self,
        namespace: &str,
        kind: ConfigObjectKind,
        name: &str,
    ) -> Result<Option<ConfigObject>> {
        let state = self.state()?;
        Ok(state
            .objects
            .get(&(namespace.to_string(), kind, name.to_string()))
            .cloned())
    }

    async fn delete_config_object(
        &self,
        namespace: &str,
        kind: ConfigObjectKind,
        name: &str,
    ) -> Result<()> {
        let mut state = self.state()?;
        state
            .calls
            .push(ClusterCall::DeleteConfigObject(name.to_string()));
        state
            .objects
            .remove(&(namespace.to_string(), kind, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} {}/{}", kind, namespace, name)))
    }

    async fn exec(&self, sandbox: &SandboxRef, unit: &str, argv: &[String]) -> Result<ExecStream> {
        let session = {
            let mut state = self.state()?;
            state.calls.push(ClusterCall::Exec {
                sandbox: sandbox.name.clone(),
                unit: unit.to_string(),
            });
            let pod = state
                .pods
                .get(&key(sandbox))
                .ok_or_else(|| Error::NotFound(format!("sandbox {}", sandbox)))?;
            if pod.status.phase != SandboxPhase::Running || pod.status.deleting {
                return Err(Error::ClusterApi {
                    status: 400,
                    message: format!("sandbox {} is not running", sandbox),
                });
            }
            let spec = pod
                .spec
                .units()
                .find(|u| u.name == unit)
                .ok_or_else(|| Error::NotFound(format!("unit {} in {}", unit, sandbox)))?;

            let mut env = BTreeMap::new();
            for source in &spec.env_from {
                let (kind, name) = match source {
                    EnvSource::ConfigMap(name) => (ConfigObjectKind::ConfigMap, name),
                    EnvSource::Secret(name) => (ConfigObjectKind::Secret, name),
                };
                if let Some(object) =
                    state
                        .objects
                        .get(&(sandbox.namespace.clone(), kind, name.clone()))
                {
                    env.extend(object.data.clone());
                }
            }
            env.extend(spec.env.clone());

            ExecSession {
                sandbox: sandbox.clone(),
                unit: unit.to_string(),
                argv: argv.to_vec(),
                env,
                working_dir: spec.working_dir.clone().unwrap_or_else(|| "/".to_string()),
                files: pod.files.clone(),
            }
        };
        self.handler.exec(session).await
    }

    async fn logs(&self, sandbox: &SandboxRef, unit: &str, tail_lines: u32) -> Result<Vec<String>> {
        let mut state = self.state()?;
        state.calls.push(ClusterCall::Logs {
            sandbox: sandbox.name.clone(),
            unit: unit.to_string(),
        });
        let pod = state
            .pods
            .get(&key(sandbox))
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", sandbox)))?;
        let image = pod
            .spec
            .units()
            .find(|u| u.name == unit)
            .map(|u| u.image.clone())
            .ok_or_else(|| Error::NotFound(format!("unit {} in {}", unit, sandbox)))?;

        let lines = state
            .unit_logs
            .get(unit)
            .cloned()
            .unwrap_or_else(|| vec![format!("{} started from {}", unit, image)]);
        let skip = lines.len().saturating_sub(tail_lines as usize);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::collect;
    use kiln_core::sandbox::{ResourceRequirements, SecurityProfile, UnitSpec};
    use pretty_assertions::assert_eq;

    fn spec(name: &str) -> SandboxSpec {
        SandboxSpec {
            name: name.to_string(),
            namespace: "ci".to_string(),
            labels: BTreeMap::from([("kiln.dev/managed-by".to_string(), "kiln".to_string())]),
            annotations: BTreeMap::new(),
            primary: UnitSpec {
                name: "runner".to_string(),
                image: "ubuntu:22.04".to_string(),
                command: None,
                working_dir: Some("/kiln/workspace".to_string()),
                env: BTreeMap::from([("FROM_SPEC".to_string(), "1".to_string())]),
                env_from: vec![EnvSource::ConfigMap(format!("{}-env", name))],
                ports: vec![],
                mounts: vec![],
                resources: ResourceRequirements::default(),
                security: SecurityProfile::default(),
            },
            services: vec![],
            volumes: vec![],
            config_objects: vec![],
            node_selector: BTreeMap::new(),
            tolerations: vec![],
            affinity: vec![],
            service_account: None,
            active_deadline_seconds: None,
            termination_grace_seconds: 10,
        }
    }

    #[tokio::test]
    async fn test_default_script_becomes_ready() {
        let cluster = InMemoryCluster::new();
        let sandbox = spec("kiln-a");
        cluster.create_sandbox(&sandbox).await.unwrap();

        let first = cluster.get_sandbox(&sandbox.reference()).await.unwrap().unwrap();
        assert_eq!(first.phase, SandboxPhase::Pending);
        let second = cluster.get_sandbox(&sandbox.reference()).await.unwrap().unwrap();
        assert_eq!(second.phase, SandboxPhase::Running);
        assert!(second.primary().unwrap().ready);
        assert_eq!(second.labels["kiln.dev/managed-by"], "kiln");
    }

    #[tokio::test]
    async fn test_vanish_removes_sandbox() {
        let cluster = InMemoryCluster::new();
        cluster.script_next_sandbox(vec![PodEvent::Vanish]);
        let sandbox = spec("kiln-a");
        cluster.create_sandbox(&sandbox).await.unwrap();

        assert!(cluster.get_sandbox(&sandbox.reference()).await.unwrap().is_none());
        assert!(cluster.live_sandboxes().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_deletion_needs_force() {
        let cluster = InMemoryCluster::new();
        cluster.stick_deletions();
        let sandbox = spec("kiln-a");
        cluster.create_sandbox(&sandbox).await.unwrap();

        cluster.delete_sandbox(&sandbox.reference(), 30).await.unwrap();
        let status = cluster.get_sandbox(&sandbox.reference()).await.unwrap().unwrap();
        assert!(status.deleting);

        cluster.delete_sandbox(&sandbox.reference(), 0).await.unwrap();
        assert!(cluster.live_sandboxes().is_empty());
        assert_eq!(cluster.deletions_of("kiln-a"), vec![30, 0]);

        let again = cluster.delete_sandbox(&sandbox.reference(), 0).await;
        assert!(matches!(again, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_exec_sees_config_object_env() {
        let cluster = InMemoryCluster::new();
        cluster.script_next_sandbox(vec![PodEvent::Ready]);
        let sandbox = spec("kiln-a");
        cluster.insert_config_object(
            "ci",
            ConfigObject {
                name: "kiln-a-env".to_string(),
                kind: ConfigObjectKind::ConfigMap,
                labels: BTreeMap::new(),
                data: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            },
        );
        cluster.create_sandbox(&sandbox).await.unwrap();
        cluster.get_sandbox(&sandbox.reference()).await.unwrap();

        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo $GREETING $FROM_SPEC; pwd".to_string(),
        ];
        let stream = cluster.exec(&sandbox.reference(), "runner", &argv).await.unwrap();
        let (out, _, code) = collect(stream).await.unwrap();
        assert_eq!(out, "hello 1\n/kiln/workspace\n");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_exec_before_ready_is_rejected() {
        let cluster = InMemoryCluster::new();
        let sandbox = spec("kiln-a");
        cluster.create_sandbox(&sandbox).await.unwrap();
        let result = cluster
            .exec(&sandbox.reference(), "runner", &["true".to_string()])
            .await;
        assert!(matches!(result, Err(Error::ClusterApi { status: 400, .. })));
    }

    #[tokio::test]
    async fn test_admission_rejection_and_peak_tracking() {
        let cluster = InMemoryCluster::new();
        cluster.create_sandbox(&spec("kiln-a")).await.unwrap();
        cluster.create_sandbox(&spec("kiln-b")).await.unwrap();
        cluster
            .delete_sandbox(&SandboxRef::new("ci", "kiln-a"), 0)
            .await
            .unwrap();
        assert_eq!(cluster.peak_live_sandboxes(), 2);

        cluster.reject_creates("exceeded quota");
        let result = cluster.create_sandbox(&spec("kiln-c")).await;
        assert!(matches!(result, Err(Error::Admission(_))));
    }
}
