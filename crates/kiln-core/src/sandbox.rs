//! Sandbox specification and observed status.
//!
//! A sandbox is the cluster object (a pod) that hosts one job: the primary
//! `runner` unit plus one unit per declared service. `SandboxSpec` is what
//! the builder produces and the lifecycle manager submits; `SandboxStatus`
//! is what the cluster reports back.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the primary execution unit inside every sandbox.
pub const PRIMARY_UNIT: &str = "runner";

/// Label carrying the engine identity that owns a sandbox.
pub const MANAGED_BY_LABEL: &str = "kiln.dev/managed-by";

/// Label carrying the owning job id.
pub const JOB_ID_LABEL: &str = "kiln.dev/job-id";

/// Cluster-side address of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxRef {
    pub namespace: String,
    pub name: String,
}

impl SandboxRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SandboxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Complete sandbox specification ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub primary: UnitSpec,
    pub services: Vec<UnitSpec>,
    pub volumes: Vec<VolumeSpec>,
    pub config_objects: Vec<ConfigObject>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub affinity: Vec<NodeRequirement>,
    pub service_account: Option<String>,
    /// Deadline after which the cluster reclaims the sandbox on its own.
    pub active_deadline_seconds: Option<u64>,
    pub termination_grace_seconds: u64,
}

impl SandboxSpec {
    pub fn reference(&self) -> SandboxRef {
        SandboxRef::new(&self.namespace, &self.name)
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitSpec> {
        std::iter::once(&self.primary).chain(self.services.iter())
    }
}

/// One container-equivalent unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Config objects whose keys are projected into the environment.
    pub env_from: Vec<EnvSource>,
    pub ports: Vec<u16>,
    pub mounts: Vec<VolumeMount>,
    pub resources: ResourceRequirements,
    pub security: SecurityProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnvSource {
    ConfigMap(String),
    Secret(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Ephemeral scratch space that lives and dies with the sandbox.
    Scratch { size_limit: Option<String> },
    /// Pre-existing persistent claim.
    PersistentClaim { claim_name: String },
}

/// Cluster-native configuration object carrying env or secret material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub name: String,
    pub kind: ConfigObjectKind,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigObjectKind {
    ConfigMap,
    Secret,
}

impl fmt::Display for ConfigObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigObjectKind::ConfigMap => write!(f, "configmap"),
            ConfigObjectKind::Secret => write!(f, "secret"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }

    /// Overlay `other` on top of `self`, key by key.
    pub fn merge(&mut self, other: &ResourceRequirements) {
        self.requests
            .extend(other.requests.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.limits
            .extend(other.limits.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecurityProfile {
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    #[serde(default = "default_true")]
    pub drop_all_capabilities: bool,
    #[serde(default)]
    pub allow_privilege_escalation: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            run_as_user: None,
            privileged: false,
            read_only_root_filesystem: false,
            drop_all_capabilities: true,
            allow_privilege_escalation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Toleration {
    pub key: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
}

fn default_operator() -> String {
    "Exists".to_string()
}

impl Toleration {
    pub fn exists(key: impl Into<String>, effect: Option<&str>) -> Self {
        Self {
            key: key.into(),
            operator: default_operator(),
            value: None,
            effect: effect.map(str::to_string),
        }
    }
}

/// Required node-affinity term: node label `key` must take one of `values`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct NodeRequirement {
    pub key: String,
    pub values: Vec<String>,
}

/// Cluster-reported phase of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl SandboxPhase {
    pub fn parse(value: &str) -> Self {
        match value {
            "Pending" => SandboxPhase::Pending,
            "Running" => SandboxPhase::Running,
            "Succeeded" => SandboxPhase::Succeeded,
            "Failed" => SandboxPhase::Failed,
            _ => SandboxPhase::Unknown,
        }
    }
}

/// Snapshot of what the cluster reports for a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub phase: SandboxPhase,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub node_name: Option<String>,
    /// Scheduling condition: `Some(reason)` when the scheduler refused placement.
    pub unschedulable: Option<String>,
    pub units: Vec<UnitStatus>,
    pub labels: BTreeMap<String, String>,
    /// Deletion has been requested and is in progress.
    pub deleting: bool,
}

impl SandboxStatus {
    pub fn pending() -> Self {
        Self {
            phase: SandboxPhase::Pending,
            reason: None,
            message: None,
            node_name: None,
            unschedulable: None,
            units: Vec::new(),
            labels: BTreeMap::new(),
            deleting: false,
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitStatus> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn primary(&self) -> Option<&UnitStatus> {
        self.unit(PRIMARY_UNIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub ready: bool,
    pub restart_count: u32,
    pub waiting: Option<UnitWaiting>,
    pub terminated: Option<UnitTerminated>,
}

impl UnitStatus {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            restart_count: 0,
            waiting: None,
            terminated: None,
        }
    }

    pub fn waiting(name: impl Into<String>, reason: &str, message: &str) -> Self {
        Self {
            name: name.into(),
            ready: false,
            restart_count: 0,
            waiting: Some(UnitWaiting {
                reason: reason.to_string(),
                message: message.to_string(),
            }),
            terminated: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitWaiting {
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTerminated {
    pub exit_code: i32,
    pub reason: Option<String>,
}

/// Engine-side lifecycle state of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Unrequested,
    Creating,
    Created,
    WaitingReady,
    Ready,
    Executing,
    Terminating,
    Terminated,
    Failed,
}

impl SandboxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Terminated | SandboxState::Failed)
    }

    /// Whether commands may be executed in this state.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, SandboxState::Ready | SandboxState::Executing)
    }

    /// Legal transitions of the lifecycle state machine.
    ///
    /// `Failed` is reachable from every non-terminal state. `Terminating` is
    /// reachable from every state except `Terminated`, because teardown runs
    /// regardless of how far creation got. `WaitingReady` may go back to
    /// `Creating` when a lost sandbox is re-created.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminating) => !matches!(self, Terminating),
            (Failed, _) => false,
            (_, Failed) => true,
            (Unrequested, Creating) => true,
            (Creating, Created) => true,
            (Created, WaitingReady) => true,
            (WaitingReady, Ready) => true,
            (WaitingReady, Creating) => true,
            (Ready, Executing) => true,
            (Executing, Ready) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Unrequested => "unrequested",
            SandboxState::Creating => "creating",
            SandboxState::Created => "created",
            SandboxState::WaitingReady => "waiting_ready",
            SandboxState::Ready => "ready",
            SandboxState::Executing => "executing",
            SandboxState::Terminating => "terminating",
            SandboxState::Terminated => "terminated",
            SandboxState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use SandboxState::*;
        let path = [
            Unrequested,
            Creating,
            Created,
            WaitingReady,
            Ready,
            Executing,
            Ready,
            Terminating,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_is_absorbing_except_for_teardown() {
        use SandboxState::*;
        assert!(WaitingReady.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Terminating));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Failed));
        assert!(!Terminated.can_transition_to(Terminating));
    }

    #[test]
    fn test_teardown_reachable_before_creation() {
        assert!(SandboxState::Unrequested.can_transition_to(SandboxState::Terminating));
        assert!(!SandboxState::Unrequested.can_transition_to(SandboxState::Ready));
    }
}
