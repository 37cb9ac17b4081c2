//! Translation between sandbox specs and Kubernetes object JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_core::sandbox::{
    ConfigObject, ConfigObjectKind, EnvSource, SandboxPhase, SandboxSpec, SandboxStatus,
    UnitSpec, UnitStatus, UnitTerminated, UnitWaiting, VolumeSource,
};
use kiln_core::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Pod manifest for a sandbox spec.
pub fn pod_manifest(spec: &SandboxSpec) -> Value {
    let mut pod_spec = Map::new();
    pod_spec.insert("restartPolicy".into(), json!("Never"));
    pod_spec.insert(
        "terminationGracePeriodSeconds".into(),
        json!(spec.termination_grace_seconds),
    );
    pod_spec.insert("enableServiceLinks".into(), json!(false));
    if let Some(account) = &spec.service_account {
        pod_spec.insert("serviceAccountName".into(), json!(account));
    }
    if let Some(deadline) = spec.active_deadline_seconds {
        pod_spec.insert("activeDeadlineSeconds".into(), json!(deadline));
    }
    if !spec.node_selector.is_empty() {
        pod_spec.insert("nodeSelector".into(), json!(spec.node_selector));
    }
    if !spec.tolerations.is_empty() {
        let tolerations: Vec<Value> = spec
            .tolerations
            .iter()
            .map(|t| {
                let mut toleration = Map::new();
                toleration.insert("key".into(), json!(t.key));
                toleration.insert("operator".into(), json!(t.operator));
                if let Some(value) = &t.value {
                    toleration.insert("value".into(), json!(value));
                }
                if let Some(effect) = &t.effect {
                    toleration.insert("effect".into(), json!(effect));
                }
                Value::Object(toleration)
            })
            .collect();
        pod_spec.insert("tolerations".into(), Value::Array(tolerations));
    }
    if !spec.affinity.is_empty() {
        let expressions: Vec<Value> = spec
            .affinity
            .iter()
            .map(|r| json!({ "key": r.key, "operator": "In", "values": r.values }))
            .collect();
        pod_spec.insert(
            "affinity".into(),
            json!({
                "nodeAffinity": {
                    "requiredDuringSchedulingIgnoredDuringExecution": {
                        "nodeSelectorTerms": [{ "matchExpressions": expressions }]
                    }
                }
            }),
        );
    }
    let containers: Vec<Value> = spec.units().map(container).collect();
    pod_spec.insert("containers".into(), Value::Array(containers));
    let volumes: Vec<Value> = spec
        .volumes
        .iter()
        .map(|v| match &v.source {
            VolumeSource::Scratch { size_limit } => match size_limit {
                Some(limit) => json!({ "name": v.name, "emptyDir": { "sizeLimit": limit } }),
                None => json!({ "name": v.name, "emptyDir": {} }),
            },
            VolumeSource::PersistentClaim { claim_name } => {
                json!({ "name": v.name, "persistentVolumeClaim": { "claimName": claim_name } })
            }
        })
        .collect();
    pod_spec.insert("volumes".into(), Value::Array(volumes));

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
            "annotations": spec.annotations,
        },
        "spec": Value::Object(pod_spec),
    })
}

fn container(unit: &UnitSpec) -> Value {
    let mut container = Map::new();
    container.insert("name".into(), json!(unit.name));
    container.insert("image".into(), json!(unit.image));
    if let Some(command) = &unit.command {
        container.insert("command".into(), json!(command));
    }
    if let Some(dir) = &unit.working_dir {
        container.insert("workingDir".into(), json!(dir));
    }
    let env: Vec<Value> = unit
        .env
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    container.insert("env".into(), Value::Array(env));
    let env_from: Vec<Value> = unit
        .env_from
        .iter()
        .map(|source| match source {
            EnvSource::ConfigMap(name) => json!({ "configMapRef": { "name": name } }),
            EnvSource::Secret(name) => json!({ "secretRef": { "name": name } }),
        })
        .collect();
    container.insert("envFrom".into(), Value::Array(env_from));
    let ports: Vec<Value> = unit
        .ports
        .iter()
        .map(|p| json!({ "containerPort": p }))
        .collect();
    container.insert("ports".into(), Value::Array(ports));
    let mounts: Vec<Value> = unit
        .mounts
        .iter()
        .map(|m| json!({ "name": m.volume, "mountPath": m.mount_path, "readOnly": m.read_only }))
        .collect();
    container.insert("volumeMounts".into(), Value::Array(mounts));
    if !unit.resources.is_empty() {
        container.insert(
            "resources".into(),
            json!({ "requests": unit.resources.requests, "limits": unit.resources.limits }),
        );
    }

    let security = &unit.security;
    let mut context = Map::new();
    if let Some(uid) = security.run_as_user {
        context.insert("runAsUser".into(), json!(uid));
    }
    context.insert("privileged".into(), json!(security.privileged));
    context.insert(
        "readOnlyRootFilesystem".into(),
        json!(security.read_only_root_filesystem),
    );
    context.insert(
        "allowPrivilegeEscalation".into(),
        json!(security.allow_privilege_escalation),
    );
    if security.drop_all_capabilities {
        context.insert("capabilities".into(), json!({ "drop": ["ALL"] }));
    }
    container.insert("securityContext".into(), Value::Object(context));

    Value::Object(container)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    metadata: ObjectMeta,
    spec: PodSpec,
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    reason: Option<String>,
    message: Option<String>,
    conditions: Vec<PodCondition>,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContainerStatus {
    name: String,
    ready: bool,
    restart_count: u32,
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerState {
    waiting: Option<WaitingState>,
    terminated: Option<TerminatedState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WaitingState {
    reason: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TerminatedState {
    exit_code: i32,
    reason: Option<String>,
}

/// Parse a pod object into (name, namespace, status).
pub fn parse_pod(value: Value) -> Result<(String, String, SandboxStatus)> {
    let pod: Pod = serde_json::from_value(value)?;

    let unschedulable = pod
        .status
        .conditions
        .iter()
        .find(|c| c.kind == "PodScheduled" && c.status == "False")
        .map(|c| {
            c.message
                .clone()
                .or_else(|| c.reason.clone())
                .unwrap_or_else(|| "Unschedulable".to_string())
        });

    let units = pod
        .status
        .container_statuses
        .into_iter()
        .map(|c| UnitStatus {
            name: c.name,
            ready: c.ready,
            restart_count: c.restart_count,
            waiting: c.state.waiting.map(|w| UnitWaiting {
                reason: w.reason,
                message: w.message,
            }),
            terminated: c.state.terminated.map(|t| UnitTerminated {
                exit_code: t.exit_code,
                reason: t.reason,
            }),
        })
        .collect();

    let status = SandboxStatus {
        phase: pod
            .status
            .phase
            .as_deref()
            .map(SandboxPhase::parse)
            .unwrap_or(SandboxPhase::Pending),
        reason: pod.status.reason,
        message: pod.status.message,
        node_name: pod.spec.node_name,
        unschedulable,
        units,
        labels: pod.metadata.labels,
        deleting: pod.metadata.deletion_timestamp.is_some(),
    };
    Ok((pod.metadata.name, pod.metadata.namespace, status))
}

/// Manifest for a config map or secret.
pub fn config_object_manifest(namespace: &str, object: &ConfigObject) -> Value {
    let metadata = json!({
        "name": object.name,
        "namespace": namespace,
        "labels": object.labels,
    });
    match object.kind {
        ConfigObjectKind::ConfigMap => json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": metadata,
            "data": object.data,
        }),
        ConfigObjectKind::Secret => json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": metadata,
            "stringData": object.data,
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfigObject {
    metadata: ObjectMeta,
    data: BTreeMap<String, String>,
}

/// Parse a config map or secret; secret values are base64-decoded.
pub fn parse_config_object(kind: ConfigObjectKind, value: Value) -> Result<ConfigObject> {
    let raw: RawConfigObject = serde_json::from_value(value)?;
    let data = match kind {
        ConfigObjectKind::ConfigMap => raw.data,
        ConfigObjectKind::Secret => raw
            .data
            .into_iter()
            .map(|(k, v)| {
                let bytes = BASE64
                    .decode(v.as_bytes())
                    .map_err(|e| Error::Serialization(format!("secret key {}: {}", k, e)))?;
                Ok((k, String::from_utf8_lossy(&bytes).into_owned()))
            })
            .collect::<Result<_>>()?,
    };
    Ok(ConfigObject {
        name: raw.metadata.name,
        kind,
        labels: raw.metadata.labels,
        data,
    })
}
