//! Sandbox specification builder.
//!
//! Turns a job plus its resolved template into a complete sandbox spec.
//! Building is a pure transform; nothing here touches the cluster.

use kiln_core::config::EngineConfig;
use kiln_core::job::Job;
use kiln_core::sandbox::{
    ConfigObject, ConfigObjectKind, EnvSource, JOB_ID_LABEL, MANAGED_BY_LABEL, PRIMARY_UNIT,
    ResourceRequirements, SandboxSpec, SecurityProfile, UnitSpec, VolumeMount, VolumeSource,
    VolumeSpec,
};
use kiln_platform::ResolvedTemplate;
use std::collections::BTreeMap;

pub const WORKSPACE_DIR: &str = "/kiln/workspace";
pub const TEMP_DIR: &str = "/kiln/temp";

/// Entry point that keeps the primary unit alive until commands arrive.
pub const IDLE_SCRIPT: &str = "trap 'exit 0' TERM; while :; do sleep 3600 & wait; done";

pub const JOB_NAME_ANNOTATION: &str = "kiln.dev/job-name";
pub const TEMPLATE_ANNOTATION: &str = "kiln.dev/template";

const SERVICE_UNIT_PREFIX: &str = "svc-";
const MAX_NAME_LEN: usize = 63;

/// Builds sandbox specs from engine-wide settings.
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    namespace: String,
    identity: String,
    service_account: Option<String>,
    default_resources: ResourceRequirements,
    default_deadline_seconds: u64,
    readiness_seconds: u64,
    termination_grace_seconds: u64,
}

impl SandboxBuilder {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            identity: config.identity.name.clone(),
            service_account: config.identity.service_account.clone(),
            default_resources: config.default_resources.clone(),
            default_deadline_seconds: config.sandbox_deadline_minutes * 60,
            readiness_seconds: config.readiness.timeout_seconds,
            termination_grace_seconds: config.cleanup.force_removal_delay_seconds,
        }
    }

    pub fn build(&self, job: &Job, template: &ResolvedTemplate) -> SandboxSpec {
        let name = sandbox_name(job);
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), self.identity.clone()),
            (JOB_ID_LABEL.to_string(), job_label_value(job)),
        ]);
        let annotations = BTreeMap::from([
            (JOB_NAME_ANNOTATION.to_string(), job.name.clone()),
            (TEMPLATE_ANNOTATION.to_string(), template.name.clone()),
        ]);

        let mut config_objects = vec![ConfigObject {
            name: env_object_name(&name),
            kind: ConfigObjectKind::ConfigMap,
            labels: labels.clone(),
            data: self.job_env(job),
        }];
        let mut env_from = vec![EnvSource::ConfigMap(env_object_name(&name))];
        if !job.secrets.is_empty() {
            config_objects.push(ConfigObject {
                name: secret_object_name(&name),
                kind: ConfigObjectKind::Secret,
                labels: labels.clone(),
                data: job.secrets.clone(),
            });
            env_from.push(EnvSource::Secret(secret_object_name(&name)));
        }

        let mut volumes = vec![
            VolumeSpec {
                name: "workspace".to_string(),
                source: VolumeSource::Scratch { size_limit: None },
            },
            VolumeSpec {
                name: "temp".to_string(),
                source: VolumeSource::Scratch { size_limit: None },
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                volume: "workspace".to_string(),
                mount_path: WORKSPACE_DIR.to_string(),
                read_only: false,
            },
            VolumeMount {
                volume: "temp".to_string(),
                mount_path: TEMP_DIR.to_string(),
                read_only: false,
            },
        ];
        if let Some(cache) = &job.cache {
            volumes.push(VolumeSpec {
                name: "cache".to_string(),
                source: VolumeSource::PersistentClaim {
                    claim_name: cache.claim_name.clone(),
                },
            });
            mounts.push(VolumeMount {
                volume: "cache".to_string(),
                mount_path: cache.mount_path.clone(),
                read_only: false,
            });
        }

        let mut resources = self.default_resources.clone();
        resources.merge(&template.resources);

        let primary = UnitSpec {
            name: PRIMARY_UNIT.to_string(),
            image: template.image.clone(),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                IDLE_SCRIPT.to_string(),
            ]),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            env: service_discovery_env(job),
            env_from,
            ports: Vec::new(),
            mounts,
            resources,
            security: template.security.clone(),
        };

        let services = job
            .services
            .iter()
            .map(|service| UnitSpec {
                name: service_unit_name(&service.name),
                image: service.image.clone(),
                command: service.command.clone(),
                working_dir: None,
                env: service.env.clone(),
                env_from: Vec::new(),
                ports: service.ports.clone(),
                mounts: Vec::new(),
                resources: ResourceRequirements::default(),
                security: SecurityProfile::default(),
            })
            .collect();

        let deadline = match job.timeout_minutes {
            Some(minutes) => u64::from(minutes) * 60 + self.readiness_seconds,
            None => self.default_deadline_seconds,
        };

        SandboxSpec {
            name,
            namespace: self.namespace.clone(),
            labels,
            annotations,
            primary,
            services,
            volumes,
            config_objects,
            node_selector: template.node_selector.clone(),
            tolerations: template.tolerations.clone(),
            affinity: template.affinity.clone(),
            service_account: self.service_account.clone(),
            active_deadline_seconds: Some(deadline),
            termination_grace_seconds: self.termination_grace_seconds,
        }
    }

    fn job_env(&self, job: &Job) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("CI".to_string(), "true".to_string()),
            ("KILN_JOB_ID".to_string(), job.id.to_string()),
            ("KILN_JOB_NAME".to_string(), job.name.clone()),
        ]);
        env.extend(job.env.clone());
        env
    }
}

/// DNS-1123 sandbox name: `kiln-<job-name-slug>-<short-id>`.
pub fn sandbox_name(job: &Job) -> String {
    let suffix = job.id.short();
    let budget = MAX_NAME_LEN - "kiln-".len() - 1 - suffix.len();

    let mut slug = String::with_capacity(job.name.len());
    for c in job.name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(budget).collect();
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "job" } else { slug };

    format!("kiln-{}-{}", slug, suffix)
}

/// Label values are limited to 63 characters; the job id fits after its
/// prefix is dropped.
pub fn job_label_value(job: &Job) -> String {
    job.id.as_uuid().simple().to_string()
}

pub fn env_object_name(sandbox: &str) -> String {
    format!("{}-env", sandbox)
}

pub fn secret_object_name(sandbox: &str) -> String {
    format!("{}-secrets", sandbox)
}

pub fn service_unit_name(service: &str) -> String {
    format!("{}{}", SERVICE_UNIT_PREFIX, service)
}

/// `KILN_SERVICE_<NAME>_HOST` and `..._PORT_<port>` for every service.
/// Units share one network identity, so every service is on localhost.
pub fn service_discovery_env(job: &Job) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for service in &job.services {
        let prefix = format!(
            "KILN_SERVICE_{}",
            service.name.to_ascii_uppercase().replace('-', "_")
        );
        env.insert(format!("{}_HOST", prefix), "localhost".to_string());
        if let Some(first) = service.ports.first() {
            env.insert(format!("{}_PORT", prefix), first.to_string());
        }
        for port in &service.ports {
            env.insert(format!("{}_PORT_{}", prefix, port), port.to_string());
        }
    }
    env
}
