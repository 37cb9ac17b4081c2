//! Job definition types.
//!
//! A job is handed to the engine already parsed; these types are the
//! read-only tree the engine consumes. They deserialize from YAML or JSON
//! so that external workflow parsers can hand jobs over as documents.

use crate::env::is_valid_env_key;
use crate::ids::{JobId, StepId};
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    #[serde(default)]
    pub id: JobId,
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default, alias = "runs_on")]
    pub placement: Placement,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub cache: Option<CacheVolume>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            steps: Vec::new(),
            services: Vec::new(),
            placement: Placement::default(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            timeout_minutes: None,
            cache: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.placement = Placement::new(labels);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    /// Total number of leaf steps, counting composite children.
    pub fn leaf_step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|s| match &s.kind {
                    StepKind::Composite { steps } => count(steps),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps)
    }

    /// Check structural invariants before any cluster mutation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidJob("job name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidJob(format!("job {} has no steps", self.name)));
        }
        validate_env_keys(&self.name, &self.env)?;
        validate_env_keys(&self.name, &self.secrets)?;
        validate_steps(&self.name, &self.steps)?;

        let mut names = HashSet::new();
        for service in &self.services {
            if !is_dns_label(&service.name) {
                return Err(Error::InvalidJob(format!(
                    "service name {:?} is not a valid DNS label",
                    service.name
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(Error::InvalidJob(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            if service.image.trim().is_empty() {
                return Err(Error::InvalidJob(format!(
                    "service {} has no image",
                    service.name
                )));
            }
            validate_env_keys(&service.name, &service.env)?;
            if service.ports.contains(&0) {
                return Err(Error::InvalidJob(format!(
                    "service {} declares port 0",
                    service.name
                )));
            }
        }
        Ok(())
    }
}

fn validate_steps(scope: &str, steps: &[Step]) -> Result<()> {
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.as_str().is_empty() {
            return Err(Error::InvalidJob(format!("step in {} has an empty id", scope)));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(Error::InvalidJob(format!(
                "duplicate step id {} in {}",
                step.id, scope
            )));
        }
        validate_env_keys(step.id.as_str(), &step.env)?;
        if let StepKind::Composite { steps } = &step.kind {
            if steps.is_empty() {
                return Err(Error::InvalidJob(format!(
                    "composite step {} has no children",
                    step.id
                )));
            }
            validate_steps(step.id.as_str(), steps)?;
        }
    }
    Ok(())
}

fn validate_env_keys(scope: &str, env: &BTreeMap<String, String>) -> Result<()> {
    match env.keys().find(|key| !is_valid_env_key(key)) {
        Some(key) => Err(Error::InvalidJob(format!(
            "invalid environment variable name {:?} in {}",
            key, scope
        ))),
        None => Ok(()),
    }
}

/// Whether `value` is a valid RFC 1123 label.
pub fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// What a step does once a command channel into the sandbox exists.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepKind {
    Run {
        run: String,
        #[serde(default = "default_shell")]
        shell: String,
    },
    Action {
        uses: String,
        #[serde(default)]
        with: BTreeMap<String, String>,
    },
    Composite {
        steps: Vec<Step>,
    },
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Step {
    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: StepId::new(id),
            name: None,
            kind,
            continue_on_error: false,
            timeout_minutes: None,
            env: BTreeMap::new(),
            working_directory: None,
        }
    }

    pub fn run(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Run {
                run: command.into(),
                shell: default_shell(),
            },
        )
    }

    pub fn action(id: impl Into<String>, uses: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Action {
                uses: uses.into(),
                with: BTreeMap::new(),
            },
        )
    }

    pub fn composite(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::with_kind(id, StepKind::Composite { steps })
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let StepKind::Action { with, .. } = &mut self.kind {
            with.insert(key.into(), value.into());
        }
        self
    }

    pub fn in_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            command: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Free-form placement labels, e.g. `["self-hosted", "gpu"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Placement(Vec<String>);

impl Placement {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    /// Labels as declared.
    pub fn raw(&self) -> &[String] {
        &self.0
    }

    /// Normalised label set: trimmed, lower-cased, deduplicated, sorted.
    pub fn label_set(&self) -> BTreeSet<String> {
        self.0
            .iter()
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.label_set().is_empty()
    }
}

/// Persistent cache volume mounted into the primary unit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheVolume {
    pub claim_name: String,
    #[serde(default = "default_cache_mount")]
    pub mount_path: String,
}

fn default_cache_mount() -> String {
    "/kiln/cache".to_string()
}
