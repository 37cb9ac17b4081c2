//! Engine configuration.
//!
//! Loaded once at startup and passed explicitly to the components that need
//! it; nothing here is mutated after load.

use crate::sandbox::{NodeRequirement, ResourceRequirements, SecurityProfile, Toleration};
use crate::{Error, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Namespace sandboxes are created in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub identity: EngineIdentity,
    #[serde(default)]
    pub platforms: PlatformTable,
    /// Requests/limits applied when a template declares none.
    #[serde(default)]
    pub default_resources: ResourceRequirements,
    /// Maximum jobs running at once within a stage.
    #[serde(default = "default_max_parallel", alias = "maxParallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// Step timeout when a step declares none.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_minutes: u32,
    /// Cluster-side reclamation deadline for every sandbox.
    #[serde(default = "default_sandbox_deadline")]
    pub sandbox_deadline_minutes: u64,
    /// Output lines retained per step for reports.
    #[serde(default = "default_output_tail")]
    pub output_tail_lines: usize,
}

fn default_namespace() -> String {
    "kiln-jobs".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_step_timeout() -> u32 {
    360
}

fn default_sandbox_deadline() -> u64 {
    360
}

fn default_output_tail() -> usize {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            identity: EngineIdentity::default(),
            platforms: PlatformTable::default(),
            default_resources: ResourceRequirements::default(),
            max_parallel: default_max_parallel(),
            readiness: ReadinessPolicy::default(),
            cleanup: CleanupPolicy::default(),
            default_step_timeout_minutes: default_step_timeout(),
            sandbox_deadline_minutes: default_sandbox_deadline(),
            output_tail_lines: default_output_tail(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML (or JSON) file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("failed to parse engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject malformed configuration before any cluster mutation.
    pub fn validate(&self) -> Result<()> {
        if !crate::job::is_dns_label(&self.namespace) {
            return Err(Error::Config(format!(
                "namespace {:?} is not a valid DNS label",
                self.namespace
            )));
        }
        if self.identity.name.is_empty() {
            return Err(Error::Config("identity.name must not be empty".to_string()));
        }
        if self.max_parallel == 0 {
            return Err(Error::Config("max_parallel must be at least 1".to_string()));
        }
        validate_resources("default_resources", &self.default_resources)?;
        self.readiness.validate()?;
        self.platforms.validate()
    }
}

/// Who the engine is to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineIdentity {
    /// Value of the managed-by label on every sandbox.
    #[serde(default = "default_identity")]
    pub name: String,
    #[serde(default)]
    pub service_account: Option<String>,
}

fn default_identity() -> String {
    "kiln".to_string()
}

impl Default for EngineIdentity {
    fn default() -> Self {
        Self {
            name: default_identity(),
            service_account: None,
        }
    }
}

/// Platform name to template table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlatformTable {
    #[serde(default)]
    pub entries: BTreeMap<String, TemplateEntry>,
    #[serde(default = "default_images")]
    pub default_image_by_os: BTreeMap<String, String>,
    #[serde(default = "default_template")]
    pub default_template: TemplateEntry,
}

fn default_images() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("linux".to_string(), "ubuntu:22.04".to_string()),
        (
            "windows".to_string(),
            "mcr.microsoft.com/windows/servercore:ltsc2022".to_string(),
        ),
    ])
}

fn default_template() -> TemplateEntry {
    TemplateEntry {
        image: Some("ubuntu:22.04".to_string()),
        os: Some("linux".to_string()),
        node_selector: BTreeMap::from([(
            "kubernetes.io/os".to_string(),
            "linux".to_string(),
        )]),
        ..TemplateEntry::default()
    }
}

impl Default for PlatformTable {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            default_image_by_os: default_images(),
            default_template: default_template(),
        }
    }
}

impl PlatformTable {
    pub fn with_entry(mut self, name: impl Into<String>, entry: TemplateEntry) -> Self {
        self.entries.insert(name.into(), entry);
        self
    }

    /// Reject malformed template entries.
    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.entries {
            if name.trim().is_empty() {
                return Err(Error::Config("platform entry with empty name".to_string()));
            }
            entry.validate(name)?;
        }
        self.default_template.validate("default_template")?;
        if self.default_template.image.is_none() {
            return Err(Error::Config(
                "default_template must declare an image".to_string(),
            ));
        }
        for (os, image) in &self.default_image_by_os {
            if image.trim().is_empty() {
                return Err(Error::Config(format!("default image for {} is empty", os)));
            }
        }
        Ok(())
    }
}

/// Template fields contributed by one platform entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateEntry {
    /// Additional label sets that name this platform exactly.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub affinity: Vec<NodeRequirement>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub security: Option<SecurityProfile>,
}

impl TemplateEntry {
    fn validate(&self, name: &str) -> Result<()> {
        if let Some(image) = &self.image
            && image.trim().is_empty()
        {
            return Err(Error::Config(format!("platform {}: empty image", name)));
        }
        for key in self.node_selector.keys() {
            if key.trim().is_empty() {
                return Err(Error::Config(format!(
                    "platform {}: empty node selector key",
                    name
                )));
            }
        }
        for toleration in &self.tolerations {
            if toleration.key.trim().is_empty() {
                return Err(Error::Config(format!(
                    "platform {}: toleration with empty key",
                    name
                )));
            }
        }
        for requirement in &self.affinity {
            if requirement.values.is_empty() {
                return Err(Error::Config(format!(
                    "platform {}: affinity term {} has no values",
                    name, requirement.key
                )));
            }
        }
        validate_resources(name, &self.resources)
    }
}

fn quantity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|Ki|Mi|Gi|Ti)?$").expect("valid quantity regex")
    })
}

/// Whether `value` is a well-formed resource quantity such as `500m` or `2Gi`.
pub fn is_valid_quantity(value: &str) -> bool {
    quantity_pattern().is_match(value)
}

fn validate_resources(scope: &str, resources: &ResourceRequirements) -> Result<()> {
    for (key, value) in resources.requests.iter().chain(resources.limits.iter()) {
        if !is_valid_quantity(value) {
            return Err(Error::Config(format!(
                "{}: invalid quantity {:?} for {}",
                scope, value, key
            )));
        }
    }
    Ok(())
}

/// How long and how patiently to wait for a sandbox to become ready.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReadinessPolicy {
    #[serde(default = "default_readiness_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: u32,
    /// Re-create the sandbox once if its node disappears.
    #[serde(default = "default_true")]
    pub recreate_on_node_loss: bool,
}

fn default_readiness_timeout() -> u64 {
    600
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_initial_backoff() -> u64 {
    2000
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_multiplier() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout_seconds: default_readiness_timeout(),
            poll_interval_ms: default_poll_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_multiplier(),
            recreate_on_node_loss: true,
        }
    }
}

impl ReadinessPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before retry number `attempt` (1-based), capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = (self.backoff_multiplier.max(1) as u64)
            .saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Number of backoff retries that fit inside `deadline`.
    pub fn max_attempts_within(&self, deadline: Duration) -> u32 {
        let mut spent = Duration::ZERO;
        let mut attempts = 0u32;
        loop {
            let next = self.backoff(attempts + 1);
            if next.is_zero() || spent + next > deadline {
                return attempts.max(1);
            }
            spent += next;
            attempts += 1;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(Error::Config(
                "readiness.timeout_seconds must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.initial_backoff_ms == 0 {
            return Err(Error::Config(
                "readiness intervals must be positive".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::Config(
                "readiness.max_backoff_ms is below initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retention and removal policy for finished sandboxes and their reports.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CleanupPolicy {
    /// Successful job reports retained in run history.
    #[serde(default = "default_success_history", alias = "successHistoryLimit")]
    pub success_history_limit: usize,
    /// Failed job reports retained in run history.
    #[serde(default = "default_failure_history", alias = "failureHistoryLimit")]
    pub failure_history_limit: usize,
    /// Grace period before a sandbox that is still present is force-deleted.
    #[serde(default = "default_force_delay", alias = "forceRemovalDelaySeconds")]
    pub force_removal_delay_seconds: u64,
    /// Reap orphaned sandboxes carrying this engine's identity.
    #[serde(default = "default_true", alias = "autoCleanup")]
    pub auto_cleanup: bool,
}

fn default_success_history() -> usize {
    3
}
fn default_failure_history() -> usize {
    10
}
fn default_force_delay() -> u64 {
    30
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            success_history_limit: default_success_history(),
            failure_history_limit: default_failure_history(),
            force_removal_delay_seconds: default_force_delay(),
            auto_cleanup: true,
        }
    }
}

impl CleanupPolicy {
    pub fn force_removal_delay(&self) -> Duration {
        Duration::from_secs(self.force_removal_delay_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_camel_case_cleanup_keys() {
        let config = EngineConfig::from_yaml(
            r#"
cleanup:
  successHistoryLimit: 1
  failureHistoryLimit: 2
  forceRemovalDelaySeconds: 5
  autoCleanup: false
"#,
        )
        .unwrap();
        assert_eq!(config.cleanup.success_history_limit, 1);
        assert_eq!(config.cleanup.failure_history_limit, 2);
        assert_eq!(config.cleanup.force_removal_delay_seconds, 5);
        assert!(!config.cleanup.auto_cleanup);
    }

    #[test]
    fn test_invalid_quantity_is_config_error() {
        let result = EngineConfig::from_yaml(
            r#"
platforms:
  entries:
    big:
      resources:
        requests:
          cpu: "two"
"#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let config = EngineConfig {
            max_parallel: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = ReadinessPolicy {
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
            backoff_multiplier: 2,
            ..ReadinessPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_cap_derived_from_deadline() {
        let policy = ReadinessPolicy {
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
            backoff_multiplier: 2,
            ..ReadinessPolicy::default()
        };
        // 1 + 2 + 4 + 4 = 11s fits in 12s, the next 4s does not.
        assert_eq!(policy.max_attempts_within(Duration::from_secs(12)), 4);
        assert_eq!(policy.max_attempts_within(Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_quantities() {
        assert!(is_valid_quantity("500m"));
        assert!(is_valid_quantity("2Gi"));
        assert!(is_valid_quantity("1.5"));
        assert!(!is_valid_quantity("-1"));
        assert!(!is_valid_quantity("lots"));
    }
}
