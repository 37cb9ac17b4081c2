//! CLI configuration: engine config loading, cluster connection flags and
//! the run file format.

use anyhow::{Context, bail};
use clap::{Args, ValueEnum};
use kiln_cluster::KubeConfig;
use kiln_core::config::EngineConfig;
use kiln_core::job::Job;
use kiln_scheduler::Stage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Explicit API server connection settings.
#[derive(Debug, Clone, Default, Args)]
pub struct ClusterArgs {
    /// API server base URL
    #[arg(long, env = "KILN_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "KILN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding the bearer token
    #[arg(long, env = "KILN_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Skip TLS verification for REST calls
    #[arg(long)]
    pub insecure: bool,

    /// Namespace to create sandboxes in
    #[arg(long, env = "KILN_NAMESPACE")]
    pub namespace: Option<String>,
}

impl ClusterArgs {
    pub fn kube_config(&self) -> anyhow::Result<KubeConfig> {
        let Some(api_url) = &self.api_url else {
            bail!("no API server given; pass --api-url, set KILN_API_URL, or use --dry-run");
        };
        let mut config = KubeConfig::parse(api_url)?.accept_invalid_certs(self.insecure);
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        if let Some(path) = &self.token_file {
            config = config.with_token_file(path.clone());
        }
        Ok(config)
    }
}

/// Load the engine configuration, or defaults when no file is given.
pub fn load_engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// A run file: ordered stages of jobs, or one bare job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RunFile {
    Stages { stages: Vec<StageFile> },
    Job(Job),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageFile {
    pub name: String,
    #[serde(default)]
    pub continue_on_failure: bool,
    pub jobs: Vec<Job>,
}

impl RunFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading run file {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("parsing run file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn into_stages(self) -> Vec<Stage> {
        match self {
            RunFile::Job(job) => vec![Stage {
                name: "default".to_string(),
                jobs: vec![job],
                continue_on_failure: false,
            }],
            RunFile::Stages { stages } => stages
                .into_iter()
                .map(|s| Stage {
                    name: s.name,
                    jobs: s.jobs,
                    continue_on_failure: s.continue_on_failure,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_file_with_stages() {
        let file = RunFile::from_yaml(
            r#"
stages:
  - name: build
    jobs:
      - name: compile
        runs_on: [ubuntu-latest]
        steps:
          - id: make
            run: make
  - name: test
    continue_on_failure: true
    jobs:
      - name: unit
        steps:
          - id: test
            run: make test
"#,
        )
        .unwrap();
        let stages = file.into_stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].jobs[0].name, "compile");
        assert!(stages[1].continue_on_failure);
    }

    #[test]
    fn test_single_job_run_file() {
        let file = RunFile::from_yaml(
            r#"
name: lint
steps:
  - id: lint
    run: cargo clippy
"#,
        )
        .unwrap();
        let stages = file.into_stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, "default");
        assert_eq!(stages[0].jobs[0].name, "lint");
    }

    #[test]
    fn test_cluster_args_require_url() {
        assert!(ClusterArgs::default().kube_config().is_err());

        let args = ClusterArgs {
            api_url: Some("https://10.0.0.1:6443".to_string()),
            token: Some("secret".to_string()),
            ..ClusterArgs::default()
        };
        let config = args.kube_config().unwrap();
        assert_eq!(config.token.as_deref(), Some("secret"));
    }
}
