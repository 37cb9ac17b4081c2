//! Kubernetes connection settings.

use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Explicit API server connection settings. Nothing is discovered from
/// kubeconfig files; callers pass what they have.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// API server base URL, e.g. `https://10.0.0.1:6443`.
    pub api_url: Url,

    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,

    /// File holding the bearer token; re-read on every request so rotated
    /// service-account tokens are picked up.
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Skip TLS verification for REST calls. Exec sessions always verify.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl KubeConfig {
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            token: None,
            token_file: None,
            accept_invalid_certs: false,
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn parse(api_url: &str) -> Result<Self> {
        let url = Url::parse(api_url)
            .map_err(|e| Error::Config(format!("invalid API server URL {}: {}", api_url, e)))?;
        Ok(Self::new(url))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Current bearer token, preferring the token file.
    pub fn bearer_token(&self) -> Result<Option<String>> {
        if let Some(path) = &self.token_file {
            let token = std::fs::read_to_string(path)?;
            return Ok(Some(token.trim().to_string()));
        }
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_file_wins() {
        let dir = std::env::temp_dir().join(format!("kiln-token-{}", std::process::id()));
        std::fs::write(&dir, "from-file\n").unwrap();
        let config = KubeConfig::parse("https://127.0.0.1:6443")
            .unwrap()
            .with_token("inline")
            .with_token_file(&dir);
        assert_eq!(config.bearer_token().unwrap().as_deref(), Some("from-file"));
        std::fs::remove_file(&dir).unwrap();
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        assert!(matches!(KubeConfig::parse("not a url"), Err(Error::Config(_))));
    }
}
