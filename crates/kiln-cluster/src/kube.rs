//! Kubernetes adapter.
//!
//! Sandboxes are pods, env and secret material live in config maps and
//! secrets, commands run through the pod `exec` sub-resource and service
//! logs come from the `log` sub-resource.

use crate::config::KubeConfig;
use crate::exec;
use crate::manifest::{config_object_manifest, parse_config_object, parse_pod, pod_manifest};
use async_trait::async_trait;
use kiln_core::ports::{ClusterApi, ExecStream};
use kiln_core::sandbox::{ConfigObject, ConfigObjectKind, SandboxRef, SandboxSpec, SandboxStatus};
use kiln_core::{Error, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use url::Url;

/// [`ClusterApi`] over the Kubernetes REST API.
#[derive(Debug, Clone)]
pub struct KubeCluster {
    config: KubeConfig,
    base: Url,
    http: Client,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiStatus {
    reason: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodList {
    items: Vec<Value>,
}

impl KubeCluster {
    pub fn new(config: KubeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let mut base = config.api_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self { config, base, http })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid API path {}: {}", path, e)))
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let builder = self.http.request(method, url);
        Ok(match self.config.bearer_token()? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(api_error(response).await)
    }

    async fn get_json(&self, path: &str) -> Result<Option<Value>> {
        let builder = self.request(Method::GET, self.url(path)?)?;
        match self.send(builder).await {
            Ok(response) => Ok(Some(response.json().await.map_err(|e| {
                Error::Serialization(format!("invalid response from {}: {}", path, e))
            })?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<()> {
        let builder = self.request(Method::POST, self.url(path)?)?.json(body);
        self.send(builder).await.map(|_| ())
    }

    async fn delete(&self, path: &str, grace_seconds: Option<u64>) -> Result<()> {
        let mut builder = self.request(Method::DELETE, self.url(path)?)?;
        if let Some(grace) = grace_seconds {
            builder = builder.json(&serde_json::json!({
                "kind": "DeleteOptions",
                "apiVersion": "v1",
                "gracePeriodSeconds": grace,
                "propagationPolicy": "Background",
            }));
        }
        self.send(builder).await.map(|_| ())
    }
}

fn pods_path(namespace: &str) -> String {
    format!("api/v1/namespaces/{}/pods", namespace)
}

fn config_path(namespace: &str, kind: ConfigObjectKind) -> String {
    match kind {
        ConfigObjectKind::ConfigMap => format!("api/v1/namespaces/{}/configmaps", namespace),
        ConfigObjectKind::Secret => format!("api/v1/namespaces/{}/secrets", namespace),
    }
}

/// Map an API error response onto the engine's error taxonomy.
async fn api_error(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: ApiStatus = serde_json::from_str(&body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        body
    } else {
        parsed.message
    };

    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT if parsed.reason == "AlreadyExists" => Error::AlreadyExists(message),
        StatusCode::FORBIDDEN | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::Admission(message)
        }
        _ => Error::ClusterApi {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    #[instrument(skip(self, spec), fields(sandbox = %spec.reference()))]
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<()> {
        self.post_json(&pods_path(&spec.namespace), &pod_manifest(spec))
            .await?;
        debug!("Pod created");
        Ok(())
    }

    async fn get_sandbox(&self, sandbox: &SandboxRef) -> Result<Option<SandboxStatus>> {
        let path = format!("{}/{}", pods_path(&sandbox.namespace), sandbox.name);
        match self.get_json(&path).await? {
            Some(pod) => Ok(Some(parse_pod(pod)?.2)),
            None => Ok(None),
        }
    }

    async fn delete_sandbox(&self, sandbox: &SandboxRef, grace_seconds: u64) -> Result<()> {
        let path = format!("{}/{}", pods_path(&sandbox.namespace), sandbox.name);
        self.delete(&path, Some(grace_seconds)).await
    }

    async fn list_sandboxes(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<(SandboxRef, SandboxStatus)>> {
        let mut url = self.url(&pods_path(namespace))?;
        if !selector.is_empty() {
            let selector = selector
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            url.query_pairs_mut().append_pair("labelSelector", &selector);
        }
        let response = self.send(self.request(Method::GET, url)?).await?;
        let list: PodList = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("invalid pod list: {}", e)))?;

        list.items
            .into_iter()
            .map(|pod| {
                let (name, ns, status) = parse_pod(pod)?;
                let ns = if ns.is_empty() { namespace.to_string() } else { ns };
                Ok((SandboxRef::new(ns, name), status))
            })
            .collect()
    }

    async fn create_config_object(&self, namespace: &str, object: &ConfigObject) -> Result<()> {
        self.post_json(
            &config_path(namespace, object.kind),
            &config_object_manifest(namespace, object),
        )
        .await
    }

    async fn get_config_object(
        &self,
        namespace: &str,
        kind: ConfigObjectKind,
        name: &str,
    ) -> Result<Option<ConfigObject>> {
        let path = format!("{}/{}", config_path(namespace, kind), name);
        match self.get_json(&path).await? {
            Some(value) => Ok(Some(parse_config_object(kind, value)?)),
            None => Ok(None),
        }
    }

    async fn delete_config_object(
        &self,
        namespace: &str,
        kind: ConfigObjectKind,
        name: &str,
    ) -> Result<()> {
        let path = format!("{}/{}", config_path(namespace, kind), name);
        self.delete(&path, None).await
    }

    #[instrument(skip(self, argv), fields(sandbox = %sandbox))]
    async fn exec(&self, sandbox: &SandboxRef, unit: &str, argv: &[String]) -> Result<ExecStream> {
        let url = exec::exec_url(&self.base, sandbox, unit, argv)?;
        exec::open(url, self.config.bearer_token()?).await
    }

    async fn logs(&self, sandbox: &SandboxRef, unit: &str, tail_lines: u32) -> Result<Vec<String>> {
        let mut url = self.url(&format!(
            "{}/{}/log",
            pods_path(&sandbox.namespace),
            sandbox.name
        ))?;
        url.query_pairs_mut()
            .append_pair("container", unit)
            .append_pair("tailLines", &tail_lines.to_string());
        let response = self.send(self.request(Method::GET, url)?).await?;
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(text.lines().map(str::to_string).collect())
    }
}
