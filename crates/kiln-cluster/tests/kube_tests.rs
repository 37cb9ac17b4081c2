//! REST adapter tests against a mock API server.

use kiln_cluster::{KubeCluster, KubeConfig};
use kiln_core::Error;
use kiln_core::ports::ClusterApi;
use kiln_core::sandbox::{
    ConfigObject, ConfigObjectKind, ResourceRequirements, SandboxPhase, SandboxRef, SandboxSpec,
    SecurityProfile, UnitSpec,
};
use serde_json::json;
use std::collections::BTreeMap;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cluster(server: &MockServer) -> KubeCluster {
    let config = KubeConfig::parse(&server.uri())
        .unwrap()
        .with_token("test-token");
    KubeCluster::new(config).unwrap()
}

fn spec() -> SandboxSpec {
    SandboxSpec {
        name: "kiln-build-1234abcd".to_string(),
        namespace: "ci".to_string(),
        labels: BTreeMap::from([("kiln.dev/managed-by".to_string(), "kiln".to_string())]),
        annotations: BTreeMap::new(),
        primary: UnitSpec {
            name: "runner".to_string(),
            image: "ubuntu:22.04".to_string(),
            command: None,
            working_dir: None,
            env: BTreeMap::new(),
            env_from: vec![],
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

fn status_body(reason: &str, message: &str, code: u16) -> serde_json::Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "reason": reason,
        "message": message,
        "code": code
    })
}

#[tokio::test]
async fn test_create_sandbox_posts_pod_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/ci/pods"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "kind": "Pod",
            "metadata": { "name": "kiln-build-1234abcd" }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    cluster(&server).create_sandbox(&spec()).await.unwrap();
}

#[tokio::test]
async fn test_quota_rejection_is_admission_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/ci/pods"))
        .respond_with(ResponseTemplate::new(403).set_body_json(status_body(
            "Forbidden",
            "exceeded quota: compute-resources",
            403,
        )))
        .mount(&server)
        .await;

    let err = cluster(&server).create_sandbox(&spec()).await.unwrap_err();
    match err {
        Error::Admission(message) => assert!(message.contains("exceeded quota")),
        other => panic!("expected admission error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_existing_config_object_is_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/ci/configmaps"))
        .respond_with(ResponseTemplate::new(409).set_body_json(status_body(
            "AlreadyExists",
            "configmaps \"kiln-build-env\" already exists",
            409,
        )))
        .mount(&server)
        .await;

    let object = ConfigObject {
        name: "kiln-build-env".to_string(),
        kind: ConfigObjectKind::ConfigMap,
        labels: BTreeMap::new(),
        data: BTreeMap::from([("CI".to_string(), "true".to_string())]),
    };
    let err = cluster(&server)
        .create_config_object("ci", &object)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_get_sandbox_parses_status_and_absent_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/ci/pods/kiln-build-1234abcd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": { "name": "kiln-build-1234abcd", "namespace": "ci" },
            "spec": { "nodeName": "node-7" },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    { "name": "runner", "ready": true, "restartCount": 0, "state": { "running": {} } }
                ]
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/ci/pods/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(status_body(
            "NotFound",
            "pods \"gone\" not found",
            404,
        )))
        .mount(&server)
        .await;

    let cluster = cluster(&server);
    let status = cluster
        .get_sandbox(&SandboxRef::new("ci", "kiln-build-1234abcd"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.phase, SandboxPhase::Running);
    assert_eq!(status.node_name.as_deref(), Some("node-7"));
    assert!(status.primary().unwrap().ready);

    let missing = cluster.get_sandbox(&SandboxRef::new("ci", "gone")).await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_delete_sends_grace_period_and_maps_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/namespaces/ci/pods/kiln-build-1234abcd"))
        .and(body_partial_json(json!({ "gracePeriodSeconds": 0 })))
        .respond_with(ResponseTemplate::new(404).set_body_json(status_body(
            "NotFound",
            "pods \"kiln-build-1234abcd\" not found",
            404,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let err = cluster(&server)
        .delete_sandbox(&SandboxRef::new("ci", "kiln-build-1234abcd"), 0)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_list_sandboxes_uses_label_selector() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/ci/pods"))
        .and(query_param("labelSelector", "kiln.dev/managed-by=kiln"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "metadata": { "name": "kiln-a", "labels": { "kiln.dev/managed-by": "kiln" } },
                  "status": { "phase": "Running" } },
                { "metadata": { "name": "kiln-b", "namespace": "ci" },
                  "status": { "phase": "Pending" } }
            ]
        })))
        .mount(&server)
        .await;

    let selector = BTreeMap::from([("kiln.dev/managed-by".to_string(), "kiln".to_string())]);
    let pods = cluster(&server).list_sandboxes("ci", &selector).await.unwrap();
    assert_eq!(pods.len(), 2);
    assert_eq!(pods[0].0, SandboxRef::new("ci", "kiln-a"));
    assert_eq!(pods[1].1.phase, SandboxPhase::Pending);
}

#[tokio::test]
async fn test_logs_tail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/ci/pods/kiln-a/log"))
        .and(query_param("container", "svc-postgres"))
        .and(query_param("tailLines", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ready\naccepting connections\n"))
        .mount(&server)
        .await;

    let lines = cluster(&server)
        .logs(&SandboxRef::new("ci", "kiln-a"), "svc-postgres", 2)
        .await
        .unwrap();
    assert_eq!(lines, vec!["ready", "accepting connections"]);
}

#[tokio::test]
async fn test_server_error_keeps_status_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/ci/secrets/kiln-a-secrets"))
        .respond_with(ResponseTemplate::new(500).set_body_string("etcdserver: request timed out"))
        .mount(&server)
        .await;

    let err = cluster(&server)
        .get_config_object("ci", ConfigObjectKind::Secret, "kiln-a-secrets")
        .await
        .unwrap_err();
    match err {
        Error::ClusterApi { status, message } => {
            assert_eq!(status, 500);
            assert!(message.contains("timed out"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}
