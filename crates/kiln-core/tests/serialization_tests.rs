//! Wire-shape tests for kiln-core types handed across process boundaries.

use chrono::Utc;
use kiln_core::config::EngineConfig;
use kiln_core::events::*;
use kiln_core::ids::*;
use kiln_core::job::*;
use kiln_core::result::*;

#[test]
fn test_job_document_from_external_parser() {
    let yaml = r#"
name: integration
runs_on: [self-hosted, gpu, linux]
env:
  RUST_LOG: debug
services:
  - name: postgres
    image: postgres:16
    ports: [5432]
    env:
      POSTGRES_PASSWORD: test
steps:
  - id: checkout
    uses: actions/checkout@v4
    with:
      fetch-depth: "1"
  - id: test
    run: cargo test
    continue_on_error: true
    timeout_minutes: 30
  - id: package
    steps:
      - id: tar
        run: tar czf out.tgz target
"#;
    let job: Job = serde_yaml::from_str(yaml).expect("parse job");
    job.validate().expect("valid job");

    assert_eq!(job.placement.label_set().len(), 3);
    assert_eq!(job.services[0].ports, vec![5432]);
    assert!(matches!(job.steps[0].kind, StepKind::Action { .. }));
    assert!(matches!(job.steps[1].kind, StepKind::Run { .. }));
    assert!(job.steps[1].continue_on_error);
    assert!(matches!(job.steps[2].kind, StepKind::Composite { .. }));
    assert_eq!(job.leaf_step_count(), 3);
}

#[test]
fn test_job_report_json_shape() {
    let report = JobReport {
        job_id: JobId::new(),
        name: "build".to_string(),
        status: JobStatus::Failure,
        failure: Some(JobFailure::Step {
            step_id: StepId::new("compile"),
            exit_code: Some(2),
            message: "exit code 2".to_string(),
        }),
        ledger: ResultLedger::new(),
        sandbox: Some("kiln-build-1a2b3c4d".to_string()),
        service_logs: Default::default(),
        started_at: Utc::now(),
        completed_at: Utc::now(),
        duration_ms: 1200,
    };

    let json = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["status"], "failure");
    assert_eq!(json["failure"]["kind"], "step");
    assert_eq!(json["failure"]["step_id"], "compile");
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_readiness_failure_is_reported_distinctly() {
    let mut report: JobReport = serde_json::from_value(serde_json::json!({
        "job_id": JobId::new(),
        "name": "build",
        "status": "failure",
        "failure": { "kind": "readiness", "message": "image pull" },
        "ledger": { "records": [] },
        "sandbox": null,
        "service_logs": {},
        "started_at": Utc::now(),
        "completed_at": Utc::now(),
        "duration_ms": 0
    }))
    .expect("deserialize");

    assert_eq!(report.exit_code(), 2);
    report.status = JobStatus::Cancelled;
    assert_eq!(report.exit_code(), 130);
}

#[test]
fn test_stage_events_serialize_with_type() {
    let event = Event::StageCompleted(StageCompletedPayload {
        run_id: RunId::new(),
        stage_name: "test".to_string(),
        stage_index: 1,
        jobs_passed: 3,
        jobs_failed: 1,
        completed_at: Utc::now(),
    });
    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "stage_completed");
    assert_eq!(json["jobs_failed"], 1);
    assert!(event.subject().ends_with(".stage.test.completed"));
}

#[test]
fn test_engine_config_file_with_platform_table() {
    let yaml = r#"
namespace: ci
identity:
  name: kiln-prod
max_parallel: 8
platforms:
  entries:
    ubuntu-latest:
      labels: ["linux-x64"]
      image: ghcr.io/kiln/ubuntu:22.04
      node_selector:
        kubernetes.io/os: linux
      resources:
        requests:
          cpu: "2"
          memory: 4Gi
readiness:
  timeout_seconds: 120
"#;
    let config = EngineConfig::from_yaml(yaml).expect("valid config");
    assert_eq!(config.namespace, "ci");
    assert_eq!(config.identity.name, "kiln-prod");
    assert_eq!(config.max_parallel, 8);
    assert_eq!(config.readiness.timeout_seconds, 120);
    assert_eq!(config.cleanup.force_removal_delay_seconds, 30);
    let entry = &config.platforms.entries["ubuntu-latest"];
    assert_eq!(entry.labels, vec!["linux-x64".to_string()]);
    assert_eq!(entry.resources.requests["memory"], "4Gi");
}

#[test]
fn test_json_schema_for_job_documents() {
    let schema = schemars::schema_for!(Job);
    let json = serde_json::to_value(&schema).expect("serialize schema");
    assert!(json["properties"]["steps"].is_object());
    assert!(json["properties"]["placement"].is_object());
}
