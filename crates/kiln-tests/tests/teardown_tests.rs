//! No sandbox outlives its job, whichever way the job ends.

use kiln_cluster::PodEvent;
use kiln_core::config::{EngineConfig, ReadinessPolicy};
use kiln_core::job::{Job, Step};
use kiln_core::result::{JobFailure, JobStatus};
use kiln_core::sandbox::{SandboxState, SandboxStatus};
use kiln_core::Error;
use kiln_platform::PlatformResolver;
use kiln_sandbox::{SandboxBuilder, SandboxLifecycle};
use kiln_tests::{JobFixture, StatusFixture, TestContext, assert_completes_within, wait_for};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn short_readiness() -> EngineConfig {
    EngineConfig {
        readiness: ReadinessPolicy {
            timeout_seconds: 60,
            ..ReadinessPolicy::default()
        },
        ..EngineConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_job_creates_nothing() {
    let ctx = TestContext::new();
    let job = Job::new("no-steps");

    let report = ctx.run_job(job).await;

    assert!(matches!(report.failure, Some(JobFailure::Config { .. })));
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_admission_rejection() {
    let ctx = TestContext::new();
    ctx.cluster.reject_creates("pods \"kiln\" is forbidden: exceeded quota");

    let report = ctx.run_job(JobFixture::simple()).await;

    assert!(matches!(report.failure, Some(JobFailure::Admission { .. })));
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_unschedulable_until_deadline() {
    let ctx = TestContext::with_config(short_readiness());
    ctx.cluster
        .script_next_sandbox(vec![PodEvent::Status(StatusFixture::unschedulable())]);

    let report = ctx.run_job(JobFixture::simple()).await;

    let Some(JobFailure::Readiness { message }) = &report.failure else {
        panic!("expected a readiness failure, got {:?}", report.failure);
    };
    assert!(message.contains("unschedulable"));
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_crash_loop() {
    let ctx = TestContext::new();
    ctx.cluster
        .script_next_sandbox(vec![PodEvent::Status(StatusFixture::crash_loop())]);

    let report = ctx.run_job(JobFixture::simple()).await;

    assert!(matches!(report.failure, Some(JobFailure::Readiness { .. })));
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_node_lost_twice() {
    let ctx = TestContext::new();
    for _ in 0..2 {
        ctx.cluster
            .script_next_sandbox(vec![PodEvent::Status(SandboxStatus::pending()), PodEvent::Vanish]);
    }

    let report = ctx.run_job(JobFixture::simple()).await;

    assert!(matches!(report.failure, Some(JobFailure::Readiness { .. })));
    assert_eq!(ctx.cluster.created_specs().len(), 2);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_node_lost_once_recovers() {
    let ctx = TestContext::new();
    ctx.cluster.script_next_sandbox(vec![PodEvent::Vanish]);

    let report = ctx.run_job(JobFixture::simple()).await;

    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(ctx.cluster.created_specs().len(), 2);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_step_failure() {
    let ctx = TestContext::new();

    let report = ctx.run_job(JobFixture::failing_middle()).await;

    assert_eq!(report.status, JobStatus::Failure);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout() {
    let ctx = TestContext::new();
    let job = Job::new("hang").with_step(Step::run("hang", "sleep 600").with_timeout_minutes(1));

    let report = assert_completes_within(ctx.run_job(job), Duration::from_secs(300)).await;

    let step = report.failed_step().unwrap();
    assert!(step.error.as_deref().unwrap_or_default().contains("timed out"));
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_broken_channel() {
    let ctx = TestContext::new();
    let job = Job::new("flaky-network")
        .with_step(Step::run("drop", "kiln-sim-disconnect"))
        .with_step(Step::run("after", "echo after"));

    let report = ctx.run_job(job).await;

    assert_eq!(report.status, JobStatus::Failure);
    assert_eq!(report.ledger.records()[0].exit_code, None);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_cancellation() {
    let ctx = TestContext::new();
    let orchestrator = ctx.orchestrator();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        trigger.cancel();
    });

    let report = orchestrator
        .run_job(Arc::new(JobFixture::sleeping("long", 3600)), cancel)
        .await;

    assert_eq!(report.status, JobStatus::Cancelled);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_job() {
    let ctx = TestContext::new();
    let orchestrator = ctx.orchestrator();

    let run = orchestrator.run_job(
        Arc::new(JobFixture::sleeping("abandoned", 3600)),
        CancellationToken::new(),
    );
    assert!(tokio::time::timeout(Duration::from_secs(30), run).await.is_err());

    let cluster = ctx.cluster.clone();
    let gone = wait_for(Duration::from_secs(60), Duration::from_millis(100), || {
        let cluster = cluster.clone();
        async move { cluster.live_sandboxes().is_empty() }
    })
    .await;
    assert!(gone);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_deletion_is_forced() {
    let ctx = TestContext::new();
    ctx.cluster.stick_deletions();

    let report = ctx.run_job(JobFixture::simple()).await;

    assert_eq!(report.status, JobStatus::Success);
    let sandbox = report.sandbox.unwrap();
    assert_eq!(ctx.cluster.deletions_of(&sandbox), vec![30, 0]);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_teardown_is_idempotent() {
    let ctx = TestContext::new();
    let job = JobFixture::simple();
    let template = PlatformResolver::new(ctx.config.platforms.clone())
        .unwrap()
        .resolve(&job.placement);
    let spec = SandboxBuilder::new(&ctx.config).build(&job, &template);
    let lifecycle = SandboxLifecycle::new(
        Arc::new(ctx.cluster.clone()),
        spec,
        job.id,
        ctx.config.readiness.clone(),
    );

    lifecycle.create().await.unwrap();
    lifecycle.await_ready(Duration::from_secs(60)).await.unwrap();
    lifecycle.teardown().await.unwrap();
    lifecycle.teardown().await.unwrap();

    assert_eq!(lifecycle.state(), SandboxState::Terminated);
    assert_eq!(ctx.cluster.deletions_of(&lifecycle.reference().name).len(), 1);
    ctx.assert_no_sandboxes_left();
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_error() {
    let ctx = TestContext::with_config(short_readiness());
    ctx.cluster
        .script_next_sandbox(vec![PodEvent::Status(StatusFixture::image_pull_backoff())]);
    let job = JobFixture::simple();
    let template = PlatformResolver::new(ctx.config.platforms.clone())
        .unwrap()
        .resolve(&job.placement);
    let spec = SandboxBuilder::new(&ctx.config).build(&job, &template);
    let lifecycle = SandboxLifecycle::new(
        Arc::new(ctx.cluster.clone()),
        spec,
        job.id,
        ctx.config.readiness.clone(),
    );

    lifecycle.create().await.unwrap();
    let err = lifecycle
        .await_ready(ctx.config.readiness.timeout())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ReadinessTimeout { .. }));
    assert_eq!(lifecycle.state(), SandboxState::Failed);
    lifecycle.teardown().await.unwrap();
    ctx.assert_no_sandboxes_left();
}
