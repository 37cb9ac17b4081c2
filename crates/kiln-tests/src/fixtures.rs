//! Test fixtures for creating sample jobs and platform tables.

use kiln_core::config::{PlatformTable, TemplateEntry};
use kiln_core::job::{Job, ServiceSpec, Step};
use kiln_core::sandbox::{SandboxStatus, UnitStatus};
use std::collections::BTreeMap;

/// Factory for creating test jobs.
pub struct JobFixture;

impl JobFixture {
    /// One job, one echo step.
    pub fn simple() -> Job {
        Job::new("simple").with_step(Self::echo_step("hello", "hello"))
    }

    /// `[echo A, exit 1, echo B]`.
    pub fn failing_middle() -> Job {
        Job::new("failing-middle")
            .with_step(Self::echo_step("a", "A"))
            .with_step(Step::run("fail", "exit 1"))
            .with_step(Self::echo_step("b", "B"))
    }

    /// `[exit 1 (continue-on-error), echo B]`.
    pub fn tolerated_failure() -> Job {
        Job::new("tolerated-failure")
            .with_step(Step::run("flaky", "exit 1").continue_on_error())
            .with_step(Self::echo_step("b", "B"))
    }

    /// A job whose single step sleeps for `seconds`.
    pub fn sleeping(name: &str, seconds: u64) -> Job {
        Job::new(name).with_step(Step::run("sleep", format!("sleep {}", seconds)))
    }

    /// A job with a postgres service next to the runner.
    pub fn with_database() -> Job {
        Job::new("with-database")
            .with_service(
                ServiceSpec::new("postgres", "postgres:16")
                    .with_port(5432)
                    .with_env("POSTGRES_PASSWORD", "test"),
            )
            .with_step(Step::run(
                "connect",
                "echo \"$KILN_SERVICE_POSTGRES_HOST:$KILN_SERVICE_POSTGRES_PORT\"",
            ))
    }

    /// Create an echo step.
    pub fn echo_step(id: &str, message: &str) -> Step {
        Step::run(id, format!("echo {}", message))
    }
}

/// Factory for platform tables.
pub struct PlatformFixture;

impl PlatformFixture {
    /// Table with one exact entry for `ubuntu-latest` and one for the
    /// `[self-hosted, gpu]` label set.
    pub fn table() -> PlatformTable {
        PlatformTable::default()
            .with_entry(
                "ubuntu-latest",
                TemplateEntry {
                    image: Some("ghcr.io/kiln/runner-ubuntu:24.04".to_string()),
                    os: Some("linux".to_string()),
                    ..TemplateEntry::default()
                },
            )
            .with_entry(
                "gpu-pool",
                TemplateEntry {
                    labels: vec!["self-hosted".to_string(), "gpu".to_string()],
                    image: Some("ghcr.io/kiln/runner-cuda:12".to_string()),
                    node_selector: BTreeMap::from([(
                        "pool".to_string(),
                        "gpu".to_string(),
                    )]),
                    ..TemplateEntry::default()
                },
            )
    }
}

/// Sandbox observations for scripting the simulated cluster.
pub struct StatusFixture;

impl StatusFixture {
    /// The runner image cannot be pulled.
    pub fn image_pull_backoff() -> SandboxStatus {
        SandboxStatus {
            units: vec![UnitStatus::waiting(
                "runner",
                "ImagePullBackOff",
                "Back-off pulling image \"ubuntu:22.04\"",
            )],
            ..SandboxStatus::pending()
        }
    }

    /// No node can take the sandbox yet.
    pub fn unschedulable() -> SandboxStatus {
        SandboxStatus {
            unschedulable: Some("0/3 nodes are available: insufficient cpu".to_string()),
            ..SandboxStatus::pending()
        }
    }

    /// The runner keeps crashing.
    pub fn crash_loop() -> SandboxStatus {
        SandboxStatus {
            units: vec![UnitStatus::waiting(
                "runner",
                "CrashLoopBackOff",
                "back-off restarting failed container",
            )],
            ..SandboxStatus::pending()
        }
    }
}
