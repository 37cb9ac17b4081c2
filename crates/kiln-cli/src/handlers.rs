//! Command handlers.

use crate::commands::SchemaTarget;
use crate::config::{ClusterArgs, OutputFormat, RunFile};
use anyhow::Context;
use console::style;
use kiln_cluster::{InMemoryCluster, KubeCluster};
use kiln_core::config::EngineConfig;
use kiln_core::events::{Event, LogStream};
use kiln_core::ids::JobId;
use kiln_core::job::Placement;
use kiln_core::ports::{ChannelEventSink, ClusterApi, EventSink, TracingEventSink};
use kiln_core::result::{JobReport, JobStatus, RunReport};
use kiln_platform::PlatformResolver;
use kiln_scheduler::{JobOrchestrator, Reaper, Stage, StageScheduler};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run a run file. Returns the process exit code.
pub async fn run(
    mut config: EngineConfig,
    path: &Path,
    dry_run: bool,
    max_parallel: Option<usize>,
    output: OutputFormat,
    cluster: &ClusterArgs,
) -> anyhow::Result<i32> {
    if let Some(max_parallel) = max_parallel {
        config.max_parallel = max_parallel;
    }
    if let Some(namespace) = &cluster.namespace {
        config.namespace = namespace.clone();
    }
    config.validate()?;

    let stages = RunFile::from_file(path)?.into_stages();
    let cluster: Arc<dyn ClusterApi> = if dry_run {
        eprintln!("{} Dry run against a simulated cluster", style("i").blue());
        Arc::new(InMemoryCluster::new())
    } else {
        Arc::new(KubeCluster::new(cluster.kube_config()?)?)
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling jobs and tearing down sandboxes");
            interrupt.cancel();
        }
    });

    // Text output prints live progress; structured output keeps stdout for
    // the report and sends events to the log.
    let (events, printer) = match output {
        OutputFormat::Text => {
            let (sink, rx) = ChannelEventSink::new();
            let sink: Arc<dyn EventSink> = Arc::new(sink);
            (sink, Some(tokio::spawn(print_events(rx))))
        }
        OutputFormat::Json | OutputFormat::Yaml => {
            let sink: Arc<dyn EventSink> = Arc::new(TracingEventSink);
            (sink, None)
        }
    };

    let report = execute(cluster, config, stages, events, cancel).await?;
    if let Some(printer) = printer {
        // The sink is gone with the scheduler, so the printer drains and ends.
        let _ = printer.await;
    }

    match output {
        OutputFormat::Text => print!("{}", render_report(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
    }
    Ok(report.exit_code())
}

/// Schedule stages on a cluster and wait for the run to finish.
pub async fn execute(
    cluster: Arc<dyn ClusterApi>,
    config: EngineConfig,
    stages: Vec<Stage>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let orchestrator = JobOrchestrator::new(cluster, Arc::new(config))?.with_events(events.clone());
    let scheduler = StageScheduler::new(Arc::new(orchestrator)).with_events(events);
    Ok(scheduler.run(stages, cancel).await)
}

/// Print live progress from the event stream.
async fn print_events(mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut names: HashMap<JobId, String> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            Event::StageStarted(p) => {
                println!("{} Stage {}", style("▶").cyan(), style(&p.stage_name).bold())
            }
            Event::JobStarted(p) => {
                println!(
                    "  {} {} on {} ({})",
                    style("▶").cyan(),
                    style(&p.job_name).bold(),
                    p.sandbox,
                    style(&p.template).dim()
                );
                names.insert(p.job_id, p.job_name);
            }
            Event::StepStarted(p) => {
                let job = names.get(&p.job_id).map(String::as_str).unwrap_or("?");
                println!("    {} {} / {}", style("•").dim(), job, p.step_name);
            }
            Event::StepOutput(p) => {
                let job = names.get(&p.job_id).map(String::as_str).unwrap_or("?");
                let prefix = format!("[{}/{}]", job, p.step_id);
                match p.stream {
                    LogStream::Stdout => println!("      {} {}", style(prefix).dim(), p.content),
                    LogStream::Stderr => {
                        println!("      {} {}", style(prefix).dim(), style(p.content).yellow())
                    }
                }
            }
            Event::JobCompleted(p) => {
                let mark = match p.status {
                    JobStatus::Success => style("✓").green(),
                    JobStatus::Skipped => style("-").dim(),
                    _ => style("✗").red(),
                };
                println!("  {} {} ({} ms)", mark, p.job_name, p.duration_ms);
            }
            _ => {}
        }
    }
}

/// Human-readable summary of a finished run.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    for stage in &report.stages {
        let suffix = if stage.skipped { " (not started)" } else { "" };
        let _ = writeln!(out, "Stage {}{}", style(&stage.name).bold(), suffix);
        for job in &stage.jobs {
            render_job(&mut out, job);
        }
    }
    let verdict = if report.is_success() {
        style("Run succeeded").green()
    } else {
        style("Run failed").red()
    };
    let _ = writeln!(out, "{} in {} ms", verdict, report.duration_ms);
    out
}

fn render_job(out: &mut String, job: &JobReport) {
    let mark = match job.status {
        JobStatus::Success => style("✓").green(),
        JobStatus::Skipped => style("-").dim(),
        JobStatus::Cancelled => style("!").yellow(),
        JobStatus::Failure => style("✗").red(),
    };
    match &job.failure {
        None => {
            let _ = writeln!(out, "  {} {} ({:?})", mark, job.name, job.status);
        }
        Some(failure) => {
            let _ = writeln!(out, "  {} {}: {}", mark, job.name, failure.message());
        }
    }
    if let Some(step) = job.failed_step() {
        if step.output.is_truncated() {
            let _ = writeln!(out, "      ... ({} lines total)", step.output.total_lines());
        }
        for line in step.output.lines() {
            let _ = writeln!(out, "      {}", style(line).dim());
        }
    }
    for (service, lines) in &job.service_logs {
        let _ = writeln!(out, "    service {}:", service);
        for line in lines {
            let _ = writeln!(out, "      {}", style(line).dim());
        }
    }
}

/// Print the template a placement resolves to.
pub fn resolve(config: &EngineConfig, labels: Vec<String>, output: OutputFormat) -> anyhow::Result<()> {
    let resolver = PlatformResolver::new(config.platforms.clone())?;
    let template = resolver.resolve(&Placement::new(labels));
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&template)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&template)?),
        OutputFormat::Text => {
            println!("{} {} ({:?})", style("Template").bold(), template.name, template.source);
            println!("  image: {}", template.image);
            println!("  os: {}", template.os);
            for (key, value) in &template.node_selector {
                println!("  node selector: {}={}", key, value);
            }
            for toleration in &template.tolerations {
                println!("  toleration: {}", toleration.key);
            }
            for requirement in &template.affinity {
                println!("  affinity: {} {:?}", requirement.key, requirement.values);
            }
        }
    }
    Ok(())
}

/// Reap orphaned sandboxes of this engine identity.
pub async fn reap(mut config: EngineConfig, cluster: &ClusterArgs) -> anyhow::Result<()> {
    if let Some(namespace) = &cluster.namespace {
        config.namespace = namespace.clone();
    }
    let client: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(cluster.kube_config()?)?);
    let reaper = Reaper::new(client, Arc::new(config), Default::default());
    let report = reaper.reap().await.context("reaping sandboxes")?;

    for name in &report.deleted {
        println!("{} Deleted {}", style("✓").green(), name);
    }
    for name in &report.failed {
        println!("{} Could not delete {}", style("✗").red(), name);
    }
    if report.deleted.is_empty() && report.failed.is_empty() {
        println!("{} Nothing to reap", style("i").blue());
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} sandboxes could not be deleted", report.failed.len());
    }
    Ok(())
}

/// Check a run file against the engine configuration without running it.
pub fn validate(config: &EngineConfig, path: &Path) -> anyhow::Result<()> {
    let resolver = PlatformResolver::new(config.platforms.clone())?;
    let stages = RunFile::from_file(path)?.into_stages();

    let mut invalid = 0;
    for stage in &stages {
        println!("Stage {}", style(&stage.name).bold());
        for job in &stage.jobs {
            match job.validate() {
                Ok(()) => {
                    let template = resolver.resolve(&job.placement);
                    println!(
                        "  {} {} ({} steps) -> {}",
                        style("✓").green(),
                        job.name,
                        job.leaf_step_count(),
                        template.name
                    );
                }
                Err(e) => {
                    invalid += 1;
                    println!("  {} {}: {}", style("✗").red(), job.name, e);
                }
            }
        }
    }
    if invalid > 0 {
        anyhow::bail!("{} invalid jobs", invalid);
    }
    info!(stages = stages.len(), "Run file is valid");
    Ok(())
}

/// Print a JSON schema for one of the input formats.
pub fn schema(target: SchemaTarget) -> anyhow::Result<()> {
    let schema = match target {
        SchemaTarget::Run => schemars::schema_for!(RunFile),
        SchemaTarget::Config => schemars::schema_for!(EngineConfig),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ports::CollectingEventSink;
    use pretty_assertions::assert_eq;

    const RUN_FILE: &str = r#"
stages:
  - name: build
    jobs:
      - name: compile
        steps:
          - id: make
            run: echo building
  - name: test
    jobs:
      - name: unit
        steps:
          - id: test
            run: echo failing; exit 4
  - name: deploy
    jobs:
      - name: ship
        steps:
          - id: ship
            run: echo shipping
"#;

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_executes_run_file() {
        let cluster = InMemoryCluster::new();
        let stages = RunFile::from_yaml(RUN_FILE).unwrap().into_stages();
        let sink = Arc::new(CollectingEventSink::new());

        let report = execute(
            Arc::new(cluster.clone()),
            EngineConfig::default(),
            stages,
            sink.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let statuses: Vec<JobStatus> = report.jobs().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Success, JobStatus::Failure, JobStatus::Skipped]
        );
        assert_eq!(report.exit_code(), 1);
        assert!(cluster.live_sandboxes().is_empty());
        assert!(!sink.events().is_empty());

        let rendered = render_report(&report);
        assert!(rendered.contains("compile"));
        assert!(rendered.contains("failing"));
        assert!(rendered.contains("deploy"));
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_run_events() {
        let stages = RunFile::from_yaml(RUN_FILE).unwrap().into_stages();

        let report = execute(
            Arc::new(InMemoryCluster::new()),
            EngineConfig::default(),
            stages,
            Arc::new(TracingEventSink),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.jobs().count(), 3);
    }

    #[test]
    fn test_schema_targets_render() {
        assert!(schema(SchemaTarget::Run).is_ok());
        assert!(schema(SchemaTarget::Config).is_ok());
    }
}
