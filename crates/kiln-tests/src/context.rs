//! Test context wiring an engine to a simulated cluster.

use kiln_cluster::InMemoryCluster;
use kiln_core::config::EngineConfig;
use kiln_core::job::Job;
use kiln_core::ports::CollectingEventSink;
use kiln_core::result::{JobReport, RunReport};
use kiln_scheduler::{JobOrchestrator, Stage, StageScheduler};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A simulated cluster, the engine config, and an event recorder.
pub struct TestContext {
    pub cluster: InMemoryCluster,
    pub config: Arc<EngineConfig>,
    pub events: Arc<CollectingEventSink>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        crate::init_test_logging();
        Self {
            cluster: InMemoryCluster::new(),
            config: Arc::new(config),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    pub fn orchestrator(&self) -> JobOrchestrator {
        JobOrchestrator::new(Arc::new(self.cluster.clone()), self.config.clone())
            .expect("test engine config is valid")
            .with_events(self.events.clone())
    }

    pub fn scheduler(&self) -> StageScheduler {
        StageScheduler::new(Arc::new(self.orchestrator())).with_events(self.events.clone())
    }

    pub async fn run_job(&self, job: Job) -> JobReport {
        self.orchestrator()
            .run_job(Arc::new(job), CancellationToken::new())
            .await
    }

    pub async fn run_stages(&self, stages: Vec<Stage>) -> RunReport {
        self.scheduler().run(stages, CancellationToken::new()).await
    }

    /// Panics if any sandbox or config object is still in the cluster.
    pub fn assert_no_sandboxes_left(&self) {
        let sandboxes = self.cluster.live_sandboxes();
        assert!(sandboxes.is_empty(), "sandboxes left behind: {:?}", sandboxes);
        let objects = self.cluster.config_object_names();
        assert!(objects.is_empty(), "config objects left behind: {:?}", objects);
    }
}
