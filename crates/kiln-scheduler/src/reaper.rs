//! Orphan reaping.
//!
//! An engine that crashes leaves its sandboxes behind. Every sandbox
//! carries the managed-by label with the engine's identity, so a later
//! engine with the same identity can find and remove the ones no live
//! job owns.

use kiln_core::config::EngineConfig;
use kiln_core::ports::ClusterApi;
use kiln_core::sandbox::{ConfigObjectKind, MANAGED_BY_LABEL, SandboxRef};
use kiln_core::Result;
use kiln_sandbox::builder::{env_object_name, secret_object_name};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Names of the sandboxes owned by running jobs.
#[derive(Debug, Clone, Default)]
pub struct ActiveSandboxes {
    names: Arc<Mutex<BTreeSet<String>>>,
}

impl ActiveSandboxes {
    fn names(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, name: &str) {
        self.names().insert(name.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.names().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

/// Result of one reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub deleted: Vec<String>,
    pub kept_active: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Reaper {
    cluster: Arc<dyn ClusterApi>,
    config: Arc<EngineConfig>,
    active: ActiveSandboxes,
}

impl Reaper {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Arc<EngineConfig>, active: ActiveSandboxes) -> Self {
        Self {
            cluster,
            config,
            active,
        }
    }

    /// Delete every sandbox labelled with this engine's identity that no
    /// running job owns, along with its config objects. Does nothing when
    /// automatic cleanup is disabled.
    pub async fn reap(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        if !self.config.cleanup.auto_cleanup {
            info!("Automatic cleanup disabled, not reaping");
            return Ok(report);
        }

        let namespace = &self.config.namespace;
        let selector = BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            self.config.identity.name.clone(),
        )]);
        let sandboxes = self.cluster.list_sandboxes(namespace, &selector).await?;
        debug!(count = sandboxes.len(), "Listed managed sandboxes");

        for (sandbox, _) in sandboxes {
            if self.active.contains(&sandbox.name) {
                report.kept_active.push(sandbox.name);
                continue;
            }
            match self.remove(&sandbox).await {
                Ok(()) => {
                    info!(sandbox = %sandbox, "Reaped orphaned sandbox");
                    report.deleted.push(sandbox.name);
                }
                Err(e) => {
                    warn!(sandbox = %sandbox, error = %e, "Failed to reap sandbox");
                    report.failed.push(sandbox.name);
                }
            }
        }
        Ok(report)
    }

    async fn remove(&self, sandbox: &SandboxRef) -> Result<()> {
        let grace = self.config.cleanup.force_removal_delay_seconds;
        match self.cluster.delete_sandbox(sandbox, grace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let objects = [
            (ConfigObjectKind::ConfigMap, env_object_name(&sandbox.name)),
            (ConfigObjectKind::Secret, secret_object_name(&sandbox.name)),
        ];
        for (kind, name) in objects {
            match self
                .cluster
                .delete_config_object(&sandbox.namespace, kind, &name)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_cluster::InMemoryCluster;
    use kiln_core::job::{Job, Step};
    use kiln_platform::PlatformResolver;
    use kiln_sandbox::{SandboxBuilder, SandboxLifecycle};
    use pretty_assertions::assert_eq;

    async fn leave_sandbox(cluster: &InMemoryCluster, config: &EngineConfig, name: &str) -> String {
        let job = Job::new(name).with_step(Step::run("x", "true"));
        let template = PlatformResolver::new(config.platforms.clone())
            .unwrap()
            .resolve(&job.placement);
        let spec = SandboxBuilder::new(config).build(&job, &template);
        let sandbox = spec.name.clone();
        SandboxLifecycle::new(
            Arc::new(cluster.clone()),
            spec,
            job.id,
            config.readiness.clone(),
        )
        .create()
        .await
        .unwrap();
        sandbox
    }

    #[tokio::test]
    async fn test_reaps_orphans_and_keeps_active() {
        let cluster = InMemoryCluster::new();
        let config = Arc::new(EngineConfig::default());
        let orphan = leave_sandbox(&cluster, &config, "orphan").await;
        let running = leave_sandbox(&cluster, &config, "running").await;
        let active = ActiveSandboxes::default();
        active.insert(&running);

        let report = Reaper::new(Arc::new(cluster.clone()), config, active)
            .reap()
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![orphan.clone()]);
        assert_eq!(report.kept_active, vec![running.clone()]);
        assert_eq!(cluster.live_sandboxes(), vec![running.clone()]);
        assert!(
            cluster
                .config_object_names()
                .iter()
                .all(|n| !n.starts_with(&orphan))
        );
    }

    #[tokio::test]
    async fn test_other_identity_left_alone() {
        let cluster = InMemoryCluster::new();
        let theirs = EngineConfig::default();
        leave_sandbox(&cluster, &theirs, "foreign").await;

        let mut ours = EngineConfig::default();
        ours.identity.name = "kiln-staging".to_string();
        let report = Reaper::new(
            Arc::new(cluster.clone()),
            Arc::new(ours),
            ActiveSandboxes::default(),
        )
        .reap()
        .await
        .unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(cluster.live_sandboxes().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_cleanup_reaps_nothing() {
        let cluster = InMemoryCluster::new();
        let mut config = EngineConfig::default();
        config.cleanup.auto_cleanup = false;
        leave_sandbox(&cluster, &config, "orphan").await;

        let report = Reaper::new(
            Arc::new(cluster.clone()),
            Arc::new(config),
            ActiveSandboxes::default(),
        )
        .reap()
        .await
        .unwrap();

        assert_eq!(report, ReapReport::default());
        assert_eq!(cluster.live_sandboxes().len(), 1);
    }

    #[test]
    fn test_active_set() {
        let active = ActiveSandboxes::default();
        let shared = active.clone();
        shared.insert("kiln-a");
        assert!(active.contains("kiln-a"));
        active.remove("kiln-a");
        assert!(shared.is_empty());
    }
}
