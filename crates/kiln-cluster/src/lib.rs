//! Cluster adapters for Kiln.
//!
//! [`KubeCluster`] talks to a Kubernetes API server; [`InMemoryCluster`]
//! simulates one, including a small shell, for dry runs and tests.

pub mod config;
pub mod exec;
pub mod kube;
pub mod manifest;
pub mod memory;
pub mod shell;

pub use config::KubeConfig;
pub use kube::KubeCluster;
pub use memory::{ClusterCall, InMemoryCluster, PodEvent};
pub use shell::{ExecHandler, ExecSession, ScriptedShell};
