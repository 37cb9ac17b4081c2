//! Kiln Sandbox
//!
//! Builds the sandbox spec for a job, drives its lifecycle on the cluster
//! and runs commands inside it once it is ready.

pub mod builder;
pub mod channel;
pub mod lifecycle;
pub mod quote;

pub use builder::{SandboxBuilder, TEMP_DIR, WORKSPACE_DIR};
pub use channel::{CommandChannel, ExecRequest, ExecStatus, OutputLine};
pub use lifecycle::{Observation, SandboxLifecycle, classify};
