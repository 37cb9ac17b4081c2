//! Job orchestration and stage scheduling for Kiln.

pub mod history;
pub mod orchestrator;
pub mod reaper;
pub mod stages;

pub use history::RunHistory;
pub use orchestrator::JobOrchestrator;
pub use reaper::{ActiveSandboxes, ReapReport, Reaper};
pub use stages::{Stage, StageScheduler};
