//! Action steps.
//!
//! Resolving packaged actions is somebody else's job. The driver only asks
//! an [`ActionHandler`] what an action amounts to: one command, or a list
//! of child steps run like a composite.

use async_trait::async_trait;
use kiln_core::job::Step;
use kiln_core::{Error, Result};
use std::collections::BTreeMap;

/// What an action expands to.
#[derive(Debug, Clone)]
pub enum ActionPlan {
    Command { run: String, shell: String },
    Steps(Vec<Step>),
}

/// Trait for expanding `uses:` steps.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Expand `uses` with its interpolated inputs. An error fails the step.
    async fn expand(
        &self,
        step: &Step,
        uses: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<ActionPlan>;
}

/// Name of the inline action: runs its `run` input with an optional `shell`.
pub const INLINE_RUN_ACTION: &str = "kiln/run";

/// Handles the inline `kiln/run` action and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineActionHandler;

#[async_trait]
impl ActionHandler for InlineActionHandler {
    async fn expand(
        &self,
        step: &Step,
        uses: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<ActionPlan> {
        let name = uses.split('@').next().unwrap_or(uses);
        if name != INLINE_RUN_ACTION {
            return Err(Error::InvalidJob(format!(
                "action {} used by step {} is not available",
                uses, step.id
            )));
        }
        let run = inputs.get("run").ok_or_else(|| {
            Error::InvalidJob(format!("step {}: {} requires a run input", step.id, uses))
        })?;
        Ok(ActionPlan::Command {
            run: run.clone(),
            shell: inputs
                .get("shell")
                .cloned()
                .unwrap_or_else(|| "sh".to_string()),
        })
    }
}
