//! Step execution for Kiln jobs.
//!
//! The [`StepDriver`] runs a job's steps, in order, through the command
//! channel of a ready sandbox.

pub mod action;
pub mod driver;
pub mod readback;

pub use action::{ActionHandler, ActionPlan, INLINE_RUN_ACTION, InlineActionHandler};
pub use driver::{DriveOutcome, DriverConfig, StepDriver};
