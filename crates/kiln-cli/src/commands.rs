//! CLI command definitions.

use crate::config::{ClusterArgs, OutputFormat};
use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the jobs of a run file
    Run {
        /// Path to the run file (stages of jobs, or a single job)
        #[arg(default_value = "kiln.yaml")]
        path: PathBuf,

        /// Execute against a simulated in-memory cluster
        #[arg(long)]
        dry_run: bool,

        /// Override the engine's max_parallel
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Show the template a set of placement labels resolves to
    Resolve {
        /// Placement labels, e.g. ubuntu-latest gpu
        labels: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Delete sandboxes left behind by engines that are gone
    Reap {
        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Validate the engine configuration and a run file
    Validate {
        /// Path to the run file
        #[arg(default_value = "kiln.yaml")]
        path: PathBuf,
    },

    /// Print a JSON schema
    Schema {
        #[arg(value_enum, default_value_t = SchemaTarget::Run)]
        target: SchemaTarget,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemaTarget {
    /// The run file format
    Run,
    /// The engine configuration file
    Config,
}
