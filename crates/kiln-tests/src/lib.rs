//! End-to-end test infrastructure for Kiln.
//!
//! Everything runs against the simulated [`kiln_cluster::InMemoryCluster`],
//! so tests need no real cluster and can run on paused tokio time.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_tests::{JobFixture, TestContext};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_something() {
//!     let ctx = TestContext::new();
//!     let report = ctx.run_job(JobFixture::simple()).await;
//!     ctx.assert_no_sandboxes_left();
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,kiln_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
