//! Integration test infrastructure for relay.
//!
//! Builds complete pipelines from fixture projects and platforms, runs them
//! against a scripted stage executor and inspects the recorded events.
//!
//! # Usage
//!
//! ```ignore
//! use relay_tests::{PlatformFixture, ProjectFixture, TestPipeline};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let pipeline = TestPipeline::builder()
//!         .project(ProjectFixture::alpha())
//!         .platform(PlatformFixture::linux())
//!         .build();
//!     let report = pipeline.runtime.fire("branch-scheduler-alpha", Default::default()).await;
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,relay_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
