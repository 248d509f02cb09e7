//! Integration test infrastructure for Gantry.
//!
//! Fixtures author graphs the same way production does, declarative YAML fed
//! through the builder, and the harness wires a [`JobService`] against the
//! in-memory stores with a graph cache in front. Tests read like the real
//! control flow: store a graph, create a job, lease batches, report steps.
//!
//! [`JobService`]: gantry_engine::JobService

pub mod fixtures;
pub mod harness;

pub use fixtures::GraphFixture;
pub use harness::{ready_batches, TestHarness};

use once_cell::sync::Lazy;
use tracing_subscriber::{fmt, EnvFilter};

static TRACING: Lazy<()> = Lazy::new(|| {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,gantry_engine=debug")),
        )
        .with_test_writer()
        .init();
});

/// Installs the test logging subscriber for the current binary.
///
/// Safe to call from every test; the subscriber is only installed once.
pub fn init_test_logging() {
    Lazy::force(&TRACING);
}
