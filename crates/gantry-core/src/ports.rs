//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and its storage
//! adapters. The engine requires very little from a backing store: point
//! lookup, and an atomic replace-if-version-matches write for jobs.

use crate::graph::Graph;
use crate::ids::{GraphId, JobId};
use crate::job::Job;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Content-addressed storage for immutable graphs.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Store a graph under its content hash. Idempotent: adding the same
    /// graph twice returns the same id.
    async fn add(&self, graph: Graph) -> Result<GraphId>;

    /// Fetch a graph by content hash.
    async fn get(&self, id: &GraphId) -> Result<Option<Arc<Graph>>>;
}

/// Versioned storage for job documents.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. The job's version must be 1.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Get a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Replace a job if the stored version equals `expected_version`. The
    /// replacement must carry `expected_version + 1`. Returns false when a
    /// concurrent writer got there first; the caller re-reads and retries.
    async fn try_replace(&self, job: &Job, expected_version: u64) -> Result<bool>;

    /// List all jobs.
    async fn list(&self) -> Result<Vec<Job>>;
}
