//! In-memory implementations of the storage ports.
//!
//! These adapters back the engine in tests and single-process deployments.
//! The job store provides the same contract a database adapter must: point
//! lookup plus an atomic replace-if-version-matches write.

use async_trait::async_trait;
use gantry_core::graph::Graph;
use gantry_core::ids::{GraphId, JobId};
use gantry_core::job::Job;
use gantry_core::ports::{GraphStore, JobStore};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory job store with versioned replace.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        if job.version != 1 {
            return Err(Error::Storage(format!(
                "new job {} must have version 1, got {}",
                job.id, job.version
            )));
        }
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Storage(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        debug!(job = %job.id, "inserted job");
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn try_replace(&self, job: &Job, expected_version: u64) -> Result<bool> {
        if job.version != expected_version + 1 {
            return Err(Error::Storage(format!(
                "replacement for job {} must carry version {}, got {}",
                job.id,
                expected_version + 1,
                job.version
            )));
        }
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(&job.id)
            .ok_or_else(|| Error::JobNotFound(job.id.to_string()))?;
        if current.version != expected_version {
            debug!(
                job = %job.id,
                expected = expected_version,
                actual = current.version,
                "job replace lost the version race"
            );
            return Ok(false);
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

/// In-memory content-addressed graph store.
pub struct MemoryGraphStore {
    graphs: RwLock<HashMap<GraphId, Arc<Graph>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn add(&self, graph: Graph) -> Result<GraphId> {
        let id = graph.id;
        self.graphs.write().await.insert(id, Arc::new(graph));
        Ok(id)
    }

    async fn get(&self, id: &GraphId) -> Result<Option<Arc<Graph>>> {
        Ok(self.graphs.read().await.get(id).cloned())
    }
}
