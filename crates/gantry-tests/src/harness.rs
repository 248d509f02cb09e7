//! Shared wiring for the integration tests.

use crate::init_test_logging;
use gantry_core::graph::{Graph, Priority};
use gantry_core::ids::{AgentId, BatchId, GraphId, JobId, LeaseId, PoolId, SessionId, StepId};
use gantry_core::job::{BatchState, Job, StepOutcome, StepState};
use gantry_core::ports::GraphStore;
use gantry_engine::{BatchUpdate, CreateJobParams, JobService, StepUpdate};
use gantry_graph::{GraphCache, GraphCacheConfig};
use gantry_store::memory::{MemoryGraphStore, MemoryJobStore};
use std::sync::Arc;

/// A [`JobService`] wired against fresh in-memory stores, with a graph
/// cache in front the way production deployments run. Helpers panic on
/// unexpected errors so tests stay focused on the flow under test.
pub struct TestHarness {
    pub service: JobService,
    graphs: Arc<GraphCache>,
}

impl TestHarness {
    pub async fn new() -> Self {
        init_test_logging();
        let backing = Arc::new(MemoryGraphStore::new());
        let graphs = Arc::new(GraphCache::new(
            backing,
            GraphCacheConfig::default().with_capacity(8),
        ));
        let service = JobService::new(Arc::new(MemoryJobStore::new()), graphs.clone());
        Self { service, graphs }
    }

    /// Store a graph and return its content id.
    pub async fn store_graph(&self, graph: Graph) -> GraphId {
        self.graphs.add(graph).await.expect("graph stores")
    }

    pub async fn create_job(
        &self,
        graph_id: GraphId,
        name: &str,
        arguments: &[&str],
        priority: Priority,
    ) -> Job {
        self.service
            .create_job(CreateJobParams {
                name: name.to_string(),
                graph_id,
                arguments: arguments.iter().map(|argument| argument.to_string()).collect(),
                priority,
            })
            .await
            .expect("job creates")
    }

    /// Lease a ready batch as a fresh agent session.
    pub async fn lease_batch(&self, job_id: JobId, batch_id: BatchId) -> Job {
        self.service
            .assign_lease(
                job_id,
                batch_id,
                PoolId::new(),
                AgentId::new(),
                SessionId::new(),
                LeaseId::new(),
            )
            .await
            .expect("lease assigns")
    }

    /// Report one step finished with the given outcome.
    pub async fn finish_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        outcome: StepOutcome,
    ) -> Job {
        self.service
            .update_step(
                job_id,
                batch_id,
                step_id,
                StepUpdate {
                    state: Some(StepState::Completed),
                    outcome: Some(outcome),
                    ..StepUpdate::default()
                },
            )
            .await
            .expect("step updates")
    }

    /// Report a batch cleanly finished.
    pub async fn finish_batch(&self, job_id: JobId, batch_id: BatchId) -> Job {
        self.service
            .update_batch(
                job_id,
                batch_id,
                BatchUpdate {
                    state: Some(BatchState::Complete),
                    error: None,
                },
            )
            .await
            .expect("batch completes")
    }

    /// Lease a batch, run every pending step to success in order and close
    /// the batch, the way a healthy agent would.
    pub async fn run_batch(&self, job_id: JobId, batch_id: BatchId) -> Job {
        let job = self.lease_batch(job_id, batch_id).await;
        let steps: Vec<StepId> = job
            .batch(batch_id)
            .expect("leased batch exists")
            .steps
            .iter()
            .filter(|step| !step.state.is_terminal())
            .map(|step| step.id)
            .collect();
        for step_id in steps {
            self.service
                .update_step(
                    job_id,
                    batch_id,
                    step_id,
                    StepUpdate {
                        state: Some(StepState::Running),
                        ..StepUpdate::default()
                    },
                )
                .await
                .expect("step starts");
            self.finish_step(job_id, batch_id, step_id, StepOutcome::Success)
                .await;
        }
        self.finish_batch(job_id, batch_id).await
    }
}

/// Ids of the batches currently ready for an agent, in declaration order.
pub fn ready_batches(job: &Job) -> Vec<BatchId> {
    job.batches
        .iter()
        .filter(|batch| batch.state == BatchState::Ready)
        .map(|batch| batch.id)
        .collect()
}
