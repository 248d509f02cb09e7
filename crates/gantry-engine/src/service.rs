//! Job orchestration service.
//!
//! Every mutation follows the same shape: read the job, apply a pure
//! transformation, write it back with a compare-and-swap on the version
//! counter, and retry from a fresh read when another writer got there
//! first. The transformations themselves live in [`crate::recompute`],
//! [`crate::readiness`] and [`crate::lease`]; this module owns the loop.

use crate::dispatch::compare_dispatch_order;
use crate::labels::{self, LabelState};
use crate::lease;
use crate::readiness::{node_priorities, refresh_schedule_priorities, refresh_states};
use crate::recompute::recompute_batches;
use chrono::{DateTime, Utc};
use gantry_core::graph::{Graph, NodeRef, Priority};
use gantry_core::ids::{AgentId, BatchId, GraphId, JobId, LeaseId, LogId, PoolId, SessionId, StepId};
use gantry_core::job::{BatchError, BatchState, Job, StepOutcome, StepState};
use gantry_core::ports::{GraphStore, JobStore};
use gantry_core::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Bounds for the optimistic-concurrency write loop.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_update_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: 5,
        }
    }
}

/// Everything needed to start a job against a stored graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateJobParams {
    pub name: String,
    pub graph_id: GraphId,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

/// Partial update applied to one step. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StepUpdate {
    pub state: Option<StepState>,
    pub outcome: Option<StepOutcome>,
    pub abort_requested: Option<bool>,
    pub retry_requested_by: Option<String>,
    pub priority: Option<Priority>,
    pub log_id: Option<LogId>,
}

/// Partial update applied to one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BatchUpdate {
    pub state: Option<BatchState>,
    pub error: Option<BatchError>,
}

/// The job orchestration service.
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    graphs: Arc<dyn GraphStore>,
    config: ServiceConfig,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobStore>, graphs: Arc<dyn GraphStore>) -> Self {
        Self {
            jobs,
            graphs,
            config: ServiceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Create a job and derive its initial batches.
    pub async fn create_job(&self, params: CreateJobParams) -> Result<Job> {
        let graph = self.load_graph(&params.graph_id).await?;
        let mut job = Job::new(
            params.name,
            params.graph_id,
            params.arguments,
            params.priority,
        );
        let created_at = job.created_at;
        recompute_batches(&mut job, &graph, created_at)?;
        self.jobs.insert(&job).await?;
        info!(job = %job.id, graph = %job.graph_id, "created job");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Jobs with batches ready for an agent, most urgent first.
    pub async fn get_dispatch_queue(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|job| job.schedule_priority > 0)
            .collect();
        jobs.sort_by(compare_dispatch_order);
        Ok(jobs)
    }

    /// Replace the job's target arguments and re-derive its batches.
    pub async fn update_arguments(&self, job_id: JobId, arguments: Vec<String>) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            job.arguments = arguments.clone();
            recompute_batches(job, graph, now)
        })
        .await
    }

    pub async fn update_priority(&self, job_id: JobId, priority: Priority) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            job.priority = priority;
            recompute_batches(job, graph, now)
        })
        .await
    }

    /// Stop scheduling new work for the job. Running batches are cancelled;
    /// finished work keeps its history. The first abort wins.
    pub async fn abort_job(&self, job_id: JobId, aborted_by: impl Into<String>) -> Result<Job> {
        let aborted_by = aborted_by.into();
        self.update_job(job_id, move |job, graph, now| {
            if job.aborted_by_user.is_none() {
                job.aborted_by_user = Some(aborted_by.clone());
            }
            recompute_batches(job, graph, now)
        })
        .await
    }

    /// Point the job at a new graph. The replacement must extend the current
    /// one so the job's positional references stay valid.
    pub async fn update_graph(&self, job_id: JobId, graph_id: GraphId) -> Result<Job> {
        let replacement = self.load_graph(&graph_id).await?;
        for _ in 0..self.config.max_update_attempts {
            let mut job = self.get_job(job_id).await?;
            let current = self.load_graph(&job.graph_id).await?;
            if !replacement.extends(&current) {
                return Err(Error::GraphNotExtension {
                    current: job.graph_id.to_string(),
                    candidate: graph_id.to_string(),
                });
            }
            let expected = job.version;
            let now = Utc::now();
            job.graph_id = graph_id;
            recompute_batches(&mut job, &replacement, now)?;
            job.version = expected + 1;
            job.updated_at = now;
            if self.jobs.try_replace(&job, expected).await? {
                info!(job = %job_id, graph = %graph_id, "updated job graph");
                return Ok(job);
            }
            debug!(job = %job_id, version = expected, "job update conflicted, retrying");
        }
        Err(Error::TooManyConflicts {
            attempts: self.config.max_update_attempts,
        })
    }

    /// Apply an agent or user report to one step. A retry request re-derives
    /// the job's batches; everything else only refreshes readiness.
    pub async fn update_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        update: StepUpdate,
    ) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            apply_step_update(job, graph, batch_id, step_id, &update, now)
        })
        .await
    }

    /// Apply an agent report to one batch. Errors and premature completion
    /// terminate the batch and re-derive the job.
    pub async fn update_batch(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        update: BatchUpdate,
    ) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            apply_batch_update(job, graph, batch_id, &update, now)
        })
        .await
    }

    /// Terminate a batch with the given error and re-derive the job. Work the
    /// batch never started goes back on the queue unless a failed dependency
    /// rules it out.
    pub async fn fail_batch(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        error: BatchError,
    ) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            lease::fail_batch(job, batch_id, error, now)?;
            recompute_batches(job, graph, now)
        })
        .await
    }

    /// Cancel one batch. Its unstarted work is rescheduled into fresh
    /// batches; aborting the job is the way to stop it for good.
    pub async fn skip_batch(&self, job_id: JobId, batch_id: BatchId) -> Result<Job> {
        self.fail_batch(job_id, batch_id, BatchError::Cancelled).await
    }

    /// Cancel every unfinished batch and re-derive the job.
    pub async fn skip_all_batches(&self, job_id: JobId) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            lease::skip_all_batches(job, BatchError::Cancelled, now);
            recompute_batches(job, graph, now)
        })
        .await
    }

    /// Bind a ready batch to an agent lease and mark it running.
    pub async fn assign_lease(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        pool_id: PoolId,
        agent_id: AgentId,
        session_id: SessionId,
        lease_id: LeaseId,
    ) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            lease::assign_lease(job, batch_id, pool_id, agent_id, session_id, lease_id, now)?;
            let priorities = node_priorities(job, graph);
            refresh_schedule_priorities(job, &priorities);
            Ok(())
        })
        .await
    }

    /// Return a running batch to the ready queue, e.g. when its agent went
    /// away before reporting anything.
    pub async fn cancel_lease(&self, job_id: JobId, batch_id: BatchId) -> Result<Job> {
        self.update_job(job_id, move |job, graph, _now| {
            lease::cancel_lease(job, batch_id)?;
            let priorities = node_priorities(job, graph);
            refresh_schedule_priorities(job, &priorities);
            Ok(())
        })
        .await
    }

    /// Spend a node's retry budget up front so later failures stay final.
    pub async fn add_retried_node(&self, job_id: JobId, node_ref: NodeRef) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            if !job.retried_nodes.contains(&node_ref) {
                job.retried_nodes.push(node_ref);
            }
            recompute_batches(job, graph, now)
        })
        .await
    }

    /// Hand a node's retry budget back, allowing one more attempt.
    pub async fn remove_retried_node(&self, job_id: JobId, node_ref: NodeRef) -> Result<Job> {
        self.update_job(job_id, move |job, graph, now| {
            job.retried_nodes.retain(|existing| *existing != node_ref);
            recompute_batches(job, graph, now)
        })
        .await
    }

    /// Current label rollups for the job.
    pub async fn label_states(&self, job_id: JobId) -> Result<Vec<LabelState>> {
        let job = self.get_job(job_id).await?;
        let graph = self.load_graph(&job.graph_id).await?;
        Ok(labels::label_states(&job, &graph))
    }

    async fn load_graph(&self, graph_id: &GraphId) -> Result<Arc<Graph>> {
        self.graphs
            .get(graph_id)
            .await?
            .ok_or_else(|| Error::GraphNotFound(graph_id.to_string()))
    }

    /// Read-mutate-write with version CAS, retried from a fresh read on
    /// contention.
    async fn update_job<F>(&self, job_id: JobId, mut mutate: F) -> Result<Job>
    where
        F: FnMut(&mut Job, &Graph, DateTime<Utc>) -> Result<()>,
    {
        for _ in 0..self.config.max_update_attempts {
            let mut job = self.get_job(job_id).await?;
            let graph = self.load_graph(&job.graph_id).await?;
            let expected = job.version;
            let now = Utc::now();
            mutate(&mut job, &graph, now)?;
            job.version = expected + 1;
            job.updated_at = now;
            if self.jobs.try_replace(&job, expected).await? {
                return Ok(job);
            }
            debug!(job = %job_id, version = expected, "job update conflicted, retrying");
        }
        Err(Error::TooManyConflicts {
            attempts: self.config.max_update_attempts,
        })
    }
}

fn apply_step_update(
    job: &mut Job,
    graph: &Graph,
    batch_id: BatchId,
    step_id: StepId,
    update: &StepUpdate,
    now: DateTime<Utc>,
) -> Result<()> {
    let batch = job
        .batch_mut(batch_id)
        .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
    let group_idx = batch.group_idx;
    let step = batch
        .step_mut(step_id)
        .ok_or_else(|| Error::StepNotFound(step_id.to_string()))?;
    let node = graph.try_node(NodeRef::new(group_idx, step.node_idx))?;

    if let Some(state) = update.state {
        if state == StepState::Running && step.started_at.is_none() {
            step.started_at = Some(now);
        }
        if state.is_terminal() && step.finished_at.is_none() {
            step.finished_at = Some(now);
        }
        step.state = state;
    }
    if let Some(outcome) = update.outcome {
        // Nodes can opt out of warning-level reporting.
        step.outcome = if outcome == StepOutcome::Warnings && !node.warnings {
            StepOutcome::Success
        } else {
            outcome
        };
    }
    if let Some(priority) = update.priority {
        step.priority = Some(priority);
    }
    if let Some(log_id) = update.log_id {
        step.log_id = Some(log_id);
    }
    if update.abort_requested == Some(true) {
        step.abort_requested = true;
        if !step.state.has_started() && !step.state.is_terminal() {
            step.state = StepState::Aborted;
            step.outcome = StepOutcome::Failure;
            step.finished_at = Some(now);
        }
    }
    if let Some(user) = &update.retry_requested_by {
        if !step.state.is_terminal() {
            return Err(Error::StepNotFinished(step_id.to_string()));
        }
        step.retried_by_user = Some(user.clone());
    }

    if update.retry_requested_by.is_some() {
        recompute_batches(job, graph, now)
    } else {
        refresh_states(job, graph)?;
        let priorities = node_priorities(job, graph);
        refresh_schedule_priorities(job, &priorities);
        Ok(())
    }
}

fn apply_batch_update(
    job: &mut Job,
    graph: &Graph,
    batch_id: BatchId,
    update: &BatchUpdate,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(error) = update.error {
        if error != BatchError::None {
            lease::fail_batch(job, batch_id, error, now)?;
            return recompute_batches(job, graph, now);
        }
    }
    let Some(state) = update.state else {
        return Ok(());
    };
    let batch = job
        .batch_mut(batch_id)
        .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
    if state == BatchState::Complete
        && batch.steps.iter().any(|step| !step.state.is_terminal())
    {
        // The agent walked away with work still pending.
        lease::fail_batch(job, batch_id, BatchError::Incomplete, now)?;
        return recompute_batches(job, graph, now);
    }
    batch.state = state;
    if state.is_terminal() && batch.finished_at.is_none() {
        batch.finished_at = Some(now);
    }
    refresh_states(job, graph)?;
    let priorities = node_priorities(job, graph);
    refresh_schedule_priorities(job, &priorities);
    Ok(())
}
