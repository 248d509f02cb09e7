//! Job execution documents.
//!
//! A job is the mutable execution instance of one graph: an ordered list of
//! batches, each a contiguous run of steps from a single node group destined
//! for one agent lease. Jobs are updated optimistically; every write bumps
//! `version` by one and goes through a compare-and-swap on the stored value.

use crate::graph::{NodeRef, Priority};
use crate::ids::{AgentId, BatchId, GraphId, JobId, LeaseId, LogId, PoolId, SessionId, StepId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub graph_id: GraphId,
    /// Raw request arguments; entries of the form `-Target=Name` select the
    /// nodes or aggregates to build.
    pub arguments: Vec<String>,
    pub priority: Priority,
    /// Set once by an abort request. No new work is scheduled afterwards;
    /// existing history is kept.
    pub aborted_by_user: Option<String>,
    pub batches: Vec<Batch>,
    /// Monotonic allocator for batch and step ids.
    pub next_sub_resource_id: u16,
    /// Nodes that have been granted their single retry.
    pub retried_nodes: Vec<NodeRef>,
    /// Derived: maximum schedule priority over ready batches, 0 when none.
    pub schedule_priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        graph_id: GraphId,
        arguments: Vec<String>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            graph_id,
            arguments,
            priority,
            aborted_by_user: None,
            batches: Vec::new(),
            next_sub_resource_id: 1,
            retried_nodes: Vec::new(),
            schedule_priority: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Allocate the next batch/step id, skipping values still in use by live
    /// sub-resources after the 16-bit counter wraps.
    pub fn allocate_sub_resource_id(&mut self) -> u16 {
        loop {
            let id = self.next_sub_resource_id;
            self.next_sub_resource_id = self.next_sub_resource_id.wrapping_add(1);
            if !self.sub_resource_id_in_use(id) {
                return id;
            }
        }
    }

    fn sub_resource_id_in_use(&self, id: u16) -> bool {
        self.batches.iter().any(|batch| {
            batch.id.value() == id || batch.steps.iter().any(|step| step.id.value() == id)
        })
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|batch| batch.id == id)
    }

    pub fn batch_mut(&mut self, id: BatchId) -> Option<&mut Batch> {
        self.batches.iter_mut().find(|batch| batch.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Batch {
    pub id: BatchId,
    pub group_idx: usize,
    pub state: BatchState,
    pub error: BatchError,
    /// Steps ordered by strictly increasing `node_idx`.
    pub steps: Vec<Step>,
    pub schedule_priority: i32,
    pub pool_id: Option<PoolId>,
    pub agent_id: Option<AgentId>,
    pub session_id: Option<SessionId>,
    pub lease_id: Option<LeaseId>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(id: BatchId, group_idx: usize) -> Self {
        Self {
            id,
            group_idx,
            state: BatchState::Waiting,
            error: BatchError::None,
            steps: Vec::new(),
            schedule_priority: 0,
            pool_id: None,
            agent_id: None,
            session_id: None,
            lease_id: None,
            ready_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn step_mut(&mut self, id: StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.id == id)
    }

    pub fn last_node_idx(&self) -> Option<usize> {
        self.steps.last().map(|step| step.node_idx)
    }

    /// A batch accepts further steps only while it has not been dispatched,
    /// carries no error, and none of its steps have started.
    pub fn is_appendable(&self) -> bool {
        matches!(self.state, BatchState::Waiting | BatchState::Ready)
            && self.error == BatchError::None
            && !self.steps.iter().any(|step| step.state.has_started())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Waiting,
    Ready,
    Running,
    Complete,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchError {
    #[default]
    None,
    /// Cancelled before completion, e.g. the target set changed under it.
    Cancelled,
    /// The agent finished the batch without reporting all steps.
    Incomplete,
    /// The agent session was lost mid-execution.
    LostConnection,
    NoAgentsInPool,
    NoAgentsOnline,
    /// The agent reported a batch-level execution failure.
    ExecutionError,
    UnknownAgentType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: StepId,
    /// Index of the node within the batch's group.
    pub node_idx: usize,
    pub state: StepState,
    pub outcome: StepOutcome,
    /// Asks the executing agent to stop this step; the engine only records
    /// the flag, termination happens agent-side.
    pub abort_requested: bool,
    /// Set when a user requests this finished step be run again.
    pub retried_by_user: Option<String>,
    /// Per-job override of the node's static priority.
    pub priority: Option<Priority>,
    pub log_id: Option<LogId>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(id: StepId, node_idx: usize) -> Self {
        Self {
            id,
            node_idx,
            state: StepState::Waiting,
            outcome: StepOutcome::Unspecified,
            abort_requested: false,
            retried_by_user: None,
            priority: None,
            log_id: None,
            ready_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// True when this attempt counts as failed for dependency propagation:
    /// it finished with a failure outcome or was aborted mid-run.
    pub fn is_failed(&self) -> bool {
        self.state == StepState::Aborted
            || (self.state == StepState::Completed && self.outcome == StepOutcome::Failure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Waiting,
    Ready,
    Running,
    Completed,
    Aborted,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Aborted | StepState::Skipped
        )
    }

    /// True once an agent has picked the step up, whether or not it finished.
    pub fn has_started(&self) -> bool {
        matches!(
            self,
            StepState::Running | StepState::Completed | StepState::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    #[default]
    Unspecified,
    Success,
    Warnings,
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_resource_ids_skip_live_values() {
        let graph_id = GraphId::from_bytes([0; 32]);
        let mut job = Job::new("test", graph_id, Vec::new(), Priority::Normal);
        let first = job.allocate_sub_resource_id();
        assert_eq!(first, 1);

        let mut batch = Batch::new(BatchId::new(2), 0);
        batch.steps.push(Step::new(StepId::new(3), 0));
        job.batches.push(batch);

        assert_eq!(job.allocate_sub_resource_id(), 4);
    }

    #[test]
    fn test_batch_appendable_until_a_step_starts() {
        let mut batch = Batch::new(BatchId::new(1), 0);
        batch.steps.push(Step::new(StepId::new(2), 0));
        assert!(batch.is_appendable());

        batch.steps[0].state = StepState::Running;
        assert!(!batch.is_appendable());
    }

    #[test]
    fn test_batch_with_error_is_not_appendable() {
        let mut batch = Batch::new(BatchId::new(1), 0);
        batch.error = BatchError::Incomplete;
        assert!(!batch.is_appendable());
    }

    #[test]
    fn test_step_failure_detection() {
        let mut step = Step::new(StepId::new(1), 0);
        assert!(!step.is_failed());

        step.state = StepState::Completed;
        step.outcome = StepOutcome::Failure;
        assert!(step.is_failed());

        step.outcome = StepOutcome::Warnings;
        assert!(!step.is_failed());

        step.state = StepState::Aborted;
        assert!(step.is_failed());
    }
}
