//! Dependency readiness propagation.
//!
//! After any state change the job's steps are walked in order: a waiting step
//! whose order dependencies all completed becomes ready, and one with a failed
//! or skipped dependency is skipped with a failure outcome. Batch states are
//! then derived from their first pending step, and schedule priorities are
//! recomputed. Everything here is a pure function of the job and its graph,
//! safe to re-run any number of times.

use chrono::{DateTime, Utc};
use gantry_core::graph::{Graph, NodeRef, Priority};
use gantry_core::job::{BatchState, Job, StepOutcome, StepState};
use gantry_core::Result;
use std::collections::HashMap;

/// Snapshot of one node's most recent step, used for dependency checks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepInfo {
    pub state: StepState,
    pub outcome: StepOutcome,
    pub retried: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepInfo {
    pub fn is_failed(&self) -> bool {
        self.state == StepState::Aborted
            || (self.state == StepState::Completed && self.outcome == StepOutcome::Failure)
    }
}

/// Latest step per node, in batch walk order. When `include_provisional` is
/// false, steps that are still pending inside an undispatched batch are left
/// out; the recompute treats those as not materialized yet.
pub(crate) fn latest_steps(job: &Job, include_provisional: bool) -> HashMap<NodeRef, StepInfo> {
    let mut latest = HashMap::new();
    for batch in &job.batches {
        let undispatched = matches!(batch.state, BatchState::Waiting | BatchState::Ready);
        for step in &batch.steps {
            let pending = matches!(step.state, StepState::Waiting | StepState::Ready);
            if !include_provisional && undispatched && pending {
                continue;
            }
            latest.insert(
                NodeRef::new(batch.group_idx, step.node_idx),
                StepInfo {
                    state: step.state,
                    outcome: step.outcome,
                    retried: step.retried_by_user.is_some(),
                    finished_at: step.finished_at,
                },
            );
        }
    }
    latest
}

/// Propagate dependency readiness through all steps, then derive batch states.
///
/// A dependency with no step at all does not block: it simply is not part of
/// this job, and a run-after edge on absent work is vacuously satisfied.
pub fn refresh_states(job: &mut Job, graph: &Graph) -> Result<()> {
    let created = job.created_at;

    // Skipping one step can change the verdict for steps visited earlier in
    // the same walk, so repeat until nothing moves.
    loop {
        let info = latest_steps(job, true);
        let mut changed = false;
        for batch_idx in 0..job.batches.len() {
            for step_idx in 0..job.batches[batch_idx].steps.len() {
                let batch = &job.batches[batch_idx];
                let step = &batch.steps[step_idx];
                if step.state != StepState::Waiting {
                    continue;
                }
                let node_ref = NodeRef::new(batch.group_idx, step.node_idx);
                let node = graph.try_node(node_ref)?;

                let mut blocked = false;
                let mut pending = false;
                let mut latest_finish = None;
                for dep in &node.order_dependencies {
                    match info.get(dep) {
                        None => {}
                        Some(dep_info) if dep_info.is_failed() || dep_info.state == StepState::Skipped => {
                            blocked = true;
                            latest_finish = max_time(latest_finish, dep_info.finished_at);
                        }
                        Some(dep_info) if dep_info.state != StepState::Completed => {
                            pending = true;
                        }
                        Some(dep_info) => {
                            latest_finish = max_time(latest_finish, dep_info.finished_at);
                        }
                    }
                }

                let step = &mut job.batches[batch_idx].steps[step_idx];
                if blocked {
                    step.state = StepState::Skipped;
                    step.outcome = StepOutcome::Failure;
                    step.finished_at = Some(floor_at(latest_finish, created));
                    changed = true;
                } else if !pending {
                    step.state = StepState::Ready;
                    step.ready_at = Some(floor_at(latest_finish, created));
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    refresh_batch_states(job, graph)
}

/// Derive the state of every undispatched batch from its first pending step,
/// closing batches whose steps have all reached a terminal state.
fn refresh_batch_states(job: &mut Job, graph: &Graph) -> Result<()> {
    let created = job.created_at;
    let info = latest_steps(job, true);
    for batch_idx in 0..job.batches.len() {
        let batch = &job.batches[batch_idx];
        if !matches!(batch.state, BatchState::Waiting | BatchState::Ready) || batch.steps.is_empty()
        {
            continue;
        }

        if batch.steps.iter().all(|step| step.state.is_terminal()) {
            let finished = batch
                .steps
                .iter()
                .filter_map(|step| step.finished_at)
                .max()
                .unwrap_or(created);
            let batch = &mut job.batches[batch_idx];
            batch.state = BatchState::Complete;
            batch.finished_at = Some(finished);
            continue;
        }

        let first_pending = batch
            .steps
            .iter()
            .find(|step| matches!(step.state, StepState::Waiting | StepState::Ready));
        let Some(first_pending) = first_pending else {
            continue;
        };

        if first_pending.state == StepState::Ready {
            let node_ref = NodeRef::new(batch.group_idx, first_pending.node_idx);
            let node = graph.try_node(node_ref)?;
            let latest_finish = node
                .order_dependencies
                .iter()
                .filter_map(|dep| info.get(dep).and_then(|dep_info| dep_info.finished_at))
                .max();
            let ready_at = floor_at(latest_finish, created);
            let batch = &mut job.batches[batch_idx];
            batch.state = BatchState::Ready;
            batch.ready_at = Some(ready_at);
        } else {
            let batch = &mut job.batches[batch_idx];
            batch.state = BatchState::Waiting;
            batch.ready_at = None;
        }
    }
    Ok(())
}

/// Effective priority per node: the graph's static value, overridden by any
/// explicit step priority. Overrides apply to the overridden node only; they
/// do not flow backward to its dependencies.
pub fn node_priorities(job: &Job, graph: &Graph) -> HashMap<NodeRef, Priority> {
    let mut priorities = HashMap::new();
    for (group_idx, group) in graph.groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            priorities.insert(NodeRef::new(group_idx, node_idx), node.priority);
        }
    }
    for batch in &job.batches {
        for step in &batch.steps {
            if let Some(priority) = step.priority {
                priorities.insert(NodeRef::new(batch.group_idx, step.node_idx), priority);
            }
        }
    }
    priorities
}

/// Recompute batch schedule priorities and roll the maximum over ready
/// batches up to the job. Batches with no steps, and jobs with no ready
/// batch, sit at zero and are invisible to the dispatcher.
pub fn refresh_schedule_priorities(job: &mut Job, priorities: &HashMap<NodeRef, Priority>) {
    let job_weight = job.priority.weight() * 10;
    for batch in &mut job.batches {
        if batch.steps.is_empty() {
            batch.schedule_priority = 0;
            continue;
        }
        let max_node = batch
            .steps
            .iter()
            .map(|step| {
                priorities
                    .get(&NodeRef::new(batch.group_idx, step.node_idx))
                    .copied()
                    .unwrap_or_default()
                    .weight()
            })
            .max()
            .unwrap_or(0);
        batch.schedule_priority = job_weight + max_node + 1;
    }
    job.schedule_priority = job
        .batches
        .iter()
        .filter(|batch| batch.state == BatchState::Ready)
        .map(|batch| batch.schedule_priority)
        .max()
        .unwrap_or(0);
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn floor_at(time: Option<DateTime<Utc>>, floor: DateTime<Utc>) -> DateTime<Utc> {
    time.map_or(floor, |t| t.max(floor))
}
