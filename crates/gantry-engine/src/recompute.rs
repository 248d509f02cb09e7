//! Batch and step recompute.
//!
//! The single derivation at the center of the engine: given a job and its
//! graph, rebuild the set of batches and steps that should exist. Started
//! work is never touched; steps still pending in undispatched batches are
//! reconciled in place (kept when their node is still scheduled, dropped
//! otherwise) so that recomputing twice with no intervening change leaves
//! the job byte-identical, step and batch ids included.
//!
//! The derivation runs on every mutation that can change what work exists:
//! job creation, argument/priority/graph updates, aborts, batch failures and
//! retry requests. Step completions only need the cheaper readiness refresh.

use crate::lease::terminate_batch;
use crate::readiness::{
    StepInfo, latest_steps, node_priorities, refresh_schedule_priorities, refresh_states,
};
use crate::targets::resolve_targets;
use chrono::{DateTime, Utc};
use gantry_core::graph::{Graph, NodeRef};
use gantry_core::ids::{BatchId, StepId};
use gantry_core::job::{Batch, BatchError, BatchState, Job, Step, StepOutcome, StepState};
use gantry_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Recompute the job's batches and steps from its arguments and graph, then
/// propagate readiness and schedule priorities.
pub fn recompute_batches(job: &mut Job, graph: &Graph, now: DateTime<Utc>) -> Result<()> {
    // Priorities are captured before anything is dropped so that overrides on
    // steps removed below still shape this round's batch priorities.
    let priorities = node_priorities(job, graph);

    let settled = latest_steps(job, false);
    let failed = resolve_failed_nodes(graph, &settled)?;
    drop_stale_skips(job, &failed);

    let mut to_schedule = resolve_targets(job, graph)?;
    cancel_abandoned_batches(job, &to_schedule, now);

    let settled = latest_steps(job, false);
    prune_settled_nodes(&settled, &mut to_schedule);
    add_group_local_dependencies(graph, &mut to_schedule);
    reconcile_steps(job, graph, &settled, &to_schedule)?;
    drop_empty_batches(job);

    refresh_states(job, graph)?;
    refresh_schedule_priorities(job, &priorities);
    debug!(job = %job.id, batches = job.batches.len(), "recomputed job batches");
    Ok(())
}

/// Nodes considered failed for scheduling: the latest settled attempt failed,
/// or it was skipped while an input dependency is failed. A retry request on
/// the latest attempt clears the node.
fn resolve_failed_nodes(
    graph: &Graph,
    settled: &HashMap<NodeRef, StepInfo>,
) -> Result<HashSet<NodeRef>> {
    let mut failed = HashSet::new();
    let mut memo = HashMap::new();
    for &node_ref in settled.keys() {
        if is_failed_node(graph, settled, node_ref, &mut memo)? {
            failed.insert(node_ref);
        }
    }
    Ok(failed)
}

fn is_failed_node(
    graph: &Graph,
    settled: &HashMap<NodeRef, StepInfo>,
    node_ref: NodeRef,
    memo: &mut HashMap<NodeRef, bool>,
) -> Result<bool> {
    if let Some(&known) = memo.get(&node_ref) {
        return Ok(known);
    }
    // Placeholder entry so malformed cyclic references terminate.
    memo.insert(node_ref, false);
    let verdict = match settled.get(&node_ref) {
        None => false,
        Some(info) if info.retried => false,
        Some(info) if info.is_failed() => true,
        Some(info) if info.state == StepState::Skipped => {
            let node = graph.try_node(node_ref)?;
            let mut blocked = false;
            for &dep in &node.input_dependencies {
                if is_failed_node(graph, settled, dep, memo)? {
                    blocked = true;
                    break;
                }
            }
            blocked
        }
        Some(_) => false,
    };
    memo.insert(node_ref, verdict);
    Ok(verdict)
}

/// Drop skip markers whose cause has gone away, so the affected nodes are
/// derived again.
fn drop_stale_skips(job: &mut Job, failed: &HashSet<NodeRef>) {
    for batch in &mut job.batches {
        let group_idx = batch.group_idx;
        batch.steps.retain(|step| {
            step.state != StepState::Skipped
                || failed.contains(&NodeRef::new(group_idx, step.node_idx))
        });
    }
}

/// Cancel running batches whose node group fell out of the target set.
fn cancel_abandoned_batches(job: &mut Job, to_schedule: &HashSet<NodeRef>, now: DateTime<Utc>) {
    for batch in &mut job.batches {
        if batch.state != BatchState::Running {
            continue;
        }
        let wanted = to_schedule
            .iter()
            .any(|node_ref| node_ref.group_idx == batch.group_idx);
        if !wanted {
            warn!(batch = %batch.id, "cancelling batch no longer on the target path");
            terminate_batch(batch, BatchError::Cancelled, now);
        }
    }
}

/// Drop nodes that already have a settled or agent-owned step and should not
/// run again. A finished attempt with a retry request stays schedulable.
fn prune_settled_nodes(settled: &HashMap<NodeRef, StepInfo>, to_schedule: &mut HashSet<NodeRef>) {
    for (node_ref, info) in settled {
        let retry_requested = info.retried
            && matches!(info.state, StepState::Completed | StepState::Aborted);
        if !retry_requested {
            to_schedule.remove(node_ref);
        }
    }
}

/// Re-add input dependencies that share a group with a scheduled node. Each
/// batch runs in a fresh agent workspace, so a node's same-group inputs must
/// be produced in that workspace even when an earlier batch already ran them.
fn add_group_local_dependencies(graph: &Graph, to_schedule: &mut HashSet<NodeRef>) {
    for (group_idx, group) in graph.groups.iter().enumerate() {
        // Dependencies point backward, so walking each group from the end
        // makes the closure transitive in a single pass.
        for node_idx in (0..group.nodes.len()).rev() {
            if !to_schedule.contains(&NodeRef::new(group_idx, node_idx)) {
                continue;
            }
            for &dep in &group.nodes[node_idx].input_dependencies {
                if dep.group_idx == group_idx {
                    to_schedule.insert(dep);
                }
            }
        }
    }
}

/// Materialize steps for the scheduled node set. Pending steps for nodes
/// that fell out of the schedule are dropped, pending steps for nodes still
/// in it are kept as-is, and the rest get new steps in the first batch that
/// can take them in node order, except that run-early nodes always start a
/// batch of their own. A new attempt for a node whose last run failed
/// consumes the node's single retry.
fn reconcile_steps(
    job: &mut Job,
    graph: &Graph,
    settled: &HashMap<NodeRef, StepInfo>,
    to_schedule: &HashSet<NodeRef>,
) -> Result<()> {
    for batch in &mut job.batches {
        if !matches!(batch.state, BatchState::Waiting | BatchState::Ready) {
            continue;
        }
        let group_idx = batch.group_idx;
        batch.steps.retain(|step| {
            !matches!(step.state, StepState::Waiting | StepState::Ready)
                || to_schedule.contains(&NodeRef::new(group_idx, step.node_idx))
        });
    }

    for group_idx in 0..graph.groups.len() {
        let mut desired: Vec<usize> = to_schedule
            .iter()
            .filter(|node_ref| node_ref.group_idx == group_idx)
            .map(|node_ref| node_ref.node_idx)
            .collect();
        desired.sort_unstable();

        for node_idx in desired {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if has_pending_step(job, node_ref) {
                continue;
            }
            let node = graph.try_node(node_ref)?;

            if let Some(info) = settled.get(&node_ref) {
                if info.is_failed() {
                    if !node.allow_retry {
                        return Err(Error::RetryNotAllowed {
                            node: node.name.clone(),
                        });
                    }
                    if job.retried_nodes.contains(&node_ref) {
                        return Err(Error::RetryLimitExceeded {
                            node: node.name.clone(),
                        });
                    }
                    job.retried_nodes.push(node_ref);
                }
            }

            // A run-early node opens its own batch so it can dispatch as
            // soon as its dependencies allow, instead of queueing behind
            // earlier steps of the group.
            let slot = if node.run_early {
                None
            } else {
                job.batches.iter().position(|batch| {
                    batch.group_idx == group_idx
                        && batch.is_appendable()
                        && batch.last_node_idx().map_or(true, |last| last < node_idx)
                })
            };
            let batch_idx = match slot {
                Some(batch_idx) => batch_idx,
                None => {
                    let batch_id = BatchId::new(job.allocate_sub_resource_id());
                    job.batches.push(Batch::new(batch_id, group_idx));
                    job.batches.len() - 1
                }
            };
            let step_id = StepId::new(job.allocate_sub_resource_id());
            job.batches[batch_idx]
                .steps
                .push(Step::new(step_id, node_idx));
        }
    }
    Ok(())
}

/// True when an undispatched batch already holds a pending step for the node.
fn has_pending_step(job: &Job, node_ref: NodeRef) -> bool {
    job.batches.iter().any(|batch| {
        batch.group_idx == node_ref.group_idx
            && matches!(batch.state, BatchState::Waiting | BatchState::Ready)
            && batch.steps.iter().any(|step| {
                step.node_idx == node_ref.node_idx
                    && matches!(step.state, StepState::Waiting | StepState::Ready)
            })
    })
}

/// A batch left with no steps and no error carries no information.
fn drop_empty_batches(job: &mut Job) {
    job.batches
        .retain(|batch| !batch.steps.is_empty() || batch.error != BatchError::None);
}
