//! Target resolution.
//!
//! Jobs name the work they want through `-Target=` arguments referring to
//! nodes or aggregates. The effective set is those nodes plus the implicit
//! setup node, transitively closed backward over input dependencies so that
//! everything a target consumes is scheduled too. An aborted job resolves to
//! an empty set: abort stops new work, it does not erase history.

use gantry_core::graph::{Graph, NodeRef};
use gantry_core::job::Job;
use gantry_core::{Error, Result};
use std::collections::HashSet;

const TARGET_PREFIX: &str = "-Target=";

/// Resolve the set of nodes a job should schedule steps for.
pub fn resolve_targets(job: &Job, graph: &Graph) -> Result<HashSet<NodeRef>> {
    let mut targets = HashSet::new();
    if job.aborted_by_user.is_some() {
        return Ok(targets);
    }

    let setup = NodeRef::new(0, 0);
    graph.try_node(setup)?;
    targets.insert(setup);

    for argument in &job.arguments {
        let Some(name) = argument.strip_prefix(TARGET_PREFIX) else {
            continue;
        };
        if let Some(aggregate) = graph.find_aggregate(name) {
            targets.extend(aggregate.nodes.iter().copied());
        } else if let Some(node_ref) = graph.find_node(name) {
            targets.insert(node_ref);
        } else {
            return Err(Error::UnknownTarget(name.to_string()));
        }
    }

    close_over_inputs(graph, &mut targets)?;
    Ok(targets)
}

/// Pull in every node the current set consumes, transitively.
fn close_over_inputs(graph: &Graph, targets: &mut HashSet<NodeRef>) -> Result<()> {
    let mut frontier: Vec<NodeRef> = targets.iter().copied().collect();
    while let Some(node_ref) = frontier.pop() {
        let node = graph.try_node(node_ref)?;
        for &dep in &node.input_dependencies {
            if targets.insert(dep) {
                frontier.push(dep);
            }
        }
    }
    Ok(())
}
