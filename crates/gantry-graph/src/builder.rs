//! Graph resolution.
//!
//! Turns a declarative definition into the positional, content-hashed form.
//! Resolution validates that every dependency name exists, that the
//! dependency relation is acyclic, and that no dependency points forward to
//! a later group. Within each group, nodes are reordered so dependencies
//! precede their dependents; the reorder is stable with respect to
//! declaration order, so appending nodes to a definition yields a graph that
//! extends the previous one.

use crate::definition::{GraphDefinition, NodeDefinition};
use gantry_core::graph::{Aggregate, Graph, Label, Node, NodeGroup, NodeRef};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphBuilderError {
    #[error("Cycle detected in node dependencies")]
    CycleDetected,

    #[error("Unknown node dependency: {0}")]
    UnknownDependency(String),

    #[error("Unknown node in aggregate {aggregate}: {node}")]
    UnknownAggregateNode { aggregate: String, node: String },

    #[error("Unknown node in label {label}: {node}")]
    UnknownLabelNode { label: String, node: String },

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Duplicate aggregate name: {0}")]
    DuplicateAggregate(String),

    #[error("Node {dependent} depends on {dependency} in a later group")]
    ForwardGroupDependency {
        dependent: String,
        dependency: String,
    },

    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Failed to encode graph for hashing: {0}")]
    Encoding(String),
}

/// Builder for resolving graph definitions.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, definition: &GraphDefinition) -> Result<Graph, GraphBuilderError> {
        if definition.groups.iter().all(|group| group.nodes.is_empty()) {
            return Err(GraphBuilderError::EmptyGraph);
        }

        // Map node names to declaration positions, rejecting duplicates.
        // Names are matched case-insensitively everywhere.
        let mut declared: HashMap<String, (usize, usize)> = HashMap::new();
        for (group_idx, group) in definition.groups.iter().enumerate() {
            for (node_idx, node) in group.nodes.iter().enumerate() {
                let key = node.name.to_ascii_lowercase();
                if declared.insert(key, (group_idx, node_idx)).is_some() {
                    return Err(GraphBuilderError::DuplicateNode(node.name.clone()));
                }
            }
        }

        self.validate_dependencies(definition, &declared)?;

        // Reorder each group so same-group dependencies come first, then
        // record where every declared node ended up.
        let mut resolved: HashMap<String, NodeRef> = HashMap::new();
        let mut group_orders: Vec<Vec<usize>> = Vec::with_capacity(definition.groups.len());
        for (group_idx, group) in definition.groups.iter().enumerate() {
            let order = stable_group_order(group_idx, &group.nodes, &declared)?;
            for (new_idx, &decl_idx) in order.iter().enumerate() {
                let name = group.nodes[decl_idx].name.to_ascii_lowercase();
                resolved.insert(name, NodeRef::new(group_idx, new_idx));
            }
            group_orders.push(order);
        }

        let mut groups = Vec::with_capacity(definition.groups.len());
        for (group_idx, group) in definition.groups.iter().enumerate() {
            let mut nodes = Vec::with_capacity(group.nodes.len());
            for &decl_idx in &group_orders[group_idx] {
                nodes.push(build_node(&group.nodes[decl_idx], &resolved)?);
            }
            groups.push(NodeGroup {
                agent_type: group.agent_type.clone(),
                nodes,
            });
        }

        let mut aggregate_names = HashSet::new();
        let mut aggregates = Vec::with_capacity(definition.aggregates.len());
        for aggregate in &definition.aggregates {
            if !aggregate_names.insert(aggregate.name.to_ascii_lowercase()) {
                return Err(GraphBuilderError::DuplicateAggregate(aggregate.name.clone()));
            }
            let mut nodes = Vec::with_capacity(aggregate.nodes.len());
            for name in &aggregate.nodes {
                let node_ref = resolved.get(&name.to_ascii_lowercase()).copied().ok_or_else(
                    || GraphBuilderError::UnknownAggregateNode {
                        aggregate: aggregate.name.clone(),
                        node: name.clone(),
                    },
                )?;
                if !nodes.contains(&node_ref) {
                    nodes.push(node_ref);
                }
            }
            aggregates.push(Aggregate {
                name: aggregate.name.clone(),
                nodes,
            });
        }

        let mut labels = Vec::with_capacity(definition.labels.len());
        for label in &definition.labels {
            let resolve = |names: &[String]| -> Result<Vec<NodeRef>, GraphBuilderError> {
                names
                    .iter()
                    .map(|name| {
                        resolved.get(&name.to_ascii_lowercase()).copied().ok_or_else(|| {
                            GraphBuilderError::UnknownLabelNode {
                                label: label.name.clone(),
                                node: name.clone(),
                            }
                        })
                    })
                    .collect()
            };
            labels.push(Label {
                name: label.name.clone(),
                category: label.category.clone(),
                required_nodes: resolve(&label.required_nodes)?,
                included_nodes: resolve(&label.included_nodes)?,
            });
        }

        Graph::new(groups, aggregates, labels)
            .map_err(|e| GraphBuilderError::Encoding(e.to_string()))
    }

    /// Check that every dependency exists, points to the same or an earlier
    /// group, and that the relation over all nodes is acyclic.
    fn validate_dependencies(
        &self,
        definition: &GraphDefinition,
        declared: &HashMap<String, (usize, usize)>,
    ) -> Result<(), GraphBuilderError> {
        let mut dag: DiGraph<(), ()> = DiGraph::new();
        let mut indices: HashMap<(usize, usize), NodeIndex> = HashMap::new();
        for &position in declared.values() {
            indices.insert(position, dag.add_node(()));
        }

        for (group_idx, group) in definition.groups.iter().enumerate() {
            for (node_idx, node) in group.nodes.iter().enumerate() {
                for dep_name in dependency_names(node) {
                    let dep_position = declared
                        .get(&dep_name.to_ascii_lowercase())
                        .copied()
                        .ok_or_else(|| {
                            GraphBuilderError::UnknownDependency(dep_name.clone())
                        })?;
                    if dep_position.0 > group_idx {
                        return Err(GraphBuilderError::ForwardGroupDependency {
                            dependent: node.name.clone(),
                            dependency: dep_name.clone(),
                        });
                    }
                    dag.add_edge(indices[&dep_position], indices[&(group_idx, node_idx)], ());
                }
            }
        }

        toposort(&dag, None).map_err(|_| GraphBuilderError::CycleDetected)?;
        Ok(())
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn dependency_names(node: &NodeDefinition) -> impl Iterator<Item = &String> {
    node.input_dependencies
        .iter()
        .chain(node.order_dependencies.iter())
}

/// Topological order of one group's nodes, stable with respect to
/// declaration order: each pass emits the first declared nodes whose
/// same-group dependencies have already been emitted.
fn stable_group_order(
    group_idx: usize,
    nodes: &[NodeDefinition],
    declared: &HashMap<String, (usize, usize)>,
) -> Result<Vec<usize>, GraphBuilderError> {
    let same_group_deps: Vec<Vec<usize>> = nodes
        .iter()
        .map(|node| {
            dependency_names(node)
                .filter_map(|name| declared.get(&name.to_ascii_lowercase()))
                .filter(|(dep_group, _)| *dep_group == group_idx)
                .map(|(_, dep_idx)| *dep_idx)
                .collect()
        })
        .collect();

    let mut emitted = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    while order.len() < nodes.len() {
        let mut progressed = false;
        for node_idx in 0..nodes.len() {
            if emitted[node_idx] {
                continue;
            }
            if same_group_deps[node_idx].iter().all(|&dep| emitted[dep]) {
                emitted[node_idx] = true;
                order.push(node_idx);
                progressed = true;
            }
        }
        if !progressed {
            return Err(GraphBuilderError::CycleDetected);
        }
    }
    Ok(order)
}

fn build_node(
    definition: &NodeDefinition,
    resolved: &HashMap<String, NodeRef>,
) -> Result<Node, GraphBuilderError> {
    let resolve = |name: &String| -> Result<NodeRef, GraphBuilderError> {
        resolved
            .get(&name.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| GraphBuilderError::UnknownDependency(name.clone()))
    };

    let mut input_dependencies = Vec::with_capacity(definition.input_dependencies.len());
    for name in &definition.input_dependencies {
        let node_ref = resolve(name)?;
        if !input_dependencies.contains(&node_ref) {
            input_dependencies.push(node_ref);
        }
    }

    let mut order_dependencies = Vec::with_capacity(definition.order_dependencies.len());
    for name in &definition.order_dependencies {
        let node_ref = resolve(name)?;
        if !order_dependencies.contains(&node_ref) {
            order_dependencies.push(node_ref);
        }
    }
    for node_ref in &input_dependencies {
        if !order_dependencies.contains(node_ref) {
            order_dependencies.push(*node_ref);
        }
    }

    Ok(Node {
        name: definition.name.clone(),
        input_dependencies,
        order_dependencies,
        priority: definition.priority,
        allow_retry: definition.allow_retry,
        run_early: definition.run_early,
        warnings: definition.warnings,
    })
}
