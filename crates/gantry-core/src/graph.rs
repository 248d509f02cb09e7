//! Build graph types.
//!
//! A graph is the immutable description of everything a job could execute:
//! nodes grouped by the agent type they run on, named aggregates expanding to
//! node sets, and labels used for reporting rollups. Graphs are addressed by
//! the content hash of their structure and are never mutated; growing a job's
//! graph means storing a new graph that extends the old one.

use crate::error::{Error, Result};
use crate::ids::GraphId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Name of the node every fresh job starts from.
pub const SETUP_NODE_NAME: &str = "Setup Build";

/// Positional reference to a node, valid only against the graph it was
/// resolved from. Dependencies always point backward: an earlier group, or an
/// earlier node in the same group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct NodeRef {
    pub group_idx: usize,
    pub node_idx: usize,
}

impl NodeRef {
    pub fn new(group_idx: usize, node_idx: usize) -> Self {
        Self {
            group_idx,
            node_idx,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.group_idx, self.node_idx)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
    Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
}

impl Priority {
    /// Numeric weight used by the schedule priority formula.
    pub fn weight(&self) -> i32 {
        match self {
            Priority::Lowest => 1,
            Priority::BelowNormal => 2,
            Priority::Normal => 3,
            Priority::AboveNormal => 4,
            Priority::High => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub name: String,
    /// Nodes whose outputs this node consumes.
    pub input_dependencies: Vec<NodeRef>,
    /// Nodes that must finish before this node starts. Superset of
    /// `input_dependencies`; the extra entries are run-after-but-not-on edges.
    pub order_dependencies: Vec<NodeRef>,
    pub priority: Priority,
    pub allow_retry: bool,
    pub run_early: bool,
    /// When false, a warnings outcome reported for this node is recorded as
    /// a plain success.
    pub warnings: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_dependencies: Vec::new(),
            order_dependencies: Vec::new(),
            priority: Priority::Normal,
            allow_retry: true,
            run_early: false,
            warnings: true,
        }
    }
}

/// Nodes that run in the same execution environment. A batch executes a
/// contiguous slice of one group on a single agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeGroup {
    pub agent_type: String,
    pub nodes: Vec<Node>,
}

/// Named shortcut expanding to a set of nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Aggregate {
    pub name: String,
    pub nodes: Vec<NodeRef>,
}

/// Reporting rollup: the label is complete when its required nodes are, and
/// its outcome folds in the included nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Label {
    pub name: String,
    pub category: String,
    pub required_nodes: Vec<NodeRef>,
    pub included_nodes: Vec<NodeRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Graph {
    pub id: GraphId,
    pub groups: Vec<NodeGroup>,
    pub aggregates: Vec<Aggregate>,
    pub labels: Vec<Label>,
}

impl Graph {
    /// Assemble a graph and compute its content hash.
    pub fn new(
        groups: Vec<NodeGroup>,
        aggregates: Vec<Aggregate>,
        labels: Vec<Label>,
    ) -> Result<Self> {
        let id = content_id(&groups, &aggregates, &labels)?;
        Ok(Self {
            id,
            groups,
            aggregates,
            labels,
        })
    }

    /// The single-node graph a fresh job starts from. Its setup node is
    /// expected to append the real graph and update the job's reference.
    pub fn initial(agent_type: impl Into<String>) -> Result<Self> {
        Self::new(
            vec![NodeGroup {
                agent_type: agent_type.into(),
                nodes: vec![Node::new(SETUP_NODE_NAME)],
            }],
            Vec::new(),
            Vec::new(),
        )
    }

    pub fn group(&self, group_idx: usize) -> Option<&NodeGroup> {
        self.groups.get(group_idx)
    }

    pub fn node(&self, node_ref: NodeRef) -> Option<&Node> {
        self.groups
            .get(node_ref.group_idx)
            .and_then(|group| group.nodes.get(node_ref.node_idx))
    }

    /// Node lookup that surfaces a dangling reference as an error.
    pub fn try_node(&self, node_ref: NodeRef) -> Result<&Node> {
        self.node(node_ref).ok_or(Error::InvalidNodeRef {
            group_idx: node_ref.group_idx,
            node_idx: node_ref.node_idx,
        })
    }

    /// Case-insensitive node lookup by name.
    pub fn find_node(&self, name: &str) -> Option<NodeRef> {
        self.groups.iter().enumerate().find_map(|(group_idx, group)| {
            group
                .nodes
                .iter()
                .position(|node| node.name.eq_ignore_ascii_case(name))
                .map(|node_idx| NodeRef::new(group_idx, node_idx))
        })
    }

    /// Case-insensitive aggregate lookup by name.
    pub fn find_aggregate(&self, name: &str) -> Option<&Aggregate> {
        self.aggregates
            .iter()
            .find(|aggregate| aggregate.name.eq_ignore_ascii_case(name))
    }

    /// True if this graph is a structural extension of `older`: every group
    /// of the old graph is present at the same index with the same agent
    /// type, and its nodes form a positional name-stable prefix. Node refs
    /// resolved against the old graph then address the same nodes here.
    pub fn extends(&self, older: &Graph) -> bool {
        if self.groups.len() < older.groups.len() {
            return false;
        }
        self.groups.iter().zip(&older.groups).all(|(new, old)| {
            new.agent_type == old.agent_type
                && new.nodes.len() >= old.nodes.len()
                && new
                    .nodes
                    .iter()
                    .zip(&old.nodes)
                    .all(|(a, b)| a.name == b.name)
        })
    }
}

fn content_id(groups: &[NodeGroup], aggregates: &[Aggregate], labels: &[Label]) -> Result<GraphId> {
    #[derive(Serialize)]
    struct Content<'a> {
        groups: &'a [NodeGroup],
        aggregates: &'a [Aggregate],
        labels: &'a [Label],
    }

    let encoded = serde_json::to_vec(&Content {
        groups,
        aggregates,
        labels,
    })?;
    Ok(GraphId::from_bytes(Sha256::digest(&encoded).into()))
}
