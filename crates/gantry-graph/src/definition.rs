//! Declarative graph definitions.
//!
//! These types represent the authored form of a build graph: nodes grouped by
//! the agent type they run on, with dependencies, aggregates and labels
//! naming nodes by name. The builder resolves them into the positional,
//! content-hashed form the engine executes.

use gantry_core::graph::Priority;
use gantry_core::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GraphDefinition {
    pub groups: Vec<GroupDefinition>,
    #[serde(default)]
    pub aggregates: Vec<AggregateDefinition>,
    #[serde(default)]
    pub labels: Vec<LabelDefinition>,
}

impl GraphDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::InvalidGraph(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GroupDefinition {
    pub agent_type: String,
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    pub name: String,
    /// Names of nodes whose outputs this node consumes.
    #[serde(default)]
    pub input_dependencies: Vec<String>,
    /// Names of nodes to run after without consuming their outputs. Input
    /// dependencies are merged in during resolution.
    #[serde(default)]
    pub order_dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_allow_retry")]
    pub allow_retry: bool,
    #[serde(default)]
    pub run_early: bool,
    #[serde(default = "default_warnings")]
    pub warnings: bool,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_dependencies: Vec::new(),
            order_dependencies: Vec::new(),
            priority: Priority::Normal,
            allow_retry: default_allow_retry(),
            run_early: false,
            warnings: default_warnings(),
        }
    }
}

fn default_allow_retry() -> bool {
    true
}

fn default_warnings() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AggregateDefinition {
    pub name: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabelDefinition {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub required_nodes: Vec<String>,
    #[serde(default)]
    pub included_nodes: Vec<String>,
}
