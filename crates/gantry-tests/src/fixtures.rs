//! Graph fixtures shared across the integration tests.

use gantry_core::graph::Graph;
use gantry_graph::definition::{GroupDefinition, NodeDefinition};
use gantry_graph::{GraphBuilder, GraphDefinition};

/// A client build chain, an editor build and a rollup aggregate, authored
/// the way production graphs are.
const GAME_BUILD_YAML: &str = r#"
groups:
  - agent_type: linux
    nodes:
      - name: Setup Build
  - agent_type: win64
    nodes:
      - name: Compile Client
        input_dependencies: [Setup Build]
      - name: Cook Client
        input_dependencies: [Compile Client]
      - name: Publish Client
        input_dependencies: [Cook Client]
  - agent_type: win64
    nodes:
      - name: Compile Editor
        input_dependencies: [Setup Build]
aggregates:
  - name: Full Build
    nodes: [Publish Client, Compile Editor]
labels:
  - name: Client
    category: Game
    required_nodes: [Compile Client, Cook Client, Publish Client]
  - name: Editor
    category: Game
    required_nodes: [Compile Editor]
"#;

/// Factory for resolved graphs used by the integration tests.
pub struct GraphFixture;

impl GraphFixture {
    /// The single-node graph every fresh job starts from.
    pub fn initial() -> Graph {
        Graph::initial("linux").expect("initial graph builds")
    }

    /// The standard fixture graph: setup, a three-node client chain, an
    /// editor node and a `Full Build` aggregate covering both.
    pub fn game_build() -> Graph {
        let definition = GraphDefinition::from_yaml(GAME_BUILD_YAML).expect("fixture yaml parses");
        build(&definition)
    }

    /// [`game_build`](Self::game_build) with a verification group appended,
    /// so it extends the base graph.
    pub fn game_build_extended() -> Graph {
        let mut definition =
            GraphDefinition::from_yaml(GAME_BUILD_YAML).expect("fixture yaml parses");
        let mut verify = NodeDefinition::new("Verify Client");
        verify.input_dependencies = vec!["Publish Client".to_string()];
        definition.groups.push(GroupDefinition {
            agent_type: "linux".to_string(),
            nodes: vec![verify],
        });
        build(&definition)
    }
}

fn build(definition: &GraphDefinition) -> Graph {
    GraphBuilder::new()
        .build(definition)
        .expect("fixture graph builds")
}
