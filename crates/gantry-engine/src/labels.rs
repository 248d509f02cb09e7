//! Label rollups.
//!
//! Labels summarize a set of nodes for reporting: a dashboard row turns
//! green when the label's required nodes finish cleanly. They have no
//! influence on scheduling.

use crate::readiness::latest_steps;
use gantry_core::graph::Graph;
use gantry_core::job::{Job, StepOutcome, StepState};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How far a label's required nodes have progressed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LabelPhase {
    /// None of the required nodes are scheduled in this job.
    #[default]
    Unspecified,
    Running,
    Complete,
}

/// Point-in-time rollup of one label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LabelState {
    pub name: String,
    pub category: String,
    pub phase: LabelPhase,
    pub outcome: StepOutcome,
}

/// Derive the current state of every label in the graph from the job's
/// latest step per node. Required nodes drive the phase; required and
/// included nodes together drive the outcome.
pub fn label_states(job: &Job, graph: &Graph) -> Vec<LabelState> {
    let latest = latest_steps(job, true);
    graph
        .labels
        .iter()
        .map(|label| {
            let required: Vec<_> = label
                .required_nodes
                .iter()
                .map(|node_ref| latest.get(node_ref))
                .collect();
            let any_scheduled = required.iter().any(Option::is_some);
            let all_finished = required
                .iter()
                .all(|info| info.is_some_and(|info| info.state.is_terminal()));

            let phase = if !any_scheduled {
                LabelPhase::Unspecified
            } else if all_finished {
                LabelPhase::Complete
            } else {
                LabelPhase::Running
            };

            let mut outcome = StepOutcome::Unspecified;
            if phase != LabelPhase::Unspecified {
                outcome = StepOutcome::Success;
                for node_ref in label.required_nodes.iter().chain(&label.included_nodes) {
                    let Some(info) = latest.get(node_ref) else {
                        continue;
                    };
                    if info.is_failed() || info.state == StepState::Skipped {
                        outcome = StepOutcome::Failure;
                        break;
                    }
                    if info.outcome == StepOutcome::Warnings {
                        outcome = StepOutcome::Warnings;
                    }
                }
            }

            LabelState {
                name: label.name.clone(),
                category: label.category.clone(),
                phase,
                outcome,
            }
        })
        .collect()
}
