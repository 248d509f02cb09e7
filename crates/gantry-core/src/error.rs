//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job update conflicted {attempts} times in a row")]
    TooManyConflicts { attempts: u32 },

    // Graph errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Graph {candidate} does not extend graph {current}")]
    GraphNotExtension { current: String, candidate: String },

    #[error("Node reference ({group_idx}, {node_idx}) is out of bounds")]
    InvalidNodeRef { group_idx: usize, node_idx: usize },

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    // Batch errors
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch {0} is not ready for assignment")]
    BatchNotReady(String),

    #[error("Batch {batch_id} is already leased to session {session_id}")]
    LeaseSessionConflict {
        batch_id: String,
        session_id: String,
    },

    // Step errors
    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step {0} has not finished")]
    StepNotFinished(String),

    // Retry errors
    #[error("Node {node} failed and does not allow retries")]
    RetryNotAllowed { node: String },

    #[error("Node {node} has already used its retry")]
    RetryLimitExceeded { node: String },

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
