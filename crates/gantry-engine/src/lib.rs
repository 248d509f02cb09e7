//! Batch and step scheduling engine for Gantry.
//!
//! Turns an immutable [`gantry_core::graph::Graph`] and a mutable
//! [`gantry_core::job::Job`] into concrete work for agents: which steps run,
//! in which batches, in what order, and at what priority. All scheduling
//! decisions are pure functions over the job document; [`JobService`] wraps
//! them in an optimistic-concurrency write loop against the store ports.

pub mod dispatch;
pub mod labels;
pub mod lease;
pub mod readiness;
pub mod recompute;
pub mod service;
pub mod targets;

pub use labels::{LabelPhase, LabelState};
pub use service::{BatchUpdate, CreateJobParams, JobService, ServiceConfig, StepUpdate};
