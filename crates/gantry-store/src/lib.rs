//! Gantry Store
//!
//! Storage adapters implementing the gantry-core ports.

pub mod memory;

pub use memory::{MemoryGraphStore, MemoryJobStore};
