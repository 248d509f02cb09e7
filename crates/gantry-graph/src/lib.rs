//! Gantry Graph
//!
//! Graph authoring and construction: declarative definitions, the builder
//! that resolves them into positional content-hashed graphs, and a bounded
//! cache for resolved graphs.

pub mod builder;
pub mod cache;
pub mod definition;

pub use builder::{GraphBuilder, GraphBuilderError};
pub use cache::{GraphCache, GraphCacheConfig};
pub use definition::GraphDefinition;
