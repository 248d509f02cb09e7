//! Graph caching.
//!
//! Graphs are immutable and content-addressed, so a cached graph can never
//! go stale; the cache exists only to bound memory. It wraps any backing
//! [`GraphStore`] and keeps the most recently used graphs resident,
//! evicting the least recently used one when full.

use gantry_core::graph::Graph;
use gantry_core::ids::GraphId;
use gantry_core::ports::GraphStore;
use gantry_core::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Configuration for the graph cache.
#[derive(Debug, Clone)]
pub struct GraphCacheConfig {
    /// Maximum number of graphs kept resident.
    pub capacity: usize,
}

impl Default for GraphCacheConfig {
    fn default() -> Self {
        Self { capacity: 128 }
    }
}

impl GraphCacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Bounded LRU cache in front of a graph store. Constructed once and shared
/// by everything that resolves graphs.
pub struct GraphCache {
    store: Arc<dyn GraphStore>,
    config: GraphCacheConfig,
    inner: Mutex<CacheInner>,
}

impl GraphCache {
    pub fn new(store: Arc<dyn GraphStore>, config: GraphCacheConfig) -> Self {
        Self {
            store,
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
            }),
        }
    }
}

#[async_trait]
impl GraphStore for GraphCache {
    async fn add(&self, graph: Graph) -> Result<GraphId> {
        self.store.add(graph).await
    }

    async fn get(&self, id: &GraphId) -> Result<Option<Arc<Graph>>> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(graph) = inner.touch(id) {
                return Ok(Some(graph));
            }
        }

        // The lock is released during the fetch; two concurrent misses for
        // the same hash insert the same immutable value.
        let graph = match self.store.get(id).await? {
            Some(graph) => graph,
            None => return Ok(None),
        };

        let mut inner = self.inner.lock().await;
        inner.insert(*id, graph.clone(), self.config.capacity);
        Ok(Some(graph))
    }
}

struct CacheInner {
    entries: HashMap<GraphId, Arc<Graph>>,
    recency: VecDeque<GraphId>,
}

impl CacheInner {
    fn touch(&mut self, id: &GraphId) -> Option<Arc<Graph>> {
        let graph = self.entries.get(id)?.clone();
        if let Some(pos) = self.recency.iter().position(|entry| entry == id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(*id);
        Some(graph)
    }

    fn insert(&mut self, id: GraphId, graph: Arc<Graph>, capacity: usize) {
        if self.entries.insert(id, graph).is_none() {
            self.recency.push_back(id);
        } else if let Some(pos) = self.recency.iter().position(|entry| *entry == id) {
            self.recency.remove(pos);
            self.recency.push_back(id);
        }
        while self.entries.len() > capacity {
            match self.recency.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    debug!(graph = %oldest, "evicted graph from cache");
                }
                None => break,
            }
        }
    }
}
