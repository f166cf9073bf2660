//! Cache of decoded index nodes.
//!
//! Stored nodes never change, so entries never go stale and eviction never
//! loses data. Uses clock eviction (approximate LRU) for low overhead.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use super::node::Node;
use crate::storage::Adr;

/// Decoded-node cache keyed by index file address.
pub struct NodeCache {
    inner: Mutex<ClockState>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct ClockState {
    entries: HashMap<Adr, CacheEntry>,
    order: Vec<Adr>,
    hand: usize,
}

struct CacheEntry {
    node: Arc<Node>,
    /// Second-chance bit for the clock sweep.
    accessed: bool,
}

impl NodeCache {
    /// Creates a cache holding at most `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ClockState {
                entries: HashMap::with_capacity(capacity),
                order: Vec::with_capacity(capacity),
                hand: 0,
            }),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached node at `adr`.
    pub fn get(&self, adr: Adr) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&adr) {
            Some(entry) => {
                entry.accessed = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.node))
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Caches `node` under `adr`, evicting one entry when full.
    pub fn insert(&self, adr: Adr, node: Arc<Node>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&adr) {
            entry.accessed = true;
            return;
        }
        if inner.entries.len() >= self.capacity {
            inner.evict_one();
        }
        inner.order.push(adr);
        inner.entries.insert(adr, CacheEntry { node, accessed: false });
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.hand = 0;
    }

    /// Total lookups that found a node.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total lookups that missed.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl ClockState {
    fn evict_one(&mut self) {
        // Two sweeps always find a victim: the first clears every accessed bit.
        for _ in 0..self.order.len() * 2 {
            if self.hand >= self.order.len() {
                self.hand = 0;
            }
            let adr = self.order[self.hand];
            match self.entries.get_mut(&adr) {
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    self.hand += 1;
                },
                _ => {
                    self.entries.remove(&adr);
                    self.order.swap_remove(self.hand);
                    return;
                },
            }
        }
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
