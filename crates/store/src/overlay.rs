//! Transaction-private view of the B-trees.
//!
//! An update transaction never modifies shared nodes. Nodes it creates live in
//! an arena and are referenced as [`NodeRef::Transient`], tagged with the
//! transaction number. A changed shared node (stored or committed in-memory)
//! gets a redirect: from then on, resolving the original reference inside
//! this transaction yields the arena copy, so unchanged parents do not need
//! to be copied.
//!
//! Every change bumps the overlay version, which tells detached iterators to
//! reseek.

use std::{collections::HashMap, sync::Arc};

use crate::{
    btree::{Node, NodeRef, NodeSource, NodeStore, SharedNodes, SlotId},
    error::{Result, corrupted},
    storage::Adr,
};

/// Identity of a shared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NodeKey {
    Stored(Adr),
    Memory(usize),
}

impl NodeKey {
    fn of(node_ref: &NodeRef) -> Option<Self> {
        match node_ref {
            NodeRef::Stored(adr) => Some(Self::Stored(*adr)),
            NodeRef::Memory(node) => Some(Self::Memory(Arc::as_ptr(node) as usize)),
            NodeRef::Transient(_) => None,
        }
    }
}

/// Arena of transient nodes plus redirects for one transaction.
pub struct Overlay {
    shared: Arc<SharedNodes>,
    generation: u64,
    max_node_size: usize,
    arena: Vec<Arc<Node>>,
    redirects: HashMap<NodeKey, u32>,
    // Keeps redirected in-memory originals alive so their addresses stay unique.
    pinned: Vec<Arc<Node>>,
    version: u64,
}

impl Overlay {
    /// Creates an empty overlay for transaction `generation`.
    pub fn new(shared: Arc<SharedNodes>, generation: u64, max_node_size: usize) -> Self {
        Self {
            shared,
            generation,
            max_node_size,
            arena: Vec::new(),
            redirects: HashMap::new(),
            pinned: Vec::new(),
            version: 0,
        }
    }

    /// Number of transient nodes.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Number of redirected shared nodes.
    pub fn redirect_count(&self) -> usize {
        self.redirects.len()
    }

    /// Drops every transient node and redirect.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.redirects.clear();
        self.pinned.clear();
        self.version += 1;
    }

    fn slot(&self, id: SlotId) -> Result<&Arc<Node>> {
        if id.generation != self.generation {
            return Err(corrupted(format!(
                "transient node of transaction {} used by transaction {}",
                id.generation, self.generation
            )));
        }
        self.arena
            .get(id.slot as usize)
            .ok_or_else(|| corrupted(format!("transient slot {} out of range", id.slot)))
    }

    fn push(&mut self, node: Node) -> u32 {
        self.arena.push(Arc::new(node));
        (self.arena.len() - 1) as u32
    }
}

impl NodeSource for Overlay {
    fn node(&self, node_ref: &NodeRef) -> Result<Arc<Node>> {
        if let NodeRef::Transient(id) = node_ref {
            return self.slot(*id).cloned();
        }
        if let Some(slot) = NodeKey::of(node_ref).and_then(|key| self.redirects.get(&key)) {
            return Ok(Arc::clone(&self.arena[*slot as usize]));
        }
        self.shared.node(node_ref)
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl NodeStore for Overlay {
    fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    fn alloc(&mut self, node: Node) -> NodeRef {
        self.version += 1;
        let slot = self.push(node);
        NodeRef::Transient(SlotId { slot, generation: self.generation })
    }

    fn update(&mut self, original: &NodeRef, node: Node) -> Option<NodeRef> {
        self.version += 1;
        if let NodeRef::Transient(id) = original {
            if id.generation == self.generation {
                if let Some(entry) = self.arena.get_mut(id.slot as usize) {
                    *entry = Arc::new(node);
                    return None;
                }
            }
            tracing::error!(
                slot = id.slot,
                generation = id.generation,
                "Update of foreign transient node"
            );
            return Some(self.alloc(node));
        }
        let key = NodeKey::of(original)?;
        if let Some(slot) = self.redirects.get(&key) {
            self.arena[*slot as usize] = Arc::new(node);
            return None;
        }
        if let NodeRef::Memory(original) = original {
            self.pinned.push(Arc::clone(original));
        }
        let slot = self.push(node);
        self.redirects.insert(key, slot);
        None
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("generation", &self.generation)
            .field("arena", &self.arena.len())
            .field("redirects", &self.redirects.len())
            .field("version", &self.version)
            .finish()
    }
}
