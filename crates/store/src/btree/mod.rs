//! Copy-on-write B-tree over [`Record`] keys.
//!
//! Every index is one tree. Keys are records whose last field is the row
//! address, so keys are unique within a tree even for non-unique indexes.
//!
//! ## Structure
//!
//! - `node.rs`: nodes, node references and the node codec
//! - `iter.rs`: detached range iterator with reseek
//! - `cache.rs`: clock cache of decoded index-file nodes
//!
//! Tree algorithms never mutate a node in place. They read nodes through a
//! [`NodeSource`] and hand modified copies to a [`NodeStore`], which decides
//! where the copy lives: in a transaction's arena (see `overlay`), as a new
//! in-memory node at commit ([`PathCopy`]), or in the index file at
//! checkpoint.
//!
//! A node whose encoding grows past the store's `max_node_size` splits in
//! half. Removing keys never merges or rebalances nodes; an emptied leaf stays
//! in place until its tree is rebuilt.

pub mod cache;
pub mod iter;
pub mod node;

use std::sync::Arc;

pub use cache::NodeCache;
pub use iter::BtreeIter;
pub use node::{Node, NodeKind, NodeRef, SlotId};

use crate::{
    btree::node::MAX_KEYS,
    error::{Result, corrupted},
    record::{Record, RecordBuf},
    storage::{Adr, NULL_ADR, Storage, read_blob},
};

/// Read access to nodes.
pub trait NodeSource {
    /// Resolves a reference to its node.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the node cannot be read or decoded, or
    /// the reference is not valid for this source.
    fn node(&self, node_ref: &NodeRef) -> Result<Arc<Node>>;

    /// Changes whenever a tree visible through this source changes.
    fn version(&self) -> u64 {
        0
    }
}

/// Write access to nodes.
pub trait NodeStore: NodeSource {
    /// Encoded size above which nodes split.
    fn max_node_size(&self) -> usize;

    /// Adds a new node and returns its reference.
    fn alloc(&mut self, node: Node) -> NodeRef;

    /// Replaces the node behind `original`.
    ///
    /// Returns the reference the parent must now hold, or `None` when
    /// `original` itself resolves to the replacement from now on.
    fn update(&mut self, original: &NodeRef, node: Node) -> Option<NodeRef>;
}

impl<T: NodeSource + ?Sized> NodeSource for &T {
    fn node(&self, node_ref: &NodeRef) -> Result<Arc<Node>> {
        (**self).node(node_ref)
    }

    fn version(&self) -> u64 {
        (**self).version()
    }
}

impl<T: NodeSource + ?Sized> NodeSource for &mut T {
    fn node(&self, node_ref: &NodeRef) -> Result<Arc<Node>> {
        (**self).node(node_ref)
    }

    fn version(&self) -> u64 {
        (**self).version()
    }
}

impl<T: NodeStore + ?Sized> NodeStore for &mut T {
    fn max_node_size(&self) -> usize {
        (**self).max_node_size()
    }

    fn alloc(&mut self, node: Node) -> NodeRef {
        (**self).alloc(node)
    }

    fn update(&mut self, original: &NodeRef, node: Node) -> Option<NodeRef> {
        (**self).update(original, node)
    }
}

/// Nodes every transaction can see: the index file (through a cache) and
/// committed in-memory nodes.
pub struct SharedNodes {
    storage: Arc<dyn Storage>,
    cache: NodeCache,
}

impl SharedNodes {
    /// Wraps the index storage.
    pub fn new(storage: Arc<dyn Storage>, cache_size: usize) -> Self {
        Self { storage, cache: NodeCache::new(cache_size) }
    }

    /// The index storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The decoded-node cache.
    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Reads and caches the node at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the bytes at `adr` are not a node.
    pub fn read(&self, adr: Adr) -> Result<Arc<Node>> {
        if adr == NULL_ADR {
            return Err(corrupted("read of the null node address"));
        }
        if let Some(node) = self.cache.get(adr) {
            return Ok(node);
        }
        let bytes = read_blob(self.storage.as_ref(), adr)?;
        let node = Arc::new(Node::decode(&bytes).map_err(|e| match e {
            crate::Error::Corrupted { reason } => corrupted(format!("node {adr}: {reason}")),
            other => other,
        })?);
        self.cache.insert(adr, Arc::clone(&node));
        Ok(node)
    }
}

impl NodeSource for SharedNodes {
    fn node(&self, node_ref: &NodeRef) -> Result<Arc<Node>> {
        match node_ref {
            NodeRef::Stored(adr) => self.read(*adr),
            NodeRef::Memory(node) => Ok(Arc::clone(node)),
            NodeRef::Transient(slot) => Err(corrupted(format!(
                "transient node of transaction {} outside its transaction",
                slot.generation
            ))),
        }
    }
}

impl std::fmt::Debug for SharedNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedNodes").field("cache", &self.cache).finish()
    }
}

/// Store that copies each modified node into a fresh in-memory node.
///
/// Used when applying a committed transaction's writes to the latest state.
pub struct PathCopy<'a> {
    nodes: &'a SharedNodes,
    max_node_size: usize,
}

impl<'a> PathCopy<'a> {
    /// Creates a path copier over the shared nodes.
    pub fn new(nodes: &'a SharedNodes, max_node_size: usize) -> Self {
        Self { nodes, max_node_size }
    }
}

impl NodeSource for PathCopy<'_> {
    fn node(&self, node_ref: &NodeRef) -> Result<Arc<Node>> {
        self.nodes.node(node_ref)
    }
}

impl NodeStore for PathCopy<'_> {
    fn max_node_size(&self) -> usize {
        self.max_node_size
    }

    fn alloc(&mut self, node: Node) -> NodeRef {
        NodeRef::Memory(Arc::new(node))
    }

    fn update(&mut self, _original: &NodeRef, node: Node) -> Option<NodeRef> {
        Some(NodeRef::Memory(Arc::new(node)))
    }
}

/// Result of modifying a subtree.
enum Change {
    /// The parent keeps its reference.
    Unchanged,
    /// The parent must point at a new reference.
    Replaced(NodeRef),
    /// The subtree split; the parent must hold both halves.
    Split { left: NodeRef, separator: RecordBuf, right: NodeRef },
}

/// A B-tree rooted at `root`, accessed through `store`.
pub struct Btree<S> {
    root: NodeRef,
    store: S,
    splits: u64,
}

impl<S: NodeSource> Btree<S> {
    /// Wraps an existing root.
    pub fn new(root: NodeRef, store: S) -> Self {
        Self { root, store, splits: 0 }
    }

    /// Current root reference.
    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Consumes the tree, returning its root.
    pub fn into_root(self) -> NodeRef {
        self.root
    }

    /// Number of node splits performed through this handle.
    pub fn split_count(&self) -> u64 {
        self.splits
    }

    /// True when the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty_tree()
    }

    /// True when `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn contains(&self, key: &RecordBuf) -> Result<bool> {
        Ok(self.first_with_prefix(key)?.is_some_and(|found| found == *key))
    }

    /// First key whose leading fields equal `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn first_with_prefix(&self, prefix: &RecordBuf) -> Result<Option<RecordBuf>> {
        let mut iter = BtreeIter::new(Some(prefix.clone()), Some(prefix.clone()));
        iter.next(&self.store, &self.root)
    }

    /// Tree height; 0 for the empty tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn depth(&self) -> Result<u32> {
        if self.root.is_empty_tree() {
            return Ok(0);
        }
        let mut depth = 1;
        let mut node = self.store.node(&self.root)?;
        while !node.is_leaf() {
            node = self.store.node(&node.children[0])?;
            depth += 1;
        }
        Ok(depth)
    }

    /// Every key in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn keys(&self) -> Result<Vec<RecordBuf>> {
        let mut iter = BtreeIter::all();
        let mut out = Vec::new();
        while let Some(key) = iter.next(&self.store, &self.root)? {
            out.push(key);
        }
        Ok(out)
    }
}

impl<S: NodeStore> Btree<S> {
    /// Adds `key`. When `unique` is set, a key that agrees with an existing
    /// key on every field but the last (the row address) is a duplicate.
    ///
    /// Returns `false`, leaving the tree unchanged, for a duplicate.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn add(&mut self, key: RecordBuf, unique: bool) -> Result<bool> {
        if unique && key.size() > 1 {
            let prefix = key.truncated(key.size() - 1);
            if self.first_with_prefix(&prefix)?.is_some() {
                return Ok(false);
            }
        }
        if self.root.is_empty_tree() {
            self.root = self.store.alloc(Node::leaf(vec![key]));
            return Ok(true);
        }
        let root = self.root.clone();
        let Some(change) = self.add_in(&root, key)? else {
            return Ok(false);
        };
        self.apply_root(change);
        Ok(true)
    }

    /// Removes `key`. Returns `false` when it was absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn remove(&mut self, key: &RecordBuf) -> Result<bool> {
        if self.root.is_empty_tree() {
            return Ok(false);
        }
        let root = self.root.clone();
        let Some(change) = self.remove_in(&root, key)? else {
            return Ok(false);
        };
        self.apply_root(change);
        Ok(true)
    }

    fn apply_root(&mut self, change: Change) {
        match change {
            Change::Unchanged => {},
            Change::Replaced(root) => self.root = root,
            Change::Split { left, separator, right } => {
                let root = Node::tree(vec![RecordBuf::empty(), separator], vec![left, right]);
                self.root = self.store.alloc(root);
            },
        }
    }

    /// Inserts below `node_ref`; `None` when the key already exists.
    fn add_in(&mut self, node_ref: &NodeRef, key: RecordBuf) -> Result<Option<Change>> {
        let node = self.store.node(node_ref)?;
        let mut copy = Node::clone(&node);
        if node.is_leaf() {
            match node.keys.binary_search(&key) {
                Ok(_) => return Ok(None),
                Err(pos) => copy.keys.insert(pos, key),
            }
            return Ok(Some(self.finish(node_ref, copy)));
        }
        let idx = node.child_for(&|sep| *sep <= key);
        match self.add_in(&node.children[idx], key)? {
            None => Ok(None),
            Some(Change::Unchanged) => Ok(Some(Change::Unchanged)),
            Some(Change::Replaced(child)) => {
                copy.children[idx] = child;
                Ok(Some(self.finish(node_ref, copy)))
            },
            Some(Change::Split { left, separator, right }) => {
                copy.children[idx] = left;
                copy.keys.insert(idx + 1, separator);
                copy.children.insert(idx + 1, right);
                Ok(Some(self.finish(node_ref, copy)))
            },
        }
    }

    /// Removes below `node_ref`; `None` when the key is absent.
    fn remove_in(&mut self, node_ref: &NodeRef, key: &RecordBuf) -> Result<Option<Change>> {
        let node = self.store.node(node_ref)?;
        if node.is_leaf() {
            let Ok(pos) = node.keys.binary_search(key) else {
                return Ok(None);
            };
            let mut copy = Node::clone(&node);
            copy.keys.remove(pos);
            return Ok(Some(self.replace(node_ref, copy)));
        }
        let idx = node.child_for(&|sep| sep <= key);
        match self.remove_in(&node.children[idx], key)? {
            Some(Change::Replaced(child)) => {
                let mut copy = Node::clone(&node);
                copy.children[idx] = child;
                Ok(Some(self.replace(node_ref, copy)))
            },
            other => Ok(other),
        }
    }

    /// Stores a modified node, splitting it when oversized.
    fn finish(&mut self, node_ref: &NodeRef, mut node: Node) -> Change {
        let fits = node.encoded_size() <= self.store.max_node_size() && node.keys.len() <= MAX_KEYS;
        if node.keys.len() < 2 || fits {
            return self.replace(node_ref, node);
        }
        let (separator, right) = node.split();
        self.splits += 1;
        let right = self.store.alloc(right);
        let left = self.store.update(node_ref, node).unwrap_or_else(|| node_ref.clone());
        Change::Split { left, separator, right }
    }

    fn replace(&mut self, node_ref: &NodeRef, node: Node) -> Change {
        match self.store.update(node_ref, node) {
            Some(new_ref) => Change::Replaced(new_ref),
            None => Change::Unchanged,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        record::RecordBuilder,
        storage::{HeapStorage, INDEX_MAGIC},
    };

    pub(crate) fn key(n: u32) -> RecordBuf {
        RecordBuilder::new().field(n.to_be_bytes()).field(n.to_le_bytes()).build()
    }

    pub(crate) fn shared() -> SharedNodes {
        SharedNodes::new(Arc::new(HeapStorage::new(INDEX_MAGIC, 1 << 20).unwrap()), 64)
    }

    fn value(k: &RecordBuf) -> u32 {
        u32::from_be_bytes(k.get(0).try_into().unwrap())
    }

    #[test]
    fn test_add_and_contains() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 256));
        assert!(tree.is_empty());
        for n in [5u32, 1, 9, 3] {
            assert!(tree.add(key(n), false).unwrap());
        }
        assert!(tree.contains(&key(9)).unwrap());
        assert!(!tree.contains(&key(4)).unwrap());
        assert!(!tree.add(key(5), false).unwrap(), "exact duplicate rejected");
    }

    #[test]
    fn test_splits_keep_order() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 256));
        let mut expected = BTreeSet::new();
        for i in 0..2000u32 {
            let n = i.wrapping_mul(2_654_435_761) % 100_000;
            tree.add(key(n), false).unwrap();
            expected.insert(n);
        }
        assert!(tree.split_count() > 0);
        assert!(tree.depth().unwrap() >= 2);
        let keys: Vec<u32> = tree.keys().unwrap().iter().map(value).collect();
        assert_eq!(keys, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_unique_prefix_duplicate() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 256));
        let a = RecordBuilder::new().field(b"alice").field(1u32.to_be_bytes()).build();
        let b = RecordBuilder::new().field(b"alice").field(2u32.to_be_bytes()).build();
        assert!(tree.add(a, true).unwrap());
        assert!(!tree.add(b.clone(), true).unwrap());
        assert!(tree.add(b, false).unwrap(), "non-unique index accepts the same prefix");
    }

    #[test]
    fn test_remove_without_rebalance() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 256));
        for n in 0..500 {
            tree.add(key(n), false).unwrap();
        }
        let depth = tree.depth().unwrap();
        for n in 0..490 {
            assert!(tree.remove(&key(n)).unwrap());
        }
        assert!(!tree.remove(&key(3)).unwrap());
        assert_eq!(tree.depth().unwrap(), depth, "no merging on delete");
        let keys: Vec<u32> = tree.keys().unwrap().iter().map(value).collect();
        assert_eq!(keys, (490..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_copy_on_write_preserves_old_root() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 256));
        for n in 0..300 {
            tree.add(key(n), false).unwrap();
        }
        let old_root = tree.root().clone();
        for n in 300..600 {
            tree.add(key(n), false).unwrap();
        }
        tree.remove(&key(0)).unwrap();
        let old = Btree::new(old_root, &nodes);
        let keys: Vec<u32> = old.keys().unwrap().iter().map(value).collect();
        assert_eq!(keys, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_range_iteration_with_prefix_upper_bound() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 200));
        for group in 0..20u32 {
            for n in 0..10u32 {
                let k =
                    RecordBuilder::new().field(group.to_be_bytes()).field(n.to_be_bytes()).build();
                tree.add(k, false).unwrap();
            }
        }
        let from = RecordBuilder::new().field(5u32.to_be_bytes()).build();
        let to = RecordBuilder::new().field(7u32.to_be_bytes()).build();
        let mut iter = BtreeIter::new(Some(from), Some(to));
        let mut count = 0;
        while let Some(k) = iter.next(&nodes, tree.root()).unwrap() {
            let group = u32::from_be_bytes(k.get(0).try_into().unwrap());
            assert!((5..=7).contains(&group));
            count += 1;
        }
        assert_eq!(count, 30, "upper bound includes every key with prefix 7");
        assert!(iter.is_eof());

        let mut back = Vec::new();
        let upper = RecordBuilder::new().field(1u32.to_be_bytes()).build();
        let mut iter = BtreeIter::new(None, Some(upper));
        while let Some(k) = iter.prev(&nodes, tree.root()).unwrap() {
            back.push(k);
        }
        assert_eq!(back.len(), 20);
        assert!(back.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_direction_switch() {
        let nodes = shared();
        let mut tree = Btree::new(NodeRef::EMPTY, PathCopy::new(&nodes, 200));
        for n in 0..100 {
            tree.add(key(n), false).unwrap();
        }
        let root = tree.root().clone();
        let mut iter = BtreeIter::all();
        for expected in 0..50 {
            assert_eq!(value(&iter.next(&nodes, &root).unwrap().unwrap()), expected);
        }
        assert_eq!(value(&iter.prev(&nodes, &root).unwrap().unwrap()), 48);
        assert_eq!(value(&iter.next(&nodes, &root).unwrap().unwrap()), 49);
    }

    #[test]
    fn test_empty_tree_iteration() {
        let nodes = shared();
        let mut iter = BtreeIter::all();
        assert!(iter.next(&nodes, &NodeRef::EMPTY).unwrap().is_none());
        assert!(iter.prev(&nodes, &NodeRef::EMPTY).unwrap().is_none());
    }
}
