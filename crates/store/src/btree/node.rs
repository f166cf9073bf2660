//! B-tree nodes, node references and the node codec.
//!
//! # Encoding
//!
//! ```text
//! [kind u8][record]
//! ```
//!
//! For a leaf the record's fields are the packed keys. For a tree node the
//! fields alternate key and child address (u32 LE): `k0 a0 k1 a1 ...`. The
//! first key of the leftmost tree node on each level is the empty record.

use std::sync::Arc;

use crate::{
    error::{Error, Result, corrupted},
    record::{BufRecord, MAX_FIELDS, Record, RecordBuf, RecordBuilder, packed_len},
    storage::{Adr, NULL_ADR},
};

const KIND_LEAF: u8 = 1;
const KIND_TREE: u8 = 2;

/// Most keys a node can hold: a tree node spends two record fields per key.
pub(crate) const MAX_KEYS: usize = MAX_FIELDS / 2;

/// Leaf or tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Holds keys only.
    Leaf,
    /// Holds separator keys and one child per key.
    Tree,
}

/// Handle to a transient node in a transaction's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    /// Index into the arena.
    pub slot: u32,
    /// Number of the transaction that owns the arena.
    pub generation: u64,
}

/// Reference from a parent (or a table's index root) to a node.
#[derive(Debug, Clone)]
pub enum NodeRef {
    /// Written to the index file. `Stored(NULL_ADR)` is the empty tree.
    Stored(Adr),
    /// Committed but not yet checkpointed.
    Memory(Arc<Node>),
    /// Private to one transaction.
    Transient(SlotId),
}

impl NodeRef {
    /// Reference to the empty tree.
    pub const EMPTY: NodeRef = NodeRef::Stored(NULL_ADR);

    /// True for the empty tree.
    pub fn is_empty_tree(&self) -> bool {
        matches!(self, NodeRef::Stored(NULL_ADR))
    }

    /// True when the node is in the index file.
    pub fn is_stored(&self) -> bool {
        matches!(self, NodeRef::Stored(_))
    }
}

/// A decoded B-tree node.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) keys: Vec<RecordBuf>,
    pub(crate) children: Vec<NodeRef>,
}

impl Node {
    /// Creates a leaf.
    pub fn leaf(keys: Vec<RecordBuf>) -> Self {
        Self { kind: NodeKind::Leaf, keys, children: Vec::new() }
    }

    /// Creates a tree node; `keys` and `children` pair up by position.
    pub fn tree(keys: Vec<RecordBuf>, children: Vec<NodeRef>) -> Self {
        debug_assert_eq!(keys.len(), children.len());
        Self { kind: NodeKind::Tree, keys, children }
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> &[RecordBuf] {
        &self.keys
    }

    /// Children, empty for leaves.
    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Index of the child whose range holds the partition point of `before`:
    /// the last child whose separator satisfies `before`, or the first child.
    ///
    /// The first separator is never consulted since a search only reaches a
    /// node when its position is at or after the node's lower bound.
    pub(crate) fn child_for(&self, before: &dyn Fn(&RecordBuf) -> bool) -> usize {
        if self.keys.len() <= 1 {
            return 0;
        }
        self.keys[1..].partition_point(|k| before(k))
    }

    /// Bytes [`Node::encode`] would produce.
    pub fn encoded_size(&self) -> usize {
        let keys: usize = self.keys.iter().map(RecordBuf::pack_size).sum();
        let (nfields, data) = match self.kind {
            NodeKind::Leaf => (self.keys.len(), keys),
            NodeKind::Tree => (self.keys.len() * 2, keys + 4 * self.children.len()),
        };
        1 + packed_len(nfields, data)
    }

    /// Moves the upper half into a new right sibling, returning the separator
    /// (the right sibling's first key) and the sibling.
    pub(crate) fn split(&mut self) -> (RecordBuf, Node) {
        let mid = self.keys.len() / 2;
        let keys = self.keys.split_off(mid);
        let children =
            if self.kind == NodeKind::Tree { self.children.split_off(mid) } else { Vec::new() };
        let separator = keys[0].clone();
        (separator, Node { kind: self.kind, keys, children })
    }

    /// Encodes the node. Every child must be stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if a child is not stored.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut fields = RecordBuilder::new();
        match self.kind {
            NodeKind::Leaf => {
                for key in &self.keys {
                    fields.add(key.as_bytes());
                }
            },
            NodeKind::Tree => {
                for (key, child) in self.keys.iter().zip(&self.children) {
                    let NodeRef::Stored(adr) = child else {
                        return Err(corrupted("encoding tree node with unstored child"));
                    };
                    fields.add(key.as_bytes());
                    fields.add(adr.to_le_bytes());
                }
            },
        }
        if fields.size() > MAX_FIELDS {
            return Err(Error::TooManyFields { fields: fields.size(), limit: MAX_FIELDS });
        }
        let mut out = Vec::with_capacity(self.encoded_size());
        out.push(match self.kind {
            NodeKind::Leaf => KIND_LEAF,
            NodeKind::Tree => KIND_TREE,
        });
        fields.pack(&mut out);
        Ok(out)
    }

    /// Decodes a node written by [`Node::encode`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&kind, body)) = bytes.split_first() else {
            return Err(corrupted("empty node"));
        };
        let record = BufRecord::new(body)?;
        if record.as_bytes().len() != body.len() {
            return Err(corrupted("trailing bytes after node"));
        }
        let key = |i: usize| RecordBuf::from_packed(record.field(i).to_vec());
        match kind {
            KIND_LEAF => {
                let keys = (0..record.size()).map(key).collect::<Result<Vec<_>>>()?;
                Ok(Node::leaf(keys))
            },
            KIND_TREE => {
                if record.size() % 2 != 0 || record.is_empty() {
                    return Err(corrupted(format!("tree node with {} fields", record.size())));
                }
                let n = record.size() / 2;
                let mut keys = Vec::with_capacity(n);
                let mut children = Vec::with_capacity(n);
                for i in 0..n {
                    keys.push(key(2 * i)?);
                    let adr: [u8; 4] = record
                        .field(2 * i + 1)
                        .try_into()
                        .map_err(|_| corrupted("child address is not 4 bytes"))?;
                    let adr = Adr::from_le_bytes(adr);
                    if adr == NULL_ADR {
                        return Err(corrupted("null child address"));
                    }
                    children.push(NodeRef::Stored(adr));
                }
                Ok(Node::tree(keys, children))
            },
            other => Err(corrupted(format!("invalid node kind {other}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(n: u32) -> RecordBuf {
        RecordBuilder::new().field(n.to_be_bytes()).build()
    }

    #[test]
    fn test_leaf_round_trip() {
        let node = Node::leaf((0..20).map(key).collect());
        let bytes = node.encode().unwrap();
        assert_eq!(bytes.len(), node.encoded_size());
        let back = Node::decode(&bytes).unwrap();
        assert!(back.is_leaf());
        assert_eq!(back.keys, node.keys);
    }

    #[test]
    fn test_tree_round_trip() {
        let node = Node::tree(
            vec![RecordBuf::empty(), key(10), key(20)],
            vec![NodeRef::Stored(5), NodeRef::Stored(6), NodeRef::Stored(7)],
        );
        let bytes = node.encode().unwrap();
        assert_eq!(bytes.len(), node.encoded_size());
        let back = Node::decode(&bytes).unwrap();
        assert_eq!(back.kind(), NodeKind::Tree);
        assert_eq!(back.keys, node.keys);
        let adrs: Vec<_> = back
            .children
            .iter()
            .map(|c| match c {
                NodeRef::Stored(adr) => *adr,
                _ => 0,
            })
            .collect();
        assert_eq!(adrs, vec![5, 6, 7]);
    }

    #[test]
    fn test_unstored_child_cannot_encode() {
        let child = NodeRef::Memory(Arc::new(Node::leaf(vec![])));
        let node = Node::tree(vec![RecordBuf::empty()], vec![child]);
        assert!(node.encode().is_err());
    }

    #[test]
    fn test_field_limit_is_an_error() {
        let full = Node::tree(
            (0..MAX_KEYS as u32).map(key).collect(),
            (1..=MAX_KEYS as u32).map(NodeRef::Stored).collect(),
        );
        assert!(full.encode().is_ok());

        let over = Node::tree(
            (0..=MAX_KEYS as u32).map(key).collect(),
            (1..=MAX_KEYS as u32 + 1).map(NodeRef::Stored).collect(),
        );
        let err = over.encode().unwrap_err();
        assert!(matches!(err, Error::TooManyFields { limit: MAX_FIELDS, .. }), "{err:?}");
    }

    #[test]
    fn test_child_for_uses_last_separator_at_or_before() {
        let node = Node::tree(
            vec![RecordBuf::empty(), key(10), key(20)],
            vec![NodeRef::Stored(5), NodeRef::Stored(6), NodeRef::Stored(7)],
        );
        let at = |k: u32| {
            let k = key(k);
            node.child_for(&|s: &RecordBuf| *s <= k)
        };
        assert_eq!(at(0), 0);
        assert_eq!(at(9), 0);
        assert_eq!(at(10), 1);
        assert_eq!(at(19), 1);
        assert_eq!(at(25), 2);
    }

    #[test]
    fn test_split_halves() {
        let mut node = Node::leaf((0..10).map(key).collect());
        let (sep, right) = node.split();
        assert_eq!(node.keys.len(), 5);
        assert_eq!(right.keys.len(), 5);
        assert_eq!(sep, key(5));
    }

    #[test]
    fn test_malformed_nodes() {
        assert!(Node::decode(&[]).is_err());
        assert!(Node::decode(&[9, 0]).is_err());
        // Tree node with an odd field count.
        let mut bytes = vec![KIND_TREE];
        RecordBuilder::new().field(b"x").pack(&mut bytes);
        assert!(Node::decode(&bytes).is_err());
        // Leaf whose field is not a record.
        let mut bytes = vec![KIND_LEAF];
        RecordBuilder::new().field([0x41u8]).pack(&mut bytes);
        assert!(Node::decode(&bytes).is_err());
    }
}
