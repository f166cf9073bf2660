//! Detached B-tree iterator with reseek on change.
//!
//! A [`BtreeIter`] does not borrow the tree. Each call receives the node
//! source and the current root, so the owning transaction can keep modifying
//! the tree between calls. The source reports a version number that changes
//! whenever a tree in it changes; when the version differs from the one the
//! iterator last saw, its node pointers may be stale and it reseeks by key:
//!
//! - forward: to the first key at or after the key that was next when the
//!   previous key was returned,
//! - reverse: to the last key before the current key.
//!
//! Each key that survives the change is returned exactly once; keys inserted
//! behind the cursor are not.

use std::sync::Arc;

use super::{NodeSource, node::Node, node::NodeRef};
use crate::{
    error::Result,
    record::{Record, RecordBuf},
};

/// Position of one key: the path of tree nodes and the leaf slot.
#[derive(Clone)]
struct Cursor {
    stack: Vec<(Arc<Node>, usize)>,
    leaf: Arc<Node>,
    idx: usize,
}

impl Cursor {
    fn key(&self) -> &RecordBuf {
        &self.leaf.keys[self.idx]
    }

    /// Descends to the leaf slot of the first key for which `before` is false.
    /// The slot may be one past the end of the leaf.
    fn descend(
        src: &dyn NodeSource,
        root: &NodeRef,
        before: &dyn Fn(&RecordBuf) -> bool,
    ) -> Result<Option<Cursor>> {
        if root.is_empty_tree() {
            return Ok(None);
        }
        let mut node = src.node(root)?;
        let mut stack = Vec::new();
        while !node.is_leaf() {
            let idx = node.child_for(before);
            let child = src.node(&node.children[idx])?;
            stack.push((node, idx));
            node = child;
        }
        let idx = node.keys.partition_point(|k| before(k));
        Ok(Some(Cursor { stack, leaf: node, idx }))
    }

    /// Moves to the first key of the next non-empty leaf.
    fn next_leaf(&mut self, src: &dyn NodeSource) -> Result<bool> {
        loop {
            let Some(depth) = self.stack.iter().rposition(|(n, i)| i + 1 < n.children.len())
            else {
                return Ok(false);
            };
            self.stack.truncate(depth + 1);
            let (parent, idx) = &mut self.stack[depth];
            *idx += 1;
            let mut node = src.node(&parent.children[*idx])?;
            while !node.is_leaf() {
                let child = src.node(&node.children[0])?;
                self.stack.push((node, 0));
                node = child;
            }
            self.leaf = node;
            self.idx = 0;
            if !self.leaf.keys.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Moves to the last key of the previous non-empty leaf.
    fn prev_leaf(&mut self, src: &dyn NodeSource) -> Result<bool> {
        loop {
            let Some(depth) = self.stack.iter().rposition(|(_, i)| *i > 0) else {
                return Ok(false);
            };
            self.stack.truncate(depth + 1);
            let (parent, idx) = &mut self.stack[depth];
            *idx -= 1;
            let mut node = src.node(&parent.children[*idx])?;
            while !node.is_leaf() {
                let last = node.children.len() - 1;
                let child = src.node(&node.children[last])?;
                self.stack.push((node, last));
                node = child;
            }
            self.leaf = node;
            if let Some(last) = self.leaf.keys.len().checked_sub(1) {
                self.idx = last;
                return Ok(true);
            }
        }
    }

    /// Normalizes a one-past-the-end slot onto the next key.
    fn settle_forward(&mut self, src: &dyn NodeSource) -> Result<bool> {
        if self.idx < self.leaf.keys.len() {
            return Ok(true);
        }
        self.next_leaf(src)
    }

    fn advance(&mut self, src: &dyn NodeSource) -> Result<bool> {
        self.idx += 1;
        self.settle_forward(src)
    }

    fn retreat(&mut self, src: &dyn NodeSource) -> Result<bool> {
        if self.idx > 0 {
            self.idx -= 1;
            return Ok(true);
        }
        self.prev_leaf(src)
    }

    /// First key for which `before` is false.
    fn seek_first(
        src: &dyn NodeSource,
        root: &NodeRef,
        before: &dyn Fn(&RecordBuf) -> bool,
    ) -> Result<Option<Cursor>> {
        let Some(mut cursor) = Self::descend(src, root, before)? else {
            return Ok(None);
        };
        Ok(cursor.settle_forward(src)?.then_some(cursor))
    }

    /// Last key for which `before` is true.
    fn seek_last(
        src: &dyn NodeSource,
        root: &NodeRef,
        before: &dyn Fn(&RecordBuf) -> bool,
    ) -> Result<Option<Cursor>> {
        let Some(mut cursor) = Self::descend(src, root, before)? else {
            return Ok(None);
        };
        Ok(cursor.retreat(src)?.then_some(cursor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Next,
    Prev,
}

enum State {
    /// Nothing returned yet, or rewound.
    Rewound,
    /// Positioned on `cursor`, the key returned last.
    At { cursor: Cursor, dir: Dir, version: u64, lookahead: Option<RecordBuf> },
    /// Ran off an end.
    Eof,
}

/// Range iterator over a B-tree that tolerates modification between steps.
pub struct BtreeIter {
    from: Option<RecordBuf>,
    to: Option<RecordBuf>,
    state: State,
}

impl BtreeIter {
    /// Iterates keys `k` with `from <= k` and `k` within `to` by prefix:
    /// every key whose leading fields equal `to` is included.
    pub fn new(from: Option<RecordBuf>, to: Option<RecordBuf>) -> Self {
        Self { from, to, state: State::Rewound }
    }

    /// Iterates every key.
    pub fn all() -> Self {
        Self::new(None, None)
    }

    /// Lower bound.
    pub fn from(&self) -> Option<&RecordBuf> {
        self.from.as_ref()
    }

    /// Upper bound (prefix-inclusive).
    pub fn to(&self) -> Option<&RecordBuf> {
        self.to.as_ref()
    }

    /// Restarts from the appropriate end on the next call.
    pub fn rewind(&mut self) {
        self.state = State::Rewound;
    }

    /// True when the last step ran off an end.
    pub fn is_eof(&self) -> bool {
        matches!(self.state, State::Eof)
    }

    /// The key most recently returned.
    pub fn current(&self) -> Option<&RecordBuf> {
        match &self.state {
            State::At { cursor, .. } => Some(cursor.key()),
            _ => None,
        }
    }

    fn in_range(&self, key: &RecordBuf) -> bool {
        self.from.as_ref().is_none_or(|from| key >= from)
            && self.to.as_ref().is_none_or(|to| key.prefix_cmp(to).is_le())
    }

    /// Returns the next key in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn next(&mut self, src: &dyn NodeSource, root: &NodeRef) -> Result<Option<RecordBuf>> {
        let version = src.version();
        let found = match std::mem::replace(&mut self.state, State::Eof) {
            State::Eof => None,
            State::Rewound => match &self.from {
                Some(from) => Cursor::seek_first(src, root, &|k| k < from)?,
                None => Cursor::seek_first(src, root, &|_| false)?,
            },
            State::At { mut cursor, dir: Dir::Next, version: seen, lookahead } => {
                if seen == version {
                    cursor.advance(src)?.then_some(cursor)
                } else {
                    match lookahead {
                        Some(next) => Cursor::seek_first(src, root, &|k| *k < next)?,
                        None => None,
                    }
                }
            },
            State::At { cursor, dir: Dir::Prev, .. } => {
                let cur = cursor.key().clone();
                Cursor::seek_first(src, root, &|k| *k <= cur)?
            },
        };
        let Some(cursor) = found else {
            return Ok(None);
        };
        if !self.in_range(cursor.key()) {
            return Ok(None);
        }
        let key = cursor.key().clone();
        let mut ahead = cursor.clone();
        let lookahead = if ahead.advance(src)? { Some(ahead.key().clone()) } else { None };
        self.state = State::At { cursor, dir: Dir::Next, version, lookahead };
        Ok(Some(key))
    }

    /// Returns the next key in descending order.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be loaded.
    pub fn prev(&mut self, src: &dyn NodeSource, root: &NodeRef) -> Result<Option<RecordBuf>> {
        let version = src.version();
        let found = match std::mem::replace(&mut self.state, State::Eof) {
            State::Eof | State::Rewound => match &self.to {
                Some(to) => Cursor::seek_last(src, root, &|k| k.prefix_cmp(to).is_le())?,
                None => Cursor::seek_last(src, root, &|_| true)?,
            },
            State::At { mut cursor, dir: Dir::Prev, version: seen, .. } if seen == version => {
                cursor.retreat(src)?.then_some(cursor)
            },
            State::At { cursor, .. } => {
                let cur = cursor.key().clone();
                Cursor::seek_last(src, root, &|k| *k < cur)?
            },
        };
        let Some(cursor) = found else {
            return Ok(None);
        };
        if !self.in_range(cursor.key()) {
            return Ok(None);
        }
        let key = cursor.key().clone();
        self.state = State::At { cursor, dir: Dir::Prev, version, lookahead: None };
        Ok(Some(key))
    }
}

impl std::fmt::Debug for BtreeIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeIter")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("current", &self.current())
            .field("eof", &self.is_eof())
            .finish()
    }
}
