//! Persistent 32-way hash trie mapping `u32` keys to values.
//!
//! The trie is immutable: [`PersistentTrie::with`] and
//! [`PersistentTrie::without`] copy the nodes on the root-to-entry path and
//! share everything else with the previous version. A reader holding an old
//! version keeps seeing exactly what it saw before.
//!
//! Keys are consumed [`BITS_PER_LEVEL`] bits at a time from the low end.
//! After [`MAX_DEPTH`] branch levels the remaining keys live in a chain node
//! and are matched by full key.
//!
//! Nodes are written to storage by [`PersistentTrie::store`], which only
//! writes nodes that have not been stored before. A stored node is never
//! modified again. Children of loaded nodes are read lazily.
//!
//! # Node encoding
//!
//! ```text
//! branch: [1][bitmap u32] then per set bit:
//!           [0][key u32][len u32][value]   entry
//!           [1][adr u32]                   child
//! chain:  [2][count u16] then per entry [key u32][len u32][value]
//! ```

use std::{
    io::{Cursor, Read},
    sync::{Arc, OnceLock},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    error::{Error, Result, corrupted},
    storage::{Adr, NULL_ADR, Storage, read_blob, write_blob},
};

/// Key bits consumed per branch level.
pub const BITS_PER_LEVEL: u32 = 5;

/// Children per branch node.
pub const FANOUT: u32 = 1 << BITS_PER_LEVEL;

/// Branch levels before keys chain in a terminal node.
pub const MAX_DEPTH: u32 = 4;

const KIND_BRANCH: u8 = 1;
const KIND_CHAIN: u8 = 2;
const SLOT_ENTRY: u8 = 0;
const SLOT_CHILD: u8 = 1;

/// A value that can live in a [`PersistentTrie`].
pub trait TrieValue: Clone + Send + Sync + 'static {
    /// Appends the stored form of the value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the value is not storable.
    fn encode(&self, dst: &mut Vec<u8>) -> Result<()>;

    /// Decodes a value written by [`TrieValue::encode`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` on malformed input.
    fn decode(src: &[u8]) -> Result<Self>;

    /// False while the value still references unstored data.
    fn is_stored(&self) -> bool {
        true
    }
}

impl TrieValue for u64 {
    fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = src.try_into().map_err(|_| corrupted("u64 trie value length"))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

#[inline]
fn slice(key: u32, level: u32) -> u32 {
    (key >> (level * BITS_PER_LEVEL)) & (FANOUT - 1)
}

#[inline]
fn position(bitmap: u32, bit: u32) -> usize {
    (bitmap & ((1u32 << bit) - 1)).count_ones() as usize
}

#[derive(Debug)]
struct TrieNode<V> {
    adr: Option<Adr>,
    body: Body<V>,
}

#[derive(Debug)]
enum Body<V> {
    Branch { bitmap: u32, slots: Vec<Slot<V>> },
    Chain(Vec<(u32, V)>),
}

#[derive(Clone, Debug)]
enum Slot<V> {
    Entry(u32, V),
    Child(Child<V>),
}

#[derive(Clone, Debug)]
struct Child<V> {
    adr: Option<Adr>,
    node: OnceLock<Arc<TrieNode<V>>>,
}

impl<V: TrieValue> Child<V> {
    fn memory(node: TrieNode<V>) -> Self {
        Self::from_node(Arc::new(node))
    }

    fn from_node(node: Arc<TrieNode<V>>) -> Self {
        let adr = node.adr;
        Self { adr, node: OnceLock::from(node) }
    }

    fn stored(adr: Adr) -> Self {
        Self { adr: Some(adr), node: OnceLock::new() }
    }

    fn load(&self, storage: &dyn Storage) -> Result<&Arc<TrieNode<V>>> {
        if let Some(node) = self.node.get() {
            return Ok(node);
        }
        let adr = self.adr.ok_or_else(|| corrupted("unstored trie child without a node"))?;
        let node = TrieNode::read(storage, adr)?;
        let _ = self.node.set(Arc::new(node));
        self.node.get().ok_or_else(|| corrupted("trie child failed to load"))
    }
}

impl<V: TrieValue> TrieNode<V> {
    fn memory(body: Body<V>) -> Self {
        Self { adr: None, body }
    }

    fn empty() -> Self {
        Self::memory(Body::Branch { bitmap: 0, slots: Vec::new() })
    }

    fn is_empty(&self) -> bool {
        match &self.body {
            Body::Branch { slots, .. } => slots.is_empty(),
            Body::Chain(entries) => entries.is_empty(),
        }
    }

    /// The single entry of a node that holds nothing else.
    fn sole_entry(&self) -> Option<(u32, V)> {
        match &self.body {
            Body::Branch { slots, .. } => match slots.as_slice() {
                [Slot::Entry(k, v)] => Some((*k, v.clone())),
                _ => None,
            },
            Body::Chain(entries) => match entries.as_slice() {
                [(k, v)] => Some((*k, v.clone())),
                _ => None,
            },
        }
    }

    fn read(storage: &dyn Storage, adr: Adr) -> Result<Self> {
        let bytes = read_blob(storage, adr)?;
        let body = decode_body(&bytes).map_err(|e| match e {
            Error::Corrupted { reason } => corrupted(format!("trie node {adr}: {reason}")),
            other => other,
        })?;
        Ok(Self { adr: Some(adr), body })
    }
}

fn truncated(_: std::io::Error) -> Error {
    corrupted("truncated trie node")
}

fn write_value<V: TrieValue>(dst: &mut Vec<u8>, key: u32, value: &V) -> Result<()> {
    let mut encoded = Vec::new();
    value.encode(&mut encoded)?;
    dst.write_u32::<LittleEndian>(key)?;
    dst.write_u32::<LittleEndian>(encoded.len() as u32)?;
    dst.extend_from_slice(&encoded);
    Ok(())
}

fn read_value<V: TrieValue>(cur: &mut Cursor<&[u8]>) -> Result<(u32, V)> {
    let key = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    let len = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let remaining = cur.get_ref().len() - cur.position() as usize;
    if len > remaining {
        return Err(corrupted(format!("trie value of {len} bytes overruns node")));
    }
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf).map_err(truncated)?;
    Ok((key, V::decode(&buf)?))
}

fn encode_body<V: TrieValue>(body: &Body<V>, dst: &mut Vec<u8>) -> Result<()> {
    match body {
        Body::Branch { bitmap, slots } => {
            dst.push(KIND_BRANCH);
            dst.write_u32::<LittleEndian>(*bitmap)?;
            for slot in slots {
                match slot {
                    Slot::Entry(key, value) => {
                        dst.push(SLOT_ENTRY);
                        write_value(dst, *key, value)?;
                    },
                    Slot::Child(child) => {
                        let adr = child.adr.ok_or_else(|| corrupted("encoding unstored child"))?;
                        dst.push(SLOT_CHILD);
                        dst.write_u32::<LittleEndian>(adr)?;
                    },
                }
            }
        },
        Body::Chain(entries) => {
            dst.push(KIND_CHAIN);
            dst.write_u16::<LittleEndian>(entries.len() as u16)?;
            for (key, value) in entries {
                write_value(dst, *key, value)?;
            }
        },
    }
    Ok(())
}

fn decode_body<V: TrieValue>(bytes: &[u8]) -> Result<Body<V>> {
    let mut cur = Cursor::new(bytes);
    let body = match cur.read_u8().map_err(truncated)? {
        KIND_BRANCH => {
            let bitmap = cur.read_u32::<LittleEndian>().map_err(truncated)?;
            let mut slots = Vec::with_capacity(bitmap.count_ones() as usize);
            for _ in 0..bitmap.count_ones() {
                match cur.read_u8().map_err(truncated)? {
                    SLOT_ENTRY => {
                        let (key, value) = read_value(&mut cur)?;
                        slots.push(Slot::Entry(key, value));
                    },
                    SLOT_CHILD => {
                        let adr = cur.read_u32::<LittleEndian>().map_err(truncated)?;
                        if adr == NULL_ADR {
                            return Err(corrupted("null child address"));
                        }
                        slots.push(Slot::Child(Child::stored(adr)));
                    },
                    tag => return Err(corrupted(format!("invalid slot tag {tag}"))),
                }
            }
            Body::Branch { bitmap, slots }
        },
        KIND_CHAIN => {
            let count = cur.read_u16::<LittleEndian>().map_err(truncated)?;
            let entries =
                (0..count).map(|_| read_value(&mut cur)).collect::<Result<Vec<(u32, V)>>>()?;
            Body::Chain(entries)
        },
        kind => return Err(corrupted(format!("invalid node kind {kind}"))),
    };
    if cur.position() as usize != bytes.len() {
        return Err(corrupted("trailing bytes after trie node"));
    }
    Ok(body)
}

/// Node holding two entries whose keys agree on every slice above `level`.
fn pair<V: TrieValue>(level: u32, a: (u32, V), b: (u32, V)) -> TrieNode<V> {
    if level >= MAX_DEPTH {
        return TrieNode::memory(Body::Chain(vec![a, b]));
    }
    let (sa, sb) = (slice(a.0, level), slice(b.0, level));
    if sa == sb {
        let child = Child::memory(pair(level + 1, a, b));
        return TrieNode::memory(Body::Branch { bitmap: 1 << sa, slots: vec![Slot::Child(child)] });
    }
    let (first, second) = if sa < sb { (a, b) } else { (b, a) };
    TrieNode::memory(Body::Branch {
        bitmap: (1 << sa) | (1 << sb),
        slots: vec![Slot::Entry(first.0, first.1), Slot::Entry(second.0, second.1)],
    })
}

fn with_in<V: TrieValue>(
    node: &TrieNode<V>,
    level: u32,
    key: u32,
    value: V,
    storage: &dyn Storage,
) -> Result<TrieNode<V>> {
    match &node.body {
        Body::Chain(entries) => {
            let mut entries = entries.clone();
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
            Ok(TrieNode::memory(Body::Chain(entries)))
        },
        Body::Branch { bitmap, slots } => {
            let bit = slice(key, level);
            let pos = position(*bitmap, bit);
            let mut slots = slots.clone();
            let mut bitmap = *bitmap;
            if bitmap & (1 << bit) == 0 {
                bitmap |= 1 << bit;
                slots.insert(pos, Slot::Entry(key, value));
            } else {
                let replacement = match &slots[pos] {
                    Slot::Entry(k, _) if *k == key => Slot::Entry(key, value),
                    Slot::Entry(k, v) => {
                        Slot::Child(Child::memory(pair(level + 1, (*k, v.clone()), (key, value))))
                    },
                    Slot::Child(child) => {
                        let loaded = child.load(storage)?;
                        Slot::Child(Child::memory(with_in(loaded, level + 1, key, value, storage)?))
                    },
                };
                slots[pos] = replacement;
            }
            Ok(TrieNode::memory(Body::Branch { bitmap, slots }))
        },
    }
}

/// Returns the replacement node, or `None` when `key` was absent.
fn without_in<V: TrieValue>(
    node: &TrieNode<V>,
    level: u32,
    key: u32,
    storage: &dyn Storage,
) -> Result<Option<TrieNode<V>>> {
    match &node.body {
        Body::Chain(entries) => {
            let Some(pos) = entries.iter().position(|(k, _)| *k == key) else {
                return Ok(None);
            };
            let mut entries = entries.clone();
            entries.remove(pos);
            Ok(Some(TrieNode::memory(Body::Chain(entries))))
        },
        Body::Branch { bitmap, slots } => {
            let bit = slice(key, level);
            if bitmap & (1 << bit) == 0 {
                return Ok(None);
            }
            let pos = position(*bitmap, bit);
            let replacement = match &slots[pos] {
                Slot::Entry(k, _) if *k == key => None,
                Slot::Entry(..) => return Ok(None),
                Slot::Child(child) => {
                    let loaded = child.load(storage)?;
                    let Some(new_child) = without_in(loaded, level + 1, key, storage)? else {
                        return Ok(None);
                    };
                    if new_child.is_empty() {
                        None
                    } else if let Some((k, v)) = new_child.sole_entry() {
                        Some(Slot::Entry(k, v))
                    } else {
                        Some(Slot::Child(Child::memory(new_child)))
                    }
                },
            };
            let mut slots = slots.clone();
            let mut bitmap = *bitmap;
            match replacement {
                Some(slot) => slots[pos] = slot,
                None => {
                    slots.remove(pos);
                    bitmap &= !(1 << bit);
                },
            }
            Ok(Some(TrieNode::memory(Body::Branch { bitmap, slots })))
        },
    }
}

fn storable<V: TrieValue>(value: &V, translate: &mut dyn FnMut(&V) -> Result<V>) -> Result<V> {
    if value.is_stored() { Ok(value.clone()) } else { translate(value) }
}

fn store_node<V: TrieValue>(
    node: &Arc<TrieNode<V>>,
    storage: &dyn Storage,
    translate: &mut dyn FnMut(&V) -> Result<V>,
    written: &mut usize,
) -> Result<Arc<TrieNode<V>>> {
    if node.adr.is_some() {
        return Ok(Arc::clone(node));
    }
    let body = match &node.body {
        Body::Chain(entries) => Body::Chain(
            entries
                .iter()
                .map(|(k, v)| Ok((*k, storable(v, translate)?)))
                .collect::<Result<Vec<_>>>()?,
        ),
        Body::Branch { bitmap, slots } => {
            let mut stored = Vec::with_capacity(slots.len());
            for slot in slots {
                stored.push(match slot {
                    Slot::Entry(k, v) => Slot::Entry(*k, storable(v, translate)?),
                    Slot::Child(child) if child.adr.is_some() => slot.clone(),
                    Slot::Child(child) => {
                        let inner = child
                            .node
                            .get()
                            .ok_or_else(|| corrupted("unstored trie child without a node"))?;
                        let node = store_node(inner, storage, translate, written)?;
                        Slot::Child(Child::from_node(node))
                    },
                });
            }
            Body::Branch { bitmap: *bitmap, slots: stored }
        },
    };
    let mut buf = Vec::new();
    encode_body(&body, &mut buf)?;
    let adr = write_blob(storage, &buf)?;
    *written += 1;
    Ok(Arc::new(TrieNode { adr: Some(adr), body }))
}

/// Immutable hash trie with structural sharing.
#[derive(Debug)]
pub struct PersistentTrie<V> {
    root: Arc<TrieNode<V>>,
}

impl<V> Clone for PersistentTrie<V> {
    fn clone(&self) -> Self {
        Self { root: Arc::clone(&self.root) }
    }
}

impl<V: TrieValue> Default for PersistentTrie<V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<V: TrieValue> PersistentTrie<V> {
    /// The trie with no entries.
    pub fn empty() -> Self {
        Self { root: Arc::new(TrieNode::empty()) }
    }

    /// Opens a stored trie. `NULL_ADR` yields the empty trie.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the root node is malformed.
    pub fn load(storage: &dyn Storage, root: Adr) -> Result<Self> {
        if root == NULL_ADR {
            return Ok(Self::empty());
        }
        Ok(Self { root: Arc::new(TrieNode::read(storage, root)?) })
    }

    /// Address of the root if it has been stored.
    pub fn root_adr(&self) -> Option<Adr> {
        self.root.adr
    }

    /// True when every node has been stored.
    pub fn is_stored(&self) -> bool {
        self.root.adr.is_some()
    }

    /// Looks up `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if a node on the path cannot be loaded.
    pub fn get(&self, key: u32, storage: &dyn Storage) -> Result<Option<V>> {
        let mut node = Arc::clone(&self.root);
        let mut level = 0;
        loop {
            let next = match &node.body {
                Body::Chain(entries) => {
                    return Ok(entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone()));
                },
                Body::Branch { bitmap, slots } => {
                    let bit = slice(key, level);
                    if bitmap & (1 << bit) == 0 {
                        return Ok(None);
                    }
                    match &slots[position(*bitmap, bit)] {
                        Slot::Entry(k, v) => return Ok((*k == key).then(|| v.clone())),
                        Slot::Child(child) => Arc::clone(child.load(storage)?),
                    }
                },
            };
            node = next;
            level += 1;
        }
    }

    /// New version with `key` mapped to `value`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if a node on the path cannot be loaded.
    pub fn with(&self, key: u32, value: V, storage: &dyn Storage) -> Result<Self> {
        Ok(Self { root: Arc::new(with_in(&self.root, 0, key, value, storage)?) })
    }

    /// New version without `key`. Returns an identical trie when absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if a node on the path cannot be loaded.
    pub fn without(&self, key: u32, storage: &dyn Storage) -> Result<Self> {
        match without_in(&self.root, 0, key, storage)? {
            Some(root) => Ok(Self { root: Arc::new(root) }),
            None => Ok(self.clone()),
        }
    }

    /// Every entry, in slice order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if a node cannot be loaded.
    pub fn entries(&self, storage: &dyn Storage) -> Result<Vec<(u32, V)>> {
        let mut out = Vec::new();
        collect(&self.root, storage, &mut out)?;
        Ok(out)
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if a node cannot be loaded.
    pub fn len(&self, storage: &dyn Storage) -> Result<usize> {
        count(&self.root, storage)
    }

    /// Visits the entries held by nodes that have not been stored yet.
    pub fn traverse_unstored(&self, f: &mut dyn FnMut(u32, &V)) {
        visit_unstored(&self.root, f);
    }

    /// Writes every unstored node, children first, returning the root address
    /// and a trie whose nodes are all marked stored. Values that report
    /// `is_stored() == false` pass through `translate` before being written.
    ///
    /// # Errors
    ///
    /// Propagates translator, encoding and storage errors.
    pub fn store(
        &self,
        storage: &dyn Storage,
        translate: &mut dyn FnMut(&V) -> Result<V>,
    ) -> Result<(Adr, Self)> {
        let mut written = 0;
        let root = store_node(&self.root, storage, translate, &mut written)?;
        let adr = root.adr.ok_or_else(|| corrupted("stored trie root without address"))?;
        tracing::trace!(root = adr, nodes = written, "Stored trie");
        Ok((adr, Self { root }))
    }
}

fn collect<V: TrieValue>(
    node: &TrieNode<V>,
    storage: &dyn Storage,
    out: &mut Vec<(u32, V)>,
) -> Result<()> {
    match &node.body {
        Body::Chain(entries) => out.extend(entries.iter().cloned()),
        Body::Branch { slots, .. } => {
            for slot in slots {
                match slot {
                    Slot::Entry(k, v) => out.push((*k, v.clone())),
                    Slot::Child(child) => collect(child.load(storage)?, storage, out)?,
                }
            }
        },
    }
    Ok(())
}

fn count<V: TrieValue>(node: &TrieNode<V>, storage: &dyn Storage) -> Result<usize> {
    match &node.body {
        Body::Chain(entries) => Ok(entries.len()),
        Body::Branch { slots, .. } => slots.iter().try_fold(0, |n, slot| match slot {
            Slot::Entry(..) => Ok(n + 1),
            Slot::Child(child) => Ok(n + count(child.load(storage)?, storage)?),
        }),
    }
}

fn visit_unstored<V: TrieValue>(node: &TrieNode<V>, f: &mut dyn FnMut(u32, &V)) {
    if node.adr.is_some() {
        return;
    }
    match &node.body {
        Body::Chain(entries) => entries.iter().for_each(|(k, v)| f(*k, v)),
        Body::Branch { slots, .. } => {
            for slot in slots {
                match slot {
                    Slot::Entry(k, v) => f(*k, v),
                    Slot::Child(child) if child.adr.is_none() => {
                        if let Some(inner) = child.node.get() {
                            visit_unstored(inner, f);
                        }
                    },
                    Slot::Child(_) => {},
                }
            }
        },
    }
}
