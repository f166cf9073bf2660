//! Table metadata held in the directory trie.
//!
//! A table is a set of rows in the data file plus one B-tree per index. Index
//! keys are the projected columns of a row followed by its address as a 4-byte
//! big-endian field, so every key is unique even in a non-unique index and
//! keys sort by address within equal column values.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::{
    btree::NodeRef,
    error::{Result, corrupted},
    record::{Record, RecordBuf, RecordBuilder},
    storage::Adr,
    trie::TrieValue,
};

/// Table numbers at or below this are reserved for schema metadata and may
/// only be written by schema transactions.
pub const SYSTEM_TABLE_LIMIT: u32 = 4;

/// Column list and uniqueness of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Row fields forming the key, in key order.
    pub columns: Vec<u16>,
    /// Whether two rows may share the column values.
    pub unique: bool,
}

impl IndexSpec {
    /// A unique index.
    pub fn key(columns: impl Into<Vec<u16>>) -> Self {
        Self { columns: columns.into(), unique: true }
    }

    /// A non-unique index.
    pub fn index(columns: impl Into<Vec<u16>>) -> Self {
        Self { columns: columns.into(), unique: false }
    }
}

/// One index of a table.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Shape of the index.
    pub spec: IndexSpec,
    /// Root of the index tree.
    pub root: NodeRef,
}

impl IndexInfo {
    /// A new empty index.
    pub fn new(spec: IndexSpec) -> Self {
        Self { spec, root: NodeRef::EMPTY }
    }

    /// Builds the index key of `row` stored at `adr`.
    pub fn key_of<R: Record + ?Sized>(&self, row: &R, adr: Adr) -> RecordBuf {
        let mut builder = RecordBuilder::new();
        for column in &self.spec.columns {
            builder.add(row.get(usize::from(*column)));
        }
        builder.add(adr.to_be_bytes());
        builder.build()
    }

    /// The key of `row` without its address: what must not repeat in a
    /// unique index.
    pub fn prefix_of<R: Record + ?Sized>(&self, row: &R) -> RecordBuf {
        RecordBuilder::from_fields(
            self.spec.columns.iter().map(|column| row.get(usize::from(*column))),
        )
        .build()
    }
}

/// Row address carried in the last field of an index key.
///
/// # Errors
///
/// Returns `Error::Corrupted` if the last field is not four bytes.
pub fn key_adr(key: &RecordBuf) -> Result<Adr> {
    let Some(last) = key.size().checked_sub(1) else {
        return Err(corrupted("index key without fields"));
    };
    let bytes: [u8; 4] = key
        .get(last)
        .try_into()
        .map_err(|_| corrupted("index key address field is not 4 bytes"))?;
    Ok(Adr::from_be_bytes(bytes))
}

/// Directory entry for one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table number.
    pub tblnum: u32,
    /// Live rows.
    pub nrows: u64,
    /// Sum of the packed sizes of the live rows.
    pub total_size: u64,
    /// Indexes; the first one identifies rows.
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    /// A new empty table.
    pub fn new(tblnum: u32, specs: impl IntoIterator<Item = IndexSpec>) -> Self {
        Self {
            tblnum,
            nrows: 0,
            total_size: 0,
            indexes: specs.into_iter().map(IndexInfo::new).collect(),
        }
    }

    /// True for the reserved schema tables.
    pub fn is_system(&self) -> bool {
        self.tblnum <= SYSTEM_TABLE_LIMIT
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }
}

impl TrieValue for TableInfo {
    fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.write_u32::<LittleEndian>(self.tblnum)?;
        dst.write_u64::<LittleEndian>(self.nrows)?;
        dst.write_u64::<LittleEndian>(self.total_size)?;
        dst.write_u16::<LittleEndian>(self.indexes.len() as u16)?;
        for index in &self.indexes {
            let NodeRef::Stored(root) = index.root else {
                return Err(corrupted(format!("table {} has an unstored index", self.tblnum)));
            };
            dst.push(u8::from(index.spec.unique));
            dst.write_u16::<LittleEndian>(index.spec.columns.len() as u16)?;
            for column in &index.spec.columns {
                dst.write_u16::<LittleEndian>(*column)?;
            }
            dst.write_u32::<LittleEndian>(root)?;
        }
        Ok(())
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let truncated = |_| corrupted("truncated table info");
        let mut cur = Cursor::new(src);
        let tblnum = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let nrows = cur.read_u64::<LittleEndian>().map_err(truncated)?;
        let total_size = cur.read_u64::<LittleEndian>().map_err(truncated)?;
        let count = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        let mut indexes = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let unique = match cur.read_u8().map_err(truncated)? {
                0 => false,
                1 => true,
                flag => return Err(corrupted(format!("invalid unique flag {flag}"))),
            };
            let ncols = cur.read_u16::<LittleEndian>().map_err(truncated)?;
            let columns = (0..ncols)
                .map(|_| cur.read_u16::<LittleEndian>().map_err(truncated))
                .collect::<Result<Vec<_>>>()?;
            let root = cur.read_u32::<LittleEndian>().map_err(truncated)?;
            let spec = IndexSpec { columns, unique };
            indexes.push(IndexInfo { spec, root: NodeRef::Stored(root) });
        }
        if cur.position() as usize != src.len() {
            return Err(corrupted(format!("trailing bytes after table {tblnum}")));
        }
        Ok(Self { tblnum, nrows, total_size, indexes })
    }

    fn is_stored(&self) -> bool {
        self.indexes.iter().all(|index| index.root.is_stored())
    }
}
