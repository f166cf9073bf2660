//! Packed binary tuple format shared by rows and index keys.
//!
//! # Layout
//!
//! ```text
//! [mode: u8][nfields: u16 LE][offset 0 .. offset n][field bytes]
//! ```
//!
//! The top two bits of `mode` select the offset width: `01` one byte, `10` two
//! bytes, `11` four bytes. The low six bits are zero. There are `nfields + 1`
//! offsets, each measured from the first byte of the record; the last one is
//! the total record length, so records are self-delimiting. The width is the
//! smallest that can represent the total length.
//!
//! The record with no fields is the single byte `0x00`.
//!
//! # Ordering
//!
//! Records compare field by field, each field as raw bytes. When one record
//! runs out of fields first it sorts lower, so the empty record is the minimum.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use crate::error::{Error, Result, corrupted};

const MODE_EMPTY: u8 = 0x00;
const MODE_MASK: u8 = 0xC0;
const MODE_U8: u8 = 0x40;
const MODE_U16: u8 = 0x80;
const MODE_U32: u8 = 0xC0;

/// Bytes before the offset table.
const FIXED_HEADER: usize = 3;

/// Most fields a record can hold.
pub const MAX_FIELDS: usize = u16::MAX as usize;

/// Offset width and total length for a record of `nfields` fields carrying
/// `data_len` bytes of field data.
fn layout(nfields: usize, data_len: usize) -> (usize, usize) {
    if nfields == 0 {
        return (0, 1);
    }
    for (width, max) in [(1, u8::MAX as usize), (2, u16::MAX as usize)] {
        let total = FIXED_HEADER + (nfields + 1) * width + data_len;
        if total <= max {
            return (width, total);
        }
    }
    (4, FIXED_HEADER + (nfields + 1) * 4 + data_len)
}

/// Packed length of a record with `nfields` fields holding `data_len` bytes.
pub(crate) fn packed_len(nfields: usize, data_len: usize) -> usize {
    layout(nfields, data_len).1
}

fn mode_for(width: usize) -> u8 {
    match width {
        1 => MODE_U8,
        2 => MODE_U16,
        _ => MODE_U32,
    }
}

fn push_offset(dst: &mut Vec<u8>, width: usize, value: usize) {
    match width {
        1 => dst.push(value as u8),
        2 => dst.extend_from_slice(&(value as u16).to_le_bytes()),
        _ => dst.extend_from_slice(&(value as u32).to_le_bytes()),
    }
}

/// The encode/compare contract shared by every record representation.
pub trait Record {
    /// Number of fields.
    fn size(&self) -> usize;

    /// Field `i`, or the empty slice when `i >= size()`.
    fn get(&self, i: usize) -> &[u8];

    /// True when the record has no fields.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Length of field `i`.
    fn field_length(&self, i: usize) -> usize {
        self.get(i).len()
    }

    /// Exact number of bytes [`Record::pack`] appends.
    fn pack_size(&self) -> usize {
        let n = self.size();
        let data: usize = (0..n).map(|i| self.field_length(i)).sum();
        layout(n, data).1
    }

    /// Appends the packed encoding to `dst`.
    ///
    /// Panics when the record has more than [`MAX_FIELDS`] fields.
    fn pack(&self, dst: &mut Vec<u8>) {
        let n = self.size();
        assert!(n <= MAX_FIELDS, "record with {n} fields exceeds {MAX_FIELDS}");
        if n == 0 {
            dst.push(MODE_EMPTY);
            return;
        }
        let data: usize = (0..n).map(|i| self.field_length(i)).sum();
        let (width, total) = layout(n, data);
        dst.reserve(total);
        dst.push(mode_for(width));
        dst.extend_from_slice(&(n as u16).to_le_bytes());
        let mut offset = FIXED_HEADER + (n + 1) * width;
        for i in 0..n {
            push_offset(dst, width, offset);
            offset += self.field_length(i);
        }
        push_offset(dst, width, offset);
        for i in 0..n {
            dst.extend_from_slice(self.get(i));
        }
    }

    /// Owned packed copy.
    fn to_record_buf(&self) -> RecordBuf {
        let mut bytes = Vec::with_capacity(self.pack_size());
        self.pack(&mut bytes);
        RecordBuf { bytes }
    }

    /// Compares the first `nfields` fields. A missing field sorts before a
    /// present one.
    fn compare_fields<R: Record + ?Sized>(&self, other: &R, nfields: usize) -> Ordering {
        let (mine, theirs) = (self.size(), other.size());
        for i in 0..nfields {
            match (i < mine, i < theirs) {
                (false, false) => return Ordering::Equal,
                (false, true) => return Ordering::Less,
                (true, false) => return Ordering::Greater,
                (true, true) => match self.get(i).cmp(other.get(i)) {
                    Ordering::Equal => {},
                    unequal => return unequal,
                },
            }
        }
        Ordering::Equal
    }

    /// Full field-by-field comparison.
    fn compare_to<R: Record + ?Sized>(&self, other: &R) -> Ordering {
        self.compare_fields(other, self.size().max(other.size()))
    }

    /// Compares only as many fields as `bound` has, so every record that
    /// extends `bound` compares equal to it.
    fn prefix_cmp<R: Record + ?Sized>(&self, bound: &R) -> Ordering {
        self.compare_fields(bound, bound.size())
    }
}

/// Zero-copy view of a packed record.
#[derive(Clone, Copy)]
pub struct BufRecord<'a> {
    buf: &'a [u8],
    width: usize,
    nfields: usize,
}

impl<'a> BufRecord<'a> {
    /// Parses the record at the start of `bytes`. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` for an invalid mode byte, a truncated
    /// offset table, or offsets that are out of order or out of range.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let Some(&mode) = bytes.first() else {
            return Err(corrupted("empty record buffer"));
        };
        if mode == MODE_EMPTY {
            return Ok(Self { buf: &bytes[..1], width: 0, nfields: 0 });
        }
        if mode & !MODE_MASK != 0 {
            return Err(corrupted(format!("invalid record mode byte {mode:#04x}")));
        }
        let width = match mode {
            MODE_U8 => 1,
            MODE_U16 => 2,
            _ => 4,
        };
        if bytes.len() < FIXED_HEADER {
            return Err(corrupted("truncated record header"));
        }
        let nfields = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        let header = FIXED_HEADER + (nfields + 1) * width;
        if nfields == 0 || bytes.len() < header {
            return Err(corrupted(format!("record offset table for {nfields} fields truncated")));
        }
        let view = Self { buf: bytes, width, nfields };
        let mut prev = header;
        if view.offset(0) != header {
            return Err(corrupted("record field data does not follow the offset table"));
        }
        for i in 1..=nfields {
            let offset = view.offset(i);
            if offset < prev {
                return Err(corrupted(format!("record offset {i} out of order")));
            }
            prev = offset;
        }
        if prev > bytes.len() {
            return Err(corrupted(format!("record length {prev} exceeds buffer {}", bytes.len())));
        }
        Ok(Self { buf: &bytes[..prev], width, nfields })
    }

    /// View over bytes that already passed [`BufRecord::new`]. Reads the
    /// header only.
    fn trusted(bytes: &'a [u8]) -> Self {
        let width = match bytes[0] {
            MODE_EMPTY => return Self { buf: &bytes[..1], width: 0, nfields: 0 },
            MODE_U8 => 1,
            MODE_U16 => 2,
            _ => 4,
        };
        let nfields = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        Self { buf: bytes, width, nfields }
    }

    fn offset(&self, i: usize) -> usize {
        let at = FIXED_HEADER + i * self.width;
        match self.width {
            1 => self.buf[at] as usize,
            2 => u16::from_le_bytes([self.buf[at], self.buf[at + 1]]) as usize,
            _ => u32::from_le_bytes([
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ]) as usize,
        }
    }

    /// Byte offset of field `i` from the start of the record.
    pub fn field_offset(&self, i: usize) -> usize {
        if i < self.nfields { self.offset(i) } else { self.buf.len() }
    }

    /// The packed bytes of this record and nothing else.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    /// Field `i` with the lifetime of the underlying buffer.
    pub fn field(&self, i: usize) -> &'a [u8] {
        if i >= self.nfields {
            return &[];
        }
        &self.buf[self.offset(i)..self.offset(i + 1)]
    }
}

impl Record for BufRecord<'_> {
    fn size(&self) -> usize {
        self.nfields
    }

    fn get(&self, i: usize) -> &[u8] {
        self.field(i)
    }

    fn pack_size(&self) -> usize {
        self.buf.len()
    }

    fn pack(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(self.buf);
    }
}

impl fmt::Debug for BufRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_fields(self, f)
    }
}

fn debug_fields<R: Record + ?Sized>(record: &R, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut list = f.debug_list();
    for i in 0..record.size() {
        list.entry(&HexField(record.get(i)));
    }
    list.finish()
}

struct HexField<'a>(&'a [u8]);

impl fmt::Debug for HexField<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Owned packed record.
///
/// Used for B-tree keys and for rows held by transactions.
#[derive(Clone)]
pub struct RecordBuf {
    bytes: Vec<u8>,
}

impl RecordBuf {
    /// The record with no fields.
    pub fn empty() -> Self {
        Self { bytes: vec![MODE_EMPTY] }
    }

    /// Takes ownership of packed bytes after validating them.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the bytes are not exactly one record.
    pub fn from_packed(bytes: Vec<u8>) -> Result<Self> {
        let len = BufRecord::new(&bytes)?.as_bytes().len();
        if len != bytes.len() {
            return Err(corrupted(format!("{} trailing bytes after record", bytes.len() - len)));
        }
        Ok(Self { bytes })
    }

    /// Borrowed view. The bytes were validated or packed on construction,
    /// so this reads only the header.
    pub fn view(&self) -> BufRecord<'_> {
        BufRecord::trusted(&self.bytes)
    }

    /// Packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the record, returning the packed bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Copy holding only the first `n` fields.
    pub fn truncated(&self, n: usize) -> RecordBuf {
        if n >= self.size() {
            return self.clone();
        }
        let view = self.view();
        RecordBuilder::from_fields((0..n).map(|i| view.field(i))).build()
    }
}

impl Record for RecordBuf {
    fn size(&self) -> usize {
        match self.bytes.first() {
            None | Some(&MODE_EMPTY) => 0,
            Some(_) => u16::from_le_bytes([self.bytes[1], self.bytes[2]]) as usize,
        }
    }

    fn get(&self, i: usize) -> &[u8] {
        self.view().field(i)
    }

    fn pack_size(&self) -> usize {
        self.bytes.len()
    }

    fn pack(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.bytes);
    }

    fn to_record_buf(&self) -> RecordBuf {
        self.clone()
    }
}

impl PartialEq for RecordBuf {
    fn eq(&self, other: &Self) -> bool {
        self.compare_to(other) == Ordering::Equal
    }
}

impl Eq for RecordBuf {}

impl PartialOrd for RecordBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_to(other)
    }
}

/// Hashes the fields, matching the field-wise `Eq`.
impl Hash for RecordBuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let view = self.view();
        state.write_usize(view.size());
        for i in 0..view.size() {
            view.field(i).hash(state);
        }
    }
}

impl fmt::Debug for RecordBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_fields(self, f)
    }
}

impl Default for RecordBuf {
    fn default() -> Self {
        Self::empty()
    }
}

/// Record assembled field by field before packing.
///
/// A record holds at most [`MAX_FIELDS`] fields; [`RecordBuilder::build`]
/// panics beyond that and [`RecordBuilder::try_build`] returns an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBuilder {
    fields: Vec<Vec<u8>>,
}

impl RecordBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder holding the given fields.
    pub fn from_fields<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        Self { fields: fields.into_iter().map(|f| f.as_ref().to_vec()).collect() }
    }

    /// Appends a field.
    pub fn add(&mut self, field: impl AsRef<[u8]>) -> &mut Self {
        self.fields.push(field.as_ref().to_vec());
        self
    }

    /// Appends a field, consuming and returning the builder.
    #[must_use]
    pub fn field(mut self, field: impl AsRef<[u8]>) -> Self {
        self.add(field);
        self
    }

    /// Packs the fields into an owned record.
    ///
    /// # Panics
    ///
    /// Panics when the builder holds more than [`MAX_FIELDS`] fields.
    pub fn build(&self) -> RecordBuf {
        self.to_record_buf()
    }

    /// Packs the fields into an owned record.
    ///
    /// # Errors
    ///
    /// Returns `TooManyFields` when the builder holds more than
    /// [`MAX_FIELDS`] fields.
    pub fn try_build(&self) -> Result<RecordBuf> {
        if self.fields.len() > MAX_FIELDS {
            return Err(Error::TooManyFields { fields: self.fields.len(), limit: MAX_FIELDS });
        }
        Ok(self.to_record_buf())
    }
}

impl Record for RecordBuilder {
    fn size(&self) -> usize {
        self.fields.len()
    }

    fn get(&self, i: usize) -> &[u8] {
        self.fields.get(i).map_or(&[], Vec::as_slice)
    }
}
