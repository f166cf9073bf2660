//! Append-only, chunked, byte-addressable storage.
//!
//! A storage is a sequence of fixed-size chunks. Space is handed out by an
//! atomic bump allocator and never reused; an allocation never straddles two
//! chunks. Two implementations exist:
//!
//! - [`MmapStorage`]: a file grown one chunk at a time, each chunk memory-mapped.
//! - [`HeapStorage`]: heap-allocated chunks for ephemeral databases and tests.
//!
//! # Addresses
//!
//! An [`Adr`] is a 32-bit logical address. The real byte offset is
//! `adr << ALIGN_SHIFT`, so every allocation is aligned to `1 << ALIGN_SHIFT`
//! bytes. With the default shift of 3 a file can hold 32 GiB. Raising the shift
//! grows the addressable space and the average padding per allocation together.
//! Address 0 is never returned by `alloc`.
//!
//! # File header
//!
//! ```text
//! 0..4    magic
//! 4..6    format version (u16 LE)
//! 6       chunk size as a power of two
//! 7       reserved
//! 8..256  metadata area (read_header / write_header)
//! ```
//!
//! # Failure model
//!
//! The first I/O error marks the storage failed. Every later call returns
//! [`Error::StorageFault`](crate::Error::StorageFault); there is no retry.

mod blob;
mod chunks;
mod heap;
mod mmap;

pub use blob::{BlobScan, FILLER, read_blob, write_blob};
pub use heap::HeapStorage;
pub use mmap::MmapStorage;
use parking_lot::MappedRwLockReadGuard;

use crate::error::Result;

/// Logical storage address.
pub type Adr = u32;

/// Address 0: invalid, used for "nothing stored".
pub const NULL_ADR: Adr = 0;

/// Shift converting an address into a byte offset.
pub const ALIGN_SHIFT: u32 = 3;

/// Allocation alignment in bytes.
pub const ALIGN: usize = 1 << ALIGN_SHIFT;

/// Bytes reserved at the start of every file.
pub const HEADER_SIZE: usize = 256;

/// Offset of the caller-owned metadata area inside the header.
pub const META_OFFSET: usize = 8;

/// Size of the caller-owned metadata area.
pub const META_SIZE: usize = HEADER_SIZE - META_OFFSET;

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Magic for the data file (rows and commit records).
pub const DATA_MAGIC: [u8; 4] = *b"TDB1";

/// Magic for the index file (B-tree nodes, trie nodes, commit slots).
pub const INDEX_MAGIC: [u8; 4] = *b"TDI1";

/// Largest byte offset an address can express.
pub const MAX_OFFSET: u64 = (u32::MAX as u64) << ALIGN_SHIFT;

/// Converts an address to its byte offset.
#[inline]
pub fn adr_to_offset(adr: Adr) -> u64 {
    u64::from(adr) << ALIGN_SHIFT
}

/// Converts an aligned byte offset to an address.
#[inline]
pub fn offset_to_adr(offset: u64) -> Adr {
    debug_assert_eq!(offset % ALIGN as u64, 0, "unaligned offset {offset}");
    (offset >> ALIGN_SHIFT) as Adr
}

/// Rounds `n` up to the allocation alignment.
#[inline]
pub fn align(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Append-only byte store.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Allocates `size` bytes and returns their address.
    ///
    /// Thread-safe.
    ///
    /// # Errors
    ///
    /// Returns `Error::TooLarge` if `size` is zero or larger than a chunk,
    /// `Error::Io` if growing the backing file fails, and
    /// `Error::StorageFault` once the storage has failed.
    fn alloc(&self, size: usize) -> Result<Adr>;

    /// Copies `data` to `adr`. The range must lie inside one prior allocation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the range is outside allocated space.
    fn write(&self, adr: Adr, data: &[u8]) -> Result<()>;

    /// Returns a view from `adr` to the end of its chunk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if `adr` is outside allocated space.
    fn buffer(&self, adr: Adr) -> Result<MappedRwLockReadGuard<'_, [u8]>>;

    /// Copies `len` bytes starting at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if the range is outside allocated space.
    fn read(&self, adr: Adr, len: usize) -> Result<Vec<u8>>;

    /// Offset of the next allocation (the high-water mark).
    fn up_to(&self) -> u64;

    /// Bytes allocated at or after `adr`.
    fn size_from(&self, adr: Adr) -> u64 {
        self.up_to().saturating_sub(adr_to_offset(adr))
    }

    /// Bytes per chunk.
    fn chunk_size(&self) -> usize;

    /// Durability barrier: returns once every prior write is on stable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn force(&self) -> Result<()>;

    /// Reads the metadata area of the file header.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageFault` once the storage has failed.
    fn read_header(&self) -> Result<Vec<u8>>;

    /// Overwrites the metadata area of the file header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if `meta` is not `META_SIZE` bytes.
    fn write_header(&self, meta: &[u8]) -> Result<()>;

    /// Moves the high-water mark back to `up_to`, discarding anything allocated
    /// after it. Only valid while opening, before any allocation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if `up_to` is beyond the end of the storage.
    fn restore_up_to(&self, up_to: u64) -> Result<()>;

    /// True when the storage was created empty rather than opened.
    fn is_new(&self) -> bool;
}

/// Encodes the fixed part of a file header.
pub(crate) fn encode_file_header(magic: [u8; 4], chunk_size: usize) -> [u8; META_OFFSET] {
    let mut buf = [0u8; META_OFFSET];
    buf[0..4].copy_from_slice(&magic);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[6] = chunk_size.trailing_zeros() as u8;
    buf
}

/// Validates the fixed part of a file header, returning the chunk size it records.
pub(crate) fn decode_file_header(buf: &[u8], magic: [u8; 4]) -> Result<usize> {
    use crate::error::{Error, corrupted};

    if buf.len() < META_OFFSET {
        return Err(corrupted("file header too short"));
    }
    let mut found = [0u8; 4];
    found.copy_from_slice(&buf[0..4]);
    if found != magic {
        return Err(Error::InvalidMagic { found });
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version == 0 || version > FORMAT_VERSION {
        return Err(Error::UnsupportedVersion { version });
    }
    let shift = buf[6];
    if !(20..=34).contains(&shift) {
        return Err(corrupted(format!("invalid chunk size shift {shift}")));
    }
    Ok(1usize << shift)
}
