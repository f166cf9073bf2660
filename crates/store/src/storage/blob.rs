//! Length-prefixed blob framing shared by every writer.
//!
//! ```text
//! [len: u32 LE][payload: len bytes][padding to ALIGN]
//! ```
//!
//! A length of [`FILLER`] marks the unused tail of a chunk. A length of zero
//! marks space that was never written.

use super::{Adr, HEADER_SIZE, Storage, align, offset_to_adr};
use crate::error::{Result, corrupted};

/// Length value marking a skipped chunk tail.
pub const FILLER: u32 = u32::MAX;

const LEN_SIZE: usize = 4;

/// Allocates and writes one blob, returning its address.
///
/// # Errors
///
/// Propagates allocation and write failures.
pub fn write_blob(storage: &dyn Storage, payload: &[u8]) -> Result<Adr> {
    let mut framed = Vec::with_capacity(LEN_SIZE + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(payload);
    let adr = storage.alloc(framed.len())?;
    storage.write(adr, &framed)?;
    Ok(adr)
}

/// Reads the blob at `adr`.
///
/// # Errors
///
/// Returns `Error::Corrupted` if the framing is invalid or runs past
/// allocated space.
pub fn read_blob(storage: &dyn Storage, adr: Adr) -> Result<Vec<u8>> {
    let len = read_len(storage, adr)?;
    if len == 0 || len == FILLER {
        return Err(corrupted(format!("no blob at address {adr}")));
    }
    let framed = storage.read(adr, LEN_SIZE + len as usize)?;
    Ok(framed[LEN_SIZE..].to_vec())
}

fn read_len(storage: &dyn Storage, adr: Adr) -> Result<u32> {
    let bytes = storage.read(adr, LEN_SIZE)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Sequential scan over every blob from the start of a storage up to a
/// high-water mark, skipping chunk fillers.
pub struct BlobScan<'a> {
    storage: &'a dyn Storage,
    pos: u64,
    end: u64,
    done: bool,
}

impl<'a> BlobScan<'a> {
    /// Scans all blobs below `end`.
    pub fn new(storage: &'a dyn Storage, end: u64) -> Self {
        Self { storage, pos: HEADER_SIZE as u64, end, done: false }
    }

    fn step(&mut self) -> Result<Option<(Adr, Vec<u8>)>> {
        let chunk_size = self.storage.chunk_size() as u64;
        loop {
            if self.pos >= self.end {
                return Ok(None);
            }
            let adr = offset_to_adr(self.pos);
            let len = read_len(self.storage, adr)?;
            if len == FILLER {
                self.pos = (self.pos / chunk_size + 1) * chunk_size;
                continue;
            }
            if len == 0 {
                return Err(corrupted(format!("unwritten space at address {adr}")));
            }
            let framed = self.storage.read(adr, LEN_SIZE + len as usize)?;
            self.pos += align(LEN_SIZE + len as usize) as u64;
            return Ok(Some((adr, framed[LEN_SIZE..].to_vec())));
        }
    }
}

impl Iterator for BlobScan<'_> {
    type Item = Result<(Adr, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
