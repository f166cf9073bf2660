//! Heap-backed storage for ephemeral databases and tests.

use parking_lot::MappedRwLockReadGuard;

use super::{
    Adr, HEADER_SIZE, Storage,
    chunks::{ChunkMem, Chunks},
    encode_file_header, offset_to_adr,
};
use crate::error::Result;

/// Storage whose chunks live in process memory.
///
/// Contents vanish when the value is dropped. `force` is a no-op.
#[derive(Debug)]
pub struct HeapStorage {
    chunks: Chunks,
}

impl HeapStorage {
    /// Creates an empty heap storage tagged with `magic`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the first chunk cannot be set up.
    pub fn new(magic: [u8; 4], chunk_size: usize) -> Result<Self> {
        let chunks = Chunks::new(chunk_size, HEADER_SIZE as u64, true);
        chunks.ensure(0, |_| Ok(zeroed(chunk_size)))?;
        chunks.write_file_header(&encode_file_header(magic, chunk_size))?;
        Ok(Self { chunks })
    }
}

fn zeroed(chunk_size: usize) -> ChunkMem {
    ChunkMem::Heap(vec![0u8; chunk_size].into_boxed_slice())
}

impl Storage for HeapStorage {
    fn alloc(&self, size: usize) -> Result<Adr> {
        self.chunks.check()?;
        let chunk_size = self.chunks.chunk_size();
        let (start, tail) = self.chunks.reserve(size)?;
        self.chunks.ensure((start / chunk_size as u64) as usize, |_| Ok(zeroed(chunk_size)))?;
        if let Some(tail) = tail {
            self.chunks.write_at(tail, &super::FILLER.to_le_bytes())?;
        }
        Ok(offset_to_adr(start))
    }

    fn write(&self, adr: Adr, data: &[u8]) -> Result<()> {
        self.chunks.write(adr, data)
    }

    fn buffer(&self, adr: Adr) -> Result<MappedRwLockReadGuard<'_, [u8]>> {
        self.chunks.buffer(adr)
    }

    fn read(&self, adr: Adr, len: usize) -> Result<Vec<u8>> {
        self.chunks.read(adr, len)
    }

    fn up_to(&self) -> u64 {
        self.chunks.up_to()
    }

    fn chunk_size(&self) -> usize {
        self.chunks.chunk_size()
    }

    fn force(&self) -> Result<()> {
        self.chunks.check()
    }

    fn read_header(&self) -> Result<Vec<u8>> {
        self.chunks.read_header()
    }

    fn write_header(&self, meta: &[u8]) -> Result<()> {
        self.chunks.write_header(meta)
    }

    fn restore_up_to(&self, up_to: u64) -> Result<()> {
        self.chunks.restore_up_to(up_to)
    }

    fn is_new(&self) -> bool {
        self.chunks.is_new()
    }
}
