//! Chunk table and bump allocator shared by both storage implementations.

use std::{
    io,
    ops::{Deref, DerefMut},
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use memmap2::MmapMut;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use super::{Adr, HEADER_SIZE, MAX_OFFSET, META_OFFSET, META_SIZE, adr_to_offset, align};
use crate::error::{Error, Result, corrupted};

/// Backing memory of one chunk.
pub(crate) enum ChunkMem {
    Heap(Box<[u8]>),
    Mapped(MmapMut),
}

impl ChunkMem {
    pub(crate) fn flush(&self) -> io::Result<()> {
        match self {
            ChunkMem::Heap(_) => Ok(()),
            ChunkMem::Mapped(map) => map.flush(),
        }
    }

    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match self {
            ChunkMem::Heap(_) => Ok(()),
            ChunkMem::Mapped(map) => map.flush_range(offset, len),
        }
    }
}

impl Deref for ChunkMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ChunkMem::Heap(buf) => buf,
            ChunkMem::Mapped(map) => map,
        }
    }
}

impl DerefMut for ChunkMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            ChunkMem::Heap(buf) => buf,
            ChunkMem::Mapped(map) => map,
        }
    }
}

/// Fixed table of lazily created chunks plus the allocation high-water mark.
///
/// Chunks are created once and never replaced or moved, so a chunk reference
/// stays valid for the life of the table. Each chunk has its own lock; readers
/// only contend with writers copying into the same chunk.
pub(crate) struct Chunks {
    chunk_size: usize,
    slots: Box<[OnceLock<RwLock<ChunkMem>>]>,
    grow: Mutex<()>,
    next: AtomicU64,
    failed: OnceLock<String>,
    is_new: bool,
}

impl Chunks {
    pub(crate) fn new(chunk_size: usize, next: u64, is_new: bool) -> Self {
        let nslots = (MAX_OFFSET / chunk_size as u64 + 1) as usize;
        let slots = (0..nslots).map(|_| OnceLock::new()).collect::<Vec<_>>().into_boxed_slice();
        Self {
            chunk_size,
            slots,
            grow: Mutex::new(()),
            next: AtomicU64::new(next),
            failed: OnceLock::new(),
            is_new,
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn up_to(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn chunk(&self, index: usize) -> Option<&RwLock<ChunkMem>> {
        self.slots.get(index).and_then(OnceLock::get)
    }

    /// Returns chunk `index`, creating it with `make` if it does not exist yet.
    pub(crate) fn ensure(
        &self,
        index: usize,
        make: impl FnOnce(usize) -> io::Result<ChunkMem>,
    ) -> Result<&RwLock<ChunkMem>> {
        let slot = self.slots.get(index).ok_or_else(|| corrupted(format!("chunk {index}")))?;
        if let Some(chunk) = slot.get() {
            return Ok(chunk);
        }
        let _grow = self.grow.lock();
        if let Some(chunk) = slot.get() {
            return Ok(chunk);
        }
        let mem = make(index).map_err(|e| self.fail(e))?;
        let _ = slot.set(RwLock::new(mem));
        slot.get().ok_or_else(|| corrupted(format!("chunk {index} vanished")))
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.failed.get() {
            Some(reason) => Err(Error::StorageFault { reason: reason.clone() }),
            None => Ok(()),
        }
    }

    /// Marks the storage failed and converts the error.
    pub(crate) fn fail(&self, err: io::Error) -> Error {
        if self.failed.set(err.to_string()).is_ok() {
            tracing::error!(error = %err, "Storage failed, refusing further operations");
        }
        Error::Io { source: err }
    }

    /// Reserves `size` bytes, returning the start offset and, when the
    /// reservation skipped the tail of a chunk, the offset of that tail.
    pub(crate) fn reserve(&self, size: usize) -> Result<(u64, Option<u64>)> {
        if size == 0 || size > self.chunk_size {
            return Err(Error::TooLarge { size, limit: self.chunk_size });
        }
        let size = align(size) as u64;
        let chunk_size = self.chunk_size as u64;
        let mut cur = self.next.load(Ordering::Acquire);
        loop {
            let room = chunk_size - cur % chunk_size;
            let (start, tail) = if size > room { (cur + room, Some(cur)) } else { (cur, None) };
            let end = start + size;
            if end > MAX_OFFSET {
                return Err(Error::StorageFault {
                    reason: format!("address space exhausted at offset {end}"),
                });
            }
            match self.next.compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok((start, tail)),
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn restore_up_to(&self, up_to: u64) -> Result<()> {
        let cur = self.up_to();
        if up_to < HEADER_SIZE as u64 || up_to > cur {
            return Err(corrupted(format!("high-water mark {up_to} outside 256..={cur}")));
        }
        self.next.store(up_to, Ordering::Release);
        Ok(())
    }

    /// Resolves a byte range to its chunk and in-chunk offset.
    fn locate(&self, adr: Adr, len: usize) -> Result<(&RwLock<ChunkMem>, usize)> {
        let offset = adr_to_offset(adr);
        let chunk_size = self.chunk_size as u64;
        let within = (offset % chunk_size) as usize;
        if offset < HEADER_SIZE as u64
            || offset + len as u64 > self.up_to()
            || within + len > self.chunk_size
        {
            return Err(corrupted(format!("address {adr} (+{len}) outside allocated space")));
        }
        let chunk = self
            .chunk((offset / chunk_size) as usize)
            .ok_or_else(|| corrupted(format!("address {adr} in a missing chunk")))?;
        Ok((chunk, within))
    }

    pub(crate) fn write(&self, adr: Adr, data: &[u8]) -> Result<()> {
        self.check()?;
        let (chunk, within) = self.locate(adr, data.len())?;
        chunk.write()[within..within + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writes at an offset reserved by [`Chunks::reserve`], bypassing address checks.
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let chunk_size = self.chunk_size as u64;
        let chunk = self
            .chunk((offset / chunk_size) as usize)
            .ok_or_else(|| corrupted(format!("offset {offset} in a missing chunk")))?;
        let within = (offset % chunk_size) as usize;
        chunk.write()[within..within + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn buffer(&self, adr: Adr) -> Result<MappedRwLockReadGuard<'_, [u8]>> {
        self.check()?;
        let (chunk, within) = self.locate(adr, 0)?;
        Ok(RwLockReadGuard::map(chunk.read(), |mem| &mem[within..]))
    }

    pub(crate) fn read(&self, adr: Adr, len: usize) -> Result<Vec<u8>> {
        self.check()?;
        let (chunk, within) = self.locate(adr, len)?;
        Ok(chunk.read()[within..within + len].to_vec())
    }

    pub(crate) fn read_header(&self) -> Result<Vec<u8>> {
        self.check()?;
        let chunk = self.chunk(0).ok_or_else(|| corrupted("header chunk missing"))?;
        Ok(chunk.read()[META_OFFSET..HEADER_SIZE].to_vec())
    }

    pub(crate) fn write_header(&self, meta: &[u8]) -> Result<()> {
        self.check()?;
        if meta.len() != META_SIZE {
            return Err(corrupted(format!(
                "header metadata must be {META_SIZE} bytes, got {}",
                meta.len()
            )));
        }
        let chunk = self.chunk(0).ok_or_else(|| corrupted("header chunk missing"))?;
        chunk.write()[META_OFFSET..HEADER_SIZE].copy_from_slice(meta);
        Ok(())
    }

    /// Writes the fixed file header into chunk 0.
    pub(crate) fn write_file_header(&self, fixed: &[u8; META_OFFSET]) -> Result<()> {
        let chunk = self.chunk(0).ok_or_else(|| corrupted("header chunk missing"))?;
        chunk.write()[..META_OFFSET].copy_from_slice(fixed);
        Ok(())
    }
}

impl std::fmt::Debug for Chunks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunks")
            .field("chunk_size", &self.chunk_size)
            .field("up_to", &self.up_to())
            .field("failed", &self.failed.get())
            .finish()
    }
}
