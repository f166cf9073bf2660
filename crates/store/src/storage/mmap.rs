//! Memory-mapped file storage.
//!
//! The file grows one chunk at a time and each chunk is mapped separately, so
//! existing mappings never move when the file grows.

#![allow(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use memmap2::MmapOptions;
use parking_lot::MappedRwLockReadGuard;

use super::{
    Adr, HEADER_SIZE, META_OFFSET, Storage,
    chunks::{ChunkMem, Chunks},
    decode_file_header, encode_file_header, offset_to_adr,
};
use crate::error::{Result, corrupted};

/// File-backed storage with memory-mapped chunks.
#[derive(Debug)]
pub struct MmapStorage {
    path: PathBuf,
    file: File,
    chunks: Chunks,
    forced: AtomicU64,
}

impl MmapStorage {
    /// Opens `path`, creating it when missing or empty.
    ///
    /// A new file records `chunk_size`; an existing file keeps the chunk size
    /// it was created with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on file errors, `Error::InvalidMagic` or
    /// `Error::UnsupportedVersion` for foreign files, and `Error::Corrupted`
    /// when the file length is not a whole number of chunks.
    pub fn open(path: impl AsRef<Path>, magic: [u8; 4], chunk_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            let chunks = Chunks::new(chunk_size, HEADER_SIZE as u64, true);
            chunks.ensure(0, |index| map_chunk(&file, index, chunk_size))?;
            chunks.write_file_header(&encode_file_header(magic, chunk_size))?;
            tracing::debug!(path = %path.display(), chunk_size, "Created storage file");
            return Ok(Self { path, file, chunks, forced: AtomicU64::new(0) });
        }

        let mut fixed = [0u8; META_OFFSET];
        file.read_exact(&mut fixed)?;
        let chunk_size = decode_file_header(&fixed, magic)?;
        if len % chunk_size as u64 != 0 {
            return Err(corrupted(format!(
                "{} length {len} is not a multiple of chunk size {chunk_size}",
                path.display()
            )));
        }
        let chunks = Chunks::new(chunk_size, len, false);
        for index in 0..(len / chunk_size as u64) as usize {
            chunks.ensure(index, |index| map_chunk(&file, index, chunk_size))?;
        }
        tracing::debug!(path = %path.display(), len, chunk_size, "Opened storage file");
        Ok(Self { path, file, chunks, forced: AtomicU64::new(len) })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map_chunk(file: &File, index: usize, chunk_size: usize) -> io::Result<ChunkMem> {
    let start = index as u64 * chunk_size as u64;
    let end = start + chunk_size as u64;
    if file.metadata()?.len() < end {
        file.set_len(end)?;
    }
    // SAFETY: MmapMut is unsafe because the file could be modified by another
    // process while mapped. The database owns its files exclusively, the
    // mapping covers a range that was just sized by set_len, and the map lives
    // inside the chunk table for as long as any reference to it can exist.
    let map = unsafe { MmapOptions::new().offset(start).len(chunk_size).map_mut(file)? };
    Ok(ChunkMem::Mapped(map))
}

impl Storage for MmapStorage {
    fn alloc(&self, size: usize) -> Result<Adr> {
        self.chunks.check()?;
        let chunk_size = self.chunks.chunk_size();
        let (start, tail) = self.chunks.reserve(size)?;
        self.chunks.ensure((start / chunk_size as u64) as usize, |index| {
            map_chunk(&self.file, index, chunk_size)
        })?;
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
        self.chunks.check()?;
        let chunk_size = self.chunks.chunk_size() as u64;
        let up_to = self.chunks.up_to();
        let from = self.forced.load(Ordering::Acquire).min(up_to);
        let first = (from / chunk_size) as usize;
        let last = (up_to.saturating_sub(1) / chunk_size) as usize;
        for index in first..=last {
            if let Some(chunk) = self.chunks.chunk(index) {
                chunk.read().flush().map_err(|e| self.chunks.fail(e))?;
            }
        }
        if first > 0 {
            if let Some(chunk) = self.chunks.chunk(0) {
                chunk.read().flush_range(0, HEADER_SIZE).map_err(|e| self.chunks.fail(e))?;
            }
        }
        self.file.sync_all().map_err(|e| self.chunks.fail(e))?;
        self.forced.store(up_to, Ordering::Release);
        Ok(())
    }

    fn read_header(&self) -> Result<Vec<u8>> {
        self.chunks.read_header()
    }

    fn write_header(&self, meta: &[u8]) -> Result<()> {
        self.chunks.write_header(meta)
    }

    fn restore_up_to(&self, up_to: u64) -> Result<()> {
        self.chunks.restore_up_to(up_to)?;
        self.forced.store(up_to, Ordering::Release);
        Ok(())
    }

    fn is_new(&self) -> bool {
        self.chunks.is_new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        storage::{DATA_MAGIC, INDEX_MAGIC, META_SIZE, adr_to_offset},
    };

    const CHUNK: usize = 1 << 20;

    #[test]
    fn test_create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tdb");
        let adr = {
            let storage = MmapStorage::open(&path, DATA_MAGIC, CHUNK).unwrap();
            assert!(storage.is_new());
            let adr = storage.alloc(11).unwrap();
            storage.write(adr, b"persistent!").unwrap();
            storage.write_header(&[9u8; META_SIZE]).unwrap();
            storage.force().unwrap();
            adr
        };

        let storage = MmapStorage::open(&path, DATA_MAGIC, 4 * CHUNK).unwrap();
        assert!(!storage.is_new());
        assert_eq!(storage.chunk_size(), CHUNK, "existing file keeps its chunk size");
        assert_eq!(storage.read(adr, 11).unwrap(), b"persistent!");
        assert_eq!(storage.read_header().unwrap(), vec![9u8; META_SIZE]);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tdb");
        {
            let storage = MmapStorage::open(&path, DATA_MAGIC, CHUNK).unwrap();
            storage.force().unwrap();
        }
        let err = MmapStorage::open(&path, INDEX_MAGIC, CHUNK).unwrap_err();
        assert!(matches!(err, Error::InvalidMagic { .. }));
    }

    #[test]
    fn test_growth_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.tdb");
        let storage = MmapStorage::open(&path, DATA_MAGIC, CHUNK).unwrap();
        let mut last = 0;
        for i in 0..40u32 {
            let adr = storage.alloc(64 * 1024).unwrap();
            storage.write(adr, &i.to_le_bytes()).unwrap();
            last = adr;
        }
        storage.force().unwrap();
        assert!(adr_to_offset(last) >= 2 * CHUNK as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len() % CHUNK as u64, 0);
        assert_eq!(storage.read(last, 4).unwrap(), 39u32.to_le_bytes());
    }
}
