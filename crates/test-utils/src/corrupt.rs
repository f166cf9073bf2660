//! Helpers that damage database files in place.
//!
//! Used by recovery tests to simulate torn writes and media errors on files
//! that were closed (or abandoned) by an earlier database instance.

#![allow(clippy::expect_used)]

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

/// Inverts every bit of the byte at `offset`.
///
/// # Panics
///
/// Panics if the file cannot be opened or `offset` is past its end.
pub fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).expect("open file");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.read_exact(&mut byte).expect("read byte");
    byte[0] = !byte[0];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&byte).expect("write byte");
    file.sync_all().expect("sync");
}

/// Overwrites `len` bytes starting at `offset` with zeros.
///
/// # Panics
///
/// Panics if the file cannot be opened or written.
pub fn zero_range(path: &Path, offset: u64, len: usize) {
    let mut file = OpenOptions::new().write(true).open(path).expect("open file");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&vec![0u8; len]).expect("write zeros");
    file.sync_all().expect("sync");
}

/// Truncates the file to `len` bytes.
///
/// # Panics
///
/// Panics if the file cannot be opened or resized.
pub fn truncate(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).expect("open file");
    file.set_len(len).expect("set length");
    file.sync_all().expect("sync");
}

/// Current length of the file in bytes.
///
/// # Panics
///
/// Panics if the file metadata cannot be read.
#[must_use]
pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).expect("file metadata").len()
}
