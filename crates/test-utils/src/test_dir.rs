//! Scratch database directories for tests.

#![allow(clippy::expect_used)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

/// Name of the data file inside a database directory.
pub const DATA_FILE_NAME: &str = "tarn.tdb";
/// Name of the index file inside a database directory.
pub const INDEX_FILE_NAME: &str = "tarn.tdi";

/// A database directory removed on drop.
///
/// Knows the layout `Database::open` creates, so recovery tests can reach the
/// data and index files directly and freeze copies of them between steps.
///
/// # Example
///
/// ```
/// use tarn_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// assert!(dir.data_file().starts_with(dir.path()));
/// assert!(!dir.has_database());
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates an empty directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: TempDir::new().expect("failed to create temp directory") }
    }

    /// The directory to pass to `Database::open`.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    #[must_use]
    pub fn data_file(&self) -> PathBuf {
        self.join(DATA_FILE_NAME)
    }

    #[must_use]
    pub fn index_file(&self) -> PathBuf {
        self.join(INDEX_FILE_NAME)
    }

    /// True once both database files exist.
    #[must_use]
    pub fn has_database(&self) -> bool {
        self.data_file().is_file() && self.index_file().is_file()
    }

    /// Copies the database files into a fresh directory.
    ///
    /// The copy reflects whatever the files held at the time of the call,
    /// including writes not yet covered by a commit, so opening it replays
    /// recovery from that exact state.
    ///
    /// # Panics
    ///
    /// Panics if either file is missing or cannot be copied.
    #[must_use]
    pub fn snapshot(&self) -> TestDir {
        let copy = TestDir::new();
        for name in [DATA_FILE_NAME, INDEX_FILE_NAME] {
            fs::copy(self.join(name), copy.join(name)).expect("copy database file");
        }
        copy
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fake_database(dir: &TestDir, data: &[u8]) {
        fs::write(dir.data_file(), data).unwrap();
        fs::write(dir.index_file(), b"index").unwrap();
    }

    #[test]
    fn test_has_database_needs_both_files() {
        let dir = TestDir::new();
        assert!(!dir.has_database());
        fs::write(dir.data_file(), b"data").unwrap();
        assert!(!dir.has_database());
        fs::write(dir.index_file(), b"index").unwrap();
        assert!(dir.has_database());
    }

    #[test]
    fn test_snapshot_is_independent_of_later_writes() {
        let dir = TestDir::new();
        fake_database(&dir, b"before");
        let frozen = dir.snapshot();
        fs::write(dir.data_file(), b"after").unwrap();

        assert_ne!(frozen.path(), dir.path());
        assert_eq!(fs::read(frozen.data_file()).unwrap(), b"before");
        assert_eq!(fs::read(frozen.index_file()).unwrap(), b"index");
    }

    #[test]
    fn test_dir_is_removed_on_drop() {
        let path = {
            let dir = TestDir::new();
            fake_database(&dir, b"data");
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
