//! Error types for the tarn storage engine.

use std::{fmt, io, time::Duration};

use snafu::Snafu;

use crate::{config::ConfigError, storage::Adr};

/// Result type alias for storage engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error from a backing file.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A storage instance hit an I/O failure earlier and refuses further work.
    #[snafu(display("Storage failed: {reason}"))]
    StorageFault {
        /// Description of the original failure.
        reason: String,
    },

    /// Malformed record, node, trie or header bytes.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Invalid magic number in a file header.
    #[snafu(display("Invalid file magic: {found:?}"))]
    InvalidMagic {
        /// The bytes found where the magic was expected.
        found: [u8; 4],
    },

    /// Unsupported file format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Commit validation found a conflicting committed transaction.
    #[snafu(display("Transaction {tran} aborted by {kind} conflict: {reason}"))]
    Conflict {
        /// The aborted transaction.
        tran: u64,
        /// Conflict class.
        kind: ConflictKind,
        /// Human readable description.
        reason: String,
    },

    /// A unique index already holds this key.
    #[snafu(display("Duplicate key in table {table} index {index}"))]
    DuplicateKey {
        /// Table number.
        table: u32,
        /// Index position within the table.
        index: usize,
    },

    /// A resource limit forced the transaction to abort.
    #[snafu(display("Transaction {tran} aborted: {kind} limit exceeded ({reason})"))]
    LimitExceeded {
        /// The aborted transaction (0 when refused at begin).
        tran: u64,
        /// Which limit tripped.
        kind: LimitKind,
        /// Human readable description.
        reason: String,
    },

    /// The commit lock could not be acquired in time.
    #[snafu(display("Commit lock not acquired within {waited:?}"))]
    CommitLockTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The transaction already committed or aborted.
    #[snafu(display("Transaction {tran} has ended"))]
    TransactionEnded {
        /// The ended transaction.
        tran: u64,
    },

    /// Write attempted through a read-only transaction.
    #[snafu(display("Transaction {tran} is read-only"))]
    ReadOnly {
        /// The read-only transaction.
        tran: u64,
    },

    /// Operation requires a transaction mode this transaction lacks.
    #[snafu(display("Transaction {tran} not permitted: {reason}"))]
    NotPermitted {
        /// The offending transaction.
        tran: u64,
        /// What was refused.
        reason: String,
    },

    /// No table with this number.
    #[snafu(display("Table {table} not found"))]
    TableNotFound {
        /// Table number.
        table: u32,
    },

    /// A table with this number already exists.
    #[snafu(display("Table {table} already exists"))]
    TableExists {
        /// Table number.
        table: u32,
    },

    /// The table has no index at this position.
    #[snafu(display("Table {table} has no index {index}"))]
    IndexNotFound {
        /// Table number.
        table: u32,
        /// Index position.
        index: usize,
    },

    /// No live record at this address.
    #[snafu(display("Record {adr} not found"))]
    RecordNotFound {
        /// Data file address.
        adr: Adr,
    },

    /// An allocation larger than one storage chunk.
    #[snafu(display("Allocation of {size} bytes exceeds the {limit} byte chunk size"))]
    TooLarge {
        /// Requested bytes, including framing.
        size: usize,
        /// Chunk size.
        limit: usize,
    },

    /// A record with more fields than its header can count.
    #[snafu(display("Record with {fields} fields exceeds the {limit} field limit"))]
    TooManyFields {
        /// Fields requested.
        fields: usize,
        /// Most fields a record can hold.
        limit: usize,
    },

    /// Corruption was detected earlier; the database refuses commits until reopened.
    #[snafu(display("Database is marked corrupt, reopen required"))]
    DatabaseCorrupt,

    /// Invalid configuration.
    #[snafu(display("Invalid configuration: {source}"))]
    Config {
        /// The validation failure.
        source: ConfigError,
    },
}

impl Error {
    /// Returns true for errors produced by commit validation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Returns true for errors that mean on-disk bytes cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupted { .. } | Error::InvalidMagic { .. } | Error::UnsupportedVersion { .. }
        )
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config { source }
    }
}

/// Shorthand for building an [`Error::Corrupted`].
pub(crate) fn corrupted(reason: impl Into<String>) -> Error {
    Error::Corrupted { reason: reason.into() }
}

/// Classes of commit-time conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both transactions removed or updated the same record.
    WriteWrite,
    /// A committed removal falls inside a range this transaction read.
    WriteRead,
    /// A committed insertion falls inside a range this transaction read.
    Phantom,
    /// Both transactions added the same unique key.
    DuplicateKey,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictKind::WriteWrite => "write-write",
            ConflictKind::WriteRead => "write-read",
            ConflictKind::Phantom => "phantom",
            ConflictKind::DuplicateKey => "duplicate-key",
        })
    }
}

/// Resource limits that abort transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// The transaction ran longer than the configured maximum.
    Duration,
    /// The transaction wrote more records than allowed.
    Writes,
    /// Too many transactions were outstanding.
    Outstanding,
    /// Another transaction holds exclusive mode.
    Exclusive,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::Duration => "duration",
            LimitKind::Writes => "write count",
            LimitKind::Outstanding => "outstanding transactions",
            LimitKind::Exclusive => "exclusive mode",
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display_names_kind() {
        let err = Error::Conflict {
            tran: 7,
            kind: ConflictKind::WriteWrite,
            reason: "record 12 removed by transaction 6".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("write-write"), "{msg}");
        assert!(msg.contains("transaction 6"), "{msg}");
        assert!(err.is_conflict());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_limit_distinct_from_conflict() {
        let err = Error::LimitExceeded {
            tran: 3,
            kind: LimitKind::Writes,
            reason: "10001 writes".to_string(),
        };
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("write count"));
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_corruption_helpers() {
        assert!(corrupted("bad node").is_corruption());
        assert!(Error::InvalidMagic { found: *b"XXXX" }.is_corruption());
    }
}
