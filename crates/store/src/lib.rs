//! tarn-store: an embedded, crash-durable, transactional storage engine.
//!
//! Tables of variable-length tuple records, each with one or more B-tree
//! indexes, stored in two append-only files:
//!
//! - **Append-only storage**: nothing is overwritten except the commit header
//! - **Copy-on-write B-trees**: committed nodes are never modified in place
//! - **MVCC with optimistic validation**: readers never block, conflicting
//!   writers are refused at commit
//! - **Checksummed commit records**: XXH3-64 over each commit and its rows
//! - **Dual-slot commit header**: atomic checkpoints without a log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Database API                  │
//! │   (open, begin, commit, persist, close)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer                │
//! │ (Transaction, Overlay, TranManager, replay) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        Table Directory and Indexes           │
//! │   (PersistentTrie<TableInfo>, Btree)        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │          Records, Rows and Blobs             │
//! │  (Record, data file rows, commit records)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                  Storage                     │
//! │        (MmapStorage / HeapStorage)          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tarn_store::{Database, DatabaseConfig, IndexSpec, RecordBuilder};
//!
//! let db = Database::open_in_memory(DatabaseConfig::default())?;
//!
//! let mut tran = db.update()?;
//! tran.create_table(10, [IndexSpec::key(vec![0]), IndexSpec::index(vec![1])])?;
//! let row = RecordBuilder::new().field(b"alice").field(b"engineering").build();
//! let adr = tran.add_record(10, &row)?;
//! tran.commit()?;
//!
//! let mut tran = db.read()?;
//! assert_eq!(tran.get_record(adr)?, row);
//! # Ok::<(), tarn_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod btree;
pub mod check;
pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod header;
pub mod overlay;
pub mod record;
pub mod storage;
pub mod table;
pub mod tran;
mod transaction;
pub mod trie;

// Re-export commonly used types
pub use btree::{Btree, BtreeIter, Node, NodeCache, NodeRef};
pub use check::{CheckError, CheckReport};
pub use config::{ConfigError, DatabaseConfig, TranLimits};
pub use data::{CommitRecord, CommittedChange, DataEntry};
pub use db::{DATA_FILE, Database, DatabaseStats, INDEX_FILE, OpenCheck};
pub use error::{ConflictKind, Error, LimitKind, Result};
pub use header::{CommitSlot, DatabaseHeader};
pub use record::{BufRecord, Record, RecordBuf, RecordBuilder};
pub use storage::{Adr, HeapStorage, MmapStorage, Storage};
pub use table::{IndexInfo, IndexSpec, TableInfo};
pub use tran::{IndexEntry, IndexIter, TranMode, TranState, Transaction};
pub use trie::{PersistentTrie, TrieValue};

/// On-disk format version.
pub const VERSION: u16 = storage::FORMAT_VERSION;
