//! Database handle: open, commit, checkpoint and close.
//!
//! A database is two append-only files: `tarn.tdb` holds rows and commit
//! records, `tarn.tdi` holds index nodes, the table directory and the
//! dual-slot commit header.
//!
//! # Commit
//!
//! Commits are serialized by the commit lock. Under it a transaction is
//! validated against everything committed since it started, its operation log
//! is replayed onto the latest state with path copying, a commit record is
//! appended to the data file, and the new [`State`] is published with one
//! atomic pointer swap. Readers never take the lock.
//!
//! # Checkpoint
//!
//! A checkpoint writes every in-memory node and directory entry to the index
//! file, forces both files and then switches the header to a new commit slot
//! (see [`header`](crate::header)). Commits after the last checkpoint are not
//! durable; with the default `checkpoint_interval` of 1 every commit
//! checkpoints.
//!
//! # Example
//!
//! ```no_run
//! use tarn_store::{Database, DatabaseConfig, IndexSpec, RecordBuilder};
//!
//! let db = Database::open("/var/lib/tarn", DatabaseConfig::default())?;
//!
//! let mut tran = db.update()?;
//! tran.create_table(10, [IndexSpec::key(vec![0])])?;
//! tran.add_record(10, &RecordBuilder::new().field(b"alice").build())?;
//! tran.commit()?;
//!
//! let mut tran = db.read()?;
//! let key = RecordBuilder::new().field(b"alice").build();
//! assert!(tran.lookup(10, 0, &key)?.is_some());
//! # Ok::<(), tarn_store::Error>(())
//! ```

use std::{
    path::Path,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::{
    btree::{Node, NodeRef, PathCopy, SharedNodes},
    check::{self, CheckReport},
    config::DatabaseConfig,
    data::{CommitRecord, CommittedRecords, DataScan, is_below, read_row, write_row},
    error::{ConflictKind, Error, LimitKind, Result, corrupted},
    header::{CommitSlot, DatabaseHeader},
    record::RecordBuf,
    storage::{
        Adr, DATA_MAGIC, HeapStorage, INDEX_MAGIC, MmapStorage, NULL_ADR, Storage, write_blob,
    },
    table::TableInfo,
    tran::{Op, TranMode, Transaction, Updates, apply_op},
    transaction::TranManager,
    trie::PersistentTrie,
};

/// Name of the data file inside a database directory.
pub const DATA_FILE: &str = "tarn.tdb";

/// Name of the index file inside a database directory.
pub const INDEX_FILE: &str = "tarn.tdi";

/// A committed state. Published atomically; transactions keep the one they
/// started from.
#[derive(Clone)]
pub(crate) struct State {
    pub dbinfo: PersistentTrie<TableInfo>,
    pub commit_seq: u64,
    pub schema_version: u64,
    pub last_commit_adr: Adr,
    pub last_commit_checksum: u64,
}

impl State {
    fn from_slot(slot: &CommitSlot, dbinfo: PersistentTrie<TableInfo>) -> Self {
        Self {
            dbinfo,
            commit_seq: slot.commit_seq,
            schema_version: slot.schema_version,
            last_commit_adr: slot.last_commit_adr,
            last_commit_checksum: slot.last_commit_checksum,
        }
    }
}

/// Header and checkpoint bookkeeping, owned by whoever holds the commit lock.
struct Checkpointer {
    header: DatabaseHeader,
    persisted_seq: u64,
    pending: u32,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    conflicts: AtomicU64,
    limit_aborts: AtomicU64,
    checkpoints: AtomicU64,
    checkpoint_seq: AtomicU64,
    node_splits: AtomicU64,
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    /// Commits since open.
    pub commits: u64,
    /// Commits refused by validation since open.
    pub conflicts: u64,
    /// Transactions aborted by a resource limit since open.
    pub limit_aborts: u64,
    /// Update transactions force-aborted to honor `max_outstanding`.
    pub forced_aborts: u64,
    /// Checkpoints since open.
    pub checkpoints: u64,
    /// Node splits performed by commits since open.
    pub node_splits: u64,
    /// Node cache hits.
    pub cache_hits: u64,
    /// Node cache misses.
    pub cache_misses: u64,
    /// Nodes currently cached.
    pub cached_nodes: usize,
    /// Data file high-water mark in bytes.
    pub data_size: u64,
    /// Index file high-water mark in bytes.
    pub index_size: u64,
    /// Sequence number of the latest commit.
    pub commit_seq: u64,
    /// Sequence number of the latest checkpoint.
    pub checkpoint_seq: u64,
    /// Transactions currently open.
    pub outstanding: usize,
    /// Committed footprints kept for validating open update transactions.
    pub retained_footprints: usize,
}

/// How an open verified the checkpoint it started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenCheck {
    /// A new database; nothing to verify.
    Created,
    /// The last commit record matched the commit slot.
    Fast,
    /// The full consistency check ran and passed.
    Full,
}

/// The database handle.
///
/// Thread-safe: share it by reference or `Arc` and open transactions from any
/// thread.
pub struct Database {
    data: Arc<dyn Storage>,
    index: Arc<dyn Storage>,
    nodes: Arc<SharedNodes>,
    state: ArcSwap<State>,
    commit_lock: Mutex<Checkpointer>,
    /// Row writers hold it shared; reading a stable data high-water mark
    /// holds it exclusively so no row is half-written below the mark.
    append_gate: RwLock<()>,
    manager: TranManager,
    config: DatabaseConfig,
    corrupt: AtomicBool,
    counters: Counters,
    open_check: OpenCheck,
}

impl Database {
    /// Opens or creates the database in directory `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration, `Error::Io` on
    /// file errors, and a corruption error when neither commit slot verifies
    /// or the full consistency check fails.
    pub fn open(dir: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let data = MmapStorage::open(dir.join(DATA_FILE), DATA_MAGIC, config.chunk_size)?;
        let index = MmapStorage::open(dir.join(INDEX_FILE), INDEX_MAGIC, config.chunk_size)?;
        tracing::info!(dir = %dir.display(), "Opening database");
        Self::from_storage(Arc::new(data), Arc::new(index), config)
    }

    /// Creates an empty database in memory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration.
    pub fn open_in_memory(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let data = HeapStorage::new(DATA_MAGIC, config.chunk_size)?;
        let index = HeapStorage::new(INDEX_MAGIC, config.chunk_size)?;
        Self::from_storage(Arc::new(data), Arc::new(index), config)
    }

    /// Opens a database over existing storage.
    ///
    /// # Errors
    ///
    /// As for [`Database::open`].
    pub fn from_storage(
        data: Arc<dyn Storage>,
        index: Arc<dyn Storage>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        config.validate()?;
        let nodes = Arc::new(SharedNodes::new(Arc::clone(&index), config.node_cache_size));

        if index.is_new() {
            if !data.is_new() {
                return Err(corrupted("index file missing for an existing data file"));
            }
            let state = State {
                dbinfo: PersistentTrie::empty(),
                commit_seq: 0,
                schema_version: 0,
                last_commit_adr: NULL_ADR,
                last_commit_checksum: 0,
            };
            let mut header = DatabaseHeader::new();
            header.set_recovery_required(true);
            let db = Self::assemble(data, index, nodes, state, header, config, OpenCheck::Created);
            {
                let mut checkpointer = db.commit_lock.lock();
                db.checkpoint(&mut checkpointer, true)?;
            }
            tracing::info!("Created database");
            return Ok(db);
        }

        let mut header = DatabaseHeader::from_bytes(&index.read_header()?)?;
        let (slot_index, slot) = header.choose()?;
        let slot = slot.clone();
        index.restore_up_to(slot.index_upto)?;
        data.restore_up_to(slot.data_upto)?;
        let dbinfo = if slot.dbinfo_root == NULL_ADR {
            PersistentTrie::empty()
        } else {
            PersistentTrie::load(index.as_ref(), slot.dbinfo_root)?
        };

        let unclean = header.recovery_required() || slot_index != header.primary_index();
        let open_check = if !unclean && fast_check(data.as_ref(), &slot) {
            OpenCheck::Fast
        } else {
            tracing::warn!(
                recovery_flag = header.recovery_required(),
                slot = slot_index,
                "Running full consistency check"
            );
            let report = check::run(data.as_ref(), &nodes, &dbinfo, slot.data_upto);
            if let Some(first) = report.errors.first() {
                return Err(corrupted(format!(
                    "consistency check found {} problems, first: {first}",
                    report.errors.len()
                )));
            }
            if report.last_commit_seq != slot.commit_seq {
                return Err(corrupted(format!(
                    "data file ends at commit {}, checkpoint names commit {}",
                    report.last_commit_seq, slot.commit_seq
                )));
            }
            OpenCheck::Full
        };

        header.select(slot_index);
        header.set_recovery_required(true);
        index.write_header(&header.to_bytes())?;
        index.force()?;

        tracing::info!(
            commit_seq = slot.commit_seq,
            schema_version = slot.schema_version,
            check = ?open_check,
            "Opened database"
        );
        let state = State::from_slot(&slot, dbinfo);
        Ok(Self::assemble(data, index, nodes, state, header, config, open_check))
    }

    fn assemble(
        data: Arc<dyn Storage>,
        index: Arc<dyn Storage>,
        nodes: Arc<SharedNodes>,
        state: State,
        header: DatabaseHeader,
        config: DatabaseConfig,
        open_check: OpenCheck,
    ) -> Self {
        let persisted_seq = state.commit_seq;
        let counters = Counters::default();
        counters.checkpoint_seq.store(persisted_seq, Ordering::Relaxed);
        Self {
            data,
            index,
            nodes,
            state: ArcSwap::from_pointee(state),
            commit_lock: Mutex::new(Checkpointer { header, persisted_seq, pending: 0 }),
            append_gate: RwLock::new(()),
            manager: TranManager::new(config.limits.clone()),
            config,
            corrupt: AtomicBool::new(false),
            counters,
            open_check,
        }
    }

    /// How the last open verified its starting point.
    pub fn open_check(&self) -> OpenCheck {
        self.open_check
    }

    /// The configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Begins a transaction in `mode`. A bulk transaction checkpoints first.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` when an update is requested while a schema
    /// transaction holds exclusive mode, and `DatabaseCorrupt` for updates
    /// once corruption was detected.
    pub fn begin(&self, mode: TranMode) -> Result<Transaction<'_>> {
        if !mode.is_read_only() && self.is_corrupt() {
            return Err(Error::DatabaseCorrupt);
        }
        if mode.is_bulk() {
            self.persist()?;
        }
        let mut snapshot = None;
        let ticket = self
            .manager
            .begin(mode, || {
                let state = self.state.load_full();
                let seq = state.commit_seq;
                snapshot = Some(state);
                seq
            })
            .inspect_err(|_| self.count_limit_abort())?;
        let snapshot = snapshot.unwrap_or_else(|| self.state.load_full());
        tracing::trace!(tran = ticket.num, ?mode, start_seq = ticket.start_seq, "Begin");
        Ok(Transaction::new(self, ticket.num, mode, snapshot, ticket.abort))
    }

    /// Begins a read-only transaction.
    ///
    /// # Errors
    ///
    /// As for [`Database::begin`].
    pub fn read(&self) -> Result<Transaction<'_>> {
        self.begin(TranMode::READ)
    }

    /// Begins an update transaction.
    ///
    /// # Errors
    ///
    /// As for [`Database::begin`].
    pub fn update(&self) -> Result<Transaction<'_>> {
        self.begin(TranMode::UPDATE)
    }

    /// Every table as of the latest commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be loaded.
    pub fn tables(&self) -> Result<Vec<TableInfo>> {
        let state = self.state.load_full();
        let entries = state.dbinfo.entries(self.index.as_ref())?;
        Ok(entries.into_iter().map(|(_, info)| info).collect())
    }

    /// Sequence number of the latest commit.
    pub fn commit_seq(&self) -> u64 {
        self.state.load().commit_seq
    }

    /// Incremented by every commit that creates or drops a table or index.
    pub fn schema_version(&self) -> u64 {
        self.state.load().schema_version
    }

    /// True once corruption was detected. Commits are refused until reopen.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Acquire)
    }

    /// Writes every committed change to the index file and switches the
    /// commit header to it. A no-op when nothing was committed since the last
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `CommitLockTimeout` if the commit lock is busy and `Error::Io`
    /// if a write or sync fails.
    pub fn persist(&self) -> Result<()> {
        let mut checkpointer = self.lock_commits()?;
        self.checkpoint(&mut checkpointer, false)
    }

    /// Checkpoints and marks the database cleanly closed.
    ///
    /// # Errors
    ///
    /// As for [`Database::persist`]. The recovery flag stays set on failure,
    /// so the next open runs the full check.
    pub fn close(self) -> Result<()> {
        let outstanding = self.manager.outstanding();
        if outstanding > 0 {
            tracing::warn!(outstanding, "Closing with open transactions");
        }
        let mut checkpointer = self.lock_commits()?;
        self.checkpoint(&mut checkpointer, false)?;
        checkpointer.header.set_recovery_required(false);
        self.index.write_header(&checkpointer.header.to_bytes())?;
        self.index.force()?;
        tracing::info!(commit_seq = checkpointer.persisted_seq, "Closed database");
        Ok(())
    }

    /// Every blob of the data file, rows and commit records, in file order.
    pub fn data_scan(&self) -> DataScan<'_> {
        DataScan::new(self.data.as_ref(), self.stable_data_end())
    }

    /// The changes named by verified commit records, in commit order.
    pub fn committed_records(&self) -> CommittedRecords<'_> {
        CommittedRecords::new(self.data.as_ref(), self.stable_data_end())
    }

    /// Reads the row at `adr` and its table number, whether or not any
    /// commit made it live.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if no row starts at `adr`.
    pub fn read_record(&self, adr: Adr) -> Result<(u32, RecordBuf)> {
        let end = self.stable_data_end();
        if !is_below(adr, end) {
            return Err(Error::RecordNotFound { adr });
        }
        self.read_row_at(adr)
    }

    /// Runs the full consistency check against the latest commit.
    pub fn check(&self) -> CheckReport {
        let state = self.state.load_full();
        let end = self.stable_data_end();
        let report = check::run(self.data.as_ref(), &self.nodes, &state.dbinfo, end);
        if !report.is_clean() {
            tracing::error!(errors = report.errors.len(), "Consistency check failed");
        }
        report
    }

    /// Current statistics.
    pub fn stats(&self) -> DatabaseStats {
        let cache = self.nodes.cache();
        DatabaseStats {
            commits: self.counters.commits.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            limit_aborts: self.counters.limit_aborts.load(Ordering::Relaxed),
            forced_aborts: self.manager.forced_aborts(),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
            node_splits: self.counters.node_splits.load(Ordering::Relaxed),
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
            cached_nodes: cache.len(),
            data_size: self.data.up_to(),
            index_size: self.index.up_to(),
            commit_seq: self.commit_seq(),
            checkpoint_seq: self.counters.checkpoint_seq.load(Ordering::Relaxed),
            outstanding: self.manager.outstanding(),
            retained_footprints: self.manager.history_len(),
        }
    }

    pub(crate) fn shared_nodes(&self) -> &Arc<SharedNodes> {
        &self.nodes
    }

    pub(crate) fn index_storage(&self) -> &dyn Storage {
        self.index.as_ref()
    }

    pub(crate) fn end_transaction(&self, num: u64) {
        self.manager.end(num);
    }

    pub(crate) fn count_limit_abort(&self) {
        self.counters.limit_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Flags the database corrupt when `err` means stored bytes are bad.
    pub(crate) fn observe(&self, err: Error) -> Error {
        if err.is_corruption() && !self.corrupt.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %err, "Corruption detected, refusing commits until reopen");
        }
        err
    }

    pub(crate) fn append_row(&self, tblnum: u32, record: &RecordBuf) -> Result<Adr> {
        let _gate = self.append_gate.read();
        write_row(self.data.as_ref(), tblnum, record)
    }

    /// Reads a row by caller-supplied address. Anything that is not a row
    /// reads as not found.
    pub(crate) fn read_row_at(&self, adr: Adr) -> Result<(u32, RecordBuf)> {
        if !is_below(adr, self.data.up_to()) {
            return Err(Error::RecordNotFound { adr });
        }
        read_row(self.data.as_ref(), adr).map_err(|e| match e {
            e if e.is_corruption() => Error::RecordNotFound { adr },
            other => other,
        })
    }

    /// Reads a row an index points at. Failure here is corruption.
    pub(crate) fn indexed_row(&self, adr: Adr) -> Result<RecordBuf> {
        read_row(self.data.as_ref(), adr).map(|(_, record)| record).map_err(|e| self.observe(e))
    }

    fn stable_data_end(&self) -> u64 {
        let _gate = self.append_gate.write();
        self.data.up_to()
    }

    fn lock_commits(&self) -> Result<parking_lot::MutexGuard<'_, Checkpointer>> {
        let waited = self.config.commit_lock_timeout;
        self.commit_lock.try_lock_for(waited).ok_or_else(|| {
            tracing::warn!(?waited, "Commit lock timeout");
            Error::CommitLockTimeout { waited }
        })
    }

    /// Validates and applies one transaction's log, returning its commit
    /// sequence number.
    pub(crate) fn commit_update(
        &self,
        tran: u64,
        start_seq: u64,
        mode: TranMode,
        abort: &OnceLock<LimitKind>,
        updates: &mut Updates,
    ) -> Result<u64> {
        let started = Instant::now();
        let mut checkpointer = self.lock_commits()?;
        if self.is_corrupt() {
            return Err(Error::DatabaseCorrupt);
        }
        let footprint = (!mode.is_bulk()).then_some(&updates.footprint);
        match self.manager.validate(tran, start_seq, abort, footprint) {
            Ok(()) => {},
            Err(e @ Error::Conflict { .. }) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            },
            Err(e @ Error::LimitExceeded { .. }) => {
                tracing::warn!(tran, error = %e, "Commit refused, transaction aborted by limit");
                self.count_limit_abort();
                return Err(e);
            },
            Err(e) => return Err(e),
        }

        let current = self.state.load_full();
        let mut store = PathCopy::new(&self.nodes, self.config.max_node_size);
        let mut dbinfo = current.dbinfo.clone();
        let mut splits = 0;
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut schema_changed = false;
        for op in &updates.log {
            dbinfo = apply_op(&dbinfo, op, &mut store, self.index.as_ref(), tran, &mut splits)
                .map_err(|e| self.replay_error(tran, e))?;
            match op {
                Op::Add { adr, .. } => adds.push(*adr),
                Op::Remove { adr, .. } => removes.push(*adr),
                _ => {},
            }
            schema_changed |= op.is_schema();
        }

        let seq = current.commit_seq + 1;
        let record = CommitRecord { tran, seq, adds, removes };
        let (adr, checksum) = {
            let _gate = self.append_gate.read();
            record.write(self.data.as_ref()).map_err(|e| self.observe(e))?
        };
        self.state.store(Arc::new(State {
            dbinfo,
            commit_seq: seq,
            schema_version: current.schema_version + u64::from(schema_changed),
            last_commit_adr: adr,
            last_commit_checksum: checksum,
        }));
        self.manager.committed(tran, seq, std::mem::take(&mut updates.footprint));
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        self.counters.node_splits.fetch_add(splits, Ordering::Relaxed);
        tracing::debug!(
            tran,
            seq,
            adds = record.adds.len(),
            removes = record.removes.len(),
            splits,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Commit applied"
        );

        checkpointer.pending += 1;
        let interval = self.config.checkpoint_interval;
        if interval > 0 && checkpointer.pending >= interval {
            if let Err(e) = self.checkpoint(&mut checkpointer, false) {
                // The commit is visible; the next checkpoint retries.
                tracing::error!(seq, error = %e, "Checkpoint after commit failed");
            }
        }
        Ok(seq)
    }

    /// Converts a replay failure. Refusals caused by concurrent commits
    /// become conflicts.
    fn replay_error(&self, tran: u64, err: Error) -> Error {
        let (kind, reason) = match err {
            Error::DuplicateKey { table, index } => (
                ConflictKind::DuplicateKey,
                format!("key in table {table} index {index} added by a concurrent commit"),
            ),
            Error::RecordNotFound { adr } => {
                (ConflictKind::WriteWrite, format!("record {adr} removed by a concurrent commit"))
            },
            Error::TableNotFound { table } | Error::TableExists { table } => {
                (ConflictKind::WriteWrite, format!("table {table} changed by a concurrent commit"))
            },
            other => return self.observe(other),
        };
        self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tran, %kind, "Commit replay conflict");
        Error::Conflict { tran, kind, reason }
    }

    fn checkpoint(&self, checkpointer: &mut Checkpointer, force: bool) -> Result<()> {
        let state = self.state.load_full();
        if !force && state.commit_seq == checkpointer.persisted_seq {
            return Ok(());
        }
        let started = Instant::now();
        let _gate = self.append_gate.write();

        let mut writer = NodeWriter { nodes: &self.nodes, written: 0 };
        let (root, dbinfo) =
            state.dbinfo.store(self.index.as_ref(), &mut |info| writer.table(info))?;
        let slot = CommitSlot {
            dbinfo_root: root,
            index_upto: self.index.up_to(),
            data_upto: self.data.up_to(),
            commit_seq: state.commit_seq,
            schema_version: state.schema_version,
            last_commit_adr: state.last_commit_adr,
            last_commit_checksum: state.last_commit_checksum,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        self.data.force()?;
        self.index.force()?;
        checkpointer.header.set_secondary(slot);
        self.index.write_header(&checkpointer.header.to_bytes())?;
        self.index.force()?;
        checkpointer.header.flip();
        self.index.write_header(&checkpointer.header.to_bytes())?;
        self.index.force()?;

        self.state.store(Arc::new(State { dbinfo, ..(*state).clone() }));
        checkpointer.persisted_seq = state.commit_seq;
        checkpointer.pending = 0;
        self.counters.checkpoint_seq.store(state.commit_seq, Ordering::Relaxed);
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            commit_seq = state.commit_seq,
            nodes = writer.written,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Checkpoint"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data", &self.data)
            .field("index", &self.index)
            .field("commit_seq", &self.commit_seq())
            .field("manager", &self.manager)
            .finish()
    }
}

/// The last commit record must verify and match the commit slot.
fn fast_check(data: &dyn Storage, slot: &CommitSlot) -> bool {
    if slot.commit_seq == 0 {
        return slot.last_commit_adr == NULL_ADR;
    }
    match CommitRecord::read_verified(data, slot.last_commit_adr) {
        Ok((record, checksum)) => {
            record.seq == slot.commit_seq && checksum == slot.last_commit_checksum
        },
        Err(e) => {
            tracing::warn!(error = %e, "Last commit record does not verify");
            false
        },
    }
}

/// Writes in-memory nodes bottom-up during a checkpoint.
struct NodeWriter<'a> {
    nodes: &'a SharedNodes,
    written: usize,
}

impl NodeWriter<'_> {
    fn table(&mut self, info: &TableInfo) -> Result<TableInfo> {
        let mut info = info.clone();
        for index in &mut info.indexes {
            index.root = NodeRef::Stored(self.write(&index.root)?);
        }
        Ok(info)
    }

    fn write(&mut self, node_ref: &NodeRef) -> Result<Adr> {
        let node = match node_ref {
            NodeRef::Stored(adr) => return Ok(*adr),
            NodeRef::Memory(node) => node,
            NodeRef::Transient(slot) => {
                return Err(corrupted(format!(
                    "transient node of transaction {} reached a checkpoint",
                    slot.generation
                )));
            },
        };
        let stored = if node.is_leaf() {
            Node::clone(node)
        } else {
            let children = node
                .children()
                .iter()
                .map(|child| self.write(child).map(NodeRef::Stored))
                .collect::<Result<Vec<_>>>()?;
            Node::tree(node.keys().to_vec(), children)
        };
        let adr = write_blob(self.nodes.storage().as_ref(), &stored.encode()?)?;
        self.nodes.cache().insert(adr, Arc::new(stored));
        self.written += 1;
        Ok(adr)
    }
}
