//! Transactions.
//!
//! One [`Transaction`] type covers every mode; [`TranMode`] selects read-only,
//! bulk and schema behavior. A read transaction only holds the state it
//! loaded at begin. An update transaction adds a private [`Overlay`], its own
//! directory trie, an operation log and a [`Footprint`] of what it read and
//! wrote.
//!
//! At commit the operation log is replayed onto the latest state with path
//! copying; the overlay itself is discarded.

use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

use crate::{
    btree::{Btree, BtreeIter, NodeSource, NodeStore},
    db::{Database, State},
    error::{Error, LimitKind, Result},
    overlay::Overlay,
    record::{Record, RecordBuf},
    storage::{Adr, Storage},
    table::{IndexInfo, IndexSpec, SYSTEM_TABLE_LIMIT, TableInfo, key_adr},
    transaction::{Footprint, IndexId, ReadRange},
    trie::PersistentTrie,
};

/// Transaction mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranMode {
    read_only: bool,
    bulk: bool,
    schema: bool,
}

impl TranMode {
    /// Snapshot reads only.
    pub const READ: TranMode = TranMode { read_only: true, bulk: false, schema: false };
    /// Ordinary validated update.
    pub const UPDATE: TranMode = TranMode { read_only: false, bulk: false, schema: false };
    /// Large load: checkpoint first, skip validation and the write limit.
    pub const BULK: TranMode = TranMode { read_only: false, bulk: true, schema: false };
    /// Schema change: exclusive, may write system tables.
    pub const SCHEMA: TranMode = TranMode { read_only: false, bulk: false, schema: true };

    /// True for read-only transactions.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True for bulk transactions.
    pub fn is_bulk(&self) -> bool {
        self.bulk
    }

    /// True for schema transactions.
    pub fn is_schema(&self) -> bool {
        self.schema
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranState {
    /// Accepting operations.
    Active,
    /// Inside commit.
    Committing,
    /// Committed; terminal.
    Committed,
    /// Aborted, with the reason; terminal.
    Aborted(String),
}

/// A logged write, replayed at commit.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    CreateTable { tblnum: u32, specs: Vec<IndexSpec> },
    DropTable { tblnum: u32 },
    CreateIndex { tblnum: u32, spec: IndexSpec },
    Add { tblnum: u32, adr: Adr, record: RecordBuf },
    Remove { tblnum: u32, adr: Adr, record: RecordBuf },
}

impl Op {
    pub fn is_schema(&self) -> bool {
        matches!(self, Op::CreateTable { .. } | Op::DropTable { .. } | Op::CreateIndex { .. })
    }
}

fn table_of(
    dbinfo: &PersistentTrie<TableInfo>,
    tblnum: u32,
    storage: &dyn Storage,
) -> Result<TableInfo> {
    dbinfo.get(tblnum, storage)?.ok_or(Error::TableNotFound { table: tblnum })
}

/// Applies `op` to a directory, modifying trees through `store`.
///
/// Every check that can refuse the operation runs before the first tree is
/// modified, so a refused operation leaves `store` untouched.
pub(crate) fn apply_op<S: NodeStore>(
    dbinfo: &PersistentTrie<TableInfo>,
    op: &Op,
    store: &mut S,
    storage: &dyn Storage,
    tran: u64,
    splits: &mut u64,
) -> Result<PersistentTrie<TableInfo>> {
    match op {
        Op::CreateTable { tblnum, specs } => {
            if dbinfo.get(*tblnum, storage)?.is_some() {
                return Err(Error::TableExists { table: *tblnum });
            }
            dbinfo.with(*tblnum, TableInfo::new(*tblnum, specs.iter().cloned()), storage)
        },
        Op::DropTable { tblnum } => {
            table_of(dbinfo, *tblnum, storage)?;
            dbinfo.without(*tblnum, storage)
        },
        Op::CreateIndex { tblnum, spec } => {
            let mut info = table_of(dbinfo, *tblnum, storage)?;
            if !info.is_empty() {
                return Err(Error::NotPermitted {
                    tran,
                    reason: format!("table {tblnum} has rows; indexes are added to empty tables"),
                });
            }
            info.indexes.push(IndexInfo::new(spec.clone()));
            dbinfo.with(*tblnum, info, storage)
        },
        Op::Add { tblnum, adr, record } => {
            let mut info = table_of(dbinfo, *tblnum, storage)?;
            for (i, index) in info.indexes.iter().enumerate() {
                if index.spec.unique {
                    let tree = Btree::new(index.root.clone(), &*store);
                    if tree.first_with_prefix(&index.prefix_of(record))?.is_some() {
                        return Err(Error::DuplicateKey { table: *tblnum, index: i });
                    }
                }
            }
            for index in &mut info.indexes {
                let mut tree = Btree::new(index.root.clone(), &mut *store);
                tree.add(index.key_of(record, *adr), false)?;
                *splits += tree.split_count();
                index.root = tree.into_root();
            }
            info.nrows += 1;
            info.total_size += record.pack_size() as u64;
            dbinfo.with(*tblnum, info, storage)
        },
        Op::Remove { tblnum, adr, record } => {
            let mut info = table_of(dbinfo, *tblnum, storage)?;
            let present = match info.indexes.first() {
                Some(first) => {
                    Btree::new(first.root.clone(), &*store).contains(&first.key_of(record, *adr))?
                },
                None => false,
            };
            if !present {
                return Err(Error::RecordNotFound { adr: *adr });
            }
            for index in &mut info.indexes {
                let mut tree = Btree::new(index.root.clone(), &mut *store);
                tree.remove(&index.key_of(record, *adr))?;
                index.root = tree.into_root();
            }
            info.nrows = info.nrows.saturating_sub(1);
            info.total_size = info.total_size.saturating_sub(record.pack_size() as u64);
            dbinfo.with(*tblnum, info, storage)
        },
    }
}

/// Private state of an update transaction.
pub(crate) struct Updates {
    pub overlay: Overlay,
    pub dbinfo: PersistentTrie<TableInfo>,
    pub log: Vec<Op>,
    pub footprint: Footprint,
    pub writes: usize,
}

/// One row reached through an index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Index key: projected columns plus the row address.
    pub key: RecordBuf,
    /// Row address.
    pub adr: Adr,
    /// Row contents.
    pub record: RecordBuf,
}

/// A transaction.
///
/// Dropping an active transaction aborts it.
pub struct Transaction<'db> {
    db: &'db Database,
    num: u64,
    mode: TranMode,
    state: TranState,
    snapshot: Arc<State>,
    started: Instant,
    abort: Arc<OnceLock<LimitKind>>,
    updates: Option<Box<Updates>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(
        db: &'db Database,
        num: u64,
        mode: TranMode,
        snapshot: Arc<State>,
        abort: Arc<OnceLock<LimitKind>>,
    ) -> Self {
        let updates = (!mode.read_only).then(|| {
            Box::new(Updates {
                overlay: Overlay::new(
                    Arc::clone(db.shared_nodes()),
                    num,
                    db.config().max_node_size,
                ),
                dbinfo: snapshot.dbinfo.clone(),
                log: Vec::new(),
                footprint: Footprint::default(),
                writes: 0,
            })
        });
        Self {
            db,
            num,
            mode,
            state: TranState::Active,
            snapshot,
            started: Instant::now(),
            abort,
            updates,
        }
    }

    /// Transaction number.
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Mode flags.
    pub fn mode(&self) -> TranMode {
        self.mode
    }

    /// Lifecycle state.
    pub fn state(&self) -> &TranState {
        &self.state
    }

    /// Commit sequence of the snapshot this transaction reads.
    pub fn start_seq(&self) -> u64 {
        self.snapshot.commit_seq
    }

    fn dbinfo(&self) -> &PersistentTrie<TableInfo> {
        match &self.updates {
            Some(updates) => &updates.dbinfo,
            None => &self.snapshot.dbinfo,
        }
    }

    fn source(&self) -> &dyn NodeSource {
        match &self.updates {
            Some(updates) => &updates.overlay,
            None => self.db.shared_nodes().as_ref(),
        }
    }

    /// Fails unless the transaction can still run operations. Does not change
    /// state; see [`Transaction::check`].
    fn ensure_active(&self) -> Result<()> {
        if self.state != TranState::Active {
            return Err(Error::TransactionEnded { tran: self.num });
        }
        if let Some(kind) = self.abort.get() {
            return Err(self.limit_error(*kind));
        }
        if self.updates.is_some()
            && !self.mode.bulk
            && self.started.elapsed() > self.db.config().limits.max_update_duration
        {
            return Err(self.limit_error(LimitKind::Duration));
        }
        Ok(())
    }

    fn limit_error(&self, kind: LimitKind) -> Error {
        let limits = &self.db.config().limits;
        let reason = match kind {
            LimitKind::Duration => format!("open longer than {:?}", limits.max_update_duration),
            LimitKind::Writes => format!("more than {} writes", limits.max_writes),
            LimitKind::Outstanding => {
                format!("more than {} outstanding update transactions", limits.max_outstanding)
            },
            LimitKind::Exclusive => "exclusive mode held by another transaction".to_string(),
        };
        Error::LimitExceeded { tran: self.num, kind, reason }
    }

    /// Like [`Transaction::ensure_active`], but a limit violation also aborts.
    fn check(&mut self) -> Result<()> {
        let result = self.ensure_active();
        if let Err(e @ Error::LimitExceeded { .. }) = &result {
            tracing::warn!(tran = self.num, error = %e, "Transaction aborted by limit");
            self.db.count_limit_abort();
            self.finish(TranState::Aborted(e.to_string()));
        }
        result
    }

    /// Checks a write to `tblnum` is allowed and counts it.
    fn check_write(&mut self, tblnum: u32, records: usize) -> Result<()> {
        self.check()?;
        if self.mode.read_only {
            return Err(Error::ReadOnly { tran: self.num });
        }
        if tblnum == 0 {
            return Err(Error::NotPermitted {
                tran: self.num,
                reason: "table number 0 is reserved".to_string(),
            });
        }
        if tblnum <= SYSTEM_TABLE_LIMIT && !self.mode.schema {
            return Err(Error::NotPermitted {
                tran: self.num,
                reason: format!("system table {tblnum} requires a schema transaction"),
            });
        }
        let max_writes = self.db.config().limits.max_writes;
        let Some(updates) = self.updates.as_mut() else {
            return Err(Error::ReadOnly { tran: self.num });
        };
        if !self.mode.bulk && records > 0 && updates.writes + records > max_writes {
            let err = self.limit_error(LimitKind::Writes);
            tracing::warn!(tran = self.num, error = %err, "Transaction aborted by limit");
            self.db.count_limit_abort();
            self.finish(TranState::Aborted(err.to_string()));
            return Err(err);
        }
        updates.writes += records;
        Ok(())
    }

    /// Passes user-level errors through; anything else leaves the overlay in
    /// an unknown state and aborts.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let e = self.db.observe(e);
                let fatal = matches!(
                    e,
                    Error::Io { .. } | Error::StorageFault { .. } | Error::DatabaseCorrupt
                ) || e.is_corruption();
                if fatal {
                    self.finish(TranState::Aborted(e.to_string()));
                }
                Err(e)
            },
        }
    }

    fn apply(&mut self, op: Op) -> Result<()> {
        let db = self.db;
        let storage = db.index_storage();
        let Some(updates) = self.updates.as_mut() else {
            return Err(Error::ReadOnly { tran: self.num });
        };
        let mut splits = 0;
        let result =
            apply_op(&updates.dbinfo, &op, &mut updates.overlay, storage, self.num, &mut splits);
        match result {
            Ok(dbinfo) => {
                updates.dbinfo = dbinfo;
                updates.log.push(op);
                Ok(())
            },
            Err(e) => self.guard(Err(e)),
        }
    }

    fn updates_mut(&mut self) -> Result<&mut Updates> {
        let tran = self.num;
        self.updates.as_deref_mut().ok_or(Error::ReadOnly { tran })
    }

    /// Metadata of table `tblnum` as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Returns `TransactionEnded` after commit or abort.
    pub fn table(&self, tblnum: u32) -> Result<Option<TableInfo>> {
        self.ensure_active()?;
        self.dbinfo().get(tblnum, self.db.index_storage())
    }

    /// Every table, in directory order.
    ///
    /// # Errors
    ///
    /// Returns `TransactionEnded` after commit or abort.
    pub fn tables(&self) -> Result<Vec<TableInfo>> {
        self.ensure_active()?;
        let entries = self.dbinfo().entries(self.db.index_storage())?;
        Ok(entries.into_iter().map(|(_, info)| info).collect())
    }

    /// Creates table `tblnum`. The first index identifies rows and is
    /// required.
    ///
    /// # Errors
    ///
    /// Returns `TableExists` if the number is taken and `NotPermitted` for a
    /// table without indexes or a system table outside schema mode.
    pub fn create_table(
        &mut self,
        tblnum: u32,
        specs: impl IntoIterator<Item = IndexSpec>,
    ) -> Result<()> {
        self.check_write(tblnum, 0)?;
        let specs: Vec<IndexSpec> = specs.into_iter().collect();
        if specs.is_empty() {
            return Err(Error::NotPermitted {
                tran: self.num,
                reason: format!("table {tblnum} needs at least one index"),
            });
        }
        self.apply(Op::CreateTable { tblnum, specs })?;
        tracing::debug!(tran = self.num, tblnum, "Created table");
        Ok(())
    }

    /// Drops table `tblnum`. Its rows stay in the data file unreferenced.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if there is no such table.
    pub fn drop_table(&mut self, tblnum: u32) -> Result<()> {
        self.check_write(tblnum, 0)?;
        self.apply(Op::DropTable { tblnum })?;
        tracing::debug!(tran = self.num, tblnum, "Dropped table");
        Ok(())
    }

    /// Adds an index to an empty table, returning its position.
    ///
    /// # Errors
    ///
    /// Returns `NotPermitted` if the table has rows.
    pub fn create_index(&mut self, tblnum: u32, spec: IndexSpec) -> Result<usize> {
        self.check_write(tblnum, 0)?;
        self.apply(Op::CreateIndex { tblnum, spec })?;
        let info = self.table(tblnum)?.ok_or(Error::TableNotFound { table: tblnum })?;
        Ok(info.indexes.len() - 1)
    }

    /// Adds a row, returning its address.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if a unique index already holds the row's key.
    pub fn add_record(&mut self, tblnum: u32, record: &RecordBuf) -> Result<Adr> {
        self.check_write(tblnum, 1)?;
        let info = self.table(tblnum)?.ok_or(Error::TableNotFound { table: tblnum })?;
        let adr = match self.db.append_row(tblnum, record) {
            Ok(adr) => adr,
            Err(e) => return self.guard(Err(e)),
        };
        self.apply(Op::Add { tblnum, adr, record: record.clone() })?;
        self.note_add(&info, adr, record)?;
        Ok(adr)
    }

    /// Removes the row at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if `adr` is not a live row of `tblnum` in this
    /// transaction's view.
    pub fn remove_record(&mut self, tblnum: u32, adr: Adr) -> Result<()> {
        self.check_write(tblnum, 1)?;
        let record = self.row_of(tblnum, adr)?;
        let info = self.table(tblnum)?.ok_or(Error::TableNotFound { table: tblnum })?;
        self.apply(Op::Remove { tblnum, adr, record: record.clone() })?;
        self.note_remove(&info, adr, &record)
    }

    /// Replaces the row at `adr`, returning the new row's address.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if the old row is not live and `DuplicateKey`
    /// if the new row collides with a different row in a unique index.
    pub fn update_record(&mut self, tblnum: u32, adr: Adr, record: &RecordBuf) -> Result<Adr> {
        self.check_write(tblnum, 2)?;
        let old = self.row_of(tblnum, adr)?;
        let info = self.table(tblnum)?.ok_or(Error::TableNotFound { table: tblnum })?;
        if !self.visible(&info, adr, &old)? {
            return Err(Error::RecordNotFound { adr });
        }
        for (i, index) in info.indexes.iter().enumerate() {
            if !index.spec.unique {
                continue;
            }
            let tree = Btree::new(index.root.clone(), self.source());
            if let Some(found) = tree.first_with_prefix(&index.prefix_of(record))? {
                if key_adr(&found)? != adr {
                    return Err(Error::DuplicateKey { table: tblnum, index: i });
                }
            }
        }
        self.apply(Op::Remove { tblnum, adr, record: old.clone() })?;
        self.note_remove(&info, adr, &old)?;
        let new_adr = match self.db.append_row(tblnum, record) {
            Ok(new_adr) => new_adr,
            Err(e) => return self.guard(Err(e)),
        };
        let added = self.apply(Op::Add { tblnum, adr: new_adr, record: record.clone() });
        if let Err(e) = added {
            // The removal is already applied; the transaction cannot continue.
            self.finish(TranState::Aborted(e.to_string()));
            return Err(e);
        }
        self.note_add(&info, new_adr, record)?;
        Ok(new_adr)
    }

    /// Reads the live row at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if `adr` is not a live row in this
    /// transaction's view.
    pub fn get_record(&mut self, adr: Adr) -> Result<RecordBuf> {
        self.check()?;
        let (tblnum, record) = self.db.read_row_at(adr)?;
        let info = self.table(tblnum)?.ok_or(Error::RecordNotFound { adr })?;
        if !self.visible(&info, adr, &record)? {
            return Err(Error::RecordNotFound { adr });
        }
        if let Some(updates) = self.updates.as_mut() {
            updates.footprint.read_rows.insert(adr);
        }
        Ok(record)
    }

    /// Finds the row whose key in index `index` starts with `key`.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` or `IndexNotFound` for unknown targets.
    pub fn lookup(
        &mut self,
        tblnum: u32,
        index: usize,
        key: &RecordBuf,
    ) -> Result<Option<IndexEntry>> {
        self.check()?;
        let root = self.index_root(tblnum, index)?;
        self.note_range(tblnum, index, Some(key.clone()), Some(key.clone()));
        let tree = Btree::new(root, self.source());
        let Some(found) = tree.first_with_prefix(key)? else {
            return Ok(None);
        };
        let result = self.entry_for(found);
        self.guard(result).map(Some)
    }

    /// Iterator over index `index` from `from` (inclusive) to `to` (every key
    /// starting with `to` included). The whole range counts as read.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` or `IndexNotFound` for unknown targets.
    pub fn index_iter(
        &mut self,
        tblnum: u32,
        index: usize,
        from: Option<RecordBuf>,
        to: Option<RecordBuf>,
    ) -> Result<IndexIter> {
        self.check()?;
        self.index_root(tblnum, index)?;
        self.note_range(tblnum, index, from.clone(), to.clone());
        Ok(IndexIter { tblnum, index, iter: BtreeIter::new(from, to) })
    }

    /// Commits. Read-only transactions just end.
    ///
    /// On failure other than `CommitLockTimeout` the transaction is aborted.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when validation fails, `CommitLockTimeout` when the
    /// commit lock is busy, and `DatabaseCorrupt` once corruption was seen.
    pub fn commit(&mut self) -> Result<()> {
        self.check()?;
        let Some(mut updates) = self.updates.take() else {
            self.finish(TranState::Committed);
            return Ok(());
        };
        if updates.log.is_empty() {
            self.finish(TranState::Committed);
            return Ok(());
        }
        self.state = TranState::Committing;
        let start_seq = self.snapshot.commit_seq;
        let committed =
            self.db.commit_update(self.num, start_seq, self.mode, &self.abort, &mut updates);
        match committed {
            Ok(seq) => {
                tracing::debug!(tran = self.num, seq, ops = updates.log.len(), "Committed");
                self.finish(TranState::Committed);
                Ok(())
            },
            Err(e @ Error::CommitLockTimeout { .. }) => {
                self.state = TranState::Active;
                self.updates = Some(updates);
                Err(e)
            },
            Err(e) => {
                self.finish(TranState::Aborted(e.to_string()));
                Err(e)
            },
        }
    }

    /// Discards every change. A no-op once the transaction has ended.
    pub fn abort(&mut self) {
        if matches!(self.state, TranState::Active | TranState::Committing) {
            self.finish(TranState::Aborted("aborted by caller".to_string()));
        }
    }

    fn finish(&mut self, state: TranState) {
        self.state = state;
        self.updates = None;
        self.db.end_transaction(self.num);
    }

    fn row_of(&mut self, tblnum: u32, adr: Adr) -> Result<RecordBuf> {
        let (owner, record) = self.db.read_row_at(adr)?;
        if owner != tblnum {
            return Err(Error::RecordNotFound { adr });
        }
        Ok(record)
    }

    fn visible(&self, info: &TableInfo, adr: Adr, record: &RecordBuf) -> Result<bool> {
        let Some(first) = info.indexes.first() else {
            return Ok(false);
        };
        Btree::new(first.root.clone(), self.source()).contains(&first.key_of(record, adr))
    }

    fn index_root(&self, tblnum: u32, index: usize) -> Result<crate::btree::NodeRef> {
        let info = self.table(tblnum)?.ok_or(Error::TableNotFound { table: tblnum })?;
        info.indexes
            .get(index)
            .map(|i| i.root.clone())
            .ok_or(Error::IndexNotFound { table: tblnum, index })
    }

    fn entry_for(&self, key: RecordBuf) -> Result<IndexEntry> {
        let adr = key_adr(&key).map_err(|e| self.db.observe(e))?;
        let record = self.db.indexed_row(adr)?;
        Ok(IndexEntry { key, adr, record })
    }

    fn note_range(
        &mut self,
        tblnum: u32,
        index: usize,
        from: Option<RecordBuf>,
        to: Option<RecordBuf>,
    ) {
        if let Some(updates) = self.updates.as_mut() {
            updates.footprint.ranges.push(ReadRange { index: (tblnum, index), from, to });
        }
    }

    fn note_add(&mut self, info: &TableInfo, adr: Adr, record: &RecordBuf) -> Result<()> {
        let tblnum = info.tblnum;
        let footprint = &mut self.updates_mut()?.footprint;
        for (i, index) in info.indexes.iter().enumerate() {
            let id: IndexId = (tblnum, i);
            footprint.added_keys.entry(id).or_default().push(index.key_of(record, adr));
            if index.spec.unique {
                footprint.unique_prefixes.entry(id).or_default().insert(index.prefix_of(record));
            }
        }
        Ok(())
    }

    fn note_remove(&mut self, info: &TableInfo, adr: Adr, record: &RecordBuf) -> Result<()> {
        let tblnum = info.tblnum;
        let footprint = &mut self.updates_mut()?.footprint;
        footprint.removed_rows.insert(adr);
        for (i, index) in info.indexes.iter().enumerate() {
            footprint.removed_keys.entry((tblnum, i)).or_default().push(index.key_of(record, adr));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TranState::Active | TranState::Committing) {
            if self.updates.as_ref().is_some_and(|u| !u.log.is_empty()) {
                tracing::warn!(tran = self.num, "Transaction dropped without commit or abort");
            }
            self.finish(TranState::Aborted("dropped".to_string()));
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("num", &self.num)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("start_seq", &self.snapshot.commit_seq)
            .finish()
    }
}

/// Detached iterator over one index of one table.
///
/// Holds no borrow of its transaction; each step takes the transaction and
/// reseeks if the transaction's trees changed since the previous step.
#[derive(Debug)]
pub struct IndexIter {
    tblnum: u32,
    index: usize,
    iter: BtreeIter,
}

impl IndexIter {
    /// Next entry in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns `TransactionEnded` once `tran` has ended and `TableNotFound`
    /// if the table was dropped.
    pub fn next(&mut self, tran: &Transaction<'_>) -> Result<Option<IndexEntry>> {
        tran.ensure_active()?;
        let root = tran.index_root(self.tblnum, self.index)?;
        match self.iter.next(tran.source(), &root)? {
            Some(key) => tran.entry_for(key).map(Some),
            None => Ok(None),
        }
    }

    /// Previous entry in descending key order.
    ///
    /// # Errors
    ///
    /// As for [`IndexIter::next`].
    pub fn prev(&mut self, tran: &Transaction<'_>) -> Result<Option<IndexEntry>> {
        tran.ensure_active()?;
        let root = tran.index_root(self.tblnum, self.index)?;
        match self.iter.prev(tran.source(), &root)? {
            Some(key) => tran.entry_for(key).map(Some),
            None => Ok(None),
        }
    }

    /// Restarts from the range bounds.
    pub fn rewind(&mut self) {
        self.iter.rewind();
    }
}
