//! Transaction numbering, registry, resource limits and commit validation.
//!
//! Snapshot isolation comes from the published state: a transaction sees the
//! state it loaded at begin plus its own overlay. Serializability of update
//! transactions is checked optimistically at commit, against the footprints
//! of the transactions that committed after it began:
//!
//! - write-write: both removed (or updated) the same row
//! - write-read: a committed removal hit a row or key range this one read
//! - phantom: a committed insertion landed in a key range this one read
//! - duplicate-key: both added the same value to a unique index
//!
//! Committed footprints are kept only as long as an active update
//! transaction may still need them. Update transactions that outlive
//! `max_update_duration` are aborted by the manager at the next begin, commit
//! or validation, so an idle transaction cannot pin the history.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    config::TranLimits,
    error::{ConflictKind, Error, LimitKind, Result},
    record::{Record, RecordBuf},
    storage::Adr,
    tran::TranMode,
};

/// Table number and index position.
pub(crate) type IndexId = (u32, usize);

/// A key range read through an index. `from` is inclusive, `to` is
/// prefix-inclusive, matching iterator bounds.
#[derive(Debug, Clone)]
pub(crate) struct ReadRange {
    pub index: IndexId,
    pub from: Option<RecordBuf>,
    pub to: Option<RecordBuf>,
}

impl ReadRange {
    pub fn contains(&self, key: &RecordBuf) -> bool {
        self.from.as_ref().is_none_or(|from| key >= from)
            && self.to.as_ref().is_none_or(|to| key.prefix_cmp(to).is_le())
    }
}

/// What a transaction read and wrote.
#[derive(Debug, Default)]
pub(crate) struct Footprint {
    pub removed_rows: HashSet<Adr>,
    pub read_rows: HashSet<Adr>,
    pub added_keys: HashMap<IndexId, Vec<RecordBuf>>,
    pub removed_keys: HashMap<IndexId, Vec<RecordBuf>>,
    /// Address-less keys added to unique indexes.
    pub unique_prefixes: HashMap<IndexId, HashSet<RecordBuf>>,
    pub ranges: Vec<ReadRange>,
}

impl Footprint {
    pub fn is_empty(&self) -> bool {
        self.removed_rows.is_empty() && self.added_keys.is_empty() && self.removed_keys.is_empty()
    }

    /// Drops the read side, keeping what later validations compare against.
    fn into_writes(mut self) -> Self {
        self.read_rows = HashSet::new();
        self.ranges = Vec::new();
        self
    }

    /// Checks this (uncommitted) footprint against one committed after it began.
    fn conflict_with(&self, other: &Committed) -> Option<(ConflictKind, String)> {
        let theirs = &other.writes;
        if let Some(adr) = self.removed_rows.iter().find(|adr| theirs.removed_rows.contains(adr)) {
            return Some((
                ConflictKind::WriteWrite,
                format!("row {adr} also removed by transaction {}", other.tran),
            ));
        }
        if let Some(adr) = self.read_rows.iter().find(|adr| theirs.removed_rows.contains(adr)) {
            return Some((
                ConflictKind::WriteRead,
                format!("row {adr} read here was removed by transaction {}", other.tran),
            ));
        }
        for range in &self.ranges {
            let hit = |keys: &HashMap<IndexId, Vec<RecordBuf>>| {
                keys.get(&range.index).is_some_and(|keys| keys.iter().any(|k| range.contains(k)))
            };
            let (table, index) = range.index;
            if hit(&theirs.removed_keys) {
                return Some((
                    ConflictKind::WriteRead,
                    format!(
                        "transaction {} removed a key read here from table {table} index {index}",
                        other.tran
                    ),
                ));
            }
            if hit(&theirs.added_keys) {
                return Some((
                    ConflictKind::Phantom,
                    format!(
                        "transaction {} added a key inside a range read here from table {table} \
                         index {index}",
                        other.tran
                    ),
                ));
            }
        }
        for (id, prefixes) in &self.unique_prefixes {
            if theirs.unique_prefixes.get(id).is_some_and(|t| !t.is_disjoint(prefixes)) {
                return Some((
                    ConflictKind::DuplicateKey,
                    format!(
                        "transaction {} added the same unique key to table {} index {}",
                        other.tran, id.0, id.1
                    ),
                ));
            }
        }
        None
    }
}

/// Footprint of a committed transaction.
#[derive(Debug)]
struct Committed {
    seq: u64,
    tran: u64,
    writes: Footprint,
}

/// Handle the manager hands to a new transaction.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub num: u64,
    pub start_seq: u64,
    /// Set by the manager when it aborts the transaction.
    pub abort: Arc<OnceLock<LimitKind>>,
}

#[derive(Debug)]
struct Active {
    start_seq: u64,
    update: bool,
    /// Subject to `max_update_duration`.
    timed: bool,
    started: Instant,
    abort: Arc<OnceLock<LimitKind>>,
}

#[derive(Debug, Default)]
struct Registry {
    active: BTreeMap<u64, Active>,
    exclusive: Option<u64>,
    history: VecDeque<Committed>,
}

impl Registry {
    fn updates(&self) -> usize {
        self.active.values().filter(|a| a.update).count()
    }

    /// Drops committed footprints no active update transaction can conflict with.
    fn prune(&mut self) {
        let horizon = self.active.values().filter(|a| a.update).map(|a| a.start_seq).min();
        match horizon {
            Some(horizon) => {
                while self.history.front().is_some_and(|c| c.seq <= horizon) {
                    self.history.pop_front();
                }
            },
            None => self.history.clear(),
        }
    }
}

/// Transaction registry and validator.
pub(crate) struct TranManager {
    limits: TranLimits,
    next: AtomicU64,
    registry: Mutex<Registry>,
    forced_aborts: AtomicU64,
}

impl TranManager {
    pub fn new(limits: TranLimits) -> Self {
        Self {
            limits,
            next: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            forced_aborts: AtomicU64::new(0),
        }
    }

    /// Registers a transaction. `snapshot` runs under the registry lock and
    /// returns the commit sequence the transaction starts from, so no commit
    /// can slip between choosing the snapshot and registering.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` with kind `Exclusive` when an update is
    /// requested while a schema transaction holds exclusive mode.
    pub fn begin(&self, mode: TranMode, snapshot: impl FnOnce() -> u64) -> Result<Ticket> {
        let mut registry = self.registry.lock();
        self.expire(&mut registry);
        let update = !mode.is_read_only();
        if update {
            if let Some(holder) = registry.exclusive {
                return Err(Error::LimitExceeded {
                    tran: self.next.load(Ordering::Relaxed),
                    kind: LimitKind::Exclusive,
                    reason: format!("transaction {holder} holds exclusive mode"),
                });
            }
            while registry.updates() >= self.limits.max_outstanding {
                let Some(oldest) =
                    registry.active.iter().find(|(_, a)| a.update).map(|(num, _)| *num)
                else {
                    break;
                };
                self.force_abort(&mut registry, oldest, LimitKind::Outstanding);
            }
        }
        let num = self.next.fetch_add(1, Ordering::Relaxed);
        let start_seq = snapshot();
        let abort = Arc::new(OnceLock::new());
        if mode.is_schema() {
            registry.exclusive = Some(num);
        }
        registry.active.insert(num, Active {
            start_seq,
            update,
            timed: update && !mode.is_bulk(),
            started: Instant::now(),
            abort: Arc::clone(&abort),
        });
        Ok(Ticket { num, start_seq, abort })
    }

    /// Unregisters `num` and flags it aborted with `kind`.
    fn force_abort(&self, registry: &mut Registry, num: u64, kind: LimitKind) {
        let Some(victim) = registry.active.remove(&num) else {
            return;
        };
        let _ = victim.abort.set(kind);
        if registry.exclusive == Some(num) {
            registry.exclusive = None;
        }
        self.forced_aborts.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(tran = num, %kind, "Force-aborted update transaction");
    }

    /// Aborts every timed update transaction open longer than
    /// `max_update_duration`, then prunes history they were holding.
    fn expire(&self, registry: &mut Registry) {
        let max = self.limits.max_update_duration;
        let expired: Vec<u64> = registry
            .active
            .iter()
            .filter(|(_, a)| a.timed && a.started.elapsed() > max)
            .map(|(num, _)| *num)
            .collect();
        if expired.is_empty() {
            return;
        }
        for num in expired {
            self.force_abort(registry, num, LimitKind::Duration);
        }
        registry.prune();
    }

    /// Unregisters a transaction that committed or aborted.
    pub fn end(&self, num: u64) {
        let mut registry = self.registry.lock();
        registry.active.remove(&num);
        if registry.exclusive == Some(num) {
            registry.exclusive = None;
        }
        registry.prune();
    }

    /// Admits `tran` to commit. The transaction must still be registered and
    /// its `abort` flag unset. Unless `footprint` is `None` (bulk mode) it is
    /// checked against every transaction committed after `start_seq`.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` when the manager aborted the transaction and
    /// `Error::Conflict` describing the first conflict found.
    pub fn validate(
        &self,
        tran: u64,
        start_seq: u64,
        abort: &OnceLock<LimitKind>,
        footprint: Option<&Footprint>,
    ) -> Result<()> {
        let mut registry = self.registry.lock();
        self.expire(&mut registry);
        if let Some(kind) = abort.get() {
            return Err(Error::LimitExceeded {
                tran,
                kind: *kind,
                reason: format!("aborted by the transaction manager ({kind})"),
            });
        }
        if !registry.active.contains_key(&tran) {
            return Err(Error::TransactionEnded { tran });
        }
        let Some(footprint) = footprint else {
            return Ok(());
        };
        for committed in registry.history.iter().filter(|c| c.seq > start_seq) {
            if let Some((kind, reason)) = footprint.conflict_with(committed) {
                tracing::debug!(tran, against = committed.tran, %kind, "Commit conflict");
                return Err(Error::Conflict { tran, kind, reason });
            }
        }
        Ok(())
    }

    /// Records a commit for later validations and unregisters its transaction.
    pub fn committed(&self, tran: u64, seq: u64, footprint: Footprint) {
        let mut registry = self.registry.lock();
        registry.active.remove(&tran);
        if registry.exclusive == Some(tran) {
            registry.exclusive = None;
        }
        registry.history.push_back(Committed { seq, tran, writes: footprint.into_writes() });
        self.expire(&mut registry);
        registry.prune();
    }

    /// Active transactions (read and update).
    pub fn outstanding(&self) -> usize {
        self.registry.lock().active.len()
    }

    /// Committed footprints currently retained.
    pub fn history_len(&self) -> usize {
        self.registry.lock().history.len()
    }

    /// Transactions aborted by the manager since creation.
    pub fn forced_aborts(&self) -> u64 {
        self.forced_aborts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TranManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranManager")
            .field("limits", &self.limits)
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}
