//! Isolation, conflict detection and resource limits across transactions and
//! threads.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use tarn_store::{
    ConflictKind, Database, DatabaseConfig, Error, IndexSpec, LimitKind, RecordBuf, RecordBuilder,
    TranLimits, TranMode, TranState,
};
use tarn_test_utils::{assert_eventually, init_tracing, strategies::key_field};

const TABLE: u32 = 10;

fn config_with(limits: TranLimits) -> DatabaseConfig {
    DatabaseConfig::builder()
        .chunk_size(1 << 20)
        .max_node_size(256)
        .checkpoint_interval(0)
        .limits(limits)
        .build()
        .unwrap()
}

fn config() -> DatabaseConfig {
    config_with(TranLimits::default())
}

fn row(n: u32, payload: &str) -> RecordBuf {
    RecordBuilder::new().field(key_field(n)).field(payload).build()
}

fn key(n: u32) -> RecordBuf {
    RecordBuilder::new().field(key_field(n)).build()
}

/// Table with `key(0)` and rows `0..count`.
fn setup(config: DatabaseConfig, count: u32) -> Database {
    let db = Database::open_in_memory(config).unwrap();
    let mut tran = db.update().unwrap();
    tran.create_table(TABLE, [IndexSpec::key(vec![0])]).unwrap();
    for n in 0..count {
        tran.add_record(TABLE, &row(n, "seed")).unwrap();
    }
    tran.commit().unwrap();
    drop(tran);
    db
}

fn conflict_kind(err: &Error) -> Option<ConflictKind> {
    match err {
        Error::Conflict { kind, .. } => Some(*kind),
        _ => None,
    }
}

// ============================================================================
// Isolation
// ============================================================================

#[test]
fn test_reader_does_not_see_later_commits() {
    init_tracing();
    let db = setup(config(), 10);
    let mut reader = db.read().unwrap();
    let seen = reader.lookup(TABLE, 0, &key(3)).unwrap().unwrap();

    let mut writer = db.update().unwrap();
    writer.add_record(TABLE, &row(100, "new")).unwrap();
    writer.remove_record(TABLE, seen.adr).unwrap();
    writer.commit().unwrap();

    assert!(reader.lookup(TABLE, 0, &key(100)).unwrap().is_none());
    assert_eq!(reader.get_record(seen.adr).unwrap(), row(3, "seed"));
    assert_eq!(reader.table(TABLE).unwrap().unwrap().nrows, 10);
    reader.commit().unwrap();

    let mut fresh = db.read().unwrap();
    assert!(fresh.lookup(TABLE, 0, &key(100)).unwrap().is_some());
    assert!(fresh.lookup(TABLE, 0, &key(3)).unwrap().is_none());
}

#[test]
fn test_update_sees_its_own_writes() {
    init_tracing();
    let db = setup(config(), 5);
    let mut tran = db.update().unwrap();
    let adr = tran.add_record(TABLE, &row(50, "mine")).unwrap();
    assert_eq!(tran.get_record(adr).unwrap(), row(50, "mine"));

    // An iterator opened before a write sees the write on its next step.
    let mut iter = tran.index_iter(TABLE, 0, None, None).unwrap();
    let first = iter.next(&tran).unwrap().unwrap();
    assert_eq!(first.record, row(0, "seed"));
    tran.add_record(TABLE, &row(2_000, "late")).unwrap();
    let mut rest = Vec::new();
    while let Some(entry) = iter.next(&tran).unwrap() {
        rest.push(entry.record);
    }
    assert_eq!(rest.len(), 6, "four seeds after the first, 50 and 2000");
    assert_eq!(rest.last().unwrap(), &row(2_000, "late"));
    tran.abort();
    assert_eq!(tran.state(), &TranState::Aborted("aborted by caller".to_string()));

    let mut check = db.read().unwrap();
    assert!(check.lookup(TABLE, 0, &key(50)).unwrap().is_none(), "abort discards writes");
}

// ============================================================================
// Conflicts
// ============================================================================

#[test]
fn test_concurrent_removes_conflict() {
    init_tracing();
    let db = setup(config(), 10);
    let adr = db.read().unwrap().lookup(TABLE, 0, &key(4)).unwrap().unwrap().adr;

    let mut first = db.update().unwrap();
    let mut second = db.update().unwrap();
    first.remove_record(TABLE, adr).unwrap();
    second.remove_record(TABLE, adr).unwrap();
    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert_eq!(conflict_kind(&err), Some(ConflictKind::WriteWrite), "{err:?}");
    assert!(err.is_conflict());
    assert!(matches!(second.state(), TranState::Aborted(_)));
    assert_eq!(db.stats().conflicts, 1);
}

#[test]
fn test_read_then_removed_conflicts() {
    init_tracing();
    let db = setup(config(), 10);
    let adr = db.read().unwrap().lookup(TABLE, 0, &key(7)).unwrap().unwrap().adr;

    let mut reader = db.update().unwrap();
    reader.get_record(adr).unwrap();
    reader.add_record(TABLE, &row(500, "depends on 7")).unwrap();

    let mut remover = db.update().unwrap();
    remover.remove_record(TABLE, adr).unwrap();
    remover.commit().unwrap();

    let err = reader.commit().unwrap_err();
    assert_eq!(conflict_kind(&err), Some(ConflictKind::WriteRead), "{err:?}");
}

#[test]
fn test_insert_into_scanned_range_is_phantom() {
    init_tracing();
    let db = setup(config(), 10);

    let mut scanner = db.update().unwrap();
    let mut iter = scanner.index_iter(TABLE, 0, Some(key(20)), Some(key(30))).unwrap();
    assert!(iter.next(&scanner).unwrap().is_none(), "range starts empty");
    scanner.add_record(TABLE, &row(1_000, "saw no rows in 20..=30")).unwrap();

    let mut inserter = db.update().unwrap();
    inserter.add_record(TABLE, &row(25, "phantom")).unwrap();
    inserter.commit().unwrap();

    let err = scanner.commit().unwrap_err();
    assert_eq!(conflict_kind(&err), Some(ConflictKind::Phantom), "{err:?}");
}

#[test]
fn test_insert_outside_scanned_range_commits() {
    init_tracing();
    let db = setup(config(), 10);

    let mut scanner = db.update().unwrap();
    let _ = scanner.index_iter(TABLE, 0, Some(key(20)), Some(key(30))).unwrap();
    scanner.add_record(TABLE, &row(1_000, "x")).unwrap();

    let mut inserter = db.update().unwrap();
    inserter.add_record(TABLE, &row(31, "outside")).unwrap();
    inserter.commit().unwrap();

    scanner.commit().unwrap();
    assert_eq!(db.commit_seq(), 3);
}

#[test]
fn test_same_unique_key_conflicts() {
    init_tracing();
    let db = setup(config(), 0);
    let mut a = db.update().unwrap();
    let mut b = db.update().unwrap();
    a.add_record(TABLE, &row(9, "a")).unwrap();
    b.add_record(TABLE, &row(9, "b")).unwrap();
    a.commit().unwrap();
    let err = b.commit().unwrap_err();
    assert_eq!(conflict_kind(&err), Some(ConflictKind::DuplicateKey), "{err:?}");
}

#[test]
fn test_bulk_skips_validation() {
    init_tracing();
    let db = setup(config(), 10);
    let adr = db.read().unwrap().lookup(TABLE, 0, &key(1)).unwrap().unwrap().adr;

    let mut bulk = db.begin(TranMode::BULK).unwrap();
    assert_eq!(db.stats().checkpoint_seq, 1, "bulk begin checkpoints");
    bulk.get_record(adr).unwrap();
    bulk.add_record(TABLE, &row(77, "bulk")).unwrap();

    let mut remover = db.update().unwrap();
    remover.remove_record(TABLE, adr).unwrap();
    remover.commit().unwrap();

    bulk.commit().unwrap();
    assert_eq!(db.stats().conflicts, 0);
}

#[test]
fn test_history_is_pruned() {
    init_tracing();
    let db = setup(config(), 0);
    let mut old = db.update().unwrap();
    for n in 0..3 {
        let mut tran = db.update().unwrap();
        tran.add_record(TABLE, &row(n, "x")).unwrap();
        tran.commit().unwrap();
    }
    assert_eq!(db.stats().retained_footprints, 3);
    old.abort();
    assert_eq!(db.stats().retained_footprints, 0);
}

#[test]
fn test_parallel_writers_with_retry() {
    init_tracing();
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 50;
    let db = setup(config(), 0);
    let retries = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..THREADS {
            let db = &db;
            let retries = &retries;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let n = t * 10_000 + i;
                    loop {
                        let mut tran = db.update().unwrap();
                        // Claiming the whole key range makes overlapping writers conflict.
                        let _ = tran.index_iter(TABLE, 0, None, None).unwrap();
                        tran.add_record(TABLE, &row(n, "p")).unwrap();
                        match tran.commit() {
                            Ok(()) => break,
                            Err(e) if e.is_conflict() => {
                                retries.fetch_add(1, Ordering::Relaxed);
                            },
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            });
        }
    });

    let expected = u64::from(THREADS * PER_THREAD);
    assert_eq!(db.tables().unwrap()[0].nrows, expected);
    assert_eq!(db.stats().commits, expected + 1);
    assert_eq!(db.stats().conflicts, retries.load(Ordering::Relaxed) as u64);
    db.persist().unwrap();
    assert!(db.check().is_clean());
}

#[test]
fn test_readers_run_during_writes() {
    init_tracing();
    let db = setup(config(), 100);
    let done = std::sync::atomic::AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for n in 100..300 {
                let mut tran = db.update().unwrap();
                tran.add_record(TABLE, &row(n, "w")).unwrap();
                tran.commit().unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                let mut tran = db.read().unwrap();
                let nrows = tran.table(TABLE).unwrap().unwrap().nrows;
                let mut iter = tran.index_iter(TABLE, 0, None, None).unwrap();
                let mut seen = 0;
                while iter.next(&tran).unwrap().is_some() {
                    seen += 1;
                }
                assert_eq!(seen, nrows, "a snapshot is internally consistent");
            }
        });
    });
    assert_eq!(db.tables().unwrap()[0].nrows, 300);
}

#[test]
fn test_check_runs_during_commits() {
    init_tracing();
    let config = DatabaseConfig::builder()
        .chunk_size(1 << 20)
        .max_node_size(256)
        .checkpoint_interval(1)
        .build()
        .unwrap();
    let db = setup(config, 0);
    let done = std::sync::atomic::AtomicBool::new(false);
    let writers = AtomicUsize::new(2);

    thread::scope(|s| {
        for w in 0..2u32 {
            let (db, done, writers) = (&db, &done, &writers);
            s.spawn(move || {
                for n in 0..100 {
                    let mut tran = db.update().unwrap();
                    tran.add_record(TABLE, &row(w * 1000 + n, "w")).unwrap();
                    tran.commit().unwrap();
                }
                if writers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    done.store(true, Ordering::SeqCst);
                }
            });
        }
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                let report = db.check();
                assert!(report.is_clean(), "{:?}", report.errors);
                for entry in db.data_scan() {
                    entry.unwrap();
                }
                for change in db.committed_records() {
                    change.unwrap();
                }
            }
        });
    });
    assert_eq!(db.tables().unwrap()[0].nrows, 200);
    assert!(db.check().is_clean());
}

// ============================================================================
// Modes and limits
// ============================================================================

#[test]
fn test_read_only_and_system_tables() {
    init_tracing();
    let db = setup(config(), 1);
    let mut read = db.read().unwrap();
    assert!(matches!(read.add_record(TABLE, &row(5, "x")).unwrap_err(), Error::ReadOnly { .. }));

    let mut tran = db.update().unwrap();
    let err = tran.create_table(2, [IndexSpec::key(vec![0])]).unwrap_err();
    assert!(matches!(err, Error::NotPermitted { .. }), "{err:?}");
    let err = tran.add_record(0, &row(1, "x")).unwrap_err();
    assert!(matches!(err, Error::NotPermitted { .. }), "{err:?}");
    tran.abort();

    let mut schema = db.begin(TranMode::SCHEMA).unwrap();
    schema.create_table(2, [IndexSpec::key(vec![0])]).unwrap();
    schema.add_record(2, &row(1, "catalog")).unwrap();
    schema.commit().unwrap();
    assert_eq!(db.tables().unwrap().len(), 2);
}

#[test]
fn test_ended_transaction_refuses_work() {
    init_tracing();
    let db = setup(config(), 1);
    let mut tran = db.update().unwrap();
    tran.add_record(TABLE, &row(2, "x")).unwrap();
    tran.commit().unwrap();
    assert_eq!(tran.state(), &TranState::Committed);
    let err = tran.add_record(TABLE, &row(3, "x")).unwrap_err();
    assert!(matches!(err, Error::TransactionEnded { .. }), "{err:?}");
    assert!(matches!(tran.commit().unwrap_err(), Error::TransactionEnded { .. }));
}

#[test]
fn test_write_limit_aborts() {
    init_tracing();
    let limits = TranLimits::builder().max_writes(5).build().unwrap();
    let db = setup(config_with(limits), 0);

    let mut tran = db.update().unwrap();
    for n in 0..5 {
        tran.add_record(TABLE, &row(n, "x")).unwrap();
    }
    let err = tran.add_record(TABLE, &row(5, "x")).unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { kind: LimitKind::Writes, .. }), "{err:?}");
    assert!(matches!(tran.state(), TranState::Aborted(_)));
    assert_eq!(db.stats().limit_aborts, 1);

    // Bulk transactions are exempt.
    let mut bulk = db.begin(TranMode::BULK).unwrap();
    for n in 0..20 {
        bulk.add_record(TABLE, &row(n, "bulk")).unwrap();
    }
    bulk.commit().unwrap();
    assert_eq!(db.tables().unwrap()[0].nrows, 20);
}

#[test]
fn test_duration_limit_aborts() {
    init_tracing();
    let limits =
        TranLimits::builder().max_update_duration(Duration::from_millis(30)).build().unwrap();
    let db = setup(config_with(limits), 0);

    let mut tran = db.update().unwrap();
    tran.add_record(TABLE, &row(1, "x")).unwrap();
    thread::sleep(Duration::from_millis(60));
    let err = tran.commit().unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { kind: LimitKind::Duration, .. }), "{err:?}");
    assert_eq!(db.commit_seq(), 1, "only the setup commit");

    // Read transactions have no duration limit.
    let mut read = db.read().unwrap();
    thread::sleep(Duration::from_millis(60));
    assert!(read.table(TABLE).unwrap().is_some());
}

#[test]
fn test_outstanding_limit_aborts_oldest() {
    init_tracing();
    let limits = TranLimits::builder().max_outstanding(2).build().unwrap();
    let db = setup(config_with(limits), 0);

    let mut oldest = db.update().unwrap();
    let mut middle = db.update().unwrap();
    let mut newest = db.update().unwrap();
    let _reader = db.read().unwrap();

    let err = oldest.add_record(TABLE, &row(1, "x")).unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { kind: LimitKind::Outstanding, .. }), "{err:?}");
    middle.add_record(TABLE, &row(2, "x")).unwrap();
    newest.add_record(TABLE, &row(3, "x")).unwrap();
    middle.commit().unwrap();
    newest.commit().unwrap();
    assert_eq!(db.stats().forced_aborts, 1);
}

#[test]
fn test_idle_expired_update_does_not_pin_history() {
    init_tracing();
    let limits =
        TranLimits::builder().max_update_duration(Duration::from_millis(100)).build().unwrap();
    let db = setup(config_with(limits), 0);

    let mut idle = db.update().unwrap();
    thread::sleep(Duration::from_millis(200));
    for n in 0..200 {
        let mut tran = db.update().unwrap();
        tran.add_record(TABLE, &row(n, "w")).unwrap();
        tran.commit().unwrap();
    }

    let stats = db.stats();
    assert_eq!(stats.forced_aborts, 1);
    assert_eq!(stats.retained_footprints, 0);
    assert_eq!(stats.outstanding, 0, "the idle transaction is no longer registered");

    let err = idle.add_record(TABLE, &row(1000, "late")).unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { kind: LimitKind::Duration, .. }), "{err:?}");
    assert!(idle.commit().is_err());
    assert_eq!(db.tables().unwrap()[0].nrows, 200);
}

#[test]
fn test_schema_mode_is_exclusive() {
    init_tracing();
    let db = setup(config(), 0);
    let mut schema = db.begin(TranMode::SCHEMA).unwrap();
    let err = db.update().unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { kind: LimitKind::Exclusive, .. }), "{err:?}");
    assert!(db.read().is_ok(), "readers are not blocked");

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            // Retries until the schema transaction ends.
            loop {
                match db.update() {
                    Ok(mut tran) => {
                        tran.create_table(11, [IndexSpec::key(vec![0])]).unwrap();
                        tran.commit().unwrap();
                        return;
                    },
                    Err(Error::LimitExceeded { kind: LimitKind::Exclusive, .. }) => {
                        thread::sleep(Duration::from_millis(2));
                    },
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
        schema.create_table(12, [IndexSpec::key(vec![0])]).unwrap();
        assert!(assert_eventually(Duration::from_millis(100), || db.stats().limit_aborts > 1));
        schema.commit().unwrap();
        waiter.join().unwrap();
    });
    assert_eq!(db.tables().unwrap().len(), 3);
}
