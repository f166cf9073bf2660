//! End-to-end tests through the public API against on-disk databases.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use tarn_store::{
    CommittedChange, Database, DatabaseConfig, Error, IndexSpec, OpenCheck, Record, RecordBuf,
    RecordBuilder, Transaction,
};
use tarn_test_utils::{TestDir, init_tracing, strategies::key_field};

const PEOPLE: u32 = 20;
const ROWS: u32 = 1000;
const GROUPS: u32 = 37;

fn config() -> DatabaseConfig {
    DatabaseConfig::builder().chunk_size(1 << 20).max_node_size(512).build().unwrap()
}

/// Row `(a, b)` with `a = n` and `b = n mod GROUPS`.
fn person(n: u32) -> RecordBuf {
    RecordBuilder::new().field(key_field(n)).field(key_field(n % GROUPS)).build()
}

fn prefix(fields: &[u32]) -> RecordBuf {
    RecordBuilder::from_fields(fields.iter().map(|n| key_field(*n))).build()
}

fn field_u32(record: &RecordBuf, i: usize) -> u32 {
    u32::from_be_bytes(record.get(i).try_into().unwrap())
}

fn collect_forward(tran: &mut Transaction<'_>, index: usize) -> Vec<RecordBuf> {
    let mut iter = tran.index_iter(PEOPLE, index, None, None).unwrap();
    let mut rows = Vec::new();
    while let Some(entry) = iter.next(tran).unwrap() {
        rows.push(entry.record);
    }
    rows
}

fn collect_backward(tran: &mut Transaction<'_>, index: usize) -> Vec<RecordBuf> {
    let mut iter = tran.index_iter(PEOPLE, index, None, None).unwrap();
    let mut rows = Vec::new();
    while let Some(entry) = iter.prev(tran).unwrap() {
        rows.push(entry.record);
    }
    rows
}

fn load(db: &Database) {
    let mut tran = db.update().unwrap();
    tran.create_table(PEOPLE, [IndexSpec::key(vec![0]), IndexSpec::index(vec![1, 0])]).unwrap();
    // Insert out of key order so both trees split in the middle.
    for i in 0..ROWS {
        let n = (i * 7919) % ROWS;
        tran.add_record(PEOPLE, &person(n)).unwrap();
    }
    tran.commit().unwrap();
}

#[test]
fn test_two_index_table_survives_reopen() {
    init_tracing();
    let dir = TestDir::new();
    {
        let db = Database::open(dir.path(), config()).unwrap();
        load(&db);
        db.close().unwrap();
    }

    let db = Database::open(dir.path(), config()).unwrap();
    assert_eq!(db.open_check(), OpenCheck::Fast);
    let mut tran = db.read().unwrap();
    let info = tran.table(PEOPLE).unwrap().unwrap();
    assert_eq!(info.nrows, u64::from(ROWS));
    assert_eq!(info.indexes.len(), 2);

    // Index 0 orders by a.
    let by_a = collect_forward(&mut tran, 0);
    let expected: Vec<RecordBuf> = (0..ROWS).map(person).collect();
    assert_eq!(by_a, expected);

    // Index 1 orders by (b, a).
    let by_b = collect_forward(&mut tran, 1);
    let mut expected_b: Vec<(u32, u32)> = (0..ROWS).map(|n| (n % GROUPS, n)).collect();
    expected_b.sort_unstable();
    let got_b: Vec<(u32, u32)> =
        by_b.iter().map(|r| (field_u32(r, 1), field_u32(r, 0))).collect();
    assert_eq!(got_b, expected_b);

    // Backward iteration is the exact reverse.
    let mut reversed = collect_backward(&mut tran, 1);
    reversed.reverse();
    assert_eq!(reversed, by_b);

    // Point lookups through both indexes.
    let found = tran.lookup(PEOPLE, 0, &prefix(&[777])).unwrap().unwrap();
    assert_eq!(found.record, person(777));
    let found = tran.lookup(PEOPLE, 1, &prefix(&[777 % GROUPS, 777])).unwrap().unwrap();
    assert_eq!(found.record, person(777));
    assert!(tran.lookup(PEOPLE, 0, &prefix(&[ROWS])).unwrap().is_none());

    assert!(db.check().is_clean());
}

#[test]
fn test_prefix_range_iteration() {
    init_tracing();
    let db = Database::open_in_memory(config()).unwrap();
    load(&db);

    let mut tran = db.read().unwrap();
    let mut iter = tran.index_iter(PEOPLE, 1, Some(prefix(&[5])), Some(prefix(&[5]))).unwrap();
    let mut a_values = Vec::new();
    while let Some(entry) = iter.next(&tran).unwrap() {
        assert_eq!(field_u32(&entry.record, 1), 5);
        a_values.push(field_u32(&entry.record, 0));
    }
    let expected: Vec<u32> = (0..ROWS).filter(|n| n % GROUPS == 5).collect();
    assert_eq!(a_values, expected);

    // Rewind restarts at the lower bound.
    iter.rewind();
    let first = iter.next(&tran).unwrap().unwrap();
    assert_eq!(field_u32(&first.record, 0), 5);

    // An upper-bounded range on the unique index.
    let mut iter = tran.index_iter(PEOPLE, 0, Some(prefix(&[990])), None).unwrap();
    let mut count = 0;
    while iter.next(&tran).unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 10);
}

#[test]
fn test_remove_and_update_persist() {
    init_tracing();
    let dir = TestDir::new();
    let (removed, kept, moved) = {
        let db = Database::open(dir.path(), config()).unwrap();
        load(&db);

        let mut tran = db.update().unwrap();
        let victim = tran.lookup(PEOPLE, 0, &prefix(&[10])).unwrap().unwrap();
        tran.remove_record(PEOPLE, victim.adr).unwrap();
        let removed = victim.adr;
        let target = tran.lookup(PEOPLE, 0, &prefix(&[11])).unwrap().unwrap();
        let replacement =
            RecordBuilder::new().field(key_field(11)).field(key_field(GROUPS + 1)).build();
        let moved = tran.update_record(PEOPLE, target.adr, &replacement).unwrap();
        let kept = tran.lookup(PEOPLE, 0, &prefix(&[12])).unwrap().unwrap().adr;
        tran.commit().unwrap();
        drop(tran);
        db.close().unwrap();
        (removed, kept, moved)
    };

    let db = Database::open(dir.path(), config()).unwrap();
    let mut tran = db.read().unwrap();
    assert!(tran.lookup(PEOPLE, 0, &prefix(&[10])).unwrap().is_none());
    let updated = tran.get_record(moved).unwrap();
    assert_eq!(field_u32(&updated, 1), GROUPS + 1);
    assert!(tran.lookup(PEOPLE, 1, &prefix(&[GROUPS + 1])).unwrap().is_some());
    assert_eq!(tran.get_record(kept).unwrap(), person(12));
    assert_eq!(tran.table(PEOPLE).unwrap().unwrap().nrows, u64::from(ROWS - 1));

    // Removed rows are gone from transactions but still readable as raw data.
    assert!(matches!(tran.get_record(removed).unwrap_err(), Error::RecordNotFound { .. }));
    let (tblnum, raw) = db.read_record(removed).unwrap();
    assert_eq!(tblnum, PEOPLE);
    assert_eq!(raw, person(10));
    assert!(db.check().is_clean());
}

#[test]
fn test_schema_changes() {
    init_tracing();
    let db = Database::open_in_memory(config()).unwrap();
    let mut tran = db.update().unwrap();
    tran.create_table(30, [IndexSpec::key(vec![0])]).unwrap();
    assert_eq!(tran.create_index(30, IndexSpec::index(vec![1])).unwrap(), 1);
    assert!(matches!(
        tran.create_table(30, [IndexSpec::key(vec![0])]).unwrap_err(),
        Error::TableExists { table: 30 }
    ));
    assert!(matches!(tran.create_table(31, []).unwrap_err(), Error::NotPermitted { .. }));
    tran.add_record(30, &person(1)).unwrap();
    assert!(matches!(
        tran.create_index(30, IndexSpec::index(vec![1, 0])).unwrap_err(),
        Error::NotPermitted { .. }
    ));
    tran.commit().unwrap();
    let version = db.schema_version();
    assert_eq!(version, 1);

    let mut tran = db.update().unwrap();
    tran.drop_table(30).unwrap();
    assert!(tran.table(30).unwrap().is_none());
    assert!(matches!(tran.drop_table(30).unwrap_err(), Error::TableNotFound { table: 30 }));
    tran.commit().unwrap();
    assert_eq!(db.schema_version(), version + 1);
    assert!(db.tables().unwrap().is_empty());
    assert!(db.check().is_clean(), "dropped rows do not upset the check");
}

#[test]
fn test_unique_index_rejects_duplicates() {
    init_tracing();
    let db = Database::open_in_memory(config()).unwrap();
    let mut tran = db.update().unwrap();
    tran.create_table(PEOPLE, [IndexSpec::key(vec![0]), IndexSpec::index(vec![1, 0])]).unwrap();
    tran.add_record(PEOPLE, &person(1)).unwrap();
    let err = tran.add_record(PEOPLE, &person(1)).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { table: PEOPLE, index: 0 }), "{err:?}");
    // The failed add changed nothing.
    assert_eq!(tran.table(PEOPLE).unwrap().unwrap().nrows, 1);
    // Non-unique index accepts repeated values of b.
    tran.add_record(PEOPLE, &person(1 + GROUPS)).unwrap();
    tran.commit().unwrap();
    assert_eq!(db.tables().unwrap()[0].nrows, 2);
}

#[test]
fn test_oversized_row_is_refused() {
    init_tracing();
    let db = Database::open_in_memory(config()).unwrap();
    let mut tran = db.update().unwrap();
    tran.create_table(PEOPLE, [IndexSpec::key(vec![0])]).unwrap();
    let huge = RecordBuilder::new().field(key_field(1)).field(vec![7u8; 2 << 20]).build();
    let err = tran.add_record(PEOPLE, &huge).unwrap_err();
    assert!(matches!(err, Error::TooLarge { .. }), "{err:?}");
    // The transaction is still usable.
    tran.add_record(PEOPLE, &person(1)).unwrap();
    tran.commit().unwrap();
    assert_eq!(db.tables().unwrap()[0].nrows, 1);
}

#[test]
fn test_persist_twice_appends_nothing() {
    init_tracing();
    let dir = TestDir::new();
    let db = Database::open(dir.path(), config()).unwrap();
    load(&db);
    let before = db.stats();
    db.persist().unwrap();
    db.persist().unwrap();
    let after = db.stats();
    assert_eq!(after.index_size, before.index_size);
    assert_eq!(after.data_size, before.data_size);
    assert_eq!(after.checkpoints, before.checkpoints);
}

#[test]
fn test_commit_history_is_scannable() {
    init_tracing();
    let db = Database::open_in_memory(config()).unwrap();
    load(&db);
    let mut tran = db.update().unwrap();
    let victim = tran.lookup(PEOPLE, 0, &prefix(&[3])).unwrap().unwrap();
    tran.remove_record(PEOPLE, victim.adr).unwrap();
    tran.commit().unwrap();

    let changes: Vec<CommittedChange> =
        db.committed_records().collect::<tarn_store::Result<_>>().unwrap();
    assert_eq!(changes.len(), ROWS as usize + 1);
    assert!(matches!(changes[0], CommittedChange::Added { seq: 1, tblnum: PEOPLE, .. }));
    assert!(matches!(
        changes.last(),
        Some(CommittedChange::Removed { seq: 2, adr }) if *adr == victim.adr
    ));
    let rows = db
        .data_scan()
        .filter(|entry| matches!(entry, Ok(tarn_store::DataEntry::Row { .. })))
        .count();
    assert_eq!(rows, ROWS as usize);
}
