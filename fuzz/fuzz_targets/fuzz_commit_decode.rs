//! Fuzz target for commit records and the index file header.
//!
//! Neither decoder may panic on arbitrary bytes, and whatever they accept
//! must survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;

use tarn_store::{CommitRecord, CommitSlot, DatabaseHeader};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let payload = &data[1..];
    match data[0] % 3 {
        0 => fuzz_commit_record(payload),
        1 => fuzz_slot(payload),
        _ => fuzz_header(payload),
    }
});

fn fuzz_commit_record(data: &[u8]) {
    let Ok((record, _checksum)) = CommitRecord::decode(data) else {
        return;
    };
    // Tag, tran, seq, two counts, addresses, checksum.
    let expected = 1 + 8 + 8 + 4 + 4 + 4 * (record.adds.len() + record.removes.len()) + 8;
    assert_eq!(data.len(), expected, "accepted commit record with stray bytes");
}

fn fuzz_slot(data: &[u8]) {
    let Some(slot) = CommitSlot::from_bytes(data) else {
        return;
    };
    let bytes = slot.to_bytes();
    assert_eq!(CommitSlot::from_bytes(&bytes), Some(slot), "slot changed on round trip");
}

fn fuzz_header(data: &[u8]) {
    let Ok(mut header) = DatabaseHeader::from_bytes(data) else {
        return;
    };
    let primary = header.primary_index();
    assert!(primary < 2);
    assert_eq!(header.secondary_index(), 1 - primary);
    // Choosing a slot never panics, whatever the slot contents.
    let _ = header.choose();

    let bytes = header.to_bytes();
    let again = DatabaseHeader::from_bytes(&bytes).expect("encoded header must decode");
    assert_eq!(again.primary_index(), primary);
    assert_eq!(again.recovery_required(), header.recovery_required());
    for i in 0..2 {
        assert_eq!(again.slot(i), header.slot(i));
    }

    header.set_recovery_required(!header.recovery_required());
    header.flip();
    assert_eq!(header.primary_index(), 1 - primary);
}
