//! Fuzz target for packed record parsing.
//!
//! `BufRecord::new` and `RecordBuf::from_packed` must reject malformed input
//! without panicking. Anything they accept must repack to the same fields.

#![no_main]

use libfuzzer_sys::fuzz_target;

use tarn_store::{BufRecord, Record, RecordBuf, RecordBuilder};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    match data[0] % 2 {
        0 => fuzz_view(&data[1..]),
        _ => fuzz_owned(&data[1..]),
    }
});

fn fuzz_view(data: &[u8]) {
    let Ok(view) = BufRecord::new(data) else {
        return;
    };
    assert!(view.as_bytes().len() <= data.len());
    let fields: Vec<&[u8]> = (0..view.size()).map(|i| view.get(i)).collect();
    let repacked = RecordBuilder::from_fields(fields.iter().copied()).build();
    assert_eq!(repacked.size(), view.size(), "field count changed on repack");
    for (i, field) in fields.iter().enumerate() {
        assert_eq!(repacked.get(i), *field, "field {i} changed on repack");
    }
}

fn fuzz_owned(data: &[u8]) {
    let Ok(record) = RecordBuf::from_packed(data.to_vec()) else {
        return;
    };
    assert_eq!(record.as_bytes(), data);
    let view = BufRecord::new(record.as_bytes()).expect("accepted bytes must parse again");
    assert_eq!(view.size(), record.size());
    for i in 0..record.size() {
        assert_eq!(view.get(i), record.get(i));
        assert_eq!(record.get(i).len(), view.field_offset(i + 1) - view.field_offset(i));
    }
}
