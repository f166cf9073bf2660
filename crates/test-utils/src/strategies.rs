//! Proptest strategies for records and table workloads.
//!
//! Records are generated as plain field lists so this crate stays independent
//! of the store; tests build them with `RecordBuilder::from_fields`.
//!
//! # Usage
//!
//! ```no_run
//! use tarn_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_table_ops(64)) {
//!         // apply ops to a table and to a model, then compare
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Encodes a number as a field that sorts in numeric order.
#[must_use]
pub fn key_field(n: u32) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

/// Generates a field of 0-47 random bytes, including the empty field.
pub fn arb_field() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..48)
}

/// Generates a field of up to 600 bytes, large enough to span record size classes.
pub fn arb_large_field() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..600)
}

/// Generates a record of 0-7 fields.
pub fn arb_fields() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(arb_field(), 0..8)
}

/// Generates a record whose fields vary widely in size.
pub fn arb_mixed_fields() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(prop_oneof![3 => arb_field(), 1 => arb_large_field()], 0..6)
}

/// One step of a single-table workload keyed by a small number.
///
/// Keys are drawn from a narrow range so inserts collide and deletes and
/// updates usually find their target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    /// Add a row `(key, value)`.
    Insert {
        /// Key column.
        key: u32,
        /// Payload column.
        value: Vec<u8>,
    },
    /// Remove the row with this key.
    Delete {
        /// Key column.
        key: u32,
    },
    /// Replace the payload of the row with this key.
    Update {
        /// Key column.
        key: u32,
        /// New payload column.
        value: Vec<u8>,
    },
    /// Commit the open transaction and start another.
    Commit,
}

/// Generates a single workload step with keys in `0..64`.
pub fn arb_table_op() -> impl Strategy<Value = TableOp> {
    let key = 0u32..64;
    prop_oneof![
        4 => (key.clone(), arb_field()).prop_map(|(key, value)| TableOp::Insert { key, value }),
        2 => key.clone().prop_map(|key| TableOp::Delete { key }),
        2 => (key, arb_field()).prop_map(|(key, value)| TableOp::Update { key, value }),
        1 => Just(TableOp::Commit),
    ]
}

/// Generates a workload of up to `max_len` steps.
pub fn arb_table_ops(max_len: usize) -> impl Strategy<Value = Vec<TableOp>> {
    proptest::collection::vec(arb_table_op(), 1..=max_len.max(1))
}
