//! Shared test utilities for tarn crates.
//!
//! - [`TestDir`] - Scratch database directory with file paths and snapshots
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`CrashInjector`] - Deterministic crash points for checkpoint recovery tests
//! - [`corrupt`] - Damage database files in place
//! - [`strategies`] - Proptest generators for records and table workloads
//! - [`init_tracing`] - Route `tracing` output to the test harness

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::{DATA_FILE_NAME, INDEX_FILE_NAME, TestDir};

mod assertions;
pub use assertions::assert_eventually;

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

pub mod corrupt;
pub mod strategies;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
