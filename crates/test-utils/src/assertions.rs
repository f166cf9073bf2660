//! Test assertion helpers.
//!
//! Polling assertions for multi-threaded tests where the exact moment a
//! condition holds is not deterministic.

use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls a condition until it returns true or the timeout expires.
///
/// Returns `true` if the condition held before the deadline. The condition
/// is checked one final time after the timeout.
///
/// ```
/// use std::time::Duration;
/// use tarn_test_utils::assert_eventually;
///
/// assert!(assert_eventually(Duration::from_millis(50), || true));
/// ```
pub fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    condition()
}
