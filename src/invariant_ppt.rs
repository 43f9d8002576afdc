//! PPT Invariant System: runtime invariant enforcement with contract tracking.
//!
//! Scheduling code calls [`assert_invariant`] at the points where an
//! invariant is established. With the `ppt` feature the IDs are recorded so
//! integration tests can check, via [`contract_test`], that a scenario
//! actually exercised the invariants it claims to cover.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::Mutex;

pub const SLICE_TILING: u32 = 1;
pub const VIEW_RESTORED: u32 = 2;
pub const CHAIN_SEGMENTATION: u32 = 3;
pub const CHAIN_EXCLUDES_UNSAFE: u32 = 4;
pub const BARRIER_COMPLETE: u32 = 5;
pub const SERIAL_FALLBACK: u32 = 6;
pub const THREAD_COPY_COUNT: u32 = 7;
pub const REPEAT_COUNT_VALID: u32 = 8;
pub const LABELS_UNIQUE: u32 = 9;
pub const LOOP_TERMINATED: u32 = 10;
pub const CANCEL_AT_BOUNDARY: u32 = 11;
pub const FAIL_FAST: u32 = 12;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = if let Some(ctx) = context {
            format!("Invariant {} failed: {} (context: {})", id, message, ctx)
        } else {
            format!("Invariant {} failed: {}", id, message)
        };
        log::error!("{}", full_message);
        panic!("{}", full_message);
    }
    if let Ok(mut log) = INVARIANT_LOG.lock() {
        log.insert(id);
    }
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {}", message);
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let log = INVARIANT_LOG
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let missing: Vec<u32> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(inv))
        .collect();
    drop(log); // Drop the lock before panicking
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    if let Ok(mut log) = INVARIANT_LOG.lock() {
        log.clear();
    }
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_invariant_pass() {
        assert_invariant(0, 1 + 1 == 2, "Math works", Some("basic"));
    }

    #[test]
    #[should_panic]
    fn test_assert_invariant_fail() {
        assert_invariant(0, 1 + 1 == 3, "Math broken", None);
    }

    #[test]
    fn test_contract_test() {
        #[cfg(feature = "ppt")]
        {
            assert_invariant(LABELS_UNIQUE, true, "recorded", None);
            contract_test("example", &[LABELS_UNIQUE]);
        }

        #[cfg(not(feature = "ppt"))]
        {
            contract_test("example", &[LABELS_UNIQUE]);
        }
    }
}
