//! Integration Test: Relay Core Rules
//!
//! **Policy**: production code in `streamrelay/core/src` is single-threaded,
//! never blocks outside the run loop's `poll`, and propagates errors instead
//! of panicking.
//! **Exceptions**: test modules (everything after `#[cfg(test)]`).

use architectural_enforcement::{assert_clean, core_src, rust_files, scan_core};

#[test]
fn test_scanner_finds_core_sources() {
    assert!(
        rust_files(&core_src()).len() >= 8,
        "expected the core modules under {}",
        core_src().display()
    );
}

/// The run loop waits in `poll`; nothing else may sleep
#[test]
fn test_no_sleep_in_core() {
    let violations = scan_core(|code| code.contains("::sleep(") || code.contains(".sleep("));
    assert_clean("No sleep calls in the relay core", &violations);
}

#[test]
fn test_no_unsafe_in_core() {
    let violations = scan_core(|code| {
        code.contains("unsafe {") || code.contains("unsafe fn") || code.contains("unsafe impl")
    });
    assert_clean("No unsafe code in the relay core", &violations);
}

#[test]
fn test_no_unwrap_or_expect_in_core() {
    let violations = scan_core(|code| code.contains(".unwrap()") || code.contains(".expect("));
    assert_clean("No unwrap/expect in relay core production code", &violations);
}

/// Handlers run on the loop thread; `Rc`/`RefCell` are the only sharing tools
#[test]
fn test_no_locks_in_core() {
    let violations = scan_core(|code| code.contains("Mutex") || code.contains("RwLock"));
    assert_clean("No lock types in the single-threaded relay core", &violations);
}
