//! Integration tests for kernel symbol resolution.
//!
//! A real kallsyms blob is not available here, so these tests cover the
//! uninitialized paths and error handling.

#![cfg(feature = "symbols")]

use axfbt::symbols::{self, Error};

// =============================================================================
// Resolution Without Init Tests
// =============================================================================

#[test]
fn test_resolve_without_table() {
    if symbols::is_initialized() {
        return;
    }
    assert!(symbols::lookup_addr("vfs_read").is_none());
    assert!(symbols::lookup_symbol(0xffff_0000).is_none());
    assert!(symbols::resolve("vfs_read").is_none());
    assert!(symbols::resolve_names(&["vfs_read", "vfs_write"]).is_empty());
}

#[test]
fn test_lookup_edge_inputs_do_not_panic() {
    let _ = symbols::lookup_symbol(0);
    let _ = symbols::lookup_symbol(u64::MAX);
    let _ = symbols::lookup_addr("");
    let _ = symbols::lookup_addr(&"a".repeat(2048));
}

// =============================================================================
// Init Tests
// =============================================================================

#[test]
fn test_init_rejects_bad_blobs() {
    assert!(symbols::init(&[], 0x0, 0x0).is_err());

    let invalid: &'static [u8] = Box::leak(vec![0xFF; 4].into_boxed_slice());
    assert!(symbols::init(invalid, 0x1000, 0x2000).is_err());
    assert!(!symbols::is_initialized());
}

// =============================================================================
// Error Display Tests
// =============================================================================

#[test]
fn test_error_display() {
    assert!(format!("{}", Error::AlreadyInitialized).contains("already initialized"));
    assert!(format!("{}", Error::ParseError("invalid format")).contains("invalid format"));
    assert!(format!("{}", Error::NotInitialized).contains("not initialized"));
}
