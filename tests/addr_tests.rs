//! Tests for cache addresses
//!
//! These tests verify:
//! - Packing and unpacking of block addresses
//! - External file addresses
//! - File type selection by payload size
//! - Block run sizing and byte offsets
//! - Structural sanity checks

use blockcache::addr::{Addr, FileType, MAX_BLOCKS, MAX_BLOCK_SIZE};
use blockcache::blockfile::BLOCK_HEADER_SIZE;

// =============================================================================
// Packing Tests
// =============================================================================

#[test]
fn test_block_addr_round_trip() {
    let addr = Addr::block(FileType::Block1k, 7, 1234, 3);

    assert!(addr.is_initialized());
    assert!(addr.is_block_file());
    assert!(!addr.is_separate_file());
    assert_eq!(addr.file_type(), FileType::Block1k);
    assert_eq!(addr.file_number(), 7);
    assert_eq!(addr.start_block(), 1234);
    assert_eq!(addr.num_blocks(), 3);
    assert_eq!(addr.block_size(), 1024);
}

#[test]
fn test_external_addr_round_trip() {
    let addr = Addr::external(0xabcdef);

    assert!(addr.is_initialized());
    assert!(addr.is_separate_file());
    assert!(!addr.is_block_file());
    assert_eq!(addr.file_type(), FileType::External);
    assert_eq!(addr.file_number(), 0xabcdef);
}

#[test]
fn test_zero_addr_is_unset() {
    let addr = Addr::new(0);
    assert!(!addr.is_initialized());
    assert!(!addr.is_block_file());
    assert!(!addr.is_separate_file());
}

#[test]
fn test_value_survives_storage() {
    let addr = Addr::block(FileType::Block256, 1, 42, 4);
    assert_eq!(Addr::new(addr.value()), addr);
}

// =============================================================================
// Sizing Tests
// =============================================================================

#[test]
fn test_required_file_type_boundaries() {
    assert_eq!(Addr::required_file_type(1), FileType::Block256);
    assert_eq!(Addr::required_file_type(1024), FileType::Block256);
    assert_eq!(Addr::required_file_type(1025), FileType::Block1k);
    assert_eq!(Addr::required_file_type(4096), FileType::Block1k);
    assert_eq!(Addr::required_file_type(4097), FileType::Block4k);
    assert_eq!(Addr::required_file_type(MAX_BLOCK_SIZE), FileType::Block4k);
    assert_eq!(Addr::required_file_type(MAX_BLOCK_SIZE + 1), FileType::External);
}

#[test]
fn test_required_blocks() {
    assert_eq!(Addr::required_blocks(1, FileType::Block256), 1);
    assert_eq!(Addr::required_blocks(256, FileType::Block256), 1);
    assert_eq!(Addr::required_blocks(257, FileType::Block256), 2);
    assert_eq!(Addr::required_blocks(1024, FileType::Block256), 4);
    assert_eq!(Addr::required_blocks(4096 * 3 + 1, FileType::Block4k), 4);
    // Zero-byte payloads still need one block.
    assert_eq!(Addr::required_blocks(0, FileType::Rankings), 1);
}

#[test]
fn test_max_block_size_covers_max_run() {
    assert_eq!(MAX_BLOCK_SIZE, 4096 * MAX_BLOCKS as usize);
}

#[test]
fn test_block_offset_skips_header() {
    let addr = Addr::block(FileType::Block256, 1, 0, 1);
    assert_eq!(addr.block_offset(), BLOCK_HEADER_SIZE as u64);

    let addr = Addr::block(FileType::Block4k, 3, 10, 2);
    assert_eq!(addr.block_offset(), BLOCK_HEADER_SIZE as u64 + 10 * 4096);
}

// =============================================================================
// Sanity Tests
// =============================================================================

#[test]
fn test_sanity_check_accepts_valid_addrs() {
    assert!(Addr::new(0).sanity_check());
    assert!(Addr::block(FileType::Rankings, 0, 5, 1).sanity_check());
    assert!(Addr::external(12).sanity_check());
}

#[test]
fn test_sanity_check_rejects_reserved_bits() {
    let addr = Addr::block(FileType::Block256, 1, 5, 1);
    let tainted = Addr::new(addr.value() | 0x0400_0000);
    assert!(!tainted.sanity_check());
}
