//! Tests for eviction
//!
//! These tests verify:
//! - Trimming back under budget when the cache overflows
//! - Oldest-first eviction order
//! - Reuse-based list placement in multi-list mode
//! - Open entries surviving a trim pass

use blockcache::config::{Config, EvictionMode};
use blockcache::{Backend, CacheError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_small_cache(mode: EvictionMode) -> (TempDir, Backend) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .cache_dir(temp_dir.path())
        .table_mask(0xff)
        .max_size(40 * 1024) // Tiny budget so a handful of writes overflow it.
        .eviction(mode)
        .build();
    let cache = Backend::open(config).unwrap();
    (temp_dir, cache)
}

fn fill_entry(cache: &Backend, key: &str, bytes: usize) {
    let entry = cache.create_entry(key).unwrap();
    entry.write_data(0, 0, &vec![0x5au8; bytes], true).unwrap();
}

// =============================================================================
// Budget Tests
// =============================================================================

#[test]
fn test_trim_keeps_cache_under_budget() {
    let (_temp, cache) = setup_small_cache(EvictionMode::Lru);

    for i in 0..20 {
        fill_entry(&cache, &format!("e{i}"), 4096);
    }
    // One more write lands after the last deferred charge and gives
    // the trim a chance to settle.
    fill_entry(&cache, "final", 16);

    assert!(cache.used_size() <= cache.max_size());
    assert!(cache.entry_count() < 21);
}

#[test]
fn test_eviction_is_oldest_first() {
    let (_temp, cache) = setup_small_cache(EvictionMode::Lru);

    for i in 0..20 {
        fill_entry(&cache, &format!("e{i}"), 4096);
    }
    fill_entry(&cache, "final", 16);

    // The earliest entries are gone, the latest are not.
    assert!(matches!(cache.open_entry("e0"), Err(CacheError::NotFound)));
    assert!(matches!(cache.open_entry("e1"), Err(CacheError::NotFound)));
    assert!(cache.open_entry("e19").is_ok());
    assert!(cache.open_entry("final").is_ok());
}

#[test]
fn test_open_entries_survive_trim() {
    let (_temp, cache) = setup_small_cache(EvictionMode::Lru);

    // Oldest entry, kept open through the whole storm.
    let pinned = cache.create_entry("pinned").unwrap();
    pinned.write_data(0, 0, &vec![1u8; 2048], true).unwrap();

    for i in 0..20 {
        fill_entry(&cache, &format!("e{i}"), 4096);
    }

    // Still readable through the handle and still in the index.
    let mut buf = [0u8; 8];
    assert_eq!(pinned.read_data(0, 0, &mut buf).unwrap(), 8);
    assert!(cache.open_entry("pinned").is_ok());
}

// =============================================================================
// Multi-List Tests
// =============================================================================

#[test]
fn test_reuse_promotes_across_lists() {
    let (_temp, cache) = setup_small_cache(EvictionMode::MultiList);

    cache.create_entry("cold").unwrap();
    cache.create_entry("warm").unwrap();
    cache.create_entry("hot").unwrap();

    cache.open_entry("warm").unwrap();
    for _ in 0..12 {
        cache.open_entry("hot").unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.list_lengths[0], 1); // cold, never reopened
    assert_eq!(stats.list_lengths[1], 1); // warm
    assert_eq!(stats.list_lengths[2], 1); // hot, past the reuse threshold
}

#[test]
fn test_multi_list_evicts_unused_before_reused() {
    let (_temp, cache) = setup_small_cache(EvictionMode::MultiList);

    // An old but frequently reopened entry.
    fill_entry(&cache, "favorite", 2048);
    for _ in 0..12 {
        cache.open_entry("favorite").unwrap();
    }

    // Newer one-shot traffic blows the budget several times over.
    for i in 0..30 {
        fill_entry(&cache, &format!("burst{i}"), 4096);
    }
    fill_entry(&cache, "final", 16);

    // The reused entry outlives newer never-reopened ones.
    assert!(cache.open_entry("favorite").is_ok());
    assert!(matches!(
        cache.open_entry("burst0"),
        Err(CacheError::NotFound)
    ));
    assert!(cache.used_size() <= cache.max_size());
}
