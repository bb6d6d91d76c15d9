//! Tests for the cache backend
//!
//! These tests verify:
//! - Cache creation and the on-disk layout
//! - Open/create/doom semantics
//! - Storage accounting conservation
//! - Enumeration in both directions
//! - Crash detection through session generations
//! - Self-check and read-only mode

use std::collections::HashSet;

use blockcache::config::Config;
use blockcache::{Backend, CacheError, Enumerator};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_cache() -> (TempDir, Backend) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .cache_dir(temp_dir.path())
        .table_mask(0xff)
        .build();
    let cache = Backend::open(config).unwrap();
    (temp_dir, cache)
}

fn reopen(temp: &TempDir) -> Backend {
    Backend::open(
        Config::builder()
            .cache_dir(temp.path())
            .restart_on_failure(false)
            .build(),
    )
    .unwrap()
}

// =============================================================================
// Creation Tests
// =============================================================================

#[test]
fn test_open_creates_cache_files() {
    let (temp, _cache) = setup_temp_cache();

    assert!(temp.path().join("index").exists());
    for n in 0..4 {
        assert!(temp.path().join(format!("data_{n}")).exists());
    }
}

#[test]
fn test_create_and_open_entry() {
    let (_temp, cache) = setup_temp_cache();

    let entry = cache.create_entry("the-key").unwrap();
    drop(entry);

    let entry = cache.open_entry("the-key").unwrap();
    assert_eq!(entry.key().unwrap(), "the-key");
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn test_open_missing_entry() {
    let (_temp, cache) = setup_temp_cache();
    assert!(matches!(
        cache.open_entry("nothing here"),
        Err(CacheError::NotFound)
    ));
}

#[test]
fn test_create_duplicate_key_fails() {
    let (_temp, cache) = setup_temp_cache();

    let _entry = cache.create_entry("dup").unwrap();
    assert!(matches!(
        cache.create_entry("dup"),
        Err(CacheError::InvalidArgument(_))
    ));
}

#[test]
fn test_create_empty_key_fails() {
    let (_temp, cache) = setup_temp_cache();
    assert!(matches!(
        cache.create_entry(""),
        Err(CacheError::InvalidArgument(_))
    ));
}

#[test]
fn test_colliding_keys_share_a_bucket() {
    let (_temp, cache) = setup_temp_cache();

    // 256 buckets, 300 keys: plenty of chained collisions.
    for i in 0..300 {
        cache.create_entry(&format!("key-{i}")).unwrap();
    }
    assert_eq!(cache.entry_count(), 300);
    for i in 0..300 {
        let entry = cache.open_entry(&format!("key-{i}")).unwrap();
        assert_eq!(entry.key().unwrap(), format!("key-{i}"));
    }
}

#[test]
fn test_failed_create_rolls_back_chain_link() {
    use blockcache::blockfile::BLOCK_HEADER_SIZE;
    use blockcache::format::RANKINGS_NODE_SIZE;

    let (temp, cache) = setup_temp_cache();

    cache.create_entry("e1").unwrap();
    cache.create_entry("e2").unwrap();
    cache.create_entry("e3").unwrap();
    // Free the first rankings block so the next create reuses it.
    cache.doom_entry("e1").unwrap();

    // Cut the rankings pool short of the list head's node: the new
    // entry's own node still fits in the freed block, but linking it
    // into the recency list fails.
    let data_0 = std::fs::OpenOptions::new()
        .write(true)
        .open(temp.path().join("data_0"))
        .unwrap();
    data_0
        .set_len((BLOCK_HEADER_SIZE + 2 * RANKINGS_NODE_SIZE) as u64)
        .unwrap();

    assert!(cache.create_entry("e4").is_err());

    // The failed create left nothing behind.
    assert_eq!(cache.entry_count(), 2);
    assert!(matches!(cache.open_entry("e4"), Err(CacheError::NotFound)));
}

// =============================================================================
// Doom Tests
// =============================================================================

#[test]
fn test_doomed_entry_not_found() {
    let (_temp, cache) = setup_temp_cache();

    cache.create_entry("victim").unwrap();
    cache.doom_entry("victim").unwrap();

    assert!(matches!(
        cache.open_entry("victim"),
        Err(CacheError::NotFound)
    ));
    assert_eq!(cache.entry_count(), 0);
}

#[test]
fn test_doomed_handle_stays_usable() {
    let (_temp, cache) = setup_temp_cache();

    let entry = cache.create_entry("ghost").unwrap();
    entry.write_data(0, 0, b"still here", true).unwrap();
    entry.doom().unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(entry.read_data(0, 0, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"still here");
    entry.write_data(0, 0, b"STILL", false).unwrap();

    // A new entry under the same key coexists with the doomed one.
    let fresh = cache.create_entry("ghost").unwrap();
    fresh.write_data(0, 0, b"new", true).unwrap();
    assert_eq!(entry.read_data(0, 0, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..5], b"STILL");
}

#[test]
fn test_doom_all_entries() {
    let (_temp, cache) = setup_temp_cache();

    for i in 0..20 {
        let entry = cache.create_entry(&format!("e{i}")).unwrap();
        entry.write_data(0, 0, b"data", true).unwrap();
    }
    cache.doom_all_entries().unwrap();

    assert_eq!(cache.entry_count(), 0);
    assert!(matches!(cache.open_entry("e0"), Err(CacheError::NotFound)));

    // The cache keeps working afterwards.
    cache.create_entry("after").unwrap();
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn test_doom_entries_since() {
    let (_temp, cache) = setup_temp_cache();

    cache.create_entry("old").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let cutoff = blockcache::format::now_ms();
    std::thread::sleep(std::time::Duration::from_millis(10));
    cache.create_entry("new-1").unwrap();
    cache.create_entry("new-2").unwrap();

    cache.doom_entries_since(cutoff).unwrap();

    assert!(cache.open_entry("old").is_ok());
    assert!(matches!(cache.open_entry("new-1"), Err(CacheError::NotFound)));
    assert!(matches!(cache.open_entry("new-2"), Err(CacheError::NotFound)));
}

// =============================================================================
// Accounting Tests
// =============================================================================

#[test]
fn test_storage_accounting_conservation() {
    let (_temp, cache) = setup_temp_cache();
    assert_eq!(cache.used_size(), 0);

    {
        let entry = cache.create_entry("acct").unwrap();
        entry.write_data(0, 0, &[1u8; 5000], true).unwrap();
        entry.write_data(1, 0, &[2u8; 20_000], true).unwrap();
    }
    // key (4) + stream 0 (5000) + stream 1 (20000)
    assert_eq!(cache.used_size(), 4 + 5000 + 20_000);

    cache.doom_entry("acct").unwrap();
    assert_eq!(cache.used_size(), 0);
}

#[test]
fn test_accounting_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
        let entry = cache.create_entry("ab").unwrap();
        entry.write_data(0, 0, &[0u8; 1000], true).unwrap();
    }
    let cache = reopen(&temp);
    assert_eq!(cache.used_size(), 2 + 1000);
}

#[test]
fn test_set_max_size_validation() {
    let (_temp, cache) = setup_temp_cache();
    assert!(cache.set_max_size(0).is_err());
    assert!(cache.set_max_size(-5).is_err());
    // The persisted byte counter is 32-bit; bigger budgets would wrap.
    assert!(cache.set_max_size(5 * 1024 * 1024 * 1024).is_err());
    cache.set_max_size(u32::MAX as i64).unwrap();
    cache.set_max_size(1024 * 1024).unwrap();
    assert_eq!(cache.max_size(), 1024 * 1024);
}

// =============================================================================
// Enumeration Tests
// =============================================================================

#[test]
fn test_enumeration_newest_first() {
    let (_temp, cache) = setup_temp_cache();

    for name in ["first", "second", "third"] {
        cache.create_entry(name).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
    }

    let mut iter = Enumerator::default();
    let mut seen = Vec::new();
    while let Some(entry) = cache.open_next_entry(&mut iter).unwrap() {
        seen.push(entry.key().unwrap());
    }
    assert_eq!(seen, ["third", "second", "first"]);
}

#[test]
fn test_enumeration_oldest_first() {
    let (_temp, cache) = setup_temp_cache();

    for name in ["first", "second", "third"] {
        cache.create_entry(name).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
    }

    let mut iter = Enumerator::default();
    let mut seen = Vec::new();
    while let Some(entry) = cache.open_prev_entry(&mut iter).unwrap() {
        seen.push(entry.key().unwrap());
    }
    assert_eq!(seen, ["first", "second", "third"]);
}

#[test]
fn test_enumeration_complete_across_lists() {
    let (_temp, cache) = setup_temp_cache();

    for i in 0..30 {
        cache.create_entry(&format!("k{i}")).unwrap();
    }
    // Reopening moves some entries onto hotter lists.
    for i in 0..10 {
        cache.open_entry(&format!("k{i}")).unwrap();
    }

    let mut iter = Enumerator::default();
    let mut seen = HashSet::new();
    while let Some(entry) = cache.open_next_entry(&mut iter).unwrap() {
        assert!(seen.insert(entry.key().unwrap()), "entry returned twice");
    }
    assert_eq!(seen.len(), 30);
}

// =============================================================================
// Crash Detection Tests
// =============================================================================

#[test]
fn test_torn_entry_discarded_after_crash() {
    let temp = TempDir::new().unwrap();
    {
        let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
        let clean = cache.create_entry("clean").unwrap();
        clean.write_data(0, 0, b"safe", true).unwrap();
        drop(clean);

        let torn = cache.create_entry("torn").unwrap();
        torn.write_data(0, 0, b"lost", true).unwrap();
        // Leak the handle: no flush, no dirty-flag clear, and the
        // backend sees an open entry at shutdown.
        std::mem::forget(torn);
    }
    let cache = reopen(&temp);

    // The entry released properly survives; the torn one is discarded.
    let clean = cache.open_entry("clean").unwrap();
    let mut buf = [0u8; 4];
    clean.read_data(0, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"safe");

    assert!(matches!(cache.open_entry("torn"), Err(CacheError::NotFound)));
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.self_check().unwrap(), 0);
}

#[test]
fn test_clean_shutdown_keeps_everything() {
    let temp = TempDir::new().unwrap();
    {
        let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
        for i in 0..10 {
            let entry = cache.create_entry(&format!("e{i}")).unwrap();
            entry.write_data(0, 0, format!("v{i}").as_bytes(), true).unwrap();
        }
    }
    let cache = reopen(&temp);
    assert_eq!(cache.entry_count(), 10);
    assert_eq!(cache.self_check().unwrap(), 0);
    for i in 0..10 {
        let entry = cache.open_entry(&format!("e{i}")).unwrap();
        let mut buf = [0u8; 2];
        entry.read_data(0, 0, &mut buf).unwrap();
        assert_eq!(buf, format!("v{i}").as_bytes());
    }
}

#[test]
fn test_unusable_index_recreated() {
    let temp = TempDir::new().unwrap();
    {
        let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
        cache.create_entry("x").unwrap();
    }
    std::fs::write(temp.path().join("index"), b"garbage").unwrap();

    // Default config restarts on failure and comes up empty.
    let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
    assert_eq!(cache.entry_count(), 0);
    cache.create_entry("fresh").unwrap();
}

#[test]
fn test_unusable_index_fails_without_restart() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("index"), b"garbage").unwrap();

    let result = Backend::open(
        Config::builder()
            .cache_dir(temp.path())
            .restart_on_failure(false)
            .build(),
    );
    assert!(result.is_err());
}

// =============================================================================
// Self-Check Tests
// =============================================================================

#[test]
fn test_self_check_reports_stale_dirty_entries() {
    let temp = TempDir::new().unwrap();
    {
        let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
        let clean = cache.create_entry("clean").unwrap();
        clean.write_data(0, 0, b"safe", true).unwrap();
        drop(clean);

        let torn = cache.create_entry("torn").unwrap();
        torn.write_data(0, 0, b"lost", true).unwrap();
        std::mem::forget(torn);
    }
    let cache = reopen(&temp);

    // Counted before any lookup excises it.
    assert_eq!(cache.self_check().unwrap(), 1);
    assert_eq!(cache.entry_count(), 2);

    // The lookup then discards it and a fresh check is clean.
    assert!(matches!(cache.open_entry("torn"), Err(CacheError::NotFound)));
    assert_eq!(cache.self_check().unwrap(), 0);
}

#[test]
fn test_self_check_clean_cache() {
    let (_temp, cache) = setup_temp_cache();

    for i in 0..50 {
        let entry = cache.create_entry(&format!("entry-{i}")).unwrap();
        entry.write_data(0, 0, b"payload", true).unwrap();
        drop(entry);
        if i % 3 == 0 {
            cache.doom_entry(&format!("entry-{i}")).unwrap();
        }
    }
    assert_eq!(cache.self_check().unwrap(), 0);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_stats_concurrent_with_lookups() {
    let (_temp, cache) = setup_temp_cache();
    for i in 0..50 {
        let entry = cache.create_entry(&format!("key-{i}")).unwrap();
        entry.write_data(0, 0, b"payload", true).unwrap();
    }

    let cache = std::sync::Arc::new(cache);
    let stats = std::thread::spawn({
        let cache = std::sync::Arc::clone(&cache);
        move || {
            for _ in 0..500 {
                let _ = cache.stats();
            }
        }
    });
    let opens = std::thread::spawn({
        let cache = std::sync::Arc::clone(&cache);
        move || {
            for i in 0..500 {
                cache.open_entry(&format!("key-{}", i % 50)).unwrap();
            }
        }
    });
    stats.join().unwrap();
    opens.join().unwrap();
}

// =============================================================================
// Read-Only Mode Tests
// =============================================================================

#[test]
fn test_read_only_mode() {
    let temp = TempDir::new().unwrap();
    {
        let cache = Backend::open(Config::builder().cache_dir(temp.path()).build()).unwrap();
        let entry = cache.create_entry("ro").unwrap();
        entry.write_data(0, 0, b"frozen", true).unwrap();
    }

    let cache = Backend::open(
        Config::builder()
            .cache_dir(temp.path())
            .read_only(true)
            .restart_on_failure(false)
            .build(),
    )
    .unwrap();

    let entry = cache.open_entry("ro").unwrap();
    let mut buf = [0u8; 6];
    entry.read_data(0, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"frozen");

    assert!(cache.create_entry("nope").is_err());
    assert!(entry.write_data(0, 0, b"x", false).is_err());
    assert!(entry.doom().is_err());
    drop(entry);
    drop(cache);

    // Nothing changed on disk.
    let cache = reopen(&temp);
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.self_check().unwrap(), 0);
}

#[test]
fn test_read_only_requires_existing_cache() {
    let temp = TempDir::new().unwrap();
    let result = Backend::open(
        Config::builder()
            .cache_dir(temp.path())
            .read_only(true)
            .build(),
    );
    assert!(result.is_err());
}
