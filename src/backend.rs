//! Cache backend
//!
//! Ties the pieces together: the index file (header + hash table), the
//! block pool files, the recency rankings and the eviction policy.
//! `Backend` is the public face; `BackendShared` is the state every
//! open entry keeps alive through an `Arc`.
//!
//! ## Index Lookup
//! A key hashes to a bucket in the index table; buckets chain entries
//! through `EntryStore::next`. Lookups walk the chain, lazily excising
//! entries left torn by a previous session (detected through the dirty
//! generation id on their rankings node).
//!
//! ## Locking
//! Entry state, rankings control, pool file state and the header each
//! have their own lock; no path holds two entry locks at once, and the
//! eviction pass runs only at operation boundaries with no entry lock
//! held.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::addr::{Addr, FileType};
use crate::blockfile::{BlockFiles, CacheFile};
use crate::config::{Config, DEFAULT_MAX_SIZE};
use crate::entry::{Entry, EntryInner, EntryState};
use crate::error::{CacheError, Result};
use crate::eviction::Eviction;
use crate::format::{
    entry_num_blocks, hash_key, EntryStore, IndexHeader, DEFAULT_TABLE_LEN, INDEX_HEADER_SIZE,
    INDEX_MAGIC, INDEX_VERSION, NUM_LISTS,
};
use crate::rankings::{List, Rankings};

/// Longest bucket chain walked before declaring the chain corrupt
const MAX_CHAIN: u32 = 64;

/// Open handles above which the cache counts as heavily loaded and
/// trims conservatively
const LOADED_HANDLES: usize = 32;

/// Floor for the per-file size limit
const MIN_FILE_SIZE: i64 = 1024 * 1024;

/// Smallest accepted index table
const MIN_TABLE_LEN: u32 = 16;

// =============================================================================
// Shared state
// =============================================================================

pub(crate) struct BackendShared {
    path: PathBuf,
    index: Arc<CacheFile>,
    header: Mutex<IndexHeader>,
    pub(crate) block_files: Arc<BlockFiles>,
    pub(crate) rankings: Rankings,
    pub(crate) eviction: Eviction,
    /// One inner per on-disk entry address; values are weak so a
    /// dropped handle releases the entry
    open_entries: Mutex<HashMap<u32, Weak<EntryInner>>>,
    max_size: AtomicI64,
    read_only: bool,
    disabled: AtomicBool,
    trimming: AtomicBool,
}

/// Point-in-time counters for inspection tools
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entry_count: u32,
    pub used_bytes: i64,
    pub max_bytes: i64,
    pub list_lengths: [u32; NUM_LISTS],
    pub open_handles: usize,
}

/// Cursor over the cache in recency order. Tracks the last node
/// returned from each list so the walk can move forward (newest to
/// oldest) or backward and survive entries being touched mid-walk.
#[derive(Debug, Default, Clone)]
pub struct Enumerator {
    returned: [Option<u32>; NUM_LISTS],
}

/// Outcome of resolving a rankings node during enumeration
enum NodeResolution {
    /// The node belongs to a live, readable entry
    Entry(Arc<EntryInner>),
    /// The node left its list; the cursor must step back
    Destroyed,
    /// The node stays listed but yields nothing (read-only skips)
    Skipped,
}

// =============================================================================
// Backend
// =============================================================================

/// A disk-backed entry cache rooted at one directory
pub struct Backend {
    shared: Arc<BackendShared>,
}

impl Backend {
    /// Open (or create) a cache as described by `config`.
    ///
    /// When the existing index is unusable and `restart_on_failure` is
    /// set, the cache files are deleted and a fresh cache is created
    /// in place.
    pub fn open(config: Config) -> Result<Backend> {
        std::fs::create_dir_all(&config.cache_dir)?;
        match Self::init(&config) {
            Ok(shared) => Ok(Backend { shared }),
            Err(err) if config.restart_on_failure && !config.read_only => {
                warn!(%err, path = %config.cache_dir.display(), "cache unusable, recreating");
                delete_cache_files(&config.cache_dir)?;
                Ok(Backend {
                    shared: Self::init(&config)?,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn init(config: &Config) -> Result<Arc<BackendShared>> {
        let path = config.cache_dir.clone();
        let index_path = path.join("index");
        let fresh = !index_path.exists();
        if fresh && config.read_only {
            return Err(CacheError::Config("no cache to open read-only".into()));
        }
        let index = Arc::new(CacheFile::open_or_create(&index_path)?);

        let mut header = if fresh {
            let table_len = match config.table_mask {
                Some(mask) => {
                    let len = mask.wrapping_add(1);
                    if len < MIN_TABLE_LEN || !len.is_power_of_two() {
                        return Err(CacheError::Config(format!("invalid table mask {mask:#x}")));
                    }
                    len
                }
                None => DEFAULT_TABLE_LEN,
            };
            index.set_length(INDEX_HEADER_SIZE as u64 + table_len as u64 * 4)?;
            IndexHeader::new(table_len)
        } else {
            let mut buf = [0u8; 128];
            index.read(&mut buf, 0)?;
            let header = IndexHeader::decode(&buf)?;
            check_index(&header, index.length()?)?;
            header
        };

        let previous_crash = header.crash != 0;
        header.this_id = header.this_id.wrapping_add(1).max(1);
        header.crash = 1;
        if !config.read_only {
            index.write(&header.encode(), 0)?;
        }
        if previous_crash {
            info!(
                path = %path.display(),
                session = header.this_id,
                "previous session did not close cleanly"
            );
        }

        let block_files = Arc::new(BlockFiles::open(&path)?);
        let rankings = Rankings::open(Arc::clone(&block_files), Arc::clone(&index), config.read_only)?;
        if !config.read_only && rankings.recover()? {
            info!("completed interrupted rankings operation");
        }

        let max_size = if config.max_size > 0 {
            config.max_size as i64
        } else {
            DEFAULT_MAX_SIZE as i64
        };

        Ok(Arc::new(BackendShared {
            path,
            index,
            header: Mutex::new(header),
            block_files,
            rankings,
            eviction: Eviction::new(config.eviction),
            open_entries: Mutex::new(HashMap::new()),
            max_size: AtomicI64::new(max_size),
            read_only: config.read_only,
            disabled: AtomicBool::new(false),
            trimming: AtomicBool::new(false),
        }))
    }

    // =========================================================================
    // Entry operations
    // =========================================================================

    /// Open an existing entry by key
    pub fn open_entry(&self, key: &str) -> Result<Entry> {
        self.shared.ensure_enabled()?;
        let hash = hash_key(key);
        let inner = self
            .shared
            .match_entry(key, hash)?
            .ok_or(CacheError::NotFound)?;
        if !self.shared.read_only {
            let mut state = inner.state.lock();
            self.shared.eviction.on_open_entry(&self.shared, &mut state)?;
        }
        Ok(Entry { inner })
    }

    /// Create a new entry. Fails if an entry with this key exists.
    pub fn create_entry(&self, key: &str) -> Result<Entry> {
        let shared = &self.shared;
        shared.ensure_enabled()?;
        shared.ensure_writable()?;
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".into()));
        }
        if key.len() > shared.max_file_size() {
            return Err(CacheError::InvalidArgument(format!(
                "key of {} bytes is too long",
                key.len()
            )));
        }
        let hash = hash_key(key);
        if shared.match_entry(key, hash)?.is_some() {
            return Err(CacheError::InvalidArgument("entry already exists".into()));
        }

        let entry_addr = shared
            .block_files
            .create_block(FileType::Block256, entry_num_blocks(key.len()))?;
        let node_addr = match shared.block_files.create_block(FileType::Rankings, 1) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = shared.block_files.delete_block(entry_addr, false);
                return Err(err);
            }
        };
        let inner = match EntryInner::create(shared, entry_addr, node_addr, key, hash) {
            Ok(inner) => Arc::new(inner),
            Err(err) => {
                let _ = shared.block_files.delete_block(node_addr, false);
                let _ = shared.block_files.delete_block(entry_addr, false);
                return Err(err);
            }
        };

        // Front of the bucket chain, then the recency list.
        let bucket = hash & shared.mask();
        let old_head = shared.read_table(bucket)?;
        if old_head != 0 {
            inner.set_next_addr(old_head)?;
        }
        shared.write_table(bucket, entry_addr.value())?;

        let mut listed = false;
        let committed = {
            let mut state = inner.state.lock();
            shared.eviction.on_create_entry(shared, &mut state)
        }
        .and_then(|()| {
            listed = true;
            let mut header = shared.header.lock();
            header.num_entries += 1;
            let persisted = shared.write_header(&header);
            if persisted.is_err() {
                header.num_entries -= 1;
            }
            persisted
        });
        if let Err(err) = committed {
            // Unwind the chain link; the handle's release frees the
            // records once it is doomed.
            if let Err(err) = shared.write_table(bucket, old_head) {
                warn!(%err, "failed to unwind bucket link");
            }
            let mut state = inner.state.lock();
            if listed {
                if let Err(err) = shared.eviction.on_doom_entry(shared, &mut state) {
                    warn!(%err, "failed to unlink rolled-back entry");
                }
            }
            if let Err(err) = inner.internal_doom(&mut state) {
                warn!(%err, "failed to doom rolled-back entry");
            }
            return Err(err);
        }
        shared
            .open_entries
            .lock()
            .insert(entry_addr.value(), Arc::downgrade(&inner));

        debug!(key, %entry_addr, "created entry");
        shared.maybe_trim();
        Ok(Entry { inner })
    }

    /// Doom the entry with this key without keeping it open
    pub fn doom_entry(&self, key: &str) -> Result<()> {
        self.shared.ensure_enabled()?;
        self.shared.ensure_writable()?;
        let hash = hash_key(key);
        let inner = self
            .shared
            .match_entry(key, hash)?
            .ok_or(CacheError::NotFound)?;
        self.shared.internal_doom_entry(&inner)
    }

    /// Doom every entry in the cache. Entries currently open stay
    /// usable through their handles; their storage goes when the last
    /// handle drops.
    pub fn doom_all_entries(&self) -> Result<()> {
        self.shared.ensure_enabled()?;
        self.shared.ensure_writable()?;
        self.shared.eviction.trim_cache(&self.shared, true);
        let handles: Vec<Arc<EntryInner>> = {
            let map = self.shared.open_entries.lock();
            map.values().filter_map(Weak::upgrade).collect()
        };
        for inner in handles {
            if !inner.is_doomed() {
                self.shared.internal_doom_entry(&inner)?;
            }
        }
        Ok(())
    }

    /// Doom every entry last used at or after `since_ms`
    pub fn doom_entries_since(&self, since_ms: u64) -> Result<()> {
        self.shared.ensure_enabled()?;
        self.shared.ensure_writable()?;
        loop {
            // Dooming invalidates the cursor, so each round restarts
            // from the most recent entry.
            let mut iter = Enumerator::default();
            match self.open_next_entry(&mut iter)? {
                Some(entry) => {
                    if entry.last_used() >= since_ms {
                        entry.doom()?;
                    } else {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Next entry, newest first. `None` when the walk is done.
    pub fn open_next_entry(&self, iter: &mut Enumerator) -> Result<Option<Entry>> {
        self.shared.open_following(iter, true)
    }

    /// Next entry, oldest first
    pub fn open_prev_entry(&self, iter: &mut Enumerator) -> Result<Option<Entry>> {
        self.shared.open_following(iter, false)
    }

    // =========================================================================
    // Introspection and control
    // =========================================================================

    /// Number of live entries
    pub fn entry_count(&self) -> u32 {
        self.shared.header.lock().num_entries
    }

    /// Bytes currently charged to stored data and keys
    pub fn used_size(&self) -> i64 {
        self.shared.used_size()
    }

    /// Current cache budget in bytes
    pub fn max_size(&self) -> i64 {
        self.shared.max_size()
    }

    /// Change the cache budget. Takes effect on the next trim.
    pub fn set_max_size(&self, bytes: i64) -> Result<()> {
        if bytes <= 0 {
            return Err(CacheError::InvalidArgument(
                "cache size must be positive".into(),
            ));
        }
        // The persisted byte counter is 32-bit; a bigger budget would
        // let it wrap.
        if bytes > u32::MAX as i64 {
            return Err(CacheError::InvalidArgument(format!(
                "cache size {bytes} does not fit the on-disk counter"
            )));
        }
        self.shared.max_size.store(bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Largest size a single stream or key may reach
    pub fn max_file_size(&self) -> usize {
        self.shared.max_file_size()
    }

    /// Coarse fullness bucket, 0..=10, of used bytes against the budget
    pub fn size_group(&self) -> u32 {
        let max = self.shared.max_size();
        if max <= 0 {
            return 0;
        }
        (self.shared.used_size() * 10 / max).clamp(0, 10) as u32
    }

    /// Root directory of this cache
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn stats(&self) -> CacheStats {
        // Snapshot the header first; open_handles takes the entry map
        // lock and must never nest inside the header lock.
        let (entry_count, used_bytes) = {
            let header = self.shared.header.lock();
            (header.num_entries, header.num_bytes as i64)
        };
        let mut list_lengths = [0u32; NUM_LISTS];
        for (i, len) in list_lengths.iter_mut().enumerate() {
            *len = self.shared.rankings.list_len(List::from_index(i as u32));
        }
        CacheStats {
            entry_count,
            used_bytes,
            max_bytes: self.shared.max_size(),
            list_lengths,
            open_handles: self.shared.open_handles(),
        }
    }

    /// Full structural verification: index header, every bucket chain,
    /// every entry record and its rankings node, and the list links.
    /// Returns the number of entries flagged dirty by an older session.
    pub fn self_check(&self) -> Result<u32> {
        let shared = &self.shared;
        shared.ensure_enabled()?;
        let (table_len, mask, num_entries, this_id) = {
            let header = shared.header.lock();
            check_index(&header, shared.index.length()?)?;
            (header.table_len, header.mask, header.num_entries, header.this_id)
        };
        shared.rankings.check_lists()?;

        let mut visited: HashSet<u32> = HashSet::new();
        let mut count = 0u32;
        let mut dirty = 0u32;
        for bucket in 0..table_len {
            let mut current = shared.read_table(bucket)?;
            let mut chain = 0u32;
            while current != 0 {
                if !visited.insert(current) {
                    return Err(CacheError::Corrupt(format!(
                        "entry {current:#x} linked from two chains"
                    )));
                }
                chain += 1;
                if chain > MAX_CHAIN {
                    return Err(CacheError::Corrupt(format!("cycle in bucket {bucket}")));
                }
                let addr = Addr::new(current);
                if !addr.sanity_check() || addr.file_type() != FileType::Block256 {
                    return Err(CacheError::Corrupt(format!("{addr} cannot hold an entry")));
                }
                let store = EntryStore::decode(&shared.block_files.read_record(addr)?)?;
                if !EntryInner::sanity_check(&store) {
                    return Err(CacheError::Corrupt(format!("{addr} fails sanity check")));
                }
                if store.hash & mask != bucket {
                    return Err(CacheError::Corrupt(format!("{addr} is in the wrong bucket")));
                }
                let node = shared.rankings.read_node(Addr::new(store.rankings_node))?;
                if node.contents != current {
                    return Err(CacheError::Corrupt(format!(
                        "{addr} and its rankings node disagree"
                    )));
                }
                if node.dirty != 0 && node.dirty != this_id {
                    dirty += 1;
                }
                count += 1;
                current = store.next;
            }
        }
        if count != num_entries {
            return Err(CacheError::Corrupt(format!(
                "header counts {num_entries} entries, table holds {count}"
            )));
        }
        Ok(dirty)
    }

    /// Release the cache, marking the session clean when no entry
    /// handles remain open
    pub fn close(self) {}
}

impl Drop for Backend {
    fn drop(&mut self) {
        let shared = &self.shared;
        if shared.read_only {
            return;
        }
        if shared.open_handles() > 0 {
            warn!("cache closed with live entry handles, session stays marked dirty");
            return;
        }
        let mut header = shared.header.lock();
        header.crash = 0;
        if let Err(err) = shared.write_header(&header) {
            warn!(%err, "failed to mark clean shutdown");
        }
        if let Err(err) = shared.index.sync() {
            warn!(%err, "failed to sync index");
        }
    }
}

// =============================================================================
// Shared internals
// =============================================================================

impl BackendShared {
    fn ensure_enabled(&self) -> Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(CacheError::Disabled);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CacheError::InvalidArgument("cache is read-only".into()));
        }
        Ok(())
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Put the cache in the disabled state after an unrecoverable
    /// error. Every subsequent operation fails with `Disabled`.
    fn fatal(&self, err: &CacheError) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            error!(%err, "critical cache error, disabling backend");
        }
    }

    fn mask(&self) -> u32 {
        self.header.lock().mask
    }

    pub(crate) fn current_id(&self) -> u32 {
        self.header.lock().this_id
    }

    pub(crate) fn used_size(&self) -> i64 {
        self.header.lock().num_bytes as i64
    }

    pub(crate) fn max_size(&self) -> i64 {
        self.max_size.load(Ordering::SeqCst)
    }

    pub(crate) fn max_file_size(&self) -> usize {
        (self.max_size() / 8).max(MIN_FILE_SIZE) as usize
    }

    fn open_handles(&self) -> usize {
        self.open_entries
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.open_handles() > LOADED_HANDLES
    }

    fn write_header(&self, header: &IndexHeader) -> Result<()> {
        self.index.write(&header.encode(), 0)
    }

    fn read_table(&self, bucket: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.index
            .read(&mut buf, INDEX_HEADER_SIZE as u64 + bucket as u64 * 4)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_table(&self, bucket: u32, value: u32) -> Result<()> {
        self.index
            .write(&value.to_le_bytes(), INDEX_HEADER_SIZE as u64 + bucket as u64 * 4)
    }

    // =========================================================================
    // Storage accounting
    // =========================================================================

    /// Adjust the global byte count: `old` bytes stop being charged,
    /// `new` bytes start. Entry code calls this for every transition a
    /// stream or key makes between uncharged and charged state.
    pub(crate) fn modify_storage_size(&self, old: i64, new: i64) {
        if self.read_only || old == new {
            return;
        }
        let mut header = self.header.lock();
        let bytes = header.num_bytes as i64 + (new - old);
        if bytes < 0 {
            warn!(bytes, "storage accounting went negative, clamping");
        }
        header.num_bytes = bytes.max(0) as u32;
        if let Err(err) = self.write_header(&header) {
            warn!(%err, "failed to persist storage accounting");
        }
    }

    /// Run an eviction pass if the cache is over budget. Never called
    /// with an entry state lock held.
    pub(crate) fn maybe_trim(self: &Arc<Self>) {
        if self.read_only || self.used_size() <= self.max_size() {
            return;
        }
        if self.trimming.swap(true, Ordering::SeqCst) {
            return;
        }
        self.eviction.trim_cache(self, false);
        self.trimming.store(false, Ordering::SeqCst);
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub(crate) fn file_name(&self, addr: Addr) -> PathBuf {
        if addr.is_separate_file() {
            self.path.join(format!("f_{:06x}", addr.file_number()))
        } else {
            self.path.join(format!("data_{}", addr.file_number()))
        }
    }

    /// Resolve an address to an open file handle
    pub(crate) fn file_for(&self, addr: Addr) -> Result<Arc<CacheFile>> {
        if addr.is_separate_file() {
            Ok(Arc::new(CacheFile::open_or_create(&self.file_name(addr))?))
        } else {
            self.block_files.file(addr)
        }
    }

    /// Create a fresh external file and return its address
    pub(crate) fn create_external_file(&self) -> Result<Addr> {
        let mut header = self.header.lock();
        // Skip numbers already on disk; stale files can survive a
        // recreated index.
        for _ in 0..0x1000 {
            header.last_file = (header.last_file + 1) & 0x0fff_ffff;
            if header.last_file == 0 {
                header.last_file = 1;
            }
            let addr = Addr::external(header.last_file);
            let path = self.file_name(addr);
            if path.exists() {
                continue;
            }
            CacheFile::open_or_create(&path)?;
            self.write_header(&header)?;
            return Ok(addr);
        }
        Err(CacheError::Storage("no free external file number".into()))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Get or load the entry at `addr`. The bool reports whether the
    /// loaded entry carries a dirty generation from another session.
    pub(crate) fn entry_at(self: &Arc<Self>, addr: Addr) -> Result<(Arc<EntryInner>, bool)> {
        let mut map = self.open_entries.lock();
        if let Some(weak) = map.get(&addr.value()) {
            if let Some(inner) = weak.upgrade() {
                return Ok((inner, false));
            }
        }
        let (inner, dirty) = EntryInner::load(self, addr)?;
        let inner = Arc::new(inner);
        map.insert(addr.value(), Arc::downgrade(&inner));
        Ok((inner, dirty))
    }

    pub(crate) fn cache_entry_destroyed(&self, addr: Addr) {
        let mut map = self.open_entries.lock();
        if let Some(weak) = map.get(&addr.value()) {
            // Only drop a dead slot; a reloaded entry may have taken
            // the address over already.
            if weak.strong_count() == 0 {
                map.remove(&addr.value());
            }
        }
    }

    /// Walk the bucket chain for `key`, excising torn entries on the
    /// way, and return the live match if any
    pub(crate) fn match_entry(
        self: &Arc<Self>,
        key: &str,
        hash: u32,
    ) -> Result<Option<Arc<EntryInner>>> {
        let bucket = hash & self.mask();
        let mut prev: Option<Arc<EntryInner>> = None;
        let mut current = self.read_table(bucket)?;
        let mut walked = 0u32;

        while current != 0 {
            walked += 1;
            if walked > MAX_CHAIN {
                warn!(bucket, "bucket chain too long, truncating");
                if !self.read_only {
                    if let Err(err) = self.truncate_chain(bucket, prev.as_deref()) {
                        self.fatal(&err);
                        return Err(err);
                    }
                }
                return Ok(None);
            }
            let addr = Addr::new(current);
            match self.entry_at(addr) {
                Ok((inner, dirty)) => {
                    let next = inner.next_addr();
                    if dirty {
                        if self.read_only {
                            // Torn entries read as missing; repairs wait
                            // for a writable open.
                            prev = Some(inner);
                            current = next;
                            continue;
                        }
                        warn!(%addr, "removing entry left torn by another session");
                        if let Err(err) =
                            self.destroy_invalid_entry(&inner, prev.as_deref(), bucket, next)
                        {
                            self.fatal(&err);
                            return Err(err);
                        }
                        current = next;
                        continue;
                    }
                    if inner.is_same_entry(key, hash)? {
                        return Ok(Some(inner));
                    }
                    prev = Some(inner);
                    current = next;
                }
                Err(err) => {
                    // The rest of the chain is unreachable; cut it off
                    // so lookups stop tripping over it. Self-check will
                    // flag the count mismatch.
                    warn!(%addr, %err, "unreadable entry record, truncating chain");
                    if !self.read_only {
                        if let Err(err) = self.truncate_chain(bucket, prev.as_deref()) {
                            self.fatal(&err);
                            return Err(err);
                        }
                    }
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn truncate_chain(&self, bucket: u32, prev: Option<&EntryInner>) -> Result<()> {
        match prev {
            Some(parent) => parent.set_next_addr(0),
            None => self.write_table(bucket, 0),
        }
    }

    /// Remove a torn or invalid entry from the index and lists and
    /// mark it doomed; its storage goes when `inner` drops.
    fn destroy_invalid_entry(
        &self,
        inner: &Arc<EntryInner>,
        prev: Option<&EntryInner>,
        bucket: u32,
        next: u32,
    ) -> Result<()> {
        match prev {
            Some(parent) => parent.set_next_addr(next)?,
            None => self.write_table(bucket, next)?,
        }
        {
            let mut state = inner.state.lock();
            // Nodes reconstructed by crash recovery are already off
            // the lists.
            if state.node.dummy == 0 {
                if let Err(err) = self.eviction.on_doom_entry(self, &mut state) {
                    warn!(%err, "failed to unlink invalid entry from its list");
                }
            }
            inner.internal_doom(&mut state)?;
        }
        let mut header = self.header.lock();
        header.num_entries = header.num_entries.saturating_sub(1);
        self.write_header(&header)
    }

    // =========================================================================
    // Doom
    // =========================================================================

    /// Take an entry out of the index and the recency lists and flag
    /// it doomed. Open handles keep working against it.
    pub(crate) fn internal_doom_entry(self: &Arc<Self>, inner: &Arc<EntryInner>) -> Result<()> {
        let (hash, next, already_doomed) = {
            let state = inner.state.lock();
            (state.store.hash, state.store.next, state.doomed)
        };
        if already_doomed {
            return Ok(());
        }
        self.excise_from_chain(hash, inner.addr, next)?;
        {
            let mut state = inner.state.lock();
            self.eviction.on_doom_entry(self, &mut state)?;
            inner.internal_doom(&mut state)?;
        }
        let mut header = self.header.lock();
        header.num_entries = header.num_entries.saturating_sub(1);
        self.write_header(&header)?;
        debug!(addr = %inner.addr, "doomed entry");
        Ok(())
    }

    /// Unlink `addr` from its bucket chain, keeping any open parent's
    /// in-memory copy coherent with the disk
    fn excise_from_chain(self: &Arc<Self>, hash: u32, addr: Addr, next: u32) -> Result<()> {
        let bucket = hash & self.mask();
        let mut current = self.read_table(bucket)?;
        if current == addr.value() {
            return self.write_table(bucket, next);
        }
        let mut walked = 0u32;
        while current != 0 && walked < MAX_CHAIN {
            walked += 1;
            let (parent, _) = self.entry_at(Addr::new(current))?;
            let parent_next = parent.next_addr();
            if parent_next == addr.value() {
                return parent.set_next_addr(next);
            }
            current = parent_next;
        }
        warn!(%addr, bucket, "entry missing from its bucket chain");
        Ok(())
    }

    // =========================================================================
    // Eviction support
    // =========================================================================

    /// Doom the entry behind a rankings node during a trim walk.
    /// Returns false when the entry is referenced and must be skipped.
    pub(crate) fn evict_node(self: &Arc<Self>, node_addr: Addr, list: List) -> Result<bool> {
        let node = self.rankings.read_node(node_addr)?;
        let entry_addr = Addr::new(node.contents);

        let usable = node.dummy == 0
            && entry_addr.is_initialized()
            && entry_addr.file_type() == FileType::Block256;
        if !usable {
            return self.discard_node(node_addr, list).map(|()| true);
        }
        if let Some(weak) = self.open_entries.lock().get(&entry_addr.value()) {
            if weak.strong_count() > 0 {
                return Ok(false);
            }
        }
        let inner = match self.entry_at(entry_addr) {
            Ok((inner, _)) => inner,
            Err(err) => {
                warn!(%entry_addr, %err, "evicting node whose entry is unreadable");
                return self.discard_node(node_addr, list).map(|()| true);
            }
        };
        self.internal_doom_entry(&inner)?;
        Ok(true)
    }

    /// Drop a rankings node that no longer describes a live entry
    fn discard_node(&self, node_addr: Addr, list: List) -> Result<()> {
        let mut node = self.rankings.read_node(node_addr)?;
        self.rankings.remove(&mut node, node_addr, list)?;
        self.block_files.delete_block(node_addr, false)
    }

    // =========================================================================
    // Recency plumbing for entries
    // =========================================================================

    /// Touch an entry's position in its list. The single authorized
    /// path from entry I/O to the shared lists.
    pub(crate) fn update_rank_locked(&self, state: &mut EntryState, modified: bool) -> Result<()> {
        let list = self.eviction.list_for(state.store.reuse_count);
        self.rankings
            .update_rank(&mut state.node, state.node_addr, list, modified)
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    fn open_following(
        self: &Arc<Self>,
        iter: &mut Enumerator,
        forward: bool,
    ) -> Result<Option<Entry>> {
        self.ensure_enabled()?;
        loop {
            let mut best: Option<(usize, Addr, u64)> = None;
            for i in 0..NUM_LISTS {
                let list = List::from_index(i as u32);
                let candidate = match iter.returned[i] {
                    Some(returned) => {
                        let returned = Addr::new(returned);
                        let step = if forward {
                            self.rankings.next_of(returned)
                        } else {
                            self.rankings.prev_of(returned)
                        };
                        match step {
                            Ok(addr) => addr,
                            Err(err) => {
                                warn!(%returned, %err, "enumeration lost its place in a list");
                                continue;
                            }
                        }
                    }
                    None => {
                        if forward {
                            self.rankings.head(list)
                        } else {
                            self.rankings.tail(list)
                        }
                    }
                };
                if !candidate.is_initialized() {
                    continue;
                }
                let last_used = match self.rankings.read_node(candidate) {
                    Ok(node) => node.last_used,
                    Err(err) => {
                        warn!(%candidate, %err, "skipping unreadable node in enumeration");
                        continue;
                    }
                };
                let better = match best {
                    None => true,
                    // Forward walks newest first, backward oldest first.
                    Some((_, _, best_time)) => {
                        if forward {
                            last_used > best_time
                        } else {
                            last_used < best_time
                        }
                    }
                };
                if better {
                    best = Some((i, candidate, last_used));
                }
            }

            let Some((list_index, node_addr, _)) = best else {
                return Ok(None);
            };
            let previous = iter.returned[list_index];
            iter.returned[list_index] = Some(node_addr.value());

            match self.entry_from_node(node_addr) {
                Ok(NodeResolution::Entry(inner)) => return Ok(Some(Entry { inner })),
                Ok(NodeResolution::Destroyed) => {
                    // Step the cursor back so the repaired link is
                    // followed next round.
                    iter.returned[list_index] = previous;
                }
                Ok(NodeResolution::Skipped) => {}
                Err(err) => {
                    warn!(%node_addr, %err, "enumeration skipping bad node");
                    if self.read_only {
                        continue;
                    }
                    iter.returned[list_index] = previous;
                    let list = List::from_index(list_index as u32);
                    if let Err(err) = self.discard_node(node_addr, list) {
                        warn!(%node_addr, %err, "failed to discard bad node");
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Resolve a rankings node to a live entry, destroying it when it
    /// points at nothing valid
    fn entry_from_node(self: &Arc<Self>, node_addr: Addr) -> Result<NodeResolution> {
        let node = self.rankings.read_node(node_addr)?;
        let entry_addr = Addr::new(node.contents);
        if node.dummy != 0
            || !entry_addr.is_initialized()
            || entry_addr.file_type() != FileType::Block256
        {
            return Err(CacheError::Corrupt(format!(
                "{node_addr} does not describe an entry"
            )));
        }
        let (inner, dirty) = self.entry_at(entry_addr)?;
        if dirty {
            if self.read_only {
                return Ok(NodeResolution::Skipped);
            }
            warn!(%entry_addr, "destroying torn entry found during enumeration");
            self.internal_doom_entry(&inner)?;
            return Ok(NodeResolution::Destroyed);
        }
        if inner.is_doomed() {
            return Ok(NodeResolution::Destroyed);
        }
        {
            let state = inner.state.lock();
            if state.node_addr != node_addr {
                return Err(CacheError::Corrupt(format!(
                    "{node_addr} points at an entry that does not own it"
                )));
            }
        }
        Ok(NodeResolution::Entry(inner))
    }
}

// =============================================================================
// Index validation
// =============================================================================

fn check_index(header: &IndexHeader, file_len: u64) -> Result<()> {
    if header.magic != INDEX_MAGIC {
        return Err(CacheError::Corrupt("bad index magic".into()));
    }
    if header.version != INDEX_VERSION {
        return Err(CacheError::Corrupt(format!(
            "unsupported index version {}",
            header.version
        )));
    }
    if header.table_len < MIN_TABLE_LEN || !header.table_len.is_power_of_two() {
        return Err(CacheError::Corrupt(format!(
            "invalid table length {}",
            header.table_len
        )));
    }
    if header.mask != header.table_len - 1 {
        return Err(CacheError::Corrupt("index mask does not match table".into()));
    }
    let needed = INDEX_HEADER_SIZE as u64 + header.table_len as u64 * 4;
    if file_len < needed {
        return Err(CacheError::Corrupt(format!(
            "index file holds {file_len} bytes, needs {needed}"
        )));
    }
    Ok(())
}

/// Remove every file this cache layout creates under `path`
fn delete_cache_files(path: &Path) -> Result<()> {
    for dir_entry in std::fs::read_dir(path)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let name = name.to_string_lossy();
        if name == "index" || name.starts_with("data_") || name.starts_with("f_") {
            std::fs::remove_file(dir_entry.path())?;
        }
    }
    Ok(())
}
