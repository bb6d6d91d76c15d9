//! Cache entries
//!
//! In-memory handles over on-disk cache entries. An `Entry` wraps a
//! shared `EntryInner`; the backend's open-entry table guarantees one
//! inner per on-disk address, so concurrent lookups of the same entry
//! share state instead of racing on the same blocks.
//!
//! ## Stream Representation
//! Each of the three data streams is either:
//! - empty (no storage, size 0),
//! - buffered: a 16 KB in-memory buffer coalescing writes while the
//!   stream is small, or
//! - stored: a block run or external file addressed by `data_addr`.
//!
//! Transitions follow the write path: small streams start buffered and
//! are materialized to storage when they outgrow the buffer or when the
//! entry is released; block-backed streams that outgrow their
//! allocation are pulled back into a buffer and re-flushed to a bigger
//! allocation.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::warn;

use crate::addr::{Addr, FileType, MAX_BLOCK_SIZE};
use crate::backend::BackendShared;
use crate::blockfile::CacheFile;
use crate::error::{CacheError, Result};
use crate::format::{
    now_ms, EntryStore, RankingsNode, ENTRY_BLOCK_SIZE, KEY_FILE_INDEX, MAX_INLINE_KEY,
    NUM_STREAMS,
};

/// Reference-counted handle to an open cache entry.
///
/// Handles are cheap to clone; the entry's buffered data is flushed
/// (or, for doomed entries, its storage reclaimed) when the last
/// handle is dropped.
#[derive(Clone)]
pub struct Entry {
    pub(crate) inner: Arc<EntryInner>,
}

pub(crate) struct EntryInner {
    pub(crate) backend: Arc<BackendShared>,
    /// Address of the EntryStore record
    pub(crate) addr: Addr,
    pub(crate) state: Mutex<EntryState>,
}

pub(crate) struct EntryState {
    pub(crate) store: EntryStore,
    pub(crate) store_dirty: bool,
    pub(crate) node: RankingsNode,
    pub(crate) node_addr: Addr,
    pub(crate) node_dirty: bool,
    pub(crate) doomed: bool,
    user_buffers: [Option<BytesMut>; NUM_STREAMS],
    /// Bytes recorded in `data_size` but not yet charged to the
    /// backend's storage accounting (buffered, uncommitted)
    unreported_size: [i64; NUM_STREAMS],
    /// Cached backing file handles; slot 3 is the external key file
    files: [Option<Arc<CacheFile>>; NUM_STREAMS + 1],
}

/// Zero `buffer` outside `[offset, offset + valid_len)`
fn clear_invalid_data(buffer: &mut [u8], offset: usize, valid_len: usize) {
    buffer[..offset].fill(0);
    buffer[offset + valid_len..].fill(0);
}

// =============================================================================
// Public handle API
// =============================================================================

impl Entry {
    /// The entry's key
    pub fn key(&self) -> Result<String> {
        let mut state = self.inner.state.lock();
        self.inner.read_key(&mut state)
    }

    /// Time of last access (ms since the epoch)
    pub fn last_used(&self) -> u64 {
        self.inner.state.lock().node.last_used
    }

    /// Time of last modification (ms since the epoch)
    pub fn last_modified(&self) -> u64 {
        self.inner.state.lock().node.last_modified
    }

    /// Creation time (ms since the epoch)
    pub fn creation_time(&self) -> u64 {
        self.inner.state.lock().store.creation_time
    }

    /// Recorded size of a stream; 0 for an out-of-range index
    pub fn data_size(&self, stream: usize) -> u32 {
        if stream >= NUM_STREAMS {
            return 0;
        }
        self.inner.state.lock().store.data_size[stream]
    }

    /// Opaque flag bits owned by the entry's creator
    pub fn flags(&self) -> u32 {
        self.inner.state.lock().store.flags
    }

    /// OR flag bits into the entry
    pub fn set_flags(&self, flags: u32) -> Result<()> {
        self.inner.backend.ensure_writable()?;
        let mut state = self.inner.state.lock();
        state.store.flags |= flags;
        state.store_dirty = true;
        Ok(())
    }

    /// Read up to `buf.len()` bytes from a stream at `offset`.
    ///
    /// Returns the number of bytes read; reads at or past the end of
    /// the stream return `Ok(0)`. The read length is clamped to the
    /// recorded stream size.
    pub fn read_data(&self, stream: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        if stream >= NUM_STREAMS {
            return Err(CacheError::InvalidArgument(format!(
                "stream {stream} out of range"
            )));
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let entry_size = state.store.data_size[stream] as usize;
        if offset >= entry_size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(entry_size - offset);

        // Recency is updated before the I/O it describes.
        inner.update_rank(&mut state, false)?;

        if let Some(buffer) = &state.user_buffers[stream] {
            buf[..len].copy_from_slice(&buffer[offset..offset + len]);
            return Ok(len);
        }

        let addr = Addr::new(state.store.data_addr[stream]);
        if !addr.is_initialized() {
            return Err(CacheError::Storage(format!(
                "stream {stream} has size {entry_size} but no storage"
            )));
        }
        let file = inner.backing_file(&mut state, addr, stream)?;
        let file_offset = if addr.is_block_file() {
            addr.block_offset() + offset as u64
        } else {
            offset as u64
        };
        file.read(&mut buf[..len], file_offset)?;
        Ok(len)
    }

    /// Write `buf` to a stream at `offset`.
    ///
    /// With `truncate`, the stream is clipped to exactly
    /// `offset + buf.len()` bytes after the write; bytes between the
    /// new end and the previous end of valid data are cleared.
    pub fn write_data(
        &self,
        stream: usize,
        offset: usize,
        buf: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        if stream >= NUM_STREAMS {
            return Err(CacheError::InvalidArgument(format!(
                "stream {stream} out of range"
            )));
        }
        let inner = &self.inner;
        inner.backend.ensure_writable()?;
        let max_file_size = inner.backend.max_file_size();
        if offset > max_file_size
            || buf.len() > max_file_size
            || offset + buf.len() > max_file_size
        {
            return Err(CacheError::CapacityExceeded);
        }

        let written = {
            let mut state = inner.state.lock();
            inner.write_data_locked(&mut state, stream, offset, buf, truncate)?
        };
        // Budget is enforced at operation boundaries, never while the
        // entry's own state lock is held.
        inner.backend.maybe_trim();
        Ok(written)
    }

    /// Mark this entry as logically deleted. The handle stays usable;
    /// storage is reclaimed when the last handle is dropped.
    pub fn doom(&self) -> Result<()> {
        self.inner.backend.ensure_writable()?;
        {
            let mut state = self.inner.state.lock();
            if state.doomed {
                return Ok(());
            }
            // Stamp the node so a crash before destruction still shows
            // this entry as belonging to an unfinished operation.
            state.node.dirty = self.inner.backend.current_id();
            state.node.dummy = 0;
            self.inner.store_node(&mut state)?;
        }
        self.inner.backend.internal_doom_entry(&self.inner)
    }

    /// Release this handle. Equivalent to dropping it; provided so
    /// call sites can make the release explicit.
    pub fn close(self) {}
}

// =============================================================================
// Construction and loading
// =============================================================================

impl EntryInner {
    fn empty_state(store: EntryStore, node: RankingsNode, node_addr: Addr) -> EntryState {
        EntryState {
            store,
            store_dirty: false,
            node,
            node_addr,
            node_dirty: false,
            doomed: false,
            user_buffers: Default::default(),
            unreported_size: [0; NUM_STREAMS],
            files: Default::default(),
        }
    }

    /// Load an existing entry from its record address. Returns the
    /// inner plus whether the entry looks crash-torn (dirty generation
    /// from another session, or a reconstructed dummy node).
    pub(crate) fn load(backend: &Arc<BackendShared>, addr: Addr) -> Result<(EntryInner, bool)> {
        if !addr.is_block_file() || addr.file_type() != FileType::Block256 {
            return Err(CacheError::Corrupt(format!("{addr} cannot hold an entry")));
        }
        let buf = backend.block_files.read_record(addr)?;
        let store = EntryStore::decode(&buf)?;

        let node_addr = Addr::new(store.rankings_node);
        let node = backend.rankings.read_node(node_addr)?;

        let current_id = backend.current_id();
        let dirty = node.dummy != 0 || (node.dirty != 0 && node.dirty != current_id);

        let inner = EntryInner {
            backend: Arc::clone(backend),
            addr,
            state: Mutex::new(Self::empty_state(store, node, node_addr)),
        };
        Ok((inner, dirty))
    }

    /// Initialize a brand new entry in pre-allocated records.
    ///
    /// On failure any partially allocated key storage is released
    /// before returning; the caller owns the entry/node blocks.
    pub(crate) fn create(
        backend: &Arc<BackendShared>,
        addr: Addr,
        node_addr: Addr,
        key: &str,
        hash: u32,
    ) -> Result<EntryInner> {
        let mut store = EntryStore {
            hash,
            rankings_node: node_addr.value(),
            key_len: key.len() as u32,
            creation_time: now_ms(),
            ..Default::default()
        };
        let node = RankingsNode {
            contents: addr.value(),
            dirty: backend.current_id(),
            last_used: store.creation_time,
            last_modified: store.creation_time,
            ..Default::default()
        };

        let mut key_file = None;
        if key.len() > MAX_INLINE_KEY {
            let key_addr = create_block_for(backend, key.len())?;
            store.long_key = key_addr.value();
            let offset = if key_addr.is_block_file() {
                key_addr.block_offset()
            } else {
                0
            };
            let write_result = backend
                .file_for(key_addr)
                .and_then(|file| file.write(key.as_bytes(), offset).map(|()| file));
            match write_result {
                Ok(file) => key_file = Some(file),
                Err(err) => {
                    delete_storage(backend, key_addr);
                    return Err(err);
                }
            }
        } else {
            store.key = key.as_bytes().to_vec();
        }

        let record_len = addr.num_blocks() as usize * ENTRY_BLOCK_SIZE;
        let persisted = backend
            .block_files
            .write_record(addr, &store.encode(record_len))
            .and_then(|()| backend.rankings.write_node(node_addr, &node));
        if let Err(err) = persisted {
            let key_addr = Addr::new(store.long_key);
            if key_addr.is_initialized() {
                delete_storage(backend, key_addr);
            }
            return Err(err);
        }
        backend.modify_storage_size(0, key.len() as i64);

        let mut state = Self::empty_state(store, node, node_addr);
        state.files[KEY_FILE_INDEX] = key_file;
        Ok(EntryInner {
            backend: Arc::clone(backend),
            addr,
            state: Mutex::new(state),
        })
    }

    // =========================================================================
    // Key handling
    // =========================================================================

    pub(crate) fn read_key(&self, state: &mut EntryState) -> Result<String> {
        let key_len = state.store.key_len as usize;
        if state.store.long_key == 0 {
            return String::from_utf8(state.store.key.clone())
                .map_err(|_| CacheError::Corrupt("entry key is not valid UTF-8".into()));
        }
        let addr = Addr::new(state.store.long_key);
        let offset = if addr.is_block_file() {
            addr.block_offset()
        } else {
            0
        };
        // Keep the key file handle so the key stays readable even if
        // the backend is later disabled.
        if state.files[KEY_FILE_INDEX].is_none() {
            state.files[KEY_FILE_INDEX] = Some(self.backend.file_for(addr)?);
        }
        let file = match state.files[KEY_FILE_INDEX].as_ref() {
            Some(file) => file,
            None => return Err(CacheError::Storage("key file unavailable".into())),
        };
        let mut buf = vec![0u8; key_len];
        file.read(&mut buf, offset)?;
        String::from_utf8(buf).map_err(|_| CacheError::Corrupt("entry key is not valid UTF-8".into()))
    }

    /// Exact match: same hash, same length, same bytes
    pub(crate) fn is_same_entry(&self, key: &str, hash: u32) -> Result<bool> {
        let mut state = self.state.lock();
        if state.store.hash != hash || state.store.key_len as usize != key.len() {
            return Ok(false);
        }
        Ok(self.read_key(&mut state)? == key)
    }

    // =========================================================================
    // Bucket chain linkage (backend-driven)
    // =========================================================================

    pub(crate) fn next_addr(&self) -> u32 {
        self.state.lock().store.next
    }

    pub(crate) fn set_next_addr(&self, next: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.store.next = next;
        state.store_dirty = true;
        self.store_record(&mut state)
    }

    pub(crate) fn hash(&self) -> u32 {
        self.state.lock().store.hash
    }

    pub(crate) fn reuse_count(&self) -> u32 {
        self.state.lock().store.reuse_count
    }

    pub(crate) fn is_doomed(&self) -> bool {
        self.state.lock().doomed
    }

    /// Structural validity of the metadata record
    pub(crate) fn sanity_check(store: &EntryStore) -> bool {
        if store.rankings_node == 0 || store.key_len == 0 {
            return false;
        }
        let rankings_addr = Addr::new(store.rankings_node);
        if !rankings_addr.is_initialized()
            || rankings_addr.is_separate_file()
            || rankings_addr.file_type() != FileType::Rankings
        {
            return false;
        }
        let next_addr = Addr::new(store.next);
        if next_addr.is_initialized()
            && (next_addr.is_separate_file() || next_addr.file_type() != FileType::Block256)
        {
            return false;
        }
        true
    }

    // =========================================================================
    // Record persistence
    // =========================================================================

    pub(crate) fn store_record(&self, state: &mut EntryState) -> Result<()> {
        let record_len = self.addr.num_blocks() as usize * ENTRY_BLOCK_SIZE;
        self.backend
            .block_files
            .write_record(self.addr, &state.store.encode(record_len))?;
        state.store_dirty = false;
        Ok(())
    }

    /// Persist the node's entry-owned fields, preserving the list
    /// links on disk (the rankings module owns those).
    pub(crate) fn store_node(&self, state: &mut EntryState) -> Result<()> {
        let disk = self.backend.rankings.read_node(state.node_addr)?;
        state.node.next = disk.next;
        state.node.prev = disk.prev;
        self.backend.rankings.write_node(state.node_addr, &state.node)?;
        state.node_dirty = false;
        Ok(())
    }

    // =========================================================================
    // Doom and cleanup
    // =========================================================================

    /// Backend-side doom bookkeeping: stamp dirty and flip the flag.
    /// Index/rankings unlinking happens in the backend.
    pub(crate) fn internal_doom(&self, state: &mut EntryState) -> Result<()> {
        if state.node.dirty == 0 {
            state.node.dirty = self.backend.current_id();
            self.store_node(state)?;
        }
        state.doomed = true;
        Ok(())
    }

    /// Delete stream storage; with `everything`, also the key blob and
    /// the metadata/rankings records themselves.
    fn delete_entry_data(&self, state: &mut EntryState, everything: bool) -> Result<()> {
        for stream in 0..NUM_STREAMS {
            let addr = Addr::new(state.store.data_addr[stream]);
            if addr.is_initialized() {
                state.files[stream] = None;
                delete_storage(&self.backend, addr);
                self.backend.modify_storage_size(
                    state.store.data_size[stream] as i64 - state.unreported_size[stream],
                    0,
                );
                state.store.data_addr[stream] = 0;
                state.store.data_size[stream] = 0;
            }
        }

        if !everything {
            return self.store_record(state);
        }

        let key_addr = Addr::new(state.store.long_key);
        if key_addr.is_initialized() {
            state.files[KEY_FILE_INDEX] = None;
            delete_storage(&self.backend, key_addr);
        }
        self.backend
            .modify_storage_size(state.store.key_len as i64, 0);

        // Zero both records before freeing their blocks so recycled
        // blocks never leak a previous entry.
        let record_len = self.addr.num_blocks() as usize * ENTRY_BLOCK_SIZE;
        self.backend
            .block_files
            .write_record(self.addr, &vec![0u8; record_len])?;
        self.backend
            .rankings
            .write_node(state.node_addr, &RankingsNode::default())?;
        self.backend.block_files.delete_block(state.node_addr, false)?;
        self.backend.block_files.delete_block(self.addr, false)?;
        Ok(())
    }

    // =========================================================================
    // Recency
    // =========================================================================

    /// Touch recency. Live entries go through the backend (the sole
    /// authorized path to the shared lists); doomed entries only
    /// update their own timestamps, since they are no longer listed.
    fn update_rank(&self, state: &mut EntryState, modified: bool) -> Result<()> {
        if !state.doomed {
            return self.backend.update_rank_locked(state, modified);
        }
        let now = now_ms();
        state.node.last_used = now;
        if modified {
            state.node.last_modified = now;
        }
        state.node_dirty = true;
        Ok(())
    }

    // =========================================================================
    // Stream write path
    // =========================================================================

    fn write_data_locked(
        &self,
        state: &mut EntryState,
        stream: usize,
        offset: usize,
        buf: &[u8],
        mut truncate: bool,
    ) -> Result<usize> {
        // Size before preparation; prepare_target may change it.
        let entry_size = state.store.data_size[stream] as usize;
        self.prepare_target(state, stream, offset, buf.len(), truncate)?;

        let end = offset + buf.len();
        if entry_size < end {
            state.unreported_size[stream] += (end - entry_size) as i64;
            state.store.data_size[stream] = end as u32;
            state.store_dirty = true;
            if buf.is_empty() {
                truncate = true; // Force file extension.
            }
        } else if truncate {
            // If the size was modified inside prepare_target, leave it.
            if entry_size > end && entry_size == state.store.data_size[stream] as usize {
                state.unreported_size[stream] -= (entry_size - end) as i64;
                state.store.data_size[stream] = end as u32;
                state.store_dirty = true;
                self.clear_clipped_range(state, stream, end, entry_size)?;
            } else {
                truncate = false;
            }
        }

        self.update_rank(state, true)?;

        if let Some(buffer) = &mut state.user_buffers[stream] {
            if buf.is_empty() {
                return Ok(0);
            }
            buffer[offset..offset + buf.len()].copy_from_slice(buf);
            return Ok(buf.len());
        }

        let addr = Addr::new(state.store.data_addr[stream]);
        let file = self.backing_file(state, addr, stream)?;
        let file_offset = if addr.is_block_file() {
            addr.block_offset() + offset as u64
        } else {
            if truncate {
                file.set_length(end as u64)?;
            }
            offset as u64
        };
        if buf.is_empty() {
            return Ok(0);
        }
        file.write(buf, file_offset)?;
        Ok(buf.len())
    }

    /// Zero the clipped tail `[new_end, old_end)` of a block-backed
    /// stream so the bytes cannot resurface if the stream grows again.
    /// Buffered streams are cleared in prepare_target; external files
    /// shrink via set_length.
    fn clear_clipped_range(
        &self,
        state: &mut EntryState,
        stream: usize,
        new_end: usize,
        old_end: usize,
    ) -> Result<()> {
        if state.user_buffers[stream].is_some() || new_end >= old_end {
            return Ok(());
        }
        let addr = Addr::new(state.store.data_addr[stream]);
        if !addr.is_block_file() {
            return Ok(());
        }
        let file = self.backing_file(state, addr, stream)?;
        let zeros = vec![0u8; old_end - new_end];
        file.write(&zeros, addr.block_offset() + new_end as u64)
    }

    /// Make sure the target region `[offset, offset + buf_len)` has a
    /// home: an in-memory buffer for short streams, or block/external
    /// storage otherwise.
    fn prepare_target(
        &self,
        state: &mut EntryState,
        stream: usize,
        offset: usize,
        buf_len: usize,
        truncate: bool,
    ) -> Result<()> {
        let addr = Addr::new(state.store.data_addr[stream]);
        if addr.is_initialized() || state.user_buffers[stream].is_some() {
            return self.grow_user_buffer(state, stream, offset, buf_len, truncate);
        }

        if offset + buf_len > MAX_BLOCK_SIZE {
            return self.create_data_block(state, stream, offset + buf_len);
        }

        let mut buffer = BytesMut::zeroed(MAX_BLOCK_SIZE);
        // The region about to be written is left as-is; everything
        // else is cleared so stale bytes never reach disk later.
        clear_invalid_data(&mut buffer, offset, buf_len);
        state.user_buffers[stream] = Some(buffer);
        Ok(())
    }

    /// Called with data already present (buffered or stored). Handles
    /// growth past the buffer or the current allocation, and explicit
    /// truncation of buffered data.
    fn grow_user_buffer(
        &self,
        state: &mut EntryState,
        stream: usize,
        offset: usize,
        buf_len: usize,
        truncate: bool,
    ) -> Result<()> {
        let addr = Addr::new(state.store.data_addr[stream]);
        let end = offset + buf_len;

        if end > MAX_BLOCK_SIZE {
            // The data has to live in real storage.
            if addr.is_initialized() {
                if addr.is_separate_file() {
                    return Ok(());
                }
                self.move_to_local_buffer(state, stream)?;
            }
            return self.flush_buffer(state, stream, end);
        }

        if !addr.is_initialized() {
            // Buffered stream staying buffered.
            if truncate {
                if let Some(buffer) = &mut state.user_buffers[stream] {
                    clear_invalid_data(buffer, 0, end);
                }
            }
            return Ok(());
        }

        if addr.is_separate_file() {
            // External storage can grow and shrink in place.
            return Ok(());
        }

        // Block-backed: fine while the new extent fits the allocation.
        if end <= addr.block_size() * addr.num_blocks() as usize {
            return Ok(());
        }

        // The allocated run has to change; stage through a buffer.
        self.move_to_local_buffer(state, stream)?;

        let mut clear_start = state.store.data_size[stream] as usize;
        if truncate {
            clear_start = clear_start.min(end);
        } else if offset < clear_start {
            clear_start = clear_start.max(end);
        }
        if let Some(buffer) = &mut state.user_buffers[stream] {
            clear_invalid_data(buffer, 0, clear_start);
        }
        Ok(())
    }

    /// Pull a stored stream back into a fresh in-memory buffer,
    /// releasing its on-disk allocation.
    fn move_to_local_buffer(&self, state: &mut EntryState, stream: usize) -> Result<()> {
        let addr = Addr::new(state.store.data_addr[stream]);
        debug_assert!(state.user_buffers[stream].is_none());
        debug_assert!(addr.is_initialized());

        let len = state.store.data_size[stream] as usize;
        let mut buffer = BytesMut::zeroed(MAX_BLOCK_SIZE);
        let file = self.backing_file(state, addr, stream)?;
        let offset = if addr.is_block_file() {
            addr.block_offset()
        } else {
            0
        };
        file.read(&mut buffer[..len], offset)?;

        state.files[stream] = None;
        delete_storage(&self.backend, addr);
        state.store.data_addr[stream] = 0;
        self.store_record(state)?;

        // If we lose this entry now, it reads as zero-sized.
        self.backend
            .modify_storage_size(len as i64 - state.unreported_size[stream], 0);
        state.unreported_size[stream] = len as i64;

        state.user_buffers[stream] = Some(buffer);
        Ok(())
    }

    /// Commit a buffered stream to storage sized for `size` bytes and
    /// release the buffer. Accounting is only adjusted once the write
    /// has succeeded, so a failure leaves the stream buffered and the
    /// counters untouched.
    fn flush_buffer(&self, state: &mut EntryState, stream: usize, size: usize) -> Result<()> {
        debug_assert!(!Addr::new(state.store.data_addr[stream]).is_initialized());
        if size == 0 {
            state.user_buffers[stream] = None;
            return Ok(());
        }

        self.create_data_block(state, stream, size)?;
        let addr = Addr::new(state.store.data_addr[stream]);
        let len = state.store.data_size[stream] as usize;
        let offset = if addr.is_block_file() {
            addr.block_offset()
        } else {
            0
        };

        let write_result = (|| -> Result<()> {
            let file = self.backing_file(state, addr, stream)?;
            if len > 0 {
                if let Some(buffer) = &state.user_buffers[stream] {
                    file.write(&buffer[..len], offset)?;
                }
            }
            Ok(())
        })();

        if let Err(err) = write_result {
            state.files[stream] = None;
            delete_storage(&self.backend, addr);
            state.store.data_addr[stream] = 0;
            self.store_record(state)?;
            return Err(err);
        }

        self.backend.modify_storage_size(0, len as i64);
        state.unreported_size[stream] = 0;
        state.user_buffers[stream] = None;
        Ok(())
    }

    /// Allocate storage for `size` bytes and record it as the stream's
    /// backing address
    fn create_data_block(&self, state: &mut EntryState, stream: usize, size: usize) -> Result<()> {
        let addr = create_block_for(&self.backend, size)?;
        state.store.data_addr[stream] = addr.value();
        state.store_dirty = true;
        self.store_record(state)
    }

    /// Resolve (and cache) the backing file for an address
    fn backing_file(
        &self,
        state: &mut EntryState,
        addr: Addr,
        stream: usize,
    ) -> Result<Arc<CacheFile>> {
        if addr.is_separate_file() {
            if state.files[stream].is_none() {
                state.files[stream] = Some(self.backend.file_for(addr)?);
            }
            match state.files[stream].as_ref() {
                Some(file) => Ok(Arc::clone(file)),
                None => Err(CacheError::Storage("backing file unavailable".into())),
            }
        } else {
            self.backend.file_for(addr)
        }
    }
}

/// Allocate storage able to hold `size` bytes: a block run when one
/// fits, otherwise an external file (bounded by the max file size)
fn create_block_for(backend: &Arc<BackendShared>, size: usize) -> Result<Addr> {
    let file_type = Addr::required_file_type(size);
    if file_type == FileType::External {
        if size > backend.max_file_size() {
            return Err(CacheError::CapacityExceeded);
        }
        backend.create_external_file()
    } else {
        backend
            .block_files
            .create_block(file_type, Addr::required_blocks(size, file_type))
    }
}

/// Release one address worth of storage. Block runs are zero-filled;
/// external files are removed from the filesystem. Failures are logged
/// rather than surfaced, matching cleanup-path semantics.
fn delete_storage(backend: &Arc<BackendShared>, addr: Addr) {
    if !addr.is_initialized() {
        return;
    }
    if addr.is_separate_file() {
        let path = backend.file_name(addr);
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), %err, "failed to delete external cache file");
        }
    } else if let Err(err) = backend.block_files.delete_block(addr, true) {
        warn!(%addr, %err, "failed to release block run");
    }
}

// =============================================================================
// Deterministic release
// =============================================================================

impl Drop for EntryInner {
    fn drop(&mut self) {
        let backend = Arc::clone(&self.backend);
        if backend.is_read_only() {
            backend.cache_entry_destroyed(self.addr);
            return;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.doomed {
            // Everything goes: stream data, key blob, both records.
            if let Err(err) = self.delete_entry_data(state, true) {
                warn!(addr = %self.addr, %err, "doomed entry cleanup failed");
            }
        } else {
            let mut flushed = true;
            for stream in 0..NUM_STREAMS {
                if state.user_buffers[stream].is_some() {
                    let size = state.store.data_size[stream] as usize;
                    if let Err(err) = self.flush_buffer(state, stream, size) {
                        warn!(addr = %self.addr, stream, %err, "failed to save buffered data");
                        flushed = false;
                    }
                } else if state.unreported_size[stream] != 0 {
                    let size = state.store.data_size[stream] as i64;
                    backend.modify_storage_size(size - state.unreported_size[stream], size);
                    state.unreported_size[stream] = 0;
                }
            }

            if !flushed {
                // Part of the data is gone. Stamp the previous session
                // id so the next load treats this entry as suspect.
                let current = backend.current_id();
                state.node.dirty = if current == 1 { u32::MAX } else { current - 1 };
            } else if state.node.dirty != 0 {
                state.node.dirty = 0;
            }
            if state.store_dirty {
                if let Err(err) = self.store_record(state) {
                    warn!(addr = %self.addr, %err, "failed to persist entry record");
                }
            }
            if let Err(err) = self.store_node(state) {
                warn!(addr = %self.addr, %err, "failed to persist rankings node");
            }
        }

        drop(guard);
        backend.cache_entry_destroyed(self.addr);
    }
}
