//! On-disk record layouts
//!
//! Fixed-size binary records, little-endian, hand-encoded.
//!
//! ## Index File Format
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ IndexHeader (128 bytes)                                    │
//! │   Magic | Version | NumEntries | NumBytes | LastFile |     │
//! │   ThisId | Crash | TableLen | Mask | padding               │
//! ├────────────────────────────────────────────────────────────┤
//! │ LruData (128 bytes)                                        │
//! │   Filled | Sizes[3] | Heads[3] | Tails[3] |                │
//! │   Transaction | Operation | OperationList | padding        │
//! ├────────────────────────────────────────────────────────────┤
//! │ Table (TableLen x 4 bytes)                                 │
//! │   bucket heads: Addr of the first EntryStore per bucket    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! `EntryStore` occupies 1..=4 contiguous 256-byte blocks (a 96-byte
//! fixed prefix plus inline key bytes); `RankingsNode` is exactly one
//! 36-byte rankings block.

use crate::error::{CacheError, Result};

/// Magic number of the index file
pub const INDEX_MAGIC: u32 = 0xb10c_cace;

/// Current index format version
pub const INDEX_VERSION: u32 = 1;

/// Bytes reserved for the index header (IndexHeader + LruData)
pub const INDEX_HEADER_SIZE: usize = 256;

/// Offset of the rankings control block within the index file
pub const LRU_DATA_OFFSET: usize = 128;

/// Default hash table length (entries); must be a power of two
pub const DEFAULT_TABLE_LEN: u32 = 0x10000;

/// Number of recency lists
pub const NUM_LISTS: usize = 3;

/// Logical data streams per entry
pub const NUM_STREAMS: usize = 3;

/// Slot in the per-entry file-handle table reserved for the key file
pub const KEY_FILE_INDEX: usize = 3;

/// Fixed prefix of an EntryStore record, before the inline key
pub const ENTRY_STORE_PREFIX: usize = 96;

/// Size in bytes of one EntryStore base block
pub const ENTRY_BLOCK_SIZE: usize = 256;

/// Longest key stored inline (4 blocks minus the fixed prefix)
pub const MAX_INLINE_KEY: usize = 4 * ENTRY_BLOCK_SIZE - ENTRY_STORE_PREFIX;

/// Size in bytes of a RankingsNode record
pub const RANKINGS_NODE_SIZE: usize = 36;

// =============================================================================
// Little-endian field helpers
// =============================================================================

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Index Header
// =============================================================================

/// Header of the index file (first 128 bytes)
#[derive(Debug, Clone, Default)]
pub struct IndexHeader {
    pub magic: u32,
    pub version: u32,
    /// Number of live entries
    pub num_entries: u32,
    /// Total bytes committed to streams and keys
    pub num_bytes: u32,
    /// Counter used to name external files
    pub last_file: u32,
    /// Session generation id for dirty detection
    pub this_id: u32,
    /// Nonzero while a session has the cache open
    pub crash: u32,
    /// Hash table length
    pub table_len: u32,
    /// Hash mask (table_len - 1)
    pub mask: u32,
}

impl IndexHeader {
    pub fn new(table_len: u32) -> IndexHeader {
        IndexHeader {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            table_len,
            mask: table_len - 1,
            ..Default::default()
        }
    }

    pub fn decode(buf: &[u8]) -> Result<IndexHeader> {
        if buf.len() < LRU_DATA_OFFSET {
            return Err(CacheError::Corrupt("index header too short".into()));
        }
        Ok(IndexHeader {
            magic: get_u32(buf, 0),
            version: get_u32(buf, 4),
            num_entries: get_u32(buf, 8),
            num_bytes: get_u32(buf, 12),
            last_file: get_u32(buf, 16),
            this_id: get_u32(buf, 20),
            crash: get_u32(buf, 24),
            table_len: get_u32(buf, 28),
            mask: get_u32(buf, 32),
        })
    }

    pub fn encode(&self) -> [u8; LRU_DATA_OFFSET] {
        let mut buf = [0u8; LRU_DATA_OFFSET];
        put_u32(&mut buf, 0, self.magic);
        put_u32(&mut buf, 4, self.version);
        put_u32(&mut buf, 8, self.num_entries);
        put_u32(&mut buf, 12, self.num_bytes);
        put_u32(&mut buf, 16, self.last_file);
        put_u32(&mut buf, 20, self.this_id);
        put_u32(&mut buf, 24, self.crash);
        put_u32(&mut buf, 28, self.table_len);
        put_u32(&mut buf, 32, self.mask);
        buf
    }
}

// =============================================================================
// Rankings Control Data
// =============================================================================

/// Persisted control block for the recency lists (second 128 bytes of
/// the index header region). Owned exclusively by the rankings module.
#[derive(Debug, Clone, Default)]
pub struct LruData {
    /// Set once the cache has gone through a full eviction pass
    pub filled: u32,
    pub sizes: [u32; NUM_LISTS],
    pub heads: [u32; NUM_LISTS],
    pub tails: [u32; NUM_LISTS],
    /// Address of the node with an in-flight list operation (0 = none)
    pub transaction: u32,
    /// In-flight operation code (see rankings::Operation)
    pub operation: u32,
    /// List targeted by the in-flight operation
    pub operation_list: u32,
}

impl LruData {
    pub fn decode(buf: &[u8]) -> Result<LruData> {
        if buf.len() < INDEX_HEADER_SIZE - LRU_DATA_OFFSET {
            return Err(CacheError::Corrupt("lru data too short".into()));
        }
        let mut lru = LruData {
            filled: get_u32(buf, 0),
            transaction: get_u32(buf, 40),
            operation: get_u32(buf, 44),
            operation_list: get_u32(buf, 48),
            ..Default::default()
        };
        for i in 0..NUM_LISTS {
            lru.sizes[i] = get_u32(buf, 4 + i * 4);
            lru.heads[i] = get_u32(buf, 16 + i * 4);
            lru.tails[i] = get_u32(buf, 28 + i * 4);
        }
        Ok(lru)
    }

    pub fn encode(&self) -> [u8; INDEX_HEADER_SIZE - LRU_DATA_OFFSET] {
        let mut buf = [0u8; INDEX_HEADER_SIZE - LRU_DATA_OFFSET];
        put_u32(&mut buf, 0, self.filled);
        for i in 0..NUM_LISTS {
            put_u32(&mut buf, 4 + i * 4, self.sizes[i]);
            put_u32(&mut buf, 16 + i * 4, self.heads[i]);
            put_u32(&mut buf, 28 + i * 4, self.tails[i]);
        }
        put_u32(&mut buf, 40, self.transaction);
        put_u32(&mut buf, 44, self.operation);
        put_u32(&mut buf, 48, self.operation_list);
        buf
    }
}

// =============================================================================
// EntryStore
// =============================================================================

/// On-disk metadata record for one cache entry.
///
/// The record spans `1..=4` contiguous 256-byte blocks; keys short
/// enough to fit after the 96-byte prefix are stored inline, longer
/// keys live in a separate blob addressed by `long_key`.
#[derive(Debug, Clone, Default)]
pub struct EntryStore {
    pub hash: u32,
    /// Next EntryStore in the same hash bucket (0 = end of chain)
    pub next: u32,
    /// Addr of this entry's RankingsNode
    pub rankings_node: u32,
    /// Key length in bytes
    pub key_len: u32,
    /// Addr of the overflow key blob, when the key is not inline
    pub long_key: u32,
    /// Opaque bitset owned by the entry's creator
    pub flags: u32,
    /// Times this entry has been opened; drives list placement
    pub reuse_count: u32,
    /// Creation time, ms since the epoch
    pub creation_time: u64,
    pub data_size: [u32; 4],
    pub data_addr: [u32; 4],
    /// Inline key bytes (empty when `long_key` is used)
    pub key: Vec<u8>,
}

impl EntryStore {
    /// Record size in bytes for a key of `key_len` stored inline
    pub fn size_for_key(key_len: usize) -> usize {
        if key_len <= MAX_INLINE_KEY {
            ENTRY_STORE_PREFIX + key_len
        } else {
            ENTRY_STORE_PREFIX
        }
    }

    /// Whether a key of this length is stored inline
    pub fn key_is_inline(key_len: usize) -> bool {
        key_len <= MAX_INLINE_KEY
    }

    /// Decode from a record buffer of `num_blocks * 256` bytes
    pub fn decode(buf: &[u8]) -> Result<EntryStore> {
        if buf.len() < ENTRY_STORE_PREFIX {
            return Err(CacheError::Corrupt("entry record too short".into()));
        }
        let mut store = EntryStore {
            hash: get_u32(buf, 0),
            next: get_u32(buf, 4),
            rankings_node: get_u32(buf, 8),
            key_len: get_u32(buf, 12),
            long_key: get_u32(buf, 16),
            flags: get_u32(buf, 20),
            reuse_count: get_u32(buf, 24),
            creation_time: get_u64(buf, 32),
            ..Default::default()
        };
        for i in 0..4 {
            store.data_size[i] = get_u32(buf, 40 + i * 4);
            store.data_addr[i] = get_u32(buf, 56 + i * 4);
        }
        let key_len = store.key_len as usize;
        if Self::key_is_inline(key_len) && store.long_key == 0 {
            if ENTRY_STORE_PREFIX + key_len > buf.len() {
                return Err(CacheError::Corrupt("inline key past record end".into()));
            }
            store.key = buf[ENTRY_STORE_PREFIX..ENTRY_STORE_PREFIX + key_len].to_vec();
        }
        Ok(store)
    }

    /// Encode into a zero-padded record buffer of `record_len` bytes
    pub fn encode(&self, record_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; record_len];
        put_u32(&mut buf, 0, self.hash);
        put_u32(&mut buf, 4, self.next);
        put_u32(&mut buf, 8, self.rankings_node);
        put_u32(&mut buf, 12, self.key_len);
        put_u32(&mut buf, 16, self.long_key);
        put_u32(&mut buf, 20, self.flags);
        put_u32(&mut buf, 24, self.reuse_count);
        put_u64(&mut buf, 32, self.creation_time);
        for i in 0..4 {
            put_u32(&mut buf, 40 + i * 4, self.data_size[i]);
            put_u32(&mut buf, 56 + i * 4, self.data_addr[i]);
        }
        if !self.key.is_empty() {
            buf[ENTRY_STORE_PREFIX..ENTRY_STORE_PREFIX + self.key.len()]
                .copy_from_slice(&self.key);
        }
        buf
    }
}

// =============================================================================
// RankingsNode
// =============================================================================

/// On-disk record placing an entry in a recency list.
///
/// `next`/`prev` are maintained by the rankings module only; the entry
/// code reads timestamps and the dirty generation but never the links.
#[derive(Debug, Clone, Default)]
pub struct RankingsNode {
    pub last_used: u64,
    pub last_modified: u64,
    pub next: u32,
    pub prev: u32,
    /// Addr of the owning EntryStore (back-reference, not ownership)
    pub contents: u32,
    /// 0 = clean, else the generation id of the dirtying session
    pub dirty: u32,
    /// Set when the node was reconstructed during crash recovery and
    /// may not describe a real entry
    pub dummy: u32,
}

impl RankingsNode {
    pub fn decode(buf: &[u8]) -> Result<RankingsNode> {
        if buf.len() < RANKINGS_NODE_SIZE {
            return Err(CacheError::Corrupt("rankings record too short".into()));
        }
        Ok(RankingsNode {
            last_used: get_u64(buf, 0),
            last_modified: get_u64(buf, 8),
            next: get_u32(buf, 16),
            prev: get_u32(buf, 20),
            contents: get_u32(buf, 24),
            dirty: get_u32(buf, 28),
            dummy: get_u32(buf, 32),
        })
    }

    pub fn encode(&self) -> [u8; RANKINGS_NODE_SIZE] {
        let mut buf = [0u8; RANKINGS_NODE_SIZE];
        put_u64(&mut buf, 0, self.last_used);
        put_u64(&mut buf, 8, self.last_modified);
        put_u32(&mut buf, 16, self.next);
        put_u32(&mut buf, 20, self.prev);
        put_u32(&mut buf, 24, self.contents);
        put_u32(&mut buf, 28, self.dirty);
        put_u32(&mut buf, 32, self.dummy);
        buf
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Current wall-clock time in ms since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 32-bit hash of a cache key, fed through the index mask
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Number of 256-byte blocks needed for an entry with this key length
pub fn entry_num_blocks(key_len: usize) -> u32 {
    let size = EntryStore::size_for_key(key_len);
    (size.div_ceil(ENTRY_BLOCK_SIZE) as u32).min(crate::addr::MAX_BLOCKS)
}
