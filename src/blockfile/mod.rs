//! Block Pool File Module
//!
//! Fixed-block-size pool files and the raw file wrapper beneath them.
//!
//! ## Responsibilities
//! - Offset-addressed read/write on cache files (`CacheFile`)
//! - Allocate/free contiguous block runs, returning `Addr` values
//! - Grow pool files on demand and chain new files when one fills up
//! - Fix up a header left mid-update by a crash
//!
//! ## Pool File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (8192 bytes)                                     │
//! │   Magic (4) | Version (4) | ThisFile (2) | NextFile (2) │
//! │   EntrySize (4) | NumEntries (4) | MaxEntries (4)       │
//! │   Updating (4) | Padding (4)                            │
//! │   Allocation bitmap (8160 bytes, one bit per block)     │
//! ├─────────────────────────────────────────────────────────┤
//! │ Blocks (MaxEntries x EntrySize bytes)                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod file;
mod files;

pub use file::CacheFile;
pub use files::BlockFiles;

/// Magic bytes identifying a blockcache pool file
pub(crate) const BLOCK_MAGIC: u32 = 0xb10c_f11e;

/// Current pool file format version
pub(crate) const BLOCK_VERSION: u32 = 1;

/// Size of the pool file header, including the allocation bitmap
pub const BLOCK_HEADER_SIZE: usize = 8192;

/// Fixed header fields before the bitmap
pub(crate) const BLOCK_HEADER_FIXED: usize = 32;

/// Blocks addressable by one pool file's bitmap
pub(crate) const MAX_FILE_BLOCKS: u32 = ((BLOCK_HEADER_SIZE - BLOCK_HEADER_FIXED) * 8) as u32;

/// Blocks added each time a pool file grows
pub(crate) const GROW_BLOCKS: u32 = 1024;
