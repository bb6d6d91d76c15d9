//! # blockcache
//!
//! A disk-backed entry cache built on typed block pool files.
//!
//! Entries are keyed by string, carry up to three independent data
//! streams, and live in fixed-size records allocated out of pool files
//! by a bitmap. Recency is persisted in intrusive on-disk lists, so
//! eviction order survives restarts, and a per-session generation id
//! lets the cache detect and discard entries torn by a crash.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌───────────────┐
//!                     │    Backend    │   open/create/doom/enumerate
//!                     └───────┬───────┘
//!           ┌─────────────────┼──────────────────┐
//!           ▼                 ▼                  ▼
//!   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!   │    Entry     │  │   Eviction   │  │   Rankings   │
//!   │ stream I/O,  │  │ list policy, │  │ persisted    │
//!   │ buffering    │  │ trim passes  │  │ LRU lists    │
//!   └──────┬───────┘  └──────────────┘  └──────┬───────┘
//!          │                                   │
//!          ▼                                   ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │ BlockFiles: data_0..data_3 pools + f_* externals │
//!   └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use blockcache::{Backend, Config};
//!
//! # fn main() -> blockcache::Result<()> {
//! let cache = Backend::open(Config::builder().cache_dir("/tmp/cache").build())?;
//! let entry = cache.create_entry("https://example.com/logo.png")?;
//! entry.write_data(0, 0, b"metadata", true)?;
//! entry.write_data(1, 0, b"payload bytes", true)?;
//! drop(entry);
//!
//! let entry = cache.open_entry("https://example.com/logo.png")?;
//! let mut buf = vec![0u8; 13];
//! entry.read_data(1, 0, &mut buf)?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod backend;
pub mod blockfile;
pub mod config;
pub mod entry;
pub mod error;
mod eviction;
pub mod format;
pub mod rankings;

pub use backend::{Backend, CacheStats, Enumerator};
pub use config::{Config, ConfigBuilder, EvictionMode};
pub use entry::Entry;
pub use error::{CacheError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
