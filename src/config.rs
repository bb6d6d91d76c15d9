//! Configuration for blockcache
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

/// Default maximum data size for a cache instance (80 MB)
pub const DEFAULT_MAX_SIZE: i32 = 80 * 1024 * 1024;

/// Main configuration for a cache instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all cache files.
    /// Internal structure:
    ///   {cache_dir}/
    ///     ├── index            (hash table + header)
    ///     ├── data_0..data_3   (block pool files, one per block size)
    ///     └── f_XXXXXX         (standalone external files)
    pub cache_dir: PathBuf,

    /// Maximum total data size in bytes (0 = use default)
    pub max_size: i32,

    /// Optional mask limiting the effective index table size.
    /// Must be a power of two minus one. Mainly for tests and
    /// memory-constrained configurations.
    pub table_mask: Option<u32>,

    // -------------------------------------------------------------------------
    // Eviction Configuration
    // -------------------------------------------------------------------------
    /// Eviction mode: single LRU list or reuse-based multi-list
    pub eviction: EvictionMode,

    // -------------------------------------------------------------------------
    // Failure Handling
    // -------------------------------------------------------------------------
    /// Wipe and recreate the cache when the index is unusable at open.
    /// When false, an unusable index fails `Backend::open` instead.
    pub restart_on_failure: bool,

    /// Open without ever updating rankings or storage (inspection tools)
    pub read_only: bool,
}

/// Eviction algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Single recency list, evict strictly oldest-first
    Lru,

    /// Three lists (no-use / low-use / high-use) keyed by reuse count;
    /// rarely used entries are evicted before frequently used ones
    MultiList,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./blockcache_data"),
            max_size: DEFAULT_MAX_SIZE,
            table_mask: None,
            eviction: EvictionMode::MultiList,
            restart_on_failure: true,
            read_only: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the cache directory (root for all storage)
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = path.into();
        self
    }

    /// Set the maximum total data size (in bytes)
    pub fn max_size(mut self, bytes: i32) -> Self {
        self.config.max_size = bytes;
        self
    }

    /// Limit the effective index table size (power of two minus one)
    pub fn table_mask(mut self, mask: u32) -> Self {
        self.config.table_mask = Some(mask);
        self
    }

    /// Set the eviction mode
    pub fn eviction(mut self, mode: EvictionMode) -> Self {
        self.config.eviction = mode;
        self
    }

    /// Control wipe-and-recreate on an unusable index
    pub fn restart_on_failure(mut self, restart: bool) -> Self {
        self.config.restart_on_failure = restart;
        self
    }

    /// Open in read-only mode (no ranking or accounting updates)
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
