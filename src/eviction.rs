//! Eviction policy
//!
//! Decides which recency list an entry belongs to and walks list tails
//! to reclaim space when the cache grows past its budget. Two modes:
//! plain LRU keeps every entry on one list; the multi-list mode
//! segregates entries by reuse so a burst of one-shot traffic cannot
//! flush frequently reopened entries.
//!
//! Trimming stops at 90% of the configured maximum so a single large
//! write does not trigger eviction on every subsequent operation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::BackendShared;
use crate::config::EvictionMode;
use crate::entry::EntryState;
use crate::error::Result;
use crate::format::now_ms;
use crate::rankings::List;

/// Reuse count at which an entry graduates from the low-use list
const HIGH_USE_THRESHOLD: u32 = 10;

/// Entries doomed per trim pass while the cache is under heavy use
const LOADED_TRIM_BATCH: u32 = 4;

pub(crate) struct Eviction {
    mode: EvictionMode,
}

impl Eviction {
    pub fn new(mode: EvictionMode) -> Eviction {
        Eviction { mode }
    }

    /// List an entry with this reuse count belongs to
    pub fn list_for(&self, reuse_count: u32) -> List {
        match self.mode {
            EvictionMode::Lru => List::NoUse,
            EvictionMode::MultiList => {
                if reuse_count == 0 {
                    List::NoUse
                } else if reuse_count < HIGH_USE_THRESHOLD {
                    List::LowUse
                } else {
                    List::HighUse
                }
            }
        }
    }

    /// Tail-first trim order
    fn trim_order(&self) -> &'static [List] {
        match self.mode {
            EvictionMode::Lru => &[List::NoUse],
            EvictionMode::MultiList => &[List::NoUse, List::LowUse, List::HighUse],
        }
    }

    // =========================================================================
    // Entry lifecycle hooks
    // =========================================================================

    /// A new entry joins the front of the no-use list
    pub fn on_create_entry(&self, backend: &BackendShared, state: &mut EntryState) -> Result<()> {
        backend
            .rankings
            .insert(&mut state.node, state.node_addr, self.list_for(0))
    }

    /// Reopening bumps the reuse counter and may promote the entry to
    /// a hotter list
    pub fn on_open_entry(&self, backend: &BackendShared, state: &mut EntryState) -> Result<()> {
        let old_list = self.list_for(state.store.reuse_count);
        state.store.reuse_count = state.store.reuse_count.saturating_add(1);
        state.store_dirty = true;
        let new_list = self.list_for(state.store.reuse_count);

        if old_list == new_list {
            return backend
                .rankings
                .update_rank(&mut state.node, state.node_addr, old_list, false);
        }
        state.node.last_used = now_ms();
        backend
            .rankings
            .remove(&mut state.node, state.node_addr, old_list)?;
        backend
            .rankings
            .insert(&mut state.node, state.node_addr, new_list)
    }

    /// A doomed entry leaves its list immediately; storage follows
    /// when the last handle drops
    pub fn on_doom_entry(&self, backend: &BackendShared, state: &mut EntryState) -> Result<()> {
        backend
            .rankings
            .remove(&mut state.node, state.node_addr, self.list_for(state.store.reuse_count))
    }

    // =========================================================================
    // Trimming
    // =========================================================================

    /// Reclaim space by dooming entries from the cold end of each list.
    /// With `empty`, every unreferenced entry goes regardless of the
    /// budget (used when wiping the cache).
    pub fn trim_cache(&self, backend: &Arc<BackendShared>, empty: bool) {
        let target = if empty {
            0
        } else {
            backend.max_size() / 10 * 9
        };
        // Conservative under load: a busy cache trims in small steps
        // so foreground operations are not starved.
        let batch_limit = if !empty && backend.is_loaded() {
            LOADED_TRIM_BATCH
        } else {
            u32::MAX
        };

        let mut evicted = 0u32;
        for &list in self.trim_order() {
            // Bounded walk even if the list links are damaged.
            let mut remaining = backend.rankings.list_len(list).saturating_mul(2).max(64);
            let mut next = backend.rankings.tail(list);

            while next.is_initialized() && remaining > 0 && evicted < batch_limit {
                if !empty && backend.used_size() <= target {
                    break;
                }
                remaining -= 1;
                let node_addr = next;
                // Record the walk position before the node can vanish.
                next = match backend.rankings.prev_of(node_addr) {
                    Ok(addr) => addr,
                    Err(err) => {
                        warn!(%node_addr, %err, "trim walk stopped by unreadable node");
                        break;
                    }
                };
                match backend.evict_node(node_addr, list) {
                    Ok(true) => evicted += 1,
                    Ok(false) => {} // referenced, skipped
                    Err(err) => {
                        warn!(%node_addr, %err, "failed to evict entry");
                    }
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, used = backend.used_size(), "trimmed cache");
            if !backend.rankings.filled() {
                if let Err(err) = backend.rankings.set_filled() {
                    warn!(%err, "failed to persist eviction marker");
                }
            }
        }
    }
}
