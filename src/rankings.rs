//! Recency rankings
//!
//! Maintains the persisted, intrusive doubly-linked recency lists used
//! for LRU iteration and eviction. Nodes are `RankingsNode` records in
//! the rankings block pool; `next`/`prev` links are owned exclusively
//! by this module (entries own the timestamps and dirty generation and
//! merge-write around the links).
//!
//! List heads, tails and sizes live in the `LruData` control block of
//! the index file. Every list mutation records (node, operation, list)
//! in the control block before touching any link and clears it after,
//! so a crash mid-operation leaves a visible transaction that `recover`
//! inspects on the next open.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::addr::{Addr, FileType};
use crate::blockfile::{BlockFiles, CacheFile};
use crate::error::{CacheError, Result};
use crate::format::{now_ms, LruData, RankingsNode, LRU_DATA_OFFSET, NUM_LISTS};

/// Recency list selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum List {
    /// Entries never reopened since creation
    NoUse = 0,
    /// Entries with a few reuses
    LowUse = 1,
    /// Frequently reused entries
    HighUse = 2,
}

impl List {
    pub fn from_index(index: u32) -> List {
        match index {
            1 => List::LowUse,
            2 => List::HighUse,
            _ => List::NoUse,
        }
    }
}

/// In-flight list operation, as recorded in the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    None = 0,
    Insert = 1,
    Remove = 2,
}

/// Persisted recency lists over the rankings block pool
pub struct Rankings {
    block_files: Arc<BlockFiles>,
    index: Arc<CacheFile>,
    control: Mutex<LruData>,
    read_only: bool,
}

impl Rankings {
    /// Load the control block from the index file
    pub fn open(
        block_files: Arc<BlockFiles>,
        index: Arc<CacheFile>,
        read_only: bool,
    ) -> Result<Rankings> {
        let mut buf = [0u8; 128];
        index.read(&mut buf, LRU_DATA_OFFSET as u64)?;
        let control = LruData::decode(&buf)?;
        Ok(Rankings {
            block_files,
            index,
            control: Mutex::new(control),
            read_only,
        })
    }

    // =========================================================================
    // Node I/O
    // =========================================================================

    /// Read a rankings record; the address must point into the
    /// rankings pool
    pub fn read_node(&self, addr: Addr) -> Result<RankingsNode> {
        if !addr.is_block_file() || addr.file_type() != FileType::Rankings {
            return Err(CacheError::Corrupt(format!("{addr} is not a rankings node")));
        }
        let buf = self.block_files.read_record(addr)?;
        RankingsNode::decode(&buf)
    }

    /// Write a full rankings record. Only this module and entry
    /// release paths (which merge links first) may call this.
    pub fn write_node(&self, addr: Addr, node: &RankingsNode) -> Result<()> {
        self.block_files.write_record(addr, &node.encode())
    }

    fn write_control(&self, control: &LruData) -> Result<()> {
        self.index.write(&control.encode(), LRU_DATA_OFFSET as u64)
    }

    // =========================================================================
    // List Mutation
    // =========================================================================

    /// Insert `node` at the head of `list`. The caller's copy is the
    /// authoritative record and is persisted with its new links.
    pub fn insert(&self, node: &mut RankingsNode, node_addr: Addr, list: List) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut control = self.control.lock();
        self.begin_transaction(&mut control, node_addr, Operation::Insert, list)?;

        let old_head = control.heads[list as usize];
        node.next = old_head;
        node.prev = 0;
        self.write_node(node_addr, node)?;

        if old_head != 0 {
            let head_addr = Addr::new(old_head);
            let mut head = self.read_node(head_addr)?;
            if head.prev != 0 {
                warn!(%head_addr, "list head had a stale prev link");
            }
            head.prev = node_addr.value();
            self.write_node(head_addr, &head)?;
        }

        control.heads[list as usize] = node_addr.value();
        if control.tails[list as usize] == 0 {
            control.tails[list as usize] = node_addr.value();
        }
        control.sizes[list as usize] += 1;
        self.end_transaction(&mut control)
    }

    /// Unlink `node` from `list`. Links are refreshed from disk first,
    /// since another entry's insertion may have touched them.
    pub fn remove(&self, node: &mut RankingsNode, node_addr: Addr, list: List) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let disk = self.read_node(node_addr)?;
        node.next = disk.next;
        node.prev = disk.prev;
        if node.next == node_addr.value() || node.prev == node_addr.value() {
            return Err(CacheError::Corrupt(format!("{node_addr} links to itself")));
        }

        let mut control = self.control.lock();
        self.begin_transaction(&mut control, node_addr, Operation::Remove, list)?;
        self.unlink(&mut control, node, node_addr, list)?;
        self.end_transaction(&mut control)
    }

    fn unlink(
        &self,
        control: &mut LruData,
        node: &mut RankingsNode,
        node_addr: Addr,
        list: List,
    ) -> Result<()> {
        let list = list as usize;
        if node.prev != 0 {
            let prev_addr = Addr::new(node.prev);
            let mut prev = self.read_node(prev_addr)?;
            if prev.next != node_addr.value() {
                warn!(%node_addr, %prev_addr, "repairing mismatched prev link");
            }
            prev.next = node.next;
            self.write_node(prev_addr, &prev)?;
        } else if control.heads[list] == node_addr.value() {
            control.heads[list] = node.next;
        }
        if node.next != 0 {
            let next_addr = Addr::new(node.next);
            let mut next = self.read_node(next_addr)?;
            if next.prev != node_addr.value() {
                warn!(%node_addr, %next_addr, "repairing mismatched next link");
            }
            next.prev = node.prev;
            self.write_node(next_addr, &next)?;
        } else if control.tails[list] == node_addr.value() {
            control.tails[list] = node.prev;
        }
        node.next = 0;
        node.prev = 0;
        self.write_node(node_addr, node)?;
        control.sizes[list] = control.sizes[list].saturating_sub(1);
        Ok(())
    }

    /// Touch a node: move it to the head of its list and stamp
    /// `last_used` (and `last_modified` when `modified`).
    pub fn update_rank(
        &self,
        node: &mut RankingsNode,
        node_addr: Addr,
        list: List,
        modified: bool,
    ) -> Result<()> {
        let now = now_ms();
        node.last_used = now;
        if modified {
            node.last_modified = now;
        }
        if self.read_only {
            return Ok(());
        }
        self.remove(node, node_addr, list)?;
        self.insert(node, node_addr, list)
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    pub fn head(&self, list: List) -> Addr {
        Addr::new(self.control.lock().heads[list as usize])
    }

    pub fn tail(&self, list: List) -> Addr {
        Addr::new(self.control.lock().tails[list as usize])
    }

    pub fn list_len(&self, list: List) -> u32 {
        self.control.lock().sizes[list as usize]
    }

    /// Next node toward the tail (older), or unset at the end
    pub fn next_of(&self, node_addr: Addr) -> Result<Addr> {
        Ok(Addr::new(self.read_node(node_addr)?.next))
    }

    /// Previous node toward the head (newer), or unset at the start
    pub fn prev_of(&self, node_addr: Addr) -> Result<Addr> {
        Ok(Addr::new(self.read_node(node_addr)?.prev))
    }

    /// Whether the cache has completed a full eviction pass
    pub fn filled(&self) -> bool {
        self.control.lock().filled != 0
    }

    pub fn set_filled(&self) -> Result<()> {
        let mut control = self.control.lock();
        control.filled = 1;
        self.write_control(&control)
    }

    // =========================================================================
    // Crash Recovery
    // =========================================================================

    fn begin_transaction(
        &self,
        control: &mut LruData,
        node_addr: Addr,
        op: Operation,
        list: List,
    ) -> Result<()> {
        debug_assert_eq!(control.transaction, 0);
        control.transaction = node_addr.value();
        control.operation = op as u32;
        control.operation_list = list as u32;
        self.write_control(control)
    }

    fn end_transaction(&self, control: &mut LruData) -> Result<()> {
        control.transaction = 0;
        control.operation = Operation::None as u32;
        control.operation_list = 0;
        self.write_control(control)
    }

    /// Complete or roll back a list operation interrupted by a crash.
    /// Returns true when a pending transaction was found.
    pub fn recover(&self) -> Result<bool> {
        let mut control = self.control.lock();
        if control.transaction == 0 {
            return Ok(false);
        }
        let node_addr = Addr::new(control.transaction);
        let list = List::from_index(control.operation_list);
        warn!(%node_addr, op = control.operation, "completing interrupted rankings operation");

        match self.read_node(node_addr) {
            Ok(mut node) => {
                if control.operation == Operation::Insert as u32
                    && control.heads[list as usize] != node_addr.value()
                {
                    // The insertion never became visible: the node is
                    // not on the list. Neutralize it so a later load
                    // treats it as suspect rather than trusting links.
                    node.next = 0;
                    node.prev = 0;
                    node.dummy = 1;
                    self.write_node(node_addr, &node)?;
                } else {
                    // Finish whatever half-applied state is visible by
                    // unlinking the node; the entry will be re-ranked
                    // or destroyed when next touched.
                    self.unlink(&mut control, &mut node, node_addr, list)?;
                    node.dummy = 1;
                    self.write_node(node_addr, &node)?;
                }
            }
            Err(err) => {
                warn!(%node_addr, %err, "transaction node unreadable, dropping");
            }
        }

        for i in 0..NUM_LISTS {
            let counted = self.count_list(&control, List::from_index(i as u32))?;
            if counted != control.sizes[i] {
                debug!(list = i, stored = control.sizes[i], counted, "fixing list size");
                control.sizes[i] = counted;
            }
        }
        self.end_transaction(&mut control)?;
        Ok(true)
    }

    /// Walk a list forward counting nodes, with a cycle guard
    fn count_list(&self, control: &LruData, list: List) -> Result<u32> {
        let limit = control.sizes[list as usize].saturating_mul(2).max(1024);
        let mut current = control.heads[list as usize];
        let mut count = 0;
        while current != 0 {
            if count > limit {
                return Err(CacheError::Corrupt(format!("cycle in list {list:?}")));
            }
            current = self.read_node(Addr::new(current))?.next;
            count += 1;
        }
        Ok(count)
    }

    /// Structural check of every list; returns total nodes seen.
    /// Used by the backend self-check.
    pub fn check_lists(&self) -> Result<u32> {
        let control = self.control.lock();
        let mut total = 0;
        for i in 0..NUM_LISTS {
            let list = List::from_index(i as u32);
            let counted = self.count_list(&control, list)?;
            if counted != control.sizes[i] {
                return Err(CacheError::Corrupt(format!(
                    "list {list:?} stores {} nodes but walks {counted}",
                    control.sizes[i]
                )));
            }
            total += counted;
        }
        Ok(total)
    }
}
