//! Block pool file manager
//!
//! Owns the set of `data_N` pool files, one chain per block size.
//! Allocates and frees contiguous block runs via a per-file bitmap and
//! resolves `Addr` values to concrete files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::addr::{Addr, FileType, MAX_BLOCKS};
use crate::error::{CacheError, Result};
use crate::format::{get_u32, put_u32};

use super::{
    CacheFile, BLOCK_HEADER_FIXED, BLOCK_HEADER_SIZE, BLOCK_MAGIC, BLOCK_VERSION, GROW_BLOCKS,
    MAX_FILE_BLOCKS,
};

/// Pool file header plus its allocation bitmap, cached in memory and
/// written through on every mutation
struct FileHeader {
    this_file: u16,
    next_file: u16,
    entry_size: u32,
    num_entries: u32,
    max_entries: u32,
    bitmap: Vec<u8>,
}

impl FileHeader {
    fn new(this_file: u16, entry_size: u32) -> FileHeader {
        FileHeader {
            this_file,
            next_file: 0,
            entry_size,
            num_entries: 0,
            max_entries: 0,
            bitmap: vec![0u8; BLOCK_HEADER_SIZE - BLOCK_HEADER_FIXED],
        }
    }

    fn decode(buf: &[u8]) -> Result<FileHeader> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(CacheError::Corrupt("pool file header too short".into()));
        }
        if get_u32(buf, 0) != BLOCK_MAGIC {
            return Err(CacheError::Corrupt("bad pool file magic".into()));
        }
        if get_u32(buf, 4) != BLOCK_VERSION {
            return Err(CacheError::Corrupt("unsupported pool file version".into()));
        }
        let mut header = FileHeader {
            this_file: u16::from_le_bytes([buf[8], buf[9]]),
            next_file: u16::from_le_bytes([buf[10], buf[11]]),
            entry_size: get_u32(buf, 12),
            num_entries: get_u32(buf, 16),
            max_entries: get_u32(buf, 20),
            bitmap: buf[BLOCK_HEADER_FIXED..BLOCK_HEADER_SIZE].to_vec(),
        };
        if get_u32(buf, 24) != 0 {
            // A crash interrupted a header update; the counters may not
            // match the bitmap anymore. The bitmap is authoritative.
            let counted = header.count_allocated();
            warn!(
                file = header.this_file,
                stored = header.num_entries,
                counted,
                "pool file header left mid-update, recounting"
            );
            header.num_entries = counted;
        }
        Ok(header)
    }

    fn encode(&self, updating: bool) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
        put_u32(&mut buf, 0, BLOCK_MAGIC);
        put_u32(&mut buf, 4, BLOCK_VERSION);
        buf[8..10].copy_from_slice(&self.this_file.to_le_bytes());
        buf[10..12].copy_from_slice(&self.next_file.to_le_bytes());
        put_u32(&mut buf, 12, self.entry_size);
        put_u32(&mut buf, 16, self.num_entries);
        put_u32(&mut buf, 20, self.max_entries);
        put_u32(&mut buf, 24, updating as u32);
        buf[BLOCK_HEADER_FIXED..].copy_from_slice(&self.bitmap);
        buf
    }

    fn bit(&self, block: u32) -> bool {
        self.bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    fn set_bits(&mut self, start: u32, count: u32, value: bool) {
        for block in start..start + count {
            let byte = (block / 8) as usize;
            let mask = 1 << (block % 8);
            if value {
                self.bitmap[byte] |= mask;
            } else {
                self.bitmap[byte] &= !mask;
            }
        }
    }

    fn count_allocated(&self) -> u32 {
        (0..self.max_entries).filter(|&b| self.bit(b)).count() as u32
    }

    /// First-fit search for a free run of `count` blocks
    fn find_run(&self, count: u32) -> Option<u32> {
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for block in 0..self.max_entries {
            if self.bit(block) {
                run_len = 0;
                run_start = block + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }
}

struct FileSlot {
    file: Arc<CacheFile>,
    header: FileHeader,
}

struct State {
    /// Slots indexed by pool file number; chained files open lazily
    files: Vec<Option<FileSlot>>,
}

/// Set of typed block pool files backing all fixed-size records
pub struct BlockFiles {
    path: PathBuf,
    state: Mutex<State>,
}

impl BlockFiles {
    /// Pool file number of the head file for a block type
    fn head_file(file_type: FileType) -> u32 {
        debug_assert!(file_type != FileType::External);
        file_type as u32 - 1
    }

    fn file_path(path: &Path, file_number: u32) -> PathBuf {
        path.join(format!("data_{}", file_number))
    }

    /// Open or create the four head pool files under `path`
    pub fn open(path: &Path) -> Result<BlockFiles> {
        let mut state = State { files: Vec::new() };
        for file_type in [
            FileType::Rankings,
            FileType::Block256,
            FileType::Block1k,
            FileType::Block4k,
        ] {
            let number = Self::head_file(file_type);
            let slot = Self::open_file(path, number, file_type.block_size() as u32)?;
            state.files.push(Some(slot));
        }
        Ok(BlockFiles {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn open_file(path: &Path, number: u32, entry_size: u32) -> Result<FileSlot> {
        let file_path = Self::file_path(path, number);
        let create = !file_path.exists();
        let file = CacheFile::open_or_create(&file_path)?;
        let header = if create {
            let header = FileHeader::new(number as u16, entry_size);
            file.write(&header.encode(false), 0)?;
            header
        } else {
            let mut buf = vec![0u8; BLOCK_HEADER_SIZE];
            file.read(&mut buf, 0)?;
            let header = FileHeader::decode(&buf)?;
            if header.entry_size != entry_size {
                return Err(CacheError::Corrupt(format!(
                    "pool file {} has block size {}, expected {}",
                    number, header.entry_size, entry_size
                )));
            }
            header
        };
        Ok(FileSlot {
            file: Arc::new(file),
            header,
        })
    }

    fn ensure_open(&self, state: &mut State, number: u32, entry_size: u32) -> Result<()> {
        let idx = number as usize;
        if idx >= state.files.len() {
            state.files.resize_with(idx + 1, || None);
        }
        if state.files[idx].is_none() {
            state.files[idx] = Some(Self::open_file(&self.path, number, entry_size)?);
        }
        Ok(())
    }

    /// Resolve a block address to the concrete pool file
    pub fn file(&self, addr: Addr) -> Result<Arc<CacheFile>> {
        if !addr.is_block_file() {
            return Err(CacheError::InvalidArgument(format!(
                "{addr} is not a block address"
            )));
        }
        let mut state = self.state.lock();
        self.ensure_open(&mut state, addr.file_number(), addr.block_size() as u32)?;
        let slot = state.files[addr.file_number() as usize]
            .as_ref()
            .ok_or_else(|| CacheError::Storage(format!("pool file {} missing", addr.file_number())))?;
        if slot.header.entry_size != addr.block_size() as u32 {
            return Err(CacheError::Corrupt(format!(
                "{addr} points into a pool of block size {}",
                slot.header.entry_size
            )));
        }
        Ok(Arc::clone(&slot.file))
    }

    /// Allocate a contiguous run of `block_count` blocks in a pool of
    /// the requested type, growing or chaining files as needed
    pub fn create_block(&self, file_type: FileType, block_count: u32) -> Result<Addr> {
        if file_type == FileType::External || block_count == 0 || block_count > MAX_BLOCKS {
            return Err(CacheError::InvalidArgument(format!(
                "cannot allocate {block_count} blocks of {file_type:?}"
            )));
        }
        let entry_size = file_type.block_size() as u32;
        let mut state = self.state.lock();
        let mut number = Self::head_file(file_type);
        loop {
            self.ensure_open(&mut state, number, entry_size)?;
            let slot = match state.files[number as usize].as_mut() {
                Some(slot) => slot,
                None => return Err(CacheError::Storage(format!("pool file {number} missing"))),
            };

            if let Some(start) = slot.header.find_run(block_count) {
                Self::commit_alloc(slot, start, block_count)?;
                return Ok(Addr::block(file_type, number, start, block_count));
            }

            if slot.header.max_entries < MAX_FILE_BLOCKS {
                let new_max = (slot.header.max_entries + GROW_BLOCKS).min(MAX_FILE_BLOCKS);
                debug!(file = number, new_max, "growing pool file");
                slot.file.set_length(
                    BLOCK_HEADER_SIZE as u64 + new_max as u64 * entry_size as u64,
                )?;
                slot.header.max_entries = new_max;
                let start = slot
                    .header
                    .find_run(block_count)
                    .ok_or_else(|| CacheError::Storage("pool file grow failed".into()))?;
                Self::commit_alloc(slot, start, block_count)?;
                return Ok(Addr::block(file_type, number, start, block_count));
            }

            // This file is full; follow or extend the chain.
            if slot.header.next_file != 0 {
                number = slot.header.next_file as u32;
                continue;
            }
            // Chained files from previous sessions open lazily, so the
            // slot vector does not know every number in use; the disk
            // does.
            let new_number = (4..=0xffu32)
                .find(|&n| !Self::file_path(&self.path, n).exists())
                .ok_or_else(|| CacheError::Storage("pool file chain exhausted".into()))?;
            debug!(from = number, to = new_number, "chaining new pool file");
            if let Some(slot) = state.files[number as usize].as_mut() {
                slot.header.next_file = new_number as u16;
                slot.file.write(&slot.header.encode(false), 0)?;
            }
            let new_slot = Self::open_file(&self.path, new_number, entry_size)?;
            let idx = new_number as usize;
            if idx >= state.files.len() {
                state.files.resize_with(idx + 1, || None);
            }
            state.files[idx] = Some(new_slot);
            number = new_number;
        }
    }

    fn commit_alloc(slot: &mut FileSlot, start: u32, count: u32) -> Result<()> {
        // Flag the header before touching it so a crash mid-write is
        // detected and the counters rebuilt from the bitmap.
        slot.file.write(&slot.header.encode(true), 0)?;
        slot.header.set_bits(start, count, true);
        slot.header.num_entries += count;
        slot.file.write(&slot.header.encode(false), 0)?;
        Ok(())
    }

    /// Free a block run. `deep` zero-fills the freed blocks so stale
    /// bytes never resurface through a later allocation.
    pub fn delete_block(&self, addr: Addr, deep: bool) -> Result<()> {
        if !addr.is_block_file() {
            return Err(CacheError::InvalidArgument(format!(
                "{addr} is not a block address"
            )));
        }
        let mut state = self.state.lock();
        self.ensure_open(&mut state, addr.file_number(), addr.block_size() as u32)?;
        let slot = match state.files[addr.file_number() as usize].as_mut() {
            Some(slot) => slot,
            None => {
                return Err(CacheError::Storage(format!(
                    "pool file {} missing",
                    addr.file_number()
                )))
            }
        };
        let (start, count) = (addr.start_block(), addr.num_blocks());
        if start + count > slot.header.max_entries {
            return Err(CacheError::Corrupt(format!("{addr} past end of pool file")));
        }
        slot.file.write(&slot.header.encode(true), 0)?;
        if deep {
            let zeros = vec![0u8; (count as usize) * addr.block_size()];
            slot.file.write(&zeros, addr.block_offset())?;
        }
        slot.header.set_bits(start, count, false);
        slot.header.num_entries = slot.header.num_entries.saturating_sub(count);
        slot.file.write(&slot.header.encode(false), 0)?;
        Ok(())
    }

    /// Read a whole block-backed record
    pub fn read_record(&self, addr: Addr) -> Result<Vec<u8>> {
        let file = self.file(addr)?;
        let mut buf = vec![0u8; addr.num_blocks() as usize * addr.block_size()];
        file.read(&mut buf, addr.block_offset())?;
        Ok(buf)
    }

    /// Write a whole block-backed record
    pub fn write_record(&self, addr: Addr, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= addr.num_blocks() as usize * addr.block_size());
        let file = self.file(addr)?;
        file.write(data, addr.block_offset())
    }

    /// Total blocks currently allocated across one pool chain,
    /// for self-check reporting
    pub fn allocated_blocks(&self, file_type: FileType) -> Result<u32> {
        let entry_size = file_type.block_size() as u32;
        let mut state = self.state.lock();
        let mut number = Self::head_file(file_type);
        let mut total = 0;
        loop {
            self.ensure_open(&mut state, number, entry_size)?;
            let slot = match state.files[number as usize].as_ref() {
                Some(slot) => slot,
                None => return Ok(total),
            };
            total += slot.header.num_entries;
            if slot.header.next_file == 0 {
                return Ok(total);
            }
            number = slot.header.next_file as u32;
        }
    }
}
