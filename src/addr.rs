//! Cache addresses
//!
//! An `Addr` is a packed 32-bit value identifying where a record lives:
//! either a contiguous run of blocks inside a typed pool file, or a
//! standalone external file. Pure value type; zero means "unset".
//!
//! ## Bit Layout
//! ```text
//! Block address:
//!   1 bit   initialized
//!   3 bits  file type (1..=4)
//!   2 bits  reserved
//!   2 bits  number of blocks - 1 (runs of 1..=4)
//!   8 bits  pool file number
//!  16 bits  start block
//!
//! External address:
//!   1 bit   initialized
//!   3 bits  file type (0)
//!  28 bits  file number ("f_{:06x}")
//! ```

const INITIALIZED_MASK: u32 = 0x8000_0000;
const FILE_TYPE_MASK: u32 = 0x7000_0000;
const FILE_TYPE_OFFSET: u32 = 28;
const NUM_BLOCKS_MASK: u32 = 0x0300_0000;
const NUM_BLOCKS_OFFSET: u32 = 24;
const FILE_SELECTOR_MASK: u32 = 0x00ff_0000;
const FILE_SELECTOR_OFFSET: u32 = 16;
const START_BLOCK_MASK: u32 = 0x0000_ffff;
const FILE_NAME_MASK: u32 = 0x0fff_ffff;

/// Largest run of blocks a single address can describe
pub const MAX_BLOCKS: u32 = 4;

/// Largest payload a block-backed stream can hold (4 blocks of 4 KB).
/// Anything bigger goes to an external file.
pub const MAX_BLOCK_SIZE: usize = 4096 * MAX_BLOCKS as usize;

/// The kind of file an address points into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    /// Standalone file, one per address
    External = 0,
    /// Rankings node pool (36-byte blocks)
    Rankings = 1,
    /// 256-byte block pool
    Block256 = 2,
    /// 1 KB block pool
    Block1k = 3,
    /// 4 KB block pool
    Block4k = 4,
}

impl FileType {
    /// Block size in bytes for this pool type (0 for external)
    pub fn block_size(self) -> usize {
        match self {
            FileType::External => 0,
            FileType::Rankings => 36,
            FileType::Block256 => 256,
            FileType::Block1k => 1024,
            FileType::Block4k => 4096,
        }
    }

    fn from_bits(bits: u32) -> FileType {
        match bits {
            1 => FileType::Rankings,
            2 => FileType::Block256,
            3 => FileType::Block1k,
            4 => FileType::Block4k,
            _ => FileType::External,
        }
    }
}

/// Packed cache address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Addr(u32);

impl Addr {
    /// Wrap a raw stored value
    pub fn new(value: u32) -> Addr {
        Addr(value)
    }

    /// Build a block address from its parts
    pub fn block(file_type: FileType, file_number: u32, start_block: u32, num_blocks: u32) -> Addr {
        debug_assert!(file_type != FileType::External);
        debug_assert!(num_blocks >= 1 && num_blocks <= MAX_BLOCKS);
        debug_assert!(start_block <= START_BLOCK_MASK);
        Addr(
            INITIALIZED_MASK
                | ((file_type as u32) << FILE_TYPE_OFFSET)
                | ((num_blocks - 1) << NUM_BLOCKS_OFFSET)
                | (file_number << FILE_SELECTOR_OFFSET)
                | start_block,
        )
    }

    /// Build an external-file address from a file number
    pub fn external(file_number: u32) -> Addr {
        debug_assert!(file_number <= FILE_NAME_MASK);
        Addr(INITIALIZED_MASK | file_number)
    }

    /// The raw 32-bit value, as stored on disk
    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_initialized(self) -> bool {
        self.0 & INITIALIZED_MASK != 0
    }

    pub fn is_separate_file(self) -> bool {
        self.is_initialized() && self.file_type() == FileType::External
    }

    pub fn is_block_file(self) -> bool {
        self.is_initialized() && self.file_type() != FileType::External
    }

    pub fn file_type(self) -> FileType {
        FileType::from_bits((self.0 & FILE_TYPE_MASK) >> FILE_TYPE_OFFSET)
    }

    /// Pool file number for block addresses, file name number for external
    pub fn file_number(self) -> u32 {
        if self.is_separate_file() {
            self.0 & FILE_NAME_MASK
        } else {
            (self.0 & FILE_SELECTOR_MASK) >> FILE_SELECTOR_OFFSET
        }
    }

    pub fn start_block(self) -> u32 {
        debug_assert!(self.is_block_file());
        self.0 & START_BLOCK_MASK
    }

    pub fn num_blocks(self) -> u32 {
        debug_assert!(self.is_block_file());
        ((self.0 & NUM_BLOCKS_MASK) >> NUM_BLOCKS_OFFSET) + 1
    }

    /// Block size of the pool this address points into
    pub fn block_size(self) -> usize {
        self.file_type().block_size()
    }

    /// Byte offset of this record's first block within its pool file,
    /// past the pool file header
    pub fn block_offset(self) -> u64 {
        debug_assert!(self.is_block_file());
        crate::blockfile::BLOCK_HEADER_SIZE as u64 + self.start_block() as u64 * self.block_size() as u64
    }

    /// Smallest file type able to hold `size` bytes in one address,
    /// or `External` when no block run is big enough
    pub fn required_file_type(size: usize) -> FileType {
        if size <= 256 * MAX_BLOCKS as usize {
            FileType::Block256
        } else if size <= 1024 * MAX_BLOCKS as usize {
            FileType::Block1k
        } else if size <= MAX_BLOCK_SIZE {
            FileType::Block4k
        } else {
            FileType::External
        }
    }

    /// Number of blocks of `file_type` needed to hold `size` bytes
    pub fn required_blocks(size: usize, file_type: FileType) -> u32 {
        let block = file_type.block_size();
        debug_assert!(block > 0);
        (size.max(1)).div_ceil(block) as u32
    }

    /// Structural validity: type bits and block-count bits consistent
    pub fn sanity_check(self) -> bool {
        if !self.is_initialized() {
            return self.0 == 0;
        }
        if self.file_type() == FileType::External {
            return true;
        }
        // Reserved bits must be clear for block addresses.
        self.0 & 0x0c00_0000 == 0
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_initialized() {
            write!(f, "addr(unset)")
        } else if self.is_separate_file() {
            write!(f, "addr(f_{:06x})", self.file_number())
        } else {
            write!(
                f,
                "addr({:?} file {} block {} x{})",
                self.file_type(),
                self.file_number(),
                self.start_block(),
                self.num_blocks()
            )
        }
    }
}
