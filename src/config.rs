//! Compile-time configuration and the geometry derived from it.
//!
//! Everything here is a `const` so that node layouts, the buffer pool, and
//! the minimum-buffer-count rule are all checked at compile time.

use static_assertions::const_assert;

/// Block size in bytes.  Must be a power of two, at least as large as the
/// device sector size and a multiple of it.
pub const BLOCK_SIZE: usize = 1024;

/// log2(BLOCK_SIZE).
pub const BLOCK_SIZE_P2: u32 = BLOCK_SIZE.trailing_zeros();

const_assert!(BLOCK_SIZE.is_power_of_two());
const_assert!(BLOCK_SIZE >= 256 && BLOCK_SIZE <= 65536);

/// Smallest device sector size the core will accept.
pub const SECTOR_SIZE_MIN: u32 = 256;

/// Number of volumes sharing the buffer cache.
pub const VOLUME_COUNT: usize = 2;

/// Number of block buffers in the shared cache.
pub const BUFFER_COUNT: usize = 16;

const_assert!(BUFFER_COUNT <= u8::MAX as usize);

/// Maximum name length for a directory entry.
pub const NAME_MAX: usize = 28;

/// Direct block pointers per inode.
pub const DIRECT_POINTERS: usize = 4;

/// Indirect block pointers per inode.
pub const INDIRECT_POINTERS: usize = 32;

/// Blocks withheld from normal allocation so that unlink can still make
/// progress on a full volume.
pub const RESERVED_BLOCKS: u32 = 3;

/// Whether directory reads update the access time.
pub const UPDATE_ATIME: bool = false;

/// Bytes of the on-disk inode consumed before the block-pointer array.
pub const INODE_HEADER_SIZE: usize = 60;

/// Block-pointer entries per inode.
pub const INODE_ENTRIES: usize = (BLOCK_SIZE - INODE_HEADER_SIZE) / 4;

/// Double-indirect pointers per inode: whatever entry space remains.
pub const DINDIR_POINTERS: usize = INODE_ENTRIES - DIRECT_POINTERS - INDIRECT_POINTERS;

const_assert!(DIRECT_POINTERS + INDIRECT_POINTERS <= INODE_ENTRIES);

/// Block pointers per indirect (and double-indirect) node.
pub const INDIR_ENTRIES: usize = (BLOCK_SIZE - 20) / 4;

/// Allocation bits per external imap node.
pub const IMAP_NODE_ENTRIES: usize = (BLOCK_SIZE - 16) * 8;

/// Bytes of the metaroot consumed before the entries bitmap.
pub const METAROOT_HEADER_SIZE: usize = 44;

/// Bytes of the metaroot entries bitmap.
pub const METAROOT_ENTRY_BYTES: usize = BLOCK_SIZE - METAROOT_HEADER_SIZE;

/// Bits in the metaroot entries bitmap.
pub const METAROOT_ENTRIES: usize = METAROOT_ENTRY_BYTES * 8;

/// Logical blocks reachable through the indirect range of an inode.
pub const INODE_INDIR_BLOCKS: u32 = (INDIRECT_POINTERS * INDIR_ENTRIES) as u32;

/// Logical blocks reachable through one double-indirect node.
pub const DINDIR_DATA_BLOCKS: u32 = (INDIR_ENTRIES * INDIR_ENTRIES) as u32;

/// Total logical blocks addressable by one inode.
pub const INODE_DATA_BLOCKS: u32 =
    DIRECT_POINTERS as u32 + INODE_INDIR_BLOCKS + DINDIR_POINTERS as u32 * DINDIR_DATA_BLOCKS;

/// Maximum file size in bytes.
pub const INODE_SIZE_MAX: u64 = (INODE_DATA_BLOCKS as u64) << BLOCK_SIZE_P2;

/// Deepest chain of blocks which may need branching for one data block:
/// double indirect, indirect, and the data block itself.
pub const INODE_MAX_DEPTH: u32 = 3;

/// Buffers needed to hold one inode all the way down: the inode node, a
/// double-indirect node, an indirect node, and the data block.
pub const INODE_BUFFERS: usize = 4;

/// Buffers the imap holds at once.  The free-block scan releases the
/// working-state node before acquiring the committed-state node precisely
/// so this stays at one.
pub const IMAP_BUFFERS: usize = 1;

/// Worst case is rename with atomic replace: two parent directory chains,
/// the source and destination inode nodes, one inode node for the cycle
/// check, and the imap.  The parent chains are released before the
/// displaced inode is deleted, so deletion does not raise the minimum.
pub const MINIMUM_BUFFER_COUNT: usize = INODE_BUFFERS + INODE_BUFFERS + 3 + IMAP_BUFFERS;

const_assert!(BUFFER_COUNT >= MINIMUM_BUFFER_COUNT);
