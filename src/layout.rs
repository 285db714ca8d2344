//! On-disk format.
//!
//! Every metadata node is one block and starts with a [`NodeHeader`].  All
//! multi-byte fields are little-endian on disk; structs are kept in native
//! byte order in memory and swapped at the buffer boundary on big-endian
//! hosts (see [`swap_node`]).
//!
//! Disk layout:
//!
//! ```text
//! [ master | metaroot A | metaroot B | imap node pairs | inode slot pairs | allocable ]
//! ```

use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::config::{BLOCK_SIZE, INDIR_ENTRIES, INODE_ENTRIES, METAROOT_ENTRY_BYTES, NAME_MAX};

cfg_if::cfg_if! {
    if #[cfg(target_endian = "big")] {
        /// Metadata must be byte-swapped at the buffer/device boundary.
        pub(crate) const ENDIAN_SWAP: bool = true;
    } else {
        /// On-disk order matches native order; the swap path compiles away.
        pub(crate) const ENDIAN_SWAP: bool = false;
    }
}

/// Block 0: the master block.
pub const BLOCK_MASTER: u32 = 0;
/// Blocks 1 and 2: the two metaroot slots.
pub const BLOCK_FIRST_METAROOT: u32 = 1;
/// First block after the fixed master/metaroot region.
pub const BLOCK_FIRST_LAYOUT: u32 = 3;

/// Reserved block pointer meaning "unallocated, reads as zero".
pub const BLOCK_SPARSE: u32 = 0;
/// Sentinel for "no block" in buffer heads.
pub const BLOCK_INVALID: u32 = u32::MAX;

/// Reserved inode number meaning "no inode".
pub const INODE_INVALID: u32 = 0;
/// Inode number of the root directory; also the first inode table slot.
pub const INODE_ROOT: u32 = 2;

/// On-disk layout version understood by this driver.
pub const DISK_LAYOUT_VERSION: u32 = 1;

pub const SIG_MASTER: u32 = u32::from_le_bytes(*b"MSTR");
pub const SIG_METAROOT: u32 = u32::from_le_bytes(*b"MROT");
pub const SIG_IMAP: u32 = u32::from_le_bytes(*b"IMAP");
pub const SIG_INODE: u32 = u32::from_le_bytes(*b"INOD");
pub const SIG_DINDIR: u32 = u32::from_le_bytes(*b"DIND");
pub const SIG_INDIR: u32 = u32::from_le_bytes(*b"INDR");

/// First bytes of every metadata block.
///
/// The CRC covers the whole block with this field zeroed.  The sequence is
/// stamped at write time; a node whose sequence is not less than the
/// volume's current sequence is stale or foreign and rejected.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct NodeHeader {
    pub signature: u32,
    pub crc: u32,
    pub sequence: u64,
}

pub const NODE_HEADER_SIZE: usize = 16;

/// Feature bits stored in [`MasterBlock::flags`].  The driver refuses to
/// mount a volume whose flags disagree with its own configuration.
pub mod master_flags {
    pub const TIMESTAMPS: u8 = 0x01;
    pub const INODE_BLOCKS: u8 = 0x02;
    pub const UIDGID: u8 = 0x04;
    pub const NLINK: u8 = 0x08;
    pub const DELETE_OPEN: u8 = 0x10;

    /// Everything this build compiles in.
    pub const EXPECTED: u8 = TIMESTAMPS | INODE_BLOCKS | UIDGID | NLINK | DELETE_OPEN;
}

/// Incompatible-feature bits the driver knows; anything else rejects mount.
pub const MASTER_INCOMPAT_KNOWN: u16 = 0x0000;
/// Read-only-feature bits the driver can write through; anything else forces
/// a read-only mount.
pub const MASTER_RDONLY_WRITABLE: u16 = 0x0000;

/// Block 0, written once at format time.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct MasterBlock {
    pub hdr: NodeHeader,
    pub version: u32,
    pub format_time: u32,
    pub block_count: u32,
    pub inode_count: u32,
    pub max_name_len: u16,
    pub direct_pointers: u16,
    pub indirect_pointers: u16,
    pub features_incompat: u16,
    pub features_readonly: u16,
    pub flags: u8,
    pub block_size_p2: u8,
    pub sector_size_p2: u8,
    pub reserved: [u8; 3],
}

/// Blocks 1 and 2.  The root of all persistent state.
///
/// `sector_crc` covers bytes `[8, sector_size)` of the block with itself
/// zeroed; the header CRC continues that computation over
/// `[sector_size, BLOCK_SIZE)`.  Neither covers bytes `[0, 8)` — the
/// signature is checked separately and the CRC field cannot cover itself.
///
/// `entries` is the toggle bitmap: one bit per imap node (external imap) or
/// one bit per allocation unit (inline imap).
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Metaroot {
    pub hdr: NodeHeader,
    pub sector_crc: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub alloc_next_block: u32,
    pub orphan_head: u32,
    pub orphan_tail: u32,
    pub defunct_orphan_head: u32,
    pub entries: [u8; METAROOT_ENTRY_BYTES],
}

impl Metaroot {
    pub const fn zeroed() -> Self {
        Metaroot {
            hdr: NodeHeader {
                signature: 0,
                crc: 0,
                sequence: 0,
            },
            sector_crc: 0,
            free_blocks: 0,
            free_inodes: 0,
            alloc_next_block: 0,
            orphan_head: 0,
            orphan_tail: 0,
            defunct_orphan_head: 0,
            entries: [0; METAROOT_ENTRY_BYTES],
        }
    }
}

/// One external imap node: an allocation bitmap fragment.  Each node has
/// two fixed disk locations; a metaroot entries bit selects the current one.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct ImapNode {
    pub hdr: NodeHeader,
    pub entries: [u8; BLOCK_SIZE - NODE_HEADER_SIZE],
}

/// One inode.  Lives in a fixed table, two block slots per inode.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    pub hdr: NodeHeader,
    pub size: u64,
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub mode: u16,
    pub nlink: u16,
    pub pinode: u32,
    pub uid: u32,
    pub gid: u32,
    pub next_orphan: u32,
    pub entries: [u32; INODE_ENTRIES],
}

/// Indirect or double-indirect node: block pointers plus the owning inode.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Indir {
    pub hdr: NodeHeader,
    pub inode: u32,
    pub entries: [u32; INDIR_ENTRIES],
}

/// A directory entry within a directory's file data.  A free entry has
/// `inode == INODE_INVALID`.  Directory blocks carry no node header in this
/// layout version.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dirent {
    inode: u32,
    pub name: [u8; NAME_MAX],
}

pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

impl Dirent {
    pub const fn free() -> Self {
        Dirent {
            inode: 0,
            name: [0; NAME_MAX],
        }
    }

    pub fn new(ino: u32, name: &[u8]) -> Self {
        let mut de = Dirent::free();
        de.set_ino(ino);
        de.name[..name.len()].copy_from_slice(name);
        de
    }

    pub fn ino(&self) -> u32 {
        u32::from_le(self.inode)
    }

    pub fn set_ino(&mut self, ino: u32) {
        self.inode = ino.to_le();
    }

    /// The name without trailing NUL padding.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }
}

/// Mode field encoding, POSIX-style.
pub mod mode {
    pub const IFMT: u16 = 0xF000;
    pub const IFREG: u16 = 0x8000;
    pub const IFDIR: u16 = 0x4000;
    pub const IFLNK: u16 = 0xA000;
    pub const PERM_MASK: u16 = 0x0FFF;

    pub fn is_dir(m: u16) -> bool {
        m & IFMT == IFDIR
    }

    pub fn is_reg(m: u16) -> bool {
        m & IFMT == IFREG
    }

    pub fn is_lnk(m: u16) -> bool {
        m & IFMT == IFLNK
    }

    /// A mode is well-formed if its type is exactly one of the known types
    /// and no bits fall outside type + permissions.
    pub fn is_valid(m: u16) -> bool {
        (m & !(IFMT | PERM_MASK)) == 0 && (is_dir(m) || is_reg(m) || is_lnk(m))
    }
}

fn view<T: FromBytes>(block: &[u8]) -> &T {
    LayoutVerified::<_, T>::new_from_prefix(block)
        .expect("node view: bad size or alignment")
        .0
        .into_ref()
}

fn view_mut<T: FromBytes + AsBytes>(block: &mut [u8]) -> &mut T {
    LayoutVerified::<_, T>::new_from_prefix(block)
        .expect("node view: bad size or alignment")
        .0
        .into_mut()
}

pub fn as_header(block: &[u8]) -> &NodeHeader {
    view(block)
}

pub fn as_header_mut(block: &mut [u8]) -> &mut NodeHeader {
    view_mut(block)
}

pub fn as_master(block: &[u8]) -> &MasterBlock {
    view(block)
}

pub fn as_master_mut(block: &mut [u8]) -> &mut MasterBlock {
    view_mut(block)
}

pub fn as_inode(block: &[u8]) -> &DiskInode {
    view(block)
}

pub fn as_inode_mut(block: &mut [u8]) -> &mut DiskInode {
    view_mut(block)
}

pub fn as_indir(block: &[u8]) -> &Indir {
    view(block)
}

pub fn as_indir_mut(block: &mut [u8]) -> &mut Indir {
    view_mut(block)
}

pub fn as_imap_node(block: &[u8]) -> &ImapNode {
    view(block)
}

pub fn as_imap_node_mut(block: &mut [u8]) -> &mut ImapNode {
    view_mut(block)
}

/// Metadata node kinds for the endian-swap dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaKind {
    Master,
    Imap,
    Inode,
    Indir,
    Dindir,
}

impl MetaKind {
    pub fn signature(self) -> u32 {
        match self {
            MetaKind::Master => SIG_MASTER,
            MetaKind::Imap => SIG_IMAP,
            MetaKind::Inode => SIG_INODE,
            MetaKind::Indir => SIG_INDIR,
            MetaKind::Dindir => SIG_DINDIR,
        }
    }
}

fn swap_u32s(words: &mut [u32]) {
    for w in words {
        *w = w.swap_bytes();
    }
}

fn swap_header(block: &mut [u8]) {
    let hdr = view_mut::<NodeHeader>(block);
    hdr.signature = hdr.signature.swap_bytes();
    hdr.crc = hdr.crc.swap_bytes();
    hdr.sequence = hdr.sequence.swap_bytes();
}

/// Byte-swap a metadata node between disk order and native order.  The swap
/// is its own inverse.  Imap node entries are bytes and need no swapping
/// beyond the header.
pub fn swap_node(block: &mut [u8], kind: MetaKind) {
    swap_header(block);

    match kind {
        MetaKind::Master => {
            let mb = as_master_mut(block);
            mb.version = mb.version.swap_bytes();
            mb.format_time = mb.format_time.swap_bytes();
            mb.block_count = mb.block_count.swap_bytes();
            mb.inode_count = mb.inode_count.swap_bytes();
            mb.max_name_len = mb.max_name_len.swap_bytes();
            mb.direct_pointers = mb.direct_pointers.swap_bytes();
            mb.indirect_pointers = mb.indirect_pointers.swap_bytes();
            mb.features_incompat = mb.features_incompat.swap_bytes();
            mb.features_readonly = mb.features_readonly.swap_bytes();
        }
        MetaKind::Inode => {
            let ino = as_inode_mut(block);
            ino.size = ino.size.swap_bytes();
            ino.blocks = ino.blocks.swap_bytes();
            ino.atime = ino.atime.swap_bytes();
            ino.mtime = ino.mtime.swap_bytes();
            ino.ctime = ino.ctime.swap_bytes();
            ino.mode = ino.mode.swap_bytes();
            ino.nlink = ino.nlink.swap_bytes();
            ino.pinode = ino.pinode.swap_bytes();
            ino.uid = ino.uid.swap_bytes();
            ino.gid = ino.gid.swap_bytes();
            ino.next_orphan = ino.next_orphan.swap_bytes();
            swap_u32s(&mut ino.entries);
        }
        MetaKind::Indir | MetaKind::Dindir => {
            let ind = as_indir_mut(block);
            ind.inode = ind.inode.swap_bytes();
            swap_u32s(&mut ind.entries);
        }
        MetaKind::Imap => {}
    }
}

/// Stamp signature, sequence, and CRC on a metadata node, leaving it in
/// disk byte order.
pub fn stamp_node(block: &mut [u8], kind: MetaKind, sequence: u64) {
    {
        let hdr = as_header_mut(block);
        hdr.signature = kind.signature();
        hdr.sequence = sequence;
    }

    if ENDIAN_SWAP {
        swap_node(block, kind);
    }

    let crc = crate::crc::node(block);
    block[4..8].copy_from_slice(&crc.to_le_bytes());
}

/// Byte-swap an in-memory metaroot between disk order and native order.
/// The entries bitmap is bytes and stays put.
pub fn swap_metaroot(mr: &mut Metaroot) {
    mr.hdr.signature = mr.hdr.signature.swap_bytes();
    mr.hdr.crc = mr.hdr.crc.swap_bytes();
    mr.hdr.sequence = mr.hdr.sequence.swap_bytes();
    mr.sector_crc = mr.sector_crc.swap_bytes();
    mr.free_blocks = mr.free_blocks.swap_bytes();
    mr.free_inodes = mr.free_inodes.swap_bytes();
    mr.alloc_next_block = mr.alloc_next_block.swap_bytes();
    mr.orphan_head = mr.orphan_head.swap_bytes();
    mr.orphan_tail = mr.orphan_tail.swap_bytes();
    mr.defunct_orphan_head = mr.defunct_orphan_head.swap_bytes();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DINDIR_POINTERS, DIRECT_POINTERS, INDIRECT_POINTERS};
    use core::mem::size_of;

    #[test]
    fn node_sizes() {
        assert_eq!(size_of::<NodeHeader>(), NODE_HEADER_SIZE);
        assert_eq!(size_of::<Metaroot>(), BLOCK_SIZE);
        assert_eq!(size_of::<ImapNode>(), BLOCK_SIZE);
        assert_eq!(size_of::<DiskInode>(), BLOCK_SIZE);
        assert_eq!(size_of::<Indir>(), BLOCK_SIZE);
        assert!(size_of::<MasterBlock>() <= BLOCK_SIZE);
        assert_eq!(BLOCK_SIZE % DIRENT_SIZE, 0);
    }

    #[test]
    fn entry_partition() {
        assert_eq!(
            DIRECT_POINTERS + INDIRECT_POINTERS + DINDIR_POINTERS,
            INODE_ENTRIES
        );
    }

    #[test]
    fn mode_classification() {
        assert!(mode::is_valid(mode::IFREG | 0o644));
        assert!(mode::is_valid(mode::IFDIR | 0o755));
        assert!(mode::is_valid(mode::IFLNK | 0o777));
        assert!(!mode::is_valid(0));
        assert!(!mode::is_valid(mode::IFREG | mode::IFDIR));
        assert!(mode::is_dir(mode::IFDIR | 0o700));
        assert!(!mode::is_dir(mode::IFLNK));
    }

    #[test]
    fn swap_is_involution() {
        #[repr(align(8))]
        struct Aligned([u8; BLOCK_SIZE]);

        let mut block = Aligned([0; BLOCK_SIZE]);
        for (i, b) in block.0.iter_mut().enumerate() {
            *b = i as u8;
        }
        let orig = block.0;
        swap_node(&mut block.0, MetaKind::Inode);
        swap_node(&mut block.0, MetaKind::Inode);
        assert_eq!(&block.0[..], &orig[..]);
    }

    #[test]
    fn dirent_roundtrip() {
        let de = Dirent::new(42, b"hello.txt");
        assert_eq!(de.ino(), 42);
        assert_eq!(de.name_bytes(), b"hello.txt");
        let full = Dirent::new(7, &[b'x'; NAME_MAX]);
        assert_eq!(full.name_bytes().len(), NAME_MAX);
    }
}
