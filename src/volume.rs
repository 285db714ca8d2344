//! Volume state: mount, transaction points, rollback.
//!
//! A transaction point is the atomic promotion of the working state to the
//! committed state.  All dirty buffers are written, the device is flushed,
//! the working metaroot is written to the *alternate* metaroot slot, and the
//! device is flushed again.  Either flush failing is a critical error: the
//! volume latches read-only.

use zerocopy::AsBytes;

use crate::bdev::{BlockDev, OpenMode};
use crate::buf::{BufFlags, BufferCache};
use crate::config::{
    BLOCK_SIZE, BLOCK_SIZE_P2, DIRECT_POINTERS, IMAP_NODE_ENTRIES, INDIRECT_POINTERS,
    INODE_MAX_DEPTH, INODE_SIZE_MAX, METAROOT_ENTRIES, NAME_MAX, RESERVED_BLOCKS, SECTOR_SIZE_MIN,
};
use crate::crc;
use crate::error::{Error, Result};
use crate::layout::{
    self, master_flags, Metaroot, BLOCK_FIRST_LAYOUT, BLOCK_FIRST_METAROOT, BLOCK_MASTER,
    DISK_LAYOUT_VERSION, INODE_INVALID, MASTER_INCOMPAT_KNOWN, MASTER_RDONLY_WRITABLE,
    SIG_METAROOT,
};

/// Minimum blocks for any volume: master, two metaroots, one doubly
/// allocated inode.
const MINIMUM_METADATA_BLOCKS: u32 = 5;

bitflags::bitflags! {
    /// Mount flags.
    pub struct MountFlags: u32 {
        const READONLY = 0x01;
        /// Leave orphaned inodes on their lists instead of freeing them.
        const SKIP_DELETE = 0x02;
    }
}

bitflags::bitflags! {
    /// Automatic-transaction event mask.
    pub struct TransactMask: u32 {
        const UMOUNT   = 0x0001;
        const CREAT    = 0x0002;
        const UNLINK   = 0x0004;
        const MKDIR    = 0x0008;
        const RENAME   = 0x0010;
        const LINK     = 0x0020;
        const CLOSE    = 0x0040;
        const WRITE    = 0x0080;
        const FSYNC    = 0x0100;
        const TRUNCATE = 0x0200;
        const VOLFULL  = 0x0400;
        const SYNC     = 0x0800;
    }
}

impl TransactMask {
    /// Transact after everything except individual writes and truncates.
    pub fn default_mask() -> TransactMask {
        TransactMask::UMOUNT
            | TransactMask::CREAT
            | TransactMask::UNLINK
            | TransactMask::MKDIR
            | TransactMask::RENAME
            | TransactMask::LINK
            | TransactMask::CLOSE
            | TransactMask::FSYNC
            | TransactMask::TRUNCATE
            | TransactMask::VOLFULL
            | TransactMask::SYNC
    }
}

/// Per-volume configuration supplied at [`crate::Core::new`].
#[derive(Clone, Copy, Debug, Default)]
pub struct VolConfig {
    /// Whether the device writes sectors atomically.  When set, a metaroot
    /// whose first sector fails its own CRC rejects the mount instead of
    /// silently falling back to the other copy.
    pub atomic_sector_write: bool,
}

/// Volume status snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct VolStat {
    pub block_size: u32,
    pub block_count: u32,
    pub free_blocks: u32,
    pub allocable_blocks: u32,
    pub inode_count: u32,
    pub free_inodes: u32,
    pub name_max: u32,
    pub max_file_size: u64,
    pub read_only: bool,
}

/// In-memory state of one volume.
pub struct Volume {
    pub index: u8,
    pub config: VolConfig,
    pub mounted: bool,
    pub read_only: bool,
    /// Next sequence number to stamp on a metadata write.
    pub sequence: u64,
    pub trans_mask: TransactMask,

    // Geometry.
    pub sector_size: u32,
    pub block_sector_shift: u32,
    pub block_count: u32,

    // Layout, computed from block and inode counts.
    pub inode_count: u32,
    pub imap_inline: bool,
    pub imap_start: u32,
    pub imap_node_count: u32,
    pub inode_table_start: u32,
    pub first_allocable: u32,
    pub blocks_allocable: u32,

    // Working state.
    pub mr: [Metaroot; 2],
    pub cur_mr: usize,
    pub branched: bool,
    pub almost_free: u32,
    pub use_reserved_blocks: bool,
    pub use_reserved_inode_blocks: bool,
    pub reserved_inodes: u32,
    pub reserved_inode_blocks: u32,
}

impl Volume {
    pub fn new(index: u8, config: VolConfig) -> Volume {
        Volume {
            index,
            config,
            mounted: false,
            read_only: false,
            sequence: 0,
            trans_mask: TransactMask::default_mask(),
            sector_size: 0,
            block_sector_shift: 0,
            block_count: 0,
            inode_count: 0,
            imap_inline: false,
            imap_start: 0,
            imap_node_count: 0,
            inode_table_start: 0,
            first_allocable: 0,
            blocks_allocable: 0,
            mr: [Metaroot::zeroed(), Metaroot::zeroed()],
            cur_mr: 0,
            branched: false,
            almost_free: 0,
            use_reserved_blocks: false,
            use_reserved_inode_blocks: false,
            reserved_inodes: 0,
            reserved_inode_blocks: 0,
        }
    }

    /// The working metaroot.
    pub fn mr(&self) -> &Metaroot {
        &self.mr[self.cur_mr]
    }

    pub fn mr_mut(&mut self) -> &mut Metaroot {
        &mut self.mr[self.cur_mr]
    }

    /// Latch the volume read-only after an invariant violation.  The caller
    /// returns the produced error.
    pub fn critical_error(&mut self) -> Error {
        log::error!("volume {}: critical error, latching read-only", self.index);
        self.read_only = true;
        Error::Corrupt
    }

    pub fn seq_increment(&mut self) -> Result<()> {
        if self.sequence == u64::MAX {
            return Err(self.critical_error());
        }
        self.sequence += 1;
        Ok(())
    }

    /// Populate the geometry from the block device.
    pub fn init_block_geometry(&mut self, sector_size: u32, sector_count: u64) -> Result<()> {
        if sector_size < SECTOR_SIZE_MIN || BLOCK_SIZE as u32 % sector_size != 0 {
            return Err(Error::InvalidArg);
        }

        let mut shift = 0u32;
        while (sector_size << shift) < BLOCK_SIZE as u32 {
            shift += 1;
        }

        self.sector_size = sector_size;
        self.block_sector_shift = shift;
        // The device block count, until the true volume block count is read
        // from the master block.
        self.block_count = u32::try_from(sector_count >> shift).unwrap_or(u32::MAX);
        Ok(())
    }

    /// Compute the volume layout.  `block_count` and `inode_count` must be
    /// populated first.
    ///
    /// Fixed metadata sits at the start of the disk: the master block, the
    /// two metaroots, the external imap node pairs (if any), then the inode
    /// slot pairs.
    pub fn init_block_layout(&mut self) -> Result<()> {
        if self.block_count < MINIMUM_METADATA_BLOCKS {
            return Err(Error::InvalidArg);
        }

        // The imap needs bits for the inode table and all allocable blocks.
        // The minus 3 skips the master block and metaroots, which are never
        // allocated.  If the bitmap fits in the metaroot entries area, the
        // imap is inline and there are no imap nodes on disk.
        self.imap_inline = (self.block_count - BLOCK_FIRST_LAYOUT) as usize <= METAROOT_ENTRIES;

        if self.imap_inline {
            self.imap_start = 0;
            self.imap_node_count = 0;
            self.inode_table_start = BLOCK_FIRST_LAYOUT;
        } else {
            self.imap_start = BLOCK_FIRST_LAYOUT;
            // The imap has no bits for its own nodes, so each node covers
            // its entries plus its own two blocks.  Round up so every block
            // is covered.
            let span = IMAP_NODE_ENTRIES as u32 + 2;
            self.imap_node_count = (self.block_count - BLOCK_FIRST_LAYOUT + span - 1) / span;
            self.inode_table_start = self.imap_start + self.imap_node_count * 2;
        }

        let table_blocks = self
            .inode_count
            .checked_mul(2)
            .ok_or(Error::InvalidArg)?;
        self.first_allocable = self
            .inode_table_start
            .checked_add(table_blocks)
            .ok_or(Error::InvalidArg)?;

        if self.first_allocable > self.block_count {
            // Not enough space for the configured inode count.
            return Err(Error::InvalidArg);
        }
        self.blocks_allocable = self.block_count - self.first_allocable;
        Ok(())
    }

    /// Currently available free blocks, net of the deletion reserve and any
    /// freserve reservations (each skipped when the corresponding
    /// `use_reserved_*` flag is set for the running operation).
    pub fn free_block_count(&self) -> u32 {
        let mut free = self.mr().free_blocks;

        if !self.use_reserved_blocks {
            free = free.saturating_sub(RESERVED_BLOCKS);
        }

        if !self.use_reserved_inode_blocks {
            free = free.saturating_sub(self.reserved_inode_blocks);
            if self.reserved_inodes > 0 {
                // Branch blocks for reserved inodes are always withheld,
                // even if already branched; they can be double-counted
                // against free space, hence the clamp.
                free = free.saturating_sub(self.reserved_inodes * INODE_MAX_DEPTH);
            }
        }

        free
    }
}

/// Read whole blocks from the device backing a volume.
pub(crate) fn block_read<D: BlockDev>(
    dev: &mut D,
    vol_index: u8,
    shift: u32,
    block: u32,
    count: u32,
    dst: &mut [u8],
) -> Result<()> {
    dev.read(
        vol_index,
        (block as u64) << shift,
        count << shift,
        &mut dst[..(count as usize) << BLOCK_SIZE_P2],
    )
}

/// Write whole blocks to the device backing a volume.
pub(crate) fn block_write<D: BlockDev>(
    dev: &mut D,
    vol_index: u8,
    shift: u32,
    block: u32,
    count: u32,
    src: &[u8],
) -> Result<()> {
    dev.write(
        vol_index,
        (block as u64) << shift,
        count << shift,
        &src[..(count as usize) << BLOCK_SIZE_P2],
    )
}

/// Borrow-splitting context for everything operating on the current volume.
/// This is the explicit-state replacement for a global current-volume
/// pointer: one volume, the shared buffer cache, and the device.
pub(crate) struct VolCtx<'a, D: BlockDev> {
    pub vol: &'a mut Volume,
    pub bufs: &'a mut BufferCache,
    pub dev: &'a mut D,
    pub clock: fn() -> u32,
}

impl<'a, D: BlockDev> VolCtx<'a, D> {
    /// Mount the volume: open the device, validate the master block against
    /// the build configuration, elect the newer valid metaroot, then deal
    /// with any orphans left by earlier mounts.
    pub fn mount(&mut self, flags: MountFlags) -> Result<()> {
        if self.vol.mounted {
            return Err(Error::Busy);
        }

        let mode = if flags.contains(MountFlags::READONLY) {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        self.dev.open(self.vol.index, mode)?;

        let res = self.mount_inner(flags);
        if res.is_err() {
            // Invalidate anything buffered so stale or corrupt metadata
            // cannot leak into a later mount attempt.
            if self.vol.block_count > 0 {
                let count = self.vol.block_count;
                let _ = self.bufs.discard_range(self.vol, 0, count);
            }
            let _ = self.dev.close(self.vol.index);
            self.vol.mounted = false;
        }
        res
    }

    fn mount_inner(&mut self, flags: MountFlags) -> Result<()> {
        let geo = self.dev.geometry(self.vol.index)?;
        self.vol.init_block_geometry(geo.sector_size, geo.sector_count)?;
        self.mount_master(flags)?;
        self.mount_metaroot()?;
        self.mount_orphans(flags)?;
        log::info!(
            "volume {} mounted: {} blocks, {} free",
            self.vol.index,
            self.vol.block_count,
            self.vol.mr().free_blocks
        );
        Ok(())
    }

    /// Read and validate the master block.  A mismatch between the on-disk
    /// format and this build is the user's configuration error, not
    /// corruption, so it rejects with an I/O error rather than asserting.
    pub fn mount_master(&mut self, flags: MountFlags) -> Result<()> {
        let idx = self
            .bufs
            .get(self.dev, self.vol, BLOCK_MASTER, BufFlags::META_MASTER)?;

        let mb = *layout::as_master(self.bufs.data(idx));
        self.bufs.put(idx);

        if mb.version != DISK_LAYOUT_VERSION
            || mb.block_count > self.vol.block_count
            || mb.max_name_len != NAME_MAX as u16
            || mb.direct_pointers != DIRECT_POINTERS as u16
            || mb.indirect_pointers != INDIRECT_POINTERS as u16
            || mb.block_size_p2 != BLOCK_SIZE_P2 as u8
            || (1u32 << mb.sector_size_p2) != self.vol.sector_size
            || mb.flags != master_flags::EXPECTED
            || (mb.features_incompat & !MASTER_INCOMPAT_KNOWN) != 0
        {
            return Err(Error::Io);
        }

        // The master block is the last block written during format, so on a
        // fresh volume its sequence is the highest on disk.  Remember it;
        // the metaroot election below takes the max.
        self.vol.sequence = mb.hdr.sequence;

        self.vol.block_count = mb.block_count;
        self.vol.inode_count = mb.inode_count;
        self.vol.init_block_layout()?;

        self.vol.read_only = flags.contains(MountFlags::READONLY);
        if !self.vol.read_only && (mb.features_readonly & !MASTER_RDONLY_WRITABLE) != 0 {
            return Err(Error::ReadOnly);
        }

        Ok(())
    }

    /// Read both metaroots, pick the newer valid one, and set up the
    /// working/committed pair.
    pub fn mount_metaroot(&mut self) -> Result<()> {
        let index = self.vol.index;
        let shift = self.vol.block_sector_shift;

        let r0 = block_read(
            self.dev,
            index,
            shift,
            BLOCK_FIRST_METAROOT,
            1,
            self.vol.mr[0].as_bytes_mut(),
        );
        let r1 = block_read(
            self.dev,
            index,
            shift,
            BLOCK_FIRST_METAROOT + 1,
            1,
            self.vol.mr[1].as_bytes_mut(),
        );
        if r0.is_err() && r1.is_err() {
            return r0;
        }

        let mut chosen: Option<usize> = None;
        for i in 0..2 {
            if (i == 0 && r0.is_err()) || (i == 1 && r1.is_err()) {
                continue;
            }
            let (valid, sector_crc_ok) =
                metaroot_is_valid(self.vol.sector_size, &mut self.vol.mr[i]);
            if valid {
                if crate::layout::ENDIAN_SWAP {
                    layout::swap_metaroot(&mut self.vol.mr[i]);
                }
                let newer = match chosen {
                    None => true,
                    Some(c) => self.vol.mr[i].hdr.sequence > self.vol.mr[c].hdr.sequence,
                };
                if newer {
                    chosen = Some(i);
                }
            } else if self.vol.config.atomic_sector_write && !sector_crc_ok {
                // With atomic sector writes a torn metaroot cannot happen;
                // a bad first sector means something worse than a torn
                // write, so refuse rather than silently fall back.
                return Err(Error::Io);
            }
        }

        let cur = chosen.ok_or(Error::Io)?;
        self.vol.cur_mr = cur;

        if self.vol.mr[cur].hdr.sequence > self.vol.sequence {
            self.vol.sequence = self.vol.mr[cur].hdr.sequence;
        }
        // The stored value is the next sequence to write; never reuse the
        // metaroot's own.
        self.vol.seq_increment()?;

        self.vol.mounted = true;
        self.vol.use_reserved_blocks = false;
        self.vol.use_reserved_inode_blocks = false;
        self.vol.reserved_inodes = 0;
        self.vol.reserved_inode_blocks = 0;
        self.vol.almost_free = 0;
        self.vol.branched = false;

        // The chosen copy is the committed state; the other in-memory slot
        // becomes the working copy that mutations will touch.
        let other = 1 - cur;
        self.vol.mr[other] = self.vol.mr[cur];
        self.vol.cur_mr = other;
        Ok(())
    }

    /// Deal with orphan lists left over from before this mount.
    fn mount_orphans(&mut self, flags: MountFlags) -> Result<()> {
        if self.vol.read_only {
            return Ok(());
        }

        if !flags.contains(MountFlags::SKIP_DELETE) {
            self.free_orphans(u32::MAX)?;

            // At mount time every orphan is defunct: no handle can still be
            // open across a remount.
            if self.vol.mr().orphan_head != INODE_INVALID {
                let mr = self.vol.mr_mut();
                mr.defunct_orphan_head = mr.orphan_head;
                mr.orphan_head = INODE_INVALID;
                mr.orphan_tail = INODE_INVALID;
                self.vol.branched = true;

                self.free_orphans(u32::MAX)?;
            }
        } else {
            let defunct = self.vol.mr().defunct_orphan_head;
            let head = self.vol.mr().orphan_head;
            if defunct == INODE_INVALID {
                if head != INODE_INVALID {
                    let mr = self.vol.mr_mut();
                    mr.defunct_orphan_head = mr.orphan_head;
                    mr.orphan_head = INODE_INVALID;
                    mr.orphan_tail = INODE_INVALID;
                    self.vol.branched = true;
                }
            } else if head != INODE_INVALID {
                // Two non-empty lists: the caller asked us not to free
                // anything, so merge them so new orphans have a home.
                self.concat_orphan_lists()?;
            }
        }

        debug_assert_eq!(
            self.vol.mr().orphan_head == INODE_INVALID,
            self.vol.mr().orphan_tail == INODE_INVALID
        );
        Ok(())
    }

    /// Free up to `max` inodes from the defunct orphan list.
    pub fn free_orphans(&mut self, max: u32) -> Result<()> {
        if max == 0 {
            return Err(Error::InvalidArg);
        }

        for _ in 0..max {
            let head = self.vol.mr().defunct_orphan_head;
            let mut ino = match self.inode_mount(head, crate::inode::Ftype::Any, false) {
                Ok(ino) => ino,
                Err(Error::BadHandle) => {
                    if head == INODE_INVALID {
                        // Walked off the end of the list; the count is a
                        // maximum, so this is success.
                        return Ok(());
                    }
                    // A list entry that is not a valid inode.
                    return Err(self.vol.critical_error());
                }
                Err(e) => return Err(e),
            };

            let next = self.inode_ref(&ino).next_orphan;
            let res = self.inode_free_orphan(&mut ino);
            self.inode_put(&mut ino, crate::inode::PutFlags::empty());
            res?;

            self.vol.mr_mut().defunct_orphan_head = next;
            self.vol.branched = true;
        }
        Ok(())
    }

    /// Join the working orphan list onto the defunct list (both non-empty).
    /// The working list becomes the defunct head and the old defunct list
    /// hangs off the working tail, so the result is not in orphaning order.
    fn concat_orphan_lists(&mut self) -> Result<()> {
        debug_assert!(self.vol.mr().defunct_orphan_head != INODE_INVALID);
        debug_assert!(self.vol.mr().orphan_head != INODE_INVALID);
        debug_assert!(self.vol.mr().orphan_tail != INODE_INVALID);

        let tail = self.vol.mr().orphan_tail;
        let mut ino = self.inode_mount(tail, crate::inode::Ftype::Any, true)?;

        let res = if self.inode_ref(&ino).next_orphan != INODE_INVALID {
            Err(self.vol.critical_error())
        } else {
            let defunct = self.vol.mr().defunct_orphan_head;
            self.inode_mut(&ino).next_orphan = defunct;
            let mr = self.vol.mr_mut();
            mr.defunct_orphan_head = mr.orphan_head;
            mr.orphan_head = INODE_INVALID;
            mr.orphan_tail = INODE_INVALID;
            self.vol.branched = true;
            Ok(())
        };

        self.inode_put(&mut ino, crate::inode::PutFlags::empty());
        res
    }

    /// Commit a transaction point.
    pub fn transact(&mut self) -> Result<()> {
        debug_assert!(!self.vol.read_only);

        if !self.vol.branched {
            return Ok(());
        }

        // Blocks branched away this transaction become free again once the
        // new metaroot is the committed state.
        let almost = self.vol.almost_free;
        self.vol.mr_mut().free_blocks += almost;
        self.vol.almost_free = 0;

        let block_count = self.vol.block_count;
        let res = (|| -> Result<()> {
            self.bufs.flush_range(self.dev, self.vol, 0, block_count)?;

            {
                let seq = self.vol.sequence;
                let mr = self.vol.mr_mut();
                mr.hdr.signature = SIG_METAROOT;
                mr.hdr.sequence = seq;
            }
            self.vol.seq_increment()?;

            let sector_size = self.vol.sector_size;
            let disk = metaroot_to_disk(self.vol.mr_mut(), sector_size);

            // All metadata must be on the media before the metaroot commit,
            // or a reordering device could persist a metaroot that points
            // at unwritten blocks.
            self.dev.flush(self.vol.index)?;

            block_write(
                self.dev,
                self.vol.index,
                self.vol.block_sector_shift,
                BLOCK_FIRST_METAROOT + self.vol.cur_mr as u32,
                1,
                disk.as_bytes(),
            )?;

            // Force the metaroot itself down before reporting the
            // transaction complete.
            self.dev.flush(self.vol.index)?;
            Ok(())
        })();

        if res.is_err() {
            let _ = self.vol.critical_error();
            return res;
        }

        // The working and committed metaroots exchange places.
        let cur = self.vol.cur_mr;
        let next = 1 - cur;
        self.vol.mr[next] = self.vol.mr[cur];
        self.vol.cur_mr = next;
        self.vol.branched = false;

        log::debug!(
            "volume {}: transaction point, {} blocks free",
            self.vol.index,
            self.vol.mr().free_blocks
        );
        Ok(())
    }

    /// Discard the working state and return to the last committed state.
    /// No cached inode handles may be outstanding.
    pub fn rollback(&mut self) -> Result<()> {
        debug_assert!(self.vol.mounted);
        debug_assert!(!self.vol.read_only);

        if !self.vol.branched {
            return Ok(());
        }

        let block_count = self.vol.block_count;
        let res = (|| -> Result<()> {
            self.bufs.discard_range(self.vol, 0, block_count)?;
            self.vol.mounted = false;
            self.mount_master(MountFlags::empty())?;
            self.mount_metaroot()?;
            Ok(())
        })();

        if res.is_err() {
            let _ = self.vol.critical_error();
            return res;
        }
        self.vol.branched = false;
        Ok(())
    }

    /// Recover free space on a full volume: finish pending deletions, then
    /// transact so almost-free blocks return to the free pool.
    pub fn handle_full(&mut self) -> Result<()> {
        if !self.vol.trans_mask.contains(TransactMask::VOLFULL) {
            return Err(Error::NoSpace);
        }

        let before = self.vol.mr().free_blocks;

        if self.vol.mr().defunct_orphan_head != INODE_INVALID {
            self.free_orphans(u32::MAX)?;
        }

        if self.vol.almost_free > 0 {
            self.transact()?;
        }

        if self.vol.mr().free_blocks <= before {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Volume status for `vol_stat`.
    pub fn vol_stat(&self) -> VolStat {
        VolStat {
            block_size: BLOCK_SIZE as u32,
            block_count: self.vol.block_count,
            free_blocks: self.vol.free_block_count(),
            allocable_blocks: self.vol.blocks_allocable,
            inode_count: self.vol.inode_count,
            free_inodes: self.vol.mr().free_inodes,
            name_max: NAME_MAX as u32,
            max_file_size: INODE_SIZE_MAX,
            read_only: self.vol.read_only,
        }
    }
}

/// Produce the disk-order image of a metaroot whose header signature and
/// sequence are already set, computing both CRCs.  The native copy gets the
/// same CRC values so the in-memory slots match what was written.
pub(crate) fn metaroot_to_disk(mr: &mut Metaroot, sector_size: u32) -> Metaroot {
    let mut disk = *mr;
    if crate::layout::ENDIAN_SWAP {
        layout::swap_metaroot(&mut disk);
    }
    disk.sector_crc = 0;

    let ssz = sector_size as usize;
    let (sector_crc, full_crc) = {
        let bytes = disk.as_bytes();
        let scrc = crc::update(0, &bytes[8..ssz]);
        let full = if ssz < BLOCK_SIZE {
            crc::update(scrc, &bytes[ssz..])
        } else {
            scrc
        };
        (scrc, full)
    };

    let swap = |v: u32| {
        if crate::layout::ENDIAN_SWAP {
            v.swap_bytes()
        } else {
            v
        }
    };
    disk.sector_crc = swap(sector_crc);
    disk.hdr.crc = swap(full_crc);
    mr.sector_crc = sector_crc;
    mr.hdr.crc = full_crc;
    disk
}

/// Validate one metaroot copy, still in disk byte order.
///
/// Returns `(fully_valid, sector_crc_valid)`.  The sector CRC covers bytes
/// `[8, sector_size)` with the CRC field itself zeroed; the full CRC chains
/// on over `[sector_size, BLOCK_SIZE)`.  A valid first sector with a bad
/// full CRC is the signature of a torn non-atomic write.
fn metaroot_is_valid(sector_size: u32, mr: &mut Metaroot) -> (bool, bool) {
    let sig = if crate::layout::ENDIAN_SWAP {
        mr.hdr.signature.swap_bytes()
    } else {
        mr.hdr.signature
    };
    if sig != SIG_METAROOT {
        return (false, false);
    }

    let swap = |v: u32| {
        if crate::layout::ENDIAN_SWAP {
            v.swap_bytes()
        } else {
            v
        }
    };
    let stored_sector_crc = swap(mr.sector_crc);
    let stored_crc = swap(mr.hdr.crc);

    // The field was zero when the CRC was computed at transact time.
    mr.sector_crc = 0;

    let ssz = sector_size as usize;
    let bytes = mr.as_bytes();
    let sector_crc = crc::update(0, &bytes[8..ssz]);
    if sector_crc != stored_sector_crc {
        return (false, false);
    }

    let full = if ssz < BLOCK_SIZE {
        crc::update(sector_crc, &bytes[ssz..])
    } else {
        sector_crc
    };
    (full == stored_crc, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IMAP_NODE_ENTRIES;

    fn vol_with(block_count: u32, inode_count: u32) -> Volume {
        let mut v = Volume::new(0, VolConfig::default());
        v.block_count = block_count;
        v.inode_count = inode_count;
        v
    }

    #[test]
    fn geometry_shift() {
        let mut v = Volume::new(0, VolConfig::default());
        v.init_block_geometry(512, 4096).unwrap();
        assert_eq!(v.block_sector_shift, 1);
        assert_eq!(v.block_count, 2048);

        assert!(v.init_block_geometry(100, 4096).is_err());
        assert!(v.init_block_geometry(64, 4096).is_err());
    }

    #[test]
    fn small_volume_is_inline() {
        let mut v = vol_with(2048, 32);
        v.init_block_layout().unwrap();
        assert!(v.imap_inline);
        assert_eq!(v.inode_table_start, 3);
        assert_eq!(v.first_allocable, 3 + 64);
        assert_eq!(v.blocks_allocable, 2048 - 67);
    }

    #[test]
    fn large_volume_is_external() {
        let mut v = vol_with(40_000, 128);
        v.init_block_layout().unwrap();
        assert!(!v.imap_inline);
        assert_eq!(v.imap_start, 3);
        let span = IMAP_NODE_ENTRIES as u32 + 2;
        assert_eq!(v.imap_node_count, (40_000 - 3 + span - 1) / span);
        assert_eq!(v.inode_table_start, 3 + v.imap_node_count * 2);
        assert_eq!(v.first_allocable, v.inode_table_start + 256);
    }

    #[test]
    fn tiny_volume_rejected() {
        let mut v = vol_with(4, 1);
        assert!(v.init_block_layout().is_err());
    }

    #[test]
    fn layout_rejects_oversized_inode_table() {
        let mut v = vol_with(100, 60);
        assert!(v.init_block_layout().is_err());
    }
}
