//! Volume format: writes the initial on-disk layout.
//!
//! Format writes the external imap nodes (only the root inode's first slot
//! marked allocated), the root directory inode, both metaroot slots, and
//! the master block last, with sequence numbers increasing across the
//! writes so mount's staleness rules hold from the first transaction on.

use zerocopy::AsBytes;

use crate::bdev::{BlockDev, OpenMode};
use crate::config::{BLOCK_SIZE, BLOCK_SIZE_P2, DIRECT_POINTERS, INDIRECT_POINTERS, NAME_MAX};
use crate::error::{Error, Result};
use crate::imap::bit_set;
use crate::layout::{
    self, master_flags, MetaKind, Metaroot, BLOCK_FIRST_METAROOT, BLOCK_MASTER,
    DISK_LAYOUT_VERSION, INODE_INVALID, SIG_METAROOT,
};
use crate::volume::{block_write, metaroot_to_disk, VolCtx};

/// Format options.  A zero `inode_count` picks a default from the volume
/// size.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatOpts {
    pub inode_count: u32,
}

#[repr(align(8))]
struct Scratch([u8; BLOCK_SIZE]);

impl<'a, D: BlockDev> VolCtx<'a, D> {
    /// Format the volume.  Must not be mounted.
    pub fn format(&mut self, opts: FormatOpts) -> Result<()> {
        if self.vol.mounted {
            return Err(Error::Busy);
        }

        self.dev.open(self.vol.index, OpenMode::ReadWrite)?;
        let res = self.format_inner(opts);
        let _ = self.dev.close(self.vol.index);
        res
    }

    fn format_inner(&mut self, opts: FormatOpts) -> Result<()> {
        let geo = self.dev.geometry(self.vol.index)?;
        self.vol.init_block_geometry(geo.sector_size, geo.sector_count)?;

        self.vol.inode_count = if opts.inode_count > 0 {
            opts.inode_count
        } else {
            (self.vol.block_count / 64).max(1)
        };
        self.vol.init_block_layout()?;

        // Stale buffers from a previous mount of this volume must not
        // survive into the new filesystem.
        let count = self.vol.block_count;
        self.bufs.discard_range(self.vol, 0, count)?;

        let index = self.vol.index;
        let shift = self.vol.block_sector_shift;
        let mut seq: u64 = 1;
        let mut scratch = Scratch([0; BLOCK_SIZE]);

        // The root directory lives in the first slot of the first inode
        // table entry; its block is the only one allocated at format time.
        let root_slot = self.vol.inode_table_start;

        if !self.vol.imap_inline {
            for node in 0..self.vol.imap_node_count {
                scratch.0.fill(0);
                if node == 0 {
                    // Bit 0 covers the root inode's slot-0 block.
                    bit_set(&mut layout::as_imap_node_mut(&mut scratch.0).entries, 0);
                }
                layout::stamp_node(&mut scratch.0, MetaKind::Imap, seq);
                seq += 1;

                // Only the first copy of each pair; the metaroot entries
                // bits all start at zero, selecting it.
                block_write(
                    self.dev,
                    index,
                    shift,
                    self.vol.imap_start + node * 2,
                    1,
                    &scratch.0,
                )?;
            }
        }

        // Root directory inode.
        scratch.0.fill(0);
        {
            let di = layout::as_inode_mut(&mut scratch.0);
            di.mode = layout::mode::IFDIR | 0o777;
            di.nlink = 1;
            di.pinode = INODE_INVALID;
            let now = (self.clock)();
            di.atime = now;
            di.mtime = now;
            di.ctime = now;
        }
        layout::stamp_node(&mut scratch.0, MetaKind::Inode, seq);
        seq += 1;
        block_write(self.dev, index, shift, root_slot, 1, &scratch.0)?;

        // Both metaroot slots, the second written last so mount elects it.
        let mut mr = Metaroot::zeroed();
        mr.free_blocks = self.vol.blocks_allocable;
        mr.free_inodes = self.vol.inode_count - 1;
        mr.alloc_next_block = self.vol.first_allocable;
        mr.orphan_head = INODE_INVALID;
        mr.orphan_tail = INODE_INVALID;
        mr.defunct_orphan_head = INODE_INVALID;
        if self.vol.imap_inline {
            // Inline bitmap: bit index is block minus inode table start.
            bit_set(&mut mr.entries, 0);
        }

        for slot in [1u32, 0u32] {
            mr.hdr.signature = SIG_METAROOT;
            mr.hdr.sequence = seq;
            seq += 1;
            let disk = metaroot_to_disk(&mut mr, self.vol.sector_size);
            block_write(
                self.dev,
                index,
                shift,
                BLOCK_FIRST_METAROOT + slot,
                1,
                disk.as_bytes(),
            )?;
        }

        // Master block last: its sequence caps everything written above,
        // and a crash mid-format leaves an unmountable volume rather than
        // a half-initialized one.
        scratch.0.fill(0);
        {
            let mb = layout::as_master_mut(&mut scratch.0);
            mb.version = DISK_LAYOUT_VERSION;
            mb.format_time = (self.clock)();
            mb.block_count = self.vol.block_count;
            mb.inode_count = self.vol.inode_count;
            mb.max_name_len = NAME_MAX as u16;
            mb.direct_pointers = DIRECT_POINTERS as u16;
            mb.indirect_pointers = INDIRECT_POINTERS as u16;
            mb.features_incompat = 0;
            mb.features_readonly = 0;
            mb.flags = master_flags::EXPECTED;
            mb.block_size_p2 = BLOCK_SIZE_P2 as u8;
            mb.sector_size_p2 = self.vol.sector_size.trailing_zeros() as u8;
        }
        layout::stamp_node(&mut scratch.0, MetaKind::Master, seq);
        block_write(self.dev, index, shift, BLOCK_MASTER, 1, &scratch.0)?;

        self.dev.flush(self.vol.index)?;

        log::info!(
            "volume {} formatted: {} blocks, {} inodes",
            self.vol.index,
            self.vol.block_count,
            self.vol.inode_count
        );
        Ok(())
    }
}
