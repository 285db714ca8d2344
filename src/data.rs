//! Inode data engine.
//!
//! Maps logical file blocks through the inode's direct entries, an
//! indirect layer, and a double-indirect layer.  All modification is
//! copy-on-write: before a committed block is changed it is branched to a
//! freshly allocated location and the old block becomes almost-free.  The
//! worst case for one data block is three allocations (double indirect,
//! indirect, data), and `branch_block` refuses up front if free space
//! cannot cover the bill, so a mutating operation never strands a
//! half-branched path for lack of space.
//!
//! Reads and writes decompose into an unaligned head, whole-block runs,
//! and an unaligned tail.  Unaligned pieces go through the buffer cache;
//! whole-block runs bypass it, detecting contiguous extents so a large
//! sequential write becomes a few large device transfers.

use crate::bdev::BlockDev;
use crate::buf::{BufFlags, BufIdx};
use crate::config::{
    BLOCK_SIZE, BLOCK_SIZE_P2, DINDIR_DATA_BLOCKS, DIRECT_POINTERS, INDIR_ENTRIES,
    INODE_DATA_BLOCKS, INODE_INDIR_BLOCKS, INODE_MAX_DEPTH, INODE_SIZE_MAX,
};
use crate::error::{Error, Result};
use crate::imap::AllocState;
use crate::inode::{CInode, COORD_ENTRY_INVALID};
use crate::layout::{self, BLOCK_SPARSE};
use crate::volume::VolCtx;

/// How deep `branch_block` must make the path writable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BranchDepth {
    Dindir,
    Indir,
    FileData,
}

const BLOCK_MASK: u64 = BLOCK_SIZE as u64 - 1;

impl<'a, D: BlockDev> VolCtx<'a, D> {
    /// Read file data at `start`, returning the byte count (short only at
    /// EOF).  Sparse blocks read as zeroes.
    pub fn data_read(&mut self, ino: &mut CInode, start: u64, buf: &mut [u8]) -> Result<usize> {
        if !ino.is_mounted() {
            return Err(Error::InvalidArg);
        }

        let size = self.inode_ref(ino).size;
        if start >= size || buf.is_empty() {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(size - start) as usize;
        let mut done = 0usize;

        // Unaligned partial block at the start.
        if start & BLOCK_MASK != 0 {
            let in_first = (BLOCK_SIZE as u64 - (start & BLOCK_MASK)) as usize;
            let this = len.min(in_first);
            self.read_unaligned(ino, start, &mut buf[..this])?;
            done += this;
        }

        // Whole blocks.
        if len - done >= BLOCK_SIZE {
            let block_off = ((start + done as u64) >> BLOCK_SIZE_P2) as u32;
            let count = ((len - done) >> BLOCK_SIZE_P2) as u32;
            debug_assert_eq!((start + done as u64) & BLOCK_MASK, 0);
            self.read_aligned(ino, block_off, count, &mut buf[done..])?;
            done += (count as usize) << BLOCK_SIZE_P2;
        }

        // Aligned partial block at the end.
        if done < len {
            debug_assert_eq!((start + done as u64) & BLOCK_MASK, 0);
            self.read_unaligned(ino, start + done as u64, &mut buf[done..len])?;
        }

        Ok(len)
    }

    /// Write file data at `start`.  Returns the bytes written, which can be
    /// short if the volume fills mid-write; nothing written at all reports
    /// no-space as an error.
    pub fn data_write(&mut self, ino: &mut CInode, start: u64, buf: &[u8]) -> Result<usize> {
        if !ino.is_mounted() || !ino.dirty {
            return Err(Error::InvalidArg);
        }
        if start > INODE_SIZE_MAX || (start == INODE_SIZE_MAX && !buf.is_empty()) {
            return Err(Error::FileTooBig);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(INODE_SIZE_MAX - start) as usize;

        // Writing past EOF: stale bytes beyond the old size in the last
        // block must not resurface inside the new sparse region.
        if start > self.inode_ref(ino).size {
            self.expand_prepare(ino)?;
        }

        let mut done = 0usize;
        let mut remaining = len;

        if start & BLOCK_MASK != 0 || remaining < BLOCK_SIZE {
            let in_first = (BLOCK_SIZE as u64 - (start & BLOCK_MASK)) as usize;
            let this = remaining.min(in_first);
            self.write_unaligned(ino, start, &buf[..this])?;
            done += this;
            remaining -= this;
        }

        if remaining >= BLOCK_SIZE {
            let block_off = ((start + done as u64) >> BLOCK_SIZE_P2) as u32;
            let count = (remaining >> BLOCK_SIZE_P2) as u32;
            debug_assert_eq!((start + done as u64) & BLOCK_MASK, 0);

            let written = match self.write_aligned(
                ino,
                block_off,
                &buf[done..done + ((count as usize) << BLOCK_SIZE_P2)],
            ) {
                Ok(blocks) => blocks,
                Err(Error::NoSpace) if done > 0 => 0,
                Err(e) => return Err(e),
            };

            done += (written as usize) << BLOCK_SIZE_P2;
            remaining -= (written as usize) << BLOCK_SIZE_P2;
            if written < count {
                // Volume filled up; skip the tail.
                remaining = 0;
            }
        }

        if remaining > 0 {
            debug_assert!(remaining < BLOCK_SIZE);
            debug_assert_eq!((start + done as u64) & BLOCK_MASK, 0);
            debug_assert!(done > 0);

            match self.write_unaligned(ino, start + done as u64, &buf[done..done + remaining]) {
                Ok(()) => done += remaining,
                Err(Error::NoSpace) => {}
                Err(e) => return Err(e),
            }
        }

        if start + done as u64 > self.inode_ref(ino).size {
            self.inode_mut(ino).size = start + done as u64;
        }
        Ok(done)
    }

    /// Set the file size.  Growing creates a sparse region; shrinking frees
    /// everything beyond the boundary (committed blocks become almost-free,
    /// so the space returns at the next transaction point).
    pub fn data_truncate(&mut self, ino: &mut CInode, size: u64) -> Result<()> {
        // Deletion truncates without branching the inode: its buffer is
        // about to be discarded, so only a mount check here.
        if !ino.is_mounted() {
            return Err(Error::InvalidArg);
        }
        if size > INODE_SIZE_MAX {
            return Err(Error::FileTooBig);
        }

        let old = self.inode_ref(ino).size;
        if size > old {
            self.expand_prepare(ino)?;
        } else if size < old {
            self.shrink(ino, size)?;
        }

        self.inode_mut(ino).size = size;
        Ok(())
    }

    /// Free all file data at and beyond `size`.
    fn shrink(&mut self, ino: &mut CInode, size: u64) -> Result<()> {
        if size > 0 && !ino.dirty {
            log::error!("shrink of undirtied inode {}", ino.inum);
            return Err(Error::InvalidArg);
        }

        let mut tb = ((size + BLOCK_MASK) >> BLOCK_SIZE_P2) as u32;
        self.inode_put_data(ino);

        // Direct range.
        while tb < DIRECT_POINTERS as u32 {
            let b = self.inode_ref(ino).entries[tb as usize];
            if b != BLOCK_SPARSE {
                self.trunc_data_block(ino, b)?;
                self.inode_mut(ino).entries[tb as usize] = BLOCK_SPARSE;
            }
            tb += 1;
        }

        // Indirect range.
        while tb < DIRECT_POINTERS as u32 + INODE_INDIR_BLOCKS {
            match self.seek(ino, tb) {
                Ok(()) | Err(Error::NoData) => {}
                Err(e) => return Err(e),
            }

            let freed = self.trunc_indir(ino)?;
            if freed {
                let e = ino.inode_entry as usize;
                self.inode_mut(ino).entries[e] = BLOCK_SPARSE;
            }
            // Next seek goes to the start of the next indirect.
            tb += INDIR_ENTRIES as u32 - ino.indir_entry as u32;
        }

        // Double-indirect range.
        while tb < INODE_DATA_BLOCKS {
            match self.seek(ino, tb) {
                Ok(()) | Err(Error::NoData) => {}
                Err(e) => return Err(e),
            }

            // trunc_dindir seeks as it goes, updating the coordinates;
            // keep the originals for the arithmetic below.
            let orig_ie = ino.inode_entry;
            let orig_de = ino.dindir_entry;
            let orig_xe = ino.indir_entry;

            let freed = self.trunc_dindir(ino)?;
            if freed {
                self.inode_mut(ino).entries[orig_ie as usize] = BLOCK_SPARSE;
            }

            // Blocks until the end of this double indirect, clamped so the
            // addition cannot pass the inode's maximum.
            let till_end =
                DINDIR_DATA_BLOCKS - orig_de as u32 * INDIR_ENTRIES as u32 - orig_xe as u32;
            tb += till_end.min(INODE_DATA_BLOCKS - tb);
        }

        Ok(())
    }

    /// Truncate a double indirect at the current seek coordinates.
    /// Returns whether the node itself was freed (no surviving entries
    /// before the boundary) rather than branched and trimmed.
    fn trunc_dindir(&mut self, ino: &mut CInode) -> Result<bool> {
        let dindir = match ino.dindir {
            Some(d) => d,
            None => return Ok(false),
        };

        // Any non-sparse indirect pointer wholly before the boundary means
        // the double indirect survives.
        let mut branch = self.indir_entries_used(dindir, ino.dindir_entry);

        // Otherwise look inside the indirect that straddles the boundary:
        // if it survives, so does the double indirect.
        if !branch
            && layout::as_indir(self.bufs.data(dindir)).entries[ino.dindir_entry as usize]
                != BLOCK_SPARSE
        {
            if let Some(indir) = ino.indir {
                branch = self.indir_entries_used(indir, ino.indir_entry);
            }
        }

        if branch {
            self.branch_block(ino, BranchDepth::Dindir, false)?;
        }

        let mut block = ino.logical_block;
        let start = ino.dindir_entry;
        let dindir_offset = ino.indir_entry as u32 + start as u32 * INDIR_ENTRIES as u32;
        let dindir_first_block = block - dindir_offset;
        let till_max = INODE_DATA_BLOCKS - dindir_first_block;
        // Round up without overflowing.
        let max_entries =
            till_max / INDIR_ENTRIES as u32 + u32::from(till_max % INDIR_ENTRIES as u32 != 0);
        let n_entries = (INDIR_ENTRIES as u32).min(max_entries) as u16;

        for e in start..n_entries {
            // Reseek so trunc_indir sees the right indirect and entry.
            match self.seek(ino, block) {
                Ok(()) | Err(Error::NoData) => {}
                Err(err) => return Err(err),
            }

            if ino.indir_block != BLOCK_SPARSE {
                let indir_freed = self.trunc_indir(ino)?;

                // Indirects past the straddling one always go entirely,
                // and if the double indirect dies they all must.
                debug_assert!(e == start || indir_freed);
                debug_assert!(indir_freed || branch);

                if branch && indir_freed {
                    let d = ino.dindir.expect("double indirect released");
                    layout::as_indir_mut(self.bufs.data_mut(d)).entries[e as usize] = BLOCK_SPARSE;
                }
            }

            block += INDIR_ENTRIES as u32 - ino.indir_entry as u32;
        }

        if !branch {
            if let Some(d) = ino.dindir.take() {
                self.bufs.put(d);
            }
            self.imap_block_set(ino.dindir_block, false)?;
        }
        Ok(!branch)
    }

    /// Truncate an indirect at the current seek coordinates.  Same
    /// freed-versus-branched contract as `trunc_dindir`.
    fn trunc_indir(&mut self, ino: &mut CInode) -> Result<bool> {
        let indir = match ino.indir {
            Some(i) => i,
            None => return Ok(false),
        };

        let branch = self.indir_entries_used(indir, ino.indir_entry);
        if branch {
            self.branch_block(ino, BranchDepth::Indir, false)?;
        }

        let max_entries = (INDIR_ENTRIES as u32)
            .min(INODE_DATA_BLOCKS - (ino.logical_block - ino.indir_entry as u32))
            as u16;

        for e in ino.indir_entry..max_entries {
            let indir = ino.indir.expect("indirect released");
            let b = layout::as_indir(self.bufs.data(indir)).entries[e as usize];
            if b != BLOCK_SPARSE {
                self.trunc_data_block(ino, b)?;
                if branch {
                    layout::as_indir_mut(self.bufs.data_mut(indir)).entries[e as usize] =
                        BLOCK_SPARSE;
                }
            }
        }

        if !branch {
            if let Some(i) = ino.indir.take() {
                self.bufs.put(i);
            }
            self.imap_block_set(ino.indir_block, false)?;
        }
        Ok(!branch)
    }

    /// Whether any entry before `boundary` in an indirect-format node is
    /// allocated.
    fn indir_entries_used(&self, node: BufIdx, boundary: u16) -> bool {
        let entries = &layout::as_indir(self.bufs.data(node)).entries;
        entries[..boundary as usize]
            .iter()
            .any(|&b| b != BLOCK_SPARSE)
    }

    /// Free one file data block and account for it.
    fn trunc_data_block(&mut self, ino: &CInode, block: u32) -> Result<()> {
        debug_assert_ne!(block, BLOCK_SPARSE);
        self.imap_block_set(block, false)?;

        let blocks = self.inode_ref(ino).blocks;
        if blocks == 0 {
            return Err(self.vol.critical_error());
        }
        self.inode_mut(ino).blocks = blocks - 1;
        Ok(())
    }

    /// Prepare to grow the file: if the old EOF is mid-block and that block
    /// exists, zero the bytes beyond the old size.  A previous unaligned
    /// shrink leaves stale data there, deliberately deferring the disk-full
    /// burden of the rewrite to the expanding operation.
    fn expand_prepare(&mut self, ino: &mut CInode) -> Result<()> {
        if !ino.dirty {
            log::error!("expand of undirtied inode {}", ino.inum);
            return Err(Error::InvalidArg);
        }

        let size = self.inode_ref(ino).size;
        let in_block = (size & BLOCK_MASK) as usize;
        if in_block == 0 {
            return Ok(());
        }

        match self.seek(ino, (size >> BLOCK_SIZE_P2) as u32) {
            Err(Error::NoData) => Ok(()),
            Ok(()) => {
                self.branch_block(ino, BranchDepth::FileData, true)?;
                let data = ino.data.expect("branched without buffer");
                self.bufs.data_mut(data)[in_block..].fill(0);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Extend the file by `len` bytes of sparse data and reserve enough
    /// free blocks that writing the region can never hit no-space.
    /// `offset` must equal the current size.
    pub fn data_reserve(&mut self, ino: &mut CInode, offset: u64, len: u64) -> Result<()> {
        if !ino.is_mounted() || !ino.dirty || offset != self.inode_ref(ino).size || len == 0 {
            return Err(Error::InvalidArg);
        }
        if offset > INODE_SIZE_MAX || INODE_SIZE_MAX - offset < len {
            return Err(Error::FileTooBig);
        }

        self.expand_prepare(ino)?;

        let need = self.count_sparse_blocks(ino, offset, len)?;
        if need + INODE_MAX_DEPTH > self.vol.free_block_count() {
            return Err(Error::NoSpace);
        }

        self.vol.reserved_inodes += 1;
        self.vol.reserved_inode_blocks += need;
        self.inode_mut(ino).size = offset + len;
        Ok(())
    }

    /// Release a reservation from `offset` to EOF.  The file must not have
    /// been written beyond `offset`.
    pub fn data_unreserve(&mut self, ino: &mut CInode, offset: u64) -> Result<()> {
        if !ino.is_mounted() || offset > self.inode_ref(ino).size {
            return Err(Error::InvalidArg);
        }
        if self.vol.reserved_inodes == 0 {
            return Err(self.vol.critical_error());
        }

        let size = self.inode_ref(ino).size;
        let reclaim = self.count_sparse_blocks(ino, offset, size - offset)?;
        if self.vol.reserved_inode_blocks < reclaim {
            return Err(self.vol.critical_error());
        }

        self.vol.reserved_inodes -= 1;
        self.vol.reserved_inode_blocks -= reclaim;
        Ok(())
    }

    /// Count the blocks that would need allocating to fully populate the
    /// byte range: distinct sparse positions at every tree level.  Except
    /// for the data block straddling EOF (and the nodes above it), every
    /// block in the range must be sparse.
    fn count_sparse_blocks(&mut self, ino: &mut CInode, offset: u64, len: u64) -> Result<u32> {
        let start = (offset >> BLOCK_SIZE_P2) as u32;
        let end = ((offset + len + BLOCK_MASK) >> BLOCK_SIZE_P2) as u32;

        let mut prev_ie = COORD_ENTRY_INVALID;
        let mut prev_de = COORD_ENTRY_INVALID;
        let mut prev_xe = COORD_ENTRY_INVALID;
        let mut count = 0u32;

        match self.seek(ino, start) {
            Ok(()) | Err(Error::NoData) => {}
            Err(e) => return Err(e),
        }

        // Positions already allocated at the starting offset never need
        // new blocks; prime the trackers so they are not counted.
        if self.inode_ref(ino).entries[ino.inode_entry as usize] != BLOCK_SPARSE {
            prev_ie = ino.inode_entry;
        }
        if ino.dindir_entry != COORD_ENTRY_INVALID {
            if let Some(d) = ino.dindir {
                if layout::as_indir(self.bufs.data(d)).entries[ino.dindir_entry as usize]
                    != BLOCK_SPARSE
                {
                    prev_de = ino.dindir_entry;
                }
            }
        }
        if ino.indir_entry != COORD_ENTRY_INVALID {
            if let Some(i) = ino.indir {
                if layout::as_indir(self.bufs.data(i)).entries[ino.indir_entry as usize]
                    != BLOCK_SPARSE
                {
                    prev_xe = ino.indir_entry;
                }
            }
        }

        let mut b = start;
        while b < end {
            match self.seek(ino, b) {
                Err(Error::NoData) => {}
                Ok(()) => {
                    if b > start {
                        // Everything past the first position must be sparse.
                        return Err(self.vol.critical_error());
                    }
                }
                Err(e) => return Err(e),
            }

            if prev_ie != ino.inode_entry {
                prev_ie = ino.inode_entry;
                count += 1;
            }
            if ino.dindir_entry != COORD_ENTRY_INVALID && prev_de != ino.dindir_entry {
                prev_de = ino.dindir_entry;
                count += 1;
            }
            if ino.indir_entry != COORD_ENTRY_INVALID && prev_xe != ino.indir_entry {
                prev_xe = ino.indir_entry;
                count += 1;
            }
            b += 1;
        }

        Ok(count)
    }

    /// Seek to a logical block and buffer its data.
    pub fn seek_and_read(&mut self, ino: &mut CInode, block: u32) -> Result<()> {
        self.seek(ino, block)?;
        if ino.data.is_none() {
            debug_assert_ne!(ino.data_block, BLOCK_SPARSE);
            ino.data = Some(self.bufs.get(
                self.dev,
                self.vol,
                ino.data_block,
                BufFlags::empty(),
            )?);
        }
        Ok(())
    }

    /// Seek to a logical block: compute coordinates, walk the tree, and
    /// resolve the physical block at each level.  `NoData` means the data
    /// block is sparse; levels below a sparse node are never touched.
    pub fn seek(&mut self, ino: &mut CInode, block: u32) -> Result<()> {
        if !ino.is_mounted() || block >= INODE_DATA_BLOCKS {
            return Err(Error::InvalidArg);
        }

        self.seek_coord(ino, block);

        if ino.dindir_entry != COORD_ENTRY_INVALID {
            if ino.dindir_block == BLOCK_SPARSE {
                // No double indirect, hence no indirect either.
                ino.indir_block = BLOCK_SPARSE;
            } else {
                if ino.dindir.is_none() {
                    ino.dindir = Some(self.bufs.get(
                        self.dev,
                        self.vol,
                        ino.dindir_block,
                        BufFlags::META_DINDIR,
                    )?);
                }
                let d = ino.dindir.expect("double indirect just fetched");
                ino.indir_block =
                    layout::as_indir(self.bufs.data(d)).entries[ino.dindir_entry as usize];
            }
        }

        if ino.indir_entry != COORD_ENTRY_INVALID {
            if ino.indir_block == BLOCK_SPARSE {
                ino.data_block = BLOCK_SPARSE;
            } else {
                if ino.indir.is_none() {
                    ino.indir = Some(self.bufs.get(
                        self.dev,
                        self.vol,
                        ino.indir_block,
                        BufFlags::META_INDIR,
                    )?);
                }
                let i = ino.indir.expect("indirect just fetched");
                ino.data_block =
                    layout::as_indir(self.bufs.data(i)).entries[ino.indir_entry as usize];
            }
        }

        if ino.data_block == BLOCK_SPARSE {
            return Err(Error::NoData);
        }
        Ok(())
    }

    /// Compute the coordinates for a logical block, releasing child
    /// buffers whose coordinates no longer apply.
    fn seek_coord(&mut self, ino: &mut CInode, block: u32) {
        if ino.logical_block == block && ino.coord_inited {
            return;
        }

        self.inode_put_data(ino);
        ino.logical_block = block;

        if block < DIRECT_POINTERS as u32 {
            self.inode_put_coord(ino);

            ino.inode_entry = block as u16;
            ino.data_block = self.inode_ref(ino).entries[block as usize];
            ino.dindir_entry = COORD_ENTRY_INVALID;
            ino.indir_entry = COORD_ENTRY_INVALID;
        } else if block < DIRECT_POINTERS as u32 + INODE_INDIR_BLOCKS {
            let off = block - DIRECT_POINTERS as u32;
            let inode_entry = (off / INDIR_ENTRIES as u32 + DIRECT_POINTERS as u32) as u16;
            let indir_entry = (off % INDIR_ENTRIES as u32) as u16;

            if let Some(d) = ino.dindir.take() {
                self.bufs.put(d);
            }

            // Same inode entry means the previous indirect still applies;
            // otherwise drop it and let seek read the new one.
            if ino.inode_entry != inode_entry || !ino.coord_inited {
                if let Some(i) = ino.indir.take() {
                    self.bufs.put(i);
                }
                ino.inode_entry = inode_entry;
                ino.indir_block = self.inode_ref(ino).entries[inode_entry as usize];
            }

            ino.dindir_entry = COORD_ENTRY_INVALID;
            ino.indir_entry = indir_entry;
        } else {
            let off = block - DIRECT_POINTERS as u32 - INODE_INDIR_BLOCKS;
            let inode_entry = (off / DINDIR_DATA_BLOCKS
                + DIRECT_POINTERS as u32
                + INDIRECT_POINTERS_U32) as u16;
            let node_off = off % DINDIR_DATA_BLOCKS;
            let dindir_entry = (node_off / INDIR_ENTRIES as u32) as u16;
            let indir_entry = (node_off % INDIR_ENTRIES as u32) as u16;

            if ino.inode_entry != inode_entry || !ino.coord_inited {
                if let Some(i) = ino.indir.take() {
                    self.bufs.put(i);
                }
                if let Some(d) = ino.dindir.take() {
                    self.bufs.put(d);
                }
                ino.inode_entry = inode_entry;
                ino.dindir_block = self.inode_ref(ino).entries[inode_entry as usize];
            } else if ino.dindir_entry != dindir_entry {
                // Same double indirect, different indirect.
                if let Some(i) = ino.indir.take() {
                    self.bufs.put(i);
                }
            }

            ino.dindir_entry = dindir_entry;
            ino.indir_entry = indir_entry;
        }

        ino.coord_inited = true;
    }

    fn read_unaligned(&mut self, ino: &mut CInode, start: u64, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(
            start >> BLOCK_SIZE_P2,
            (start + dst.len() as u64 - 1) >> BLOCK_SIZE_P2
        );

        match self.seek_and_read(ino, (start >> BLOCK_SIZE_P2) as u32) {
            Ok(()) => {
                let data = ino.data.expect("seek_and_read left no buffer");
                let off = (start & BLOCK_MASK) as usize;
                dst.copy_from_slice(&self.bufs.data(data)[off..off + dst.len()]);
                Ok(())
            }
            Err(Error::NoData) => {
                dst.fill(0);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn read_aligned(
        &mut self,
        ino: &mut CInode,
        block_start: u32,
        count: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        let mut idx = 0u32;
        while idx < count {
            match self.get_extent(ino, block_start + idx, count - idx) {
                Ok((ext_start, ext_len)) => {
                    let lo = (idx as usize) << BLOCK_SIZE_P2;
                    let hi = ((idx + ext_len) as usize) << BLOCK_SIZE_P2;
                    self.bufs
                        .read_range(self.dev, self.vol, ext_start, ext_len, &mut dst[lo..hi])?;
                    idx += ext_len;
                }
                Err(Error::NoData) => {
                    let lo = (idx as usize) << BLOCK_SIZE_P2;
                    dst[lo..lo + BLOCK_SIZE].fill(0);
                    idx += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The physical start and length of the contiguous extent beginning at
    /// `block_start`, capped at `max_len`.
    fn get_extent(&mut self, ino: &mut CInode, block_start: u32, max_len: u32) -> Result<(u32, u32)> {
        self.seek(ino, block_start)?;

        let first = ino.data_block;
        let mut run = 1u32;
        while run < max_len {
            match self.seek(ino, block_start + run) {
                Err(Error::NoData) => break,
                Ok(()) => {
                    if ino.data_block != first + run {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
            run += 1;
        }
        Ok((first, run))
    }

    fn write_unaligned(&mut self, ino: &mut CInode, start: u64, src: &[u8]) -> Result<()> {
        debug_assert_eq!(
            start >> BLOCK_SIZE_P2,
            (start + src.len() as u64 - 1) >> BLOCK_SIZE_P2
        );

        match self.seek(ino, (start >> BLOCK_SIZE_P2) as u32) {
            Ok(()) | Err(Error::NoData) => {}
            Err(e) => return Err(e),
        }

        self.branch_block(ino, BranchDepth::FileData, true)?;

        let data = ino.data.expect("branched without buffer");
        let off = (start & BLOCK_MASK) as usize;
        self.bufs.data_mut(data)[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Write whole blocks, branching each and streaming contiguous extents
    /// straight to the device.  Returns the number of blocks written,
    /// which stops short when the volume fills.
    fn write_aligned(&mut self, ino: &mut CInode, block_start: u32, src: &[u8]) -> Result<u32> {
        let count = (src.len() >> BLOCK_SIZE_P2) as u32;
        let mut idx = 0u32;
        let mut next_data = BLOCK_SPARSE;

        // Drop the data pin: the direct write below invalidates cached
        // copies of the written range, and a pinned one would trip the
        // discard.
        self.inode_put_data(ino);

        while idx < count {
            let mut full = false;
            let mut ext_start = BLOCK_SPARSE;
            let mut ext_len = 0u32;

            // Branch a contiguous extent of blocks.
            let mut i = idx;
            while i < count {
                if next_data == BLOCK_SPARSE {
                    match self.seek(ino, block_start + i) {
                        Ok(()) | Err(Error::NoData) => {}
                        Err(e) => return Err(e),
                    }
                    // Create or branch the parents and allocate the data
                    // block, unbuffered.
                    match self.branch_block(ino, BranchDepth::FileData, false) {
                        Ok(()) => {}
                        Err(Error::NoSpace) if ext_len > 0 => {
                            full = true;
                            break;
                        }
                        Err(Error::NoSpace) => {
                            return if idx > 0 { Ok(idx) } else { Err(Error::NoSpace) };
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    // The discontiguous allocation that ended the last
                    // extent is still current in the handle.
                    debug_assert_eq!(ino.data_block, next_data);
                    next_data = BLOCK_SPARSE;
                }

                if ext_len == 0 {
                    ext_start = ino.data_block;
                    ext_len = 1;
                } else if ino.data_block == ext_start + ext_len {
                    ext_len += 1;
                } else {
                    // Discontiguous: flush what we have, start over here.
                    next_data = ino.data_block;
                    break;
                }
                i += 1;
            }

            let lo = (idx as usize) << BLOCK_SIZE_P2;
            let hi = ((idx + ext_len) as usize) << BLOCK_SIZE_P2;
            self.bufs
                .write_range(self.dev, self.vol, ext_start, ext_len, &src[lo..hi])?;
            idx += ext_len;

            if full {
                return Ok(idx);
            }
        }

        Ok(idx)
    }

    /// Make the path to the current seek coordinates writable down to
    /// `depth`, allocating sparse levels and branching committed ones.
    /// Checks the worst-case block bill against free space first; an error
    /// after that point is critical, since a partially branched path
    /// cannot be cleanly unwound.
    pub fn branch_block(&mut self, ino: &mut CInode, depth: BranchDepth, buffer: bool) -> Result<()> {
        let cost = self.branch_block_cost(ino, depth)?;
        if cost > self.vol.free_block_count() {
            return Err(Error::NoSpace);
        }

        let res = self.branch_block_inner(ino, depth, buffer);
        if let Err(e) = res {
            let _ = self.vol.critical_error();
            return Err(e);
        }
        Ok(())
    }

    fn branch_block_inner(
        &mut self,
        ino: &mut CInode,
        depth: BranchDepth,
        buffer: bool,
    ) -> Result<()> {
        if ino.dindir_entry != COORD_ENTRY_INVALID {
            let mut block = ino.dindir_block;
            let mut slot = ino.dindir;
            self.branch_one_block(&mut block, &mut slot, BufFlags::META_DINDIR, true)?;
            ino.dindir_block = block;
            ino.dindir = slot;

            let d = ino.dindir.expect("double indirect not buffered");
            // In case the double indirect was just created.
            layout::as_indir_mut(self.bufs.data_mut(d)).inode = ino.inum;
            let e = ino.inode_entry as usize;
            self.inode_mut(ino).entries[e] = ino.dindir_block;
        }

        if ino.indir_entry != COORD_ENTRY_INVALID && depth >= BranchDepth::Indir {
            let mut block = ino.indir_block;
            let mut slot = ino.indir;
            self.branch_one_block(&mut block, &mut slot, BufFlags::META_INDIR, true)?;
            ino.indir_block = block;
            ino.indir = slot;

            let i = ino.indir.expect("indirect not buffered");
            layout::as_indir_mut(self.bufs.data_mut(i)).inode = ino.inum;

            if ino.dindir_entry != COORD_ENTRY_INVALID {
                let d = ino.dindir.expect("double indirect not buffered");
                layout::as_indir_mut(self.bufs.data_mut(d)).entries[ino.dindir_entry as usize] =
                    ino.indir_block;
            } else {
                let e = ino.inode_entry as usize;
                self.inode_mut(ino).entries[e] = ino.indir_block;
            }
        }

        if depth == BranchDepth::FileData {
            let alloced_new = ino.data_block == BLOCK_SPARSE;
            let want_buf = buffer || ino.data.is_some();

            let mut block = ino.data_block;
            let mut slot = ino.data;
            self.branch_one_block(&mut block, &mut slot, BufFlags::empty(), want_buf)?;
            ino.data_block = block;
            ino.data = slot;

            if ino.indir_entry != COORD_ENTRY_INVALID {
                let i = ino.indir.expect("indirect not buffered");
                layout::as_indir_mut(self.bufs.data_mut(i)).entries[ino.indir_entry as usize] =
                    ino.data_block;
            } else {
                let e = ino.inode_entry as usize;
                self.inode_mut(ino).entries[e] = ino.data_block;
            }

            if alloced_new {
                let blocks = self.inode_ref(ino).blocks;
                if blocks >= INODE_DATA_BLOCKS {
                    return Err(self.vol.critical_error());
                }
                self.inode_mut(ino).blocks = blocks + 1;
            }
        }

        Ok(())
    }

    /// Branch one block of the path: a double indirect, indirect, or data
    /// block.  Sparse blocks are allocated fresh; committed blocks are
    /// reallocated with their buffer rebound and the old location marked
    /// almost-free; blocks already new this transaction are just dirtied.
    fn branch_one_block(
        &mut self,
        block: &mut u32,
        slot: &mut Option<BufIdx>,
        meta: BufFlags,
        want_buf: bool,
    ) -> Result<()> {
        let prev = *block;
        let state = if prev == BLOCK_SPARSE {
            AllocState::Free
        } else {
            self.imap_block_state(prev)?
        };

        if state == AllocState::New {
            // Already branched this transaction; overwrite in place.
            if want_buf {
                match *slot {
                    Some(b) => self.bufs.dirty(b),
                    None => {
                        *slot =
                            Some(self.bufs.get(self.dev, self.vol, prev, meta | BufFlags::DIRTY)?)
                    }
                }
            }
            return Ok(());
        }

        let new_block = self.imap_alloc_block()?;
        *block = new_block;

        if prev == BLOCK_SPARSE {
            if self.vol.use_reserved_inode_blocks {
                if self.vol.reserved_inode_blocks == 0 {
                    return Err(self.vol.critical_error());
                }
                self.vol.reserved_inode_blocks -= 1;
            }

            if want_buf {
                if slot.is_some() {
                    // A buffer for a block that did not exist?
                    log::error!("stale buffer while allocating block {}", new_block);
                    return Err(Error::InvalidArg);
                }
                *slot = Some(self.bufs.get(
                    self.dev,
                    self.vol,
                    new_block,
                    meta | BufFlags::NEW | BufFlags::DIRTY,
                )?);
            }
        } else {
            if want_buf {
                if slot.is_none() {
                    *slot = Some(self.bufs.get(self.dev, self.vol, prev, meta)?);
                }
                self.bufs
                    .branch(self.vol, slot.expect("just fetched"), new_block);
            }
            self.imap_block_set(prev, false)?;
        }

        Ok(())
    }

    /// Worst-case free blocks needed to branch down to `depth` at the
    /// current coordinates: the maximum depth minus every level already
    /// branched this transaction or not in play at this offset.
    fn branch_block_cost(&mut self, ino: &CInode, depth: BranchDepth) -> Result<u32> {
        if !ino.is_mounted() || !ino.coord_inited {
            log::error!("branch cost without coordinates");
            return Err(Error::InvalidArg);
        }

        let mut cost = INODE_MAX_DEPTH;

        if ino.dindir_entry != COORD_ENTRY_INVALID {
            if ino.dindir_block != BLOCK_SPARSE
                && self.imap_block_state(ino.dindir_block)? == AllocState::New
            {
                cost -= 1;
            }
        } else {
            cost -= 1;
        }

        if ino.indir_entry != COORD_ENTRY_INVALID && depth >= BranchDepth::Indir {
            if ino.indir_block != BLOCK_SPARSE
                && self.imap_block_state(ino.indir_block)? == AllocState::New
            {
                cost -= 1;
            }
        } else {
            cost -= 1;
        }

        if depth == BranchDepth::FileData {
            if ino.data_block != BLOCK_SPARSE
                && self.imap_block_state(ino.data_block)? == AllocState::New
            {
                cost -= 1;
                // A branched data block implies branched parents.
                debug_assert_eq!(cost, 0);
            }
        } else {
            cost -= 1;
        }

        Ok(cost)
    }
}

const INDIRECT_POINTERS_U32: u32 = crate::config::INDIRECT_POINTERS as u32;
