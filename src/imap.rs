//! Allocation bitmap (imap).
//!
//! One bit per block from the start of the inode table to the end of the
//! volume, in both the committed and the working state.  Small volumes keep
//! the bitmap inline in the metaroots; larger ones store it in imap nodes,
//! each occupying two fixed disk locations with a metaroot entries bit
//! selecting the current one.  Writing to a committed-state imap node is
//! forbidden: the node is branched to its alternate location first, which
//! is what preserves the committed state until the next transaction point.

use crate::bdev::BlockDev;
use crate::buf::{BufFlags, BufIdx};
use crate::config::IMAP_NODE_ENTRIES;
use crate::error::{Error, Result};
use crate::layout::{as_imap_node, as_imap_node_mut};
use crate::volume::{VolCtx, Volume};

/// Allocation state of a block, derived from its bit in both metaroots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocState {
    /// Clear in both states: available.
    Free,
    /// Set in the working state only: allocated this transaction.
    New,
    /// Set in both: part of the committed state.
    Committed,
    /// Clear in the working state only: branched away this transaction;
    /// reverts to free on commit.
    AlmostFree,
}

pub(crate) fn bit_get(bmp: &[u8], idx: usize) -> bool {
    bmp[idx >> 3] & (1 << (idx & 7)) != 0
}

pub(crate) fn bit_set(bmp: &mut [u8], idx: usize) {
    bmp[idx >> 3] |= 1 << (idx & 7);
}

pub(crate) fn bit_clear(bmp: &mut [u8], idx: usize) {
    bmp[idx >> 3] &= !(1 << (idx & 7));
}

impl Volume {
    /// Disk location of an external imap node according to one metaroot.
    pub(crate) fn imap_node_block(&self, mr_idx: usize, node: u32) -> u32 {
        debug_assert!(node < self.imap_node_count);
        let second = bit_get(&self.mr[mr_idx].entries, node as usize);
        self.imap_start + node * 2 + second as u32
    }

    /// An unbranched imap node has identical bits in both metaroots (both
    /// disk copies are identical).
    pub(crate) fn imap_node_is_branched(&self, node: u32) -> bool {
        bit_get(&self.mr[0].entries, node as usize) != bit_get(&self.mr[1].entries, node as usize)
    }
}

impl<'a, D: BlockDev> VolCtx<'a, D> {
    fn imap_check_range(&mut self, block: u32) -> Result<()> {
        if block < self.vol.inode_table_start || block >= self.vol.block_count {
            log::error!("imap: block {} outside mapped range", block);
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    /// The allocation bit of `block` as recorded in metaroot `mr_idx`.
    pub fn imap_block_get(&mut self, mr_idx: usize, block: u32) -> Result<bool> {
        self.imap_check_range(block)?;
        let offset = (block - self.vol.inode_table_start) as usize;

        if self.vol.imap_inline {
            return Ok(bit_get(&self.vol.mr[mr_idx].entries, offset));
        }

        let node = (offset / IMAP_NODE_ENTRIES) as u32;

        // If the node is unbranched both copies are identical; prefer the
        // current metaroot's copy, which is more likely to be buffered.
        let mut read_mr = mr_idx;
        if mr_idx != self.vol.cur_mr && !self.vol.imap_node_is_branched(node) {
            read_mr = self.vol.cur_mr;
        }

        let node_block = self.vol.imap_node_block(read_mr, node);
        let idx = self
            .bufs
            .get(self.dev, self.vol, node_block, BufFlags::META_IMAP)?;
        let bit = bit_get(
            &as_imap_node(self.bufs.data(idx)).entries,
            offset % IMAP_NODE_ENTRIES,
        );
        self.bufs.put(idx);
        Ok(bit)
    }

    /// Combined committed/working state of `block`.
    pub fn imap_block_state(&mut self, block: u32) -> Result<AllocState> {
        let working = self.imap_block_get(self.vol.cur_mr, block)?;
        let committed = self.imap_block_get(1 - self.vol.cur_mr, block)?;
        Ok(match (working, committed) {
            (false, false) => AllocState::Free,
            (true, false) => AllocState::New,
            (true, true) => AllocState::Committed,
            (false, true) => AllocState::AlmostFree,
        })
    }

    /// Set or clear the allocation bit of `block` in the working state.
    ///
    /// Setting a bit to its current value is a critical error: the driver
    /// never needs to do that, so it means the imap is corrupt or the
    /// caller lost track of a block.  Free-space accounting only applies to
    /// the allocable range; inode slot toggles live below it.
    pub fn imap_block_set(&mut self, block: u32, allocated: bool) -> Result<()> {
        self.imap_check_range(block)?;
        let offset = (block - self.vol.inode_table_start) as usize;

        if self.vol.imap_inline {
            let cur = self.vol.cur_mr;
            if bit_get(&self.vol.mr[cur].entries, offset) == allocated {
                return Err(self.vol.critical_error());
            }
            let entries = &mut self.vol.mr[cur].entries;
            if allocated {
                bit_set(entries, offset);
            } else {
                bit_clear(entries, offset);
            }
        } else {
            let node = (offset / IMAP_NODE_ENTRIES) as u32;
            let idx = self.imap_node_branch(node)?;
            let entry = offset % IMAP_NODE_ENTRIES;

            if bit_get(&as_imap_node(self.bufs.data(idx)).entries, entry) == allocated {
                self.bufs.put(idx);
                return Err(self.vol.critical_error());
            }

            let entries = &mut as_imap_node_mut(self.bufs.data_mut(idx)).entries;
            if allocated {
                bit_set(entries, entry);
            } else {
                bit_clear(entries, entry);
            }
            self.bufs.put(idx);
        }

        self.vol.branched = true;

        if !allocated {
            // A freed block must not leave a stale buffer behind: once it
            // returns to free it can be reallocated as NEW, and a free
            // block never has a buffer.  Callers release their pins before
            // freeing, so a live reference here is a logic bug.
            self.bufs.discard_range(self.vol, block, 1)?;
        }

        if block >= self.vol.first_allocable {
            if allocated {
                if self.vol.mr().free_blocks == 0 {
                    return Err(self.vol.critical_error());
                }
                self.vol.mr_mut().free_blocks -= 1;
            } else if self.imap_block_get(1 - self.vol.cur_mr, block)? {
                // Still allocated in the committed state: the block frees
                // for real at the next transaction point.
                self.vol.almost_free += 1;
            } else {
                self.vol.mr_mut().free_blocks += 1;
            }
        }

        Ok(())
    }

    /// One byte of the working-state bitmap, for the find-free fast path.
    fn imap_working_byte(&mut self, offset: usize) -> Result<u8> {
        if self.vol.imap_inline {
            return Ok(self.vol.mr().entries[offset >> 3]);
        }
        let node = (offset / IMAP_NODE_ENTRIES) as u32;
        let node_block = self.vol.imap_node_block(self.vol.cur_mr, node);
        let idx = self
            .bufs
            .get(self.dev, self.vol, node_block, BufFlags::META_IMAP)?;
        let byte = as_imap_node(self.bufs.data(idx)).entries[(offset % IMAP_NODE_ENTRIES) >> 3];
        self.bufs.put(idx);
        Ok(byte)
    }

    /// Circular scan from `start` for a block that is free in both the
    /// working and the committed state.  Blocks free in the working state
    /// but allocated in the committed state are almost-free and cannot be
    /// reused until the next transaction point.
    pub fn imap_find_free(&mut self, start: u32) -> Result<u32> {
        if start < self.vol.first_allocable || start >= self.vol.block_count {
            log::error!("imap find free: start {} out of range", start);
            return Err(Error::InvalidArg);
        }

        let table_start = self.vol.inode_table_start;
        let mut block = start;
        // The byte-skip below can hop over `start`, so bound the scan by
        // work done rather than by return-to-start alone.
        let mut remaining = self.vol.blocks_allocable as u64 + 8;

        loop {
            let offset = (block - table_start) as usize;

            if offset & 7 == 0 && self.imap_working_byte(offset)? == u8::MAX {
                // All eight blocks in this byte are allocated.
                let skip = 8.min(self.vol.block_count - block);
                block += skip;
                remaining = remaining.saturating_sub(skip as u64);
            } else {
                if !self.imap_block_get(self.vol.cur_mr, block)? {
                    if !self.imap_block_get(1 - self.vol.cur_mr, block)? {
                        return Ok(block);
                    }
                }
                block += 1;
                remaining = remaining.saturating_sub(1);
            }

            if block == self.vol.block_count {
                block = self.vol.first_allocable;
            }
            if block == start || remaining == 0 {
                return Err(Error::NoSpace);
            }
        }
    }

    /// Allocate one block, scanning from the rotating hint.
    pub fn imap_alloc_block(&mut self) -> Result<u32> {
        let mut hint = self.vol.mr().alloc_next_block;
        if hint < self.vol.first_allocable || hint >= self.vol.block_count {
            hint = self.vol.first_allocable;
        }

        let block = self.imap_find_free(hint)?;
        self.imap_block_set(block, true)?;

        let next = if block + 1 >= self.vol.block_count {
            self.vol.first_allocable
        } else {
            block + 1
        };
        self.vol.mr_mut().alloc_next_block = next;
        Ok(block)
    }

    /// Branch an external imap node and return its buffer, dirty.
    ///
    /// If the node is already branched it can be overwritten in place.
    /// Otherwise the metaroot entries bit is toggled so the node's current
    /// location moves to the alternate slot, the committed copy is fetched
    /// from the old location, and the buffer is rebound to the new one.
    fn imap_node_branch(&mut self, node: u32) -> Result<BufIdx> {
        if node >= self.vol.imap_node_count {
            log::error!("imap: node {} out of range", node);
            return Err(Error::InvalidArg);
        }

        if self.vol.imap_node_is_branched(node) {
            let block = self.vol.imap_node_block(self.vol.cur_mr, node);
            return self.bufs.get(
                self.dev,
                self.vol,
                block,
                BufFlags::META_IMAP | BufFlags::DIRTY,
            );
        }

        let cur = self.vol.cur_mr;
        let entries = &mut self.vol.mr[cur].entries;
        if bit_get(entries, node as usize) {
            bit_clear(entries, node as usize);
        } else {
            bit_set(entries, node as usize);
        }
        self.vol.branched = true;

        let new_block = self.vol.imap_node_block(cur, node);
        let old_block = self.vol.imap_node_block(1 - cur, node);

        // Any stale buffer at the new location must go before it is
        // repopulated with the committed copy.
        self.bufs.discard_range(self.vol, new_block, 1)?;

        let idx = self
            .bufs
            .get(self.dev, self.vol, old_block, BufFlags::META_IMAP)?;
        self.bufs.branch(self.vol, idx, new_block);
        Ok(idx)
    }
}
