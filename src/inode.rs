//! Inodes.
//!
//! An inode describes a single unnamed file or directory.  Inodes live in
//! a fixed on-disk table with two block slots each; the working-state imap
//! says which slot is current, and branching an inode toggles it to the
//! sibling slot, preserving the committed copy until the next transaction
//! point.  Inode slot blocks sit below `first_allocable`, so slot toggles
//! never touch the free-block accounting.
//!
//! A [`CInode`] is a short-lived working handle: it pins the inode buffer
//! plus whatever double-indirect/indirect/data buffers the last seek
//! needed, and caches the seek coordinates.  Handles live for one core API
//! call and are released with `inode_put`.
//!
//! An inode whose link count reaches zero while the caller still has it
//! open is not freed but appended to the orphan list, a singly-linked
//! chain through `next_orphan`, and reaped at mount or via the
//! free-orphan calls.

use crate::bdev::BlockDev;
use crate::buf::{BufFlags, BufIdx};
use crate::error::{Error, Result};
use crate::imap::AllocState;
use crate::layout::{self, mode, DiskInode, BLOCK_SPARSE, INODE_INVALID, INODE_ROOT};
use crate::volume::{VolCtx, Volume};

/// Coordinate value meaning "level not in play at this offset".
pub const COORD_ENTRY_INVALID: u16 = u16::MAX;

/// Expected inode type for `inode_mount`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ftype {
    Any,
    Dir,
    NotDir,
    File,
}

bitflags::bitflags! {
    /// Timestamp updates applied at `inode_put`.
    pub struct PutFlags: u8 {
        const ATIME = 0x1;
        const MTIME = 0x2;
        const CTIME = 0x4;
    }
}

/// Attribute snapshot returned by `stat`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InodeStat {
    pub ino: u32,
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// Working handle for a mounted inode.
pub struct CInode {
    pub inum: u32,
    /// Physical block currently holding the inode.
    pub inode_block: u32,
    pub buf: Option<BufIdx>,
    pub dindir: Option<BufIdx>,
    pub indir: Option<BufIdx>,
    pub data: Option<BufIdx>,

    // Seek coordinates and the physical blocks resolved at each level.
    pub logical_block: u32,
    pub inode_entry: u16,
    pub dindir_entry: u16,
    pub indir_entry: u16,
    pub dindir_block: u32,
    pub indir_block: u32,
    pub data_block: u32,

    pub dirty: bool,
    pub coord_inited: bool,
    pub directory: bool,
}

impl CInode {
    pub fn new(inum: u32) -> CInode {
        CInode {
            inum,
            inode_block: 0,
            buf: None,
            dindir: None,
            indir: None,
            data: None,
            logical_block: 0,
            inode_entry: 0,
            dindir_entry: COORD_ENTRY_INVALID,
            indir_entry: COORD_ENTRY_INVALID,
            dindir_block: BLOCK_SPARSE,
            indir_block: BLOCK_SPARSE,
            data_block: BLOCK_SPARSE,
            dirty: false,
            coord_inited: false,
            directory: false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.buf.is_some()
    }
}

impl Volume {
    pub(crate) fn inode_is_valid(&self, inum: u32) -> bool {
        inum >= INODE_ROOT && inum - INODE_ROOT < self.inode_count
    }

    /// The two fixed slot blocks of an inode.
    pub(crate) fn inode_slot_blocks(&self, inum: u32) -> (u32, u32) {
        debug_assert!(self.inode_is_valid(inum));
        let first = self.inode_table_start + 2 * (inum - INODE_ROOT);
        (first, first + 1)
    }
}

impl<'a, D: BlockDev> VolCtx<'a, D> {
    /// View of a mounted inode's on-disk struct.
    pub fn inode_ref(&self, ino: &CInode) -> &DiskInode {
        layout::as_inode(self.bufs.data(ino.buf.expect("inode not mounted")))
    }

    /// Mutable view; the inode must have been branched first.
    pub fn inode_mut(&mut self, ino: &CInode) -> &mut DiskInode {
        layout::as_inode_mut(self.bufs.data_mut(ino.buf.expect("inode not mounted")))
    }

    /// Mount an inode into a working handle, optionally branching it for
    /// modification.  The current slot is whichever of the two slot blocks
    /// the working imap says is allocated; an inode with neither slot
    /// allocated is free and yields `BadHandle`.
    pub fn inode_mount(&mut self, inum: u32, ftype: Ftype, dirty: bool) -> Result<CInode> {
        if !self.vol.inode_is_valid(inum) {
            return Err(Error::BadHandle);
        }

        let (b0, b1) = self.vol.inode_slot_blocks(inum);
        let cur_block = if self.imap_block_get(self.vol.cur_mr, b0)? {
            b0
        } else if self.imap_block_get(self.vol.cur_mr, b1)? {
            b1
        } else {
            return Err(Error::BadHandle);
        };

        let idx = self
            .bufs
            .get(self.dev, self.vol, cur_block, BufFlags::META_INODE)?;

        let m = layout::as_inode(self.bufs.data(idx)).mode;
        let is_dir = mode::is_dir(m);
        let type_err = match ftype {
            Ftype::Any => None,
            Ftype::Dir if !is_dir => Some(Error::NotDir),
            Ftype::NotDir if is_dir => Some(Error::IsDir),
            Ftype::File if is_dir => Some(Error::IsDir),
            Ftype::File if mode::is_lnk(m) => Some(Error::NoLink),
            _ => None,
        };
        if let Some(e) = type_err {
            self.bufs.put(idx);
            return Err(e);
        }

        let mut ino = CInode::new(inum);
        ino.inode_block = cur_block;
        ino.buf = Some(idx);
        ino.directory = is_dir;

        if dirty {
            if let Err(e) = self.inode_branch(&mut ino) {
                self.inode_put(&mut ino, PutFlags::empty());
                return Err(e);
            }
        }
        Ok(ino)
    }

    /// Make the inode block writable: already-branched inodes are just
    /// dirtied; committed ones move to the sibling slot, leaving the old
    /// slot almost-free.
    pub fn inode_branch(&mut self, ino: &mut CInode) -> Result<()> {
        let buf = ino.buf.expect("inode not mounted");

        match self.imap_block_state(ino.inode_block)? {
            AllocState::New => {
                self.bufs.dirty(buf);
            }
            AllocState::Committed => {
                let (b0, b1) = self.vol.inode_slot_blocks(ino.inum);
                let new_block = if ino.inode_block == b0 { b1 } else { b0 };

                self.imap_block_set(new_block, true)?;
                self.bufs.branch(self.vol, buf, new_block);
                self.imap_block_set(ino.inode_block, false)?;
                ino.inode_block = new_block;
            }
            AllocState::Free | AllocState::AlmostFree => {
                return Err(self.vol.critical_error());
            }
        }

        ino.dirty = true;
        Ok(())
    }

    /// Allocate a fresh inode under `pinode`.
    ///
    /// An inode is allocatable only when both its slots are clear in both
    /// states: an inode deleted earlier in this transaction keeps an
    /// almost-free slot until the next transaction point and is skipped,
    /// so its number cannot be recycled into the committed state it still
    /// occupies.
    pub fn inode_create(&mut self, pinode: u32, m: u16) -> Result<CInode> {
        if self.vol.mr().free_inodes == 0 {
            return Err(Error::TooManyOpenFiles);
        }

        let mut found = None;
        for inum in INODE_ROOT..INODE_ROOT + self.vol.inode_count {
            let (b0, b1) = self.vol.inode_slot_blocks(inum);
            if self.imap_block_get(self.vol.cur_mr, b0)?
                || self.imap_block_get(self.vol.cur_mr, b1)?
            {
                continue;
            }
            let other = 1 - self.vol.cur_mr;
            if self.imap_block_get(other, b0)? || self.imap_block_get(other, b1)? {
                continue;
            }
            found = Some((inum, b0));
            break;
        }

        let (inum, slot) = found.ok_or(Error::TooManyOpenFiles)?;

        self.imap_block_set(slot, true)?;
        let idx = self.bufs.get(
            self.dev,
            self.vol,
            slot,
            BufFlags::META_INODE | BufFlags::NEW | BufFlags::DIRTY,
        )?;

        let now = (self.clock)();
        {
            let di = layout::as_inode_mut(self.bufs.data_mut(idx));
            di.mode = m;
            di.nlink = 1;
            di.pinode = pinode;
            di.atime = now;
            di.mtime = now;
            di.ctime = now;
            // Zero-filled buffer: size, blocks, uid/gid, next_orphan and
            // every block pointer already read as empty/sparse/invalid.
        }

        self.vol.mr_mut().free_inodes -= 1;

        let mut ino = CInode::new(inum);
        ino.inode_block = slot;
        ino.buf = Some(idx);
        ino.dirty = true;
        ino.directory = mode::is_dir(m);
        Ok(ino)
    }

    /// Drop one link.  At zero links the inode is either freed outright or,
    /// if the caller still holds it open, parked on the orphan list.
    pub fn inode_link_dec(&mut self, ino: &mut CInode, orphan: bool) -> Result<()> {
        let nlink = self.inode_ref(ino).nlink;

        if nlink > 1 {
            self.inode_branch(ino)?;
            self.inode_mut(ino).nlink = nlink - 1;
            return Ok(());
        }

        if orphan {
            self.inode_branch(ino)?;
            {
                let di = self.inode_mut(ino);
                di.nlink = 0;
                di.pinode = INODE_INVALID;
                di.next_orphan = INODE_INVALID;
            }
            self.orphan_append(ino.inum)?;
            return Ok(());
        }

        self.inode_free(ino)
    }

    fn orphan_append(&mut self, inum: u32) -> Result<()> {
        let tail = self.vol.mr().orphan_tail;
        if tail != INODE_INVALID {
            let mut t = self.inode_mount(tail, Ftype::Any, true)?;
            self.inode_mut(&t).next_orphan = inum;
            self.inode_put(&mut t, PutFlags::empty());
        } else {
            self.vol.mr_mut().orphan_head = inum;
        }
        self.vol.mr_mut().orphan_tail = inum;
        self.vol.branched = true;
        Ok(())
    }

    /// Free an inode: release all file data, free the slot block, discard
    /// the buffer.  The handle stays usable only for `inode_put`.
    pub fn inode_free(&mut self, ino: &mut CInode) -> Result<()> {
        self.data_truncate(ino, 0)?;
        self.inode_put_coord(ino);

        // Drop the buffer before freeing the slot; freeing invalidates any
        // cached copy of the block, which must be unreferenced by then.
        if let Some(buf) = ino.buf.take() {
            self.bufs.discard(buf);
        }
        self.imap_block_set(ino.inode_block, false)?;

        self.vol.mr_mut().free_inodes += 1;
        Ok(())
    }

    /// Free an inode reached through the orphan list.
    pub fn inode_free_orphan(&mut self, ino: &mut CInode) -> Result<()> {
        self.inode_free(ino)
    }

    /// Release every buffer the handle holds, applying timestamp updates
    /// first.  Timestamps only apply to branched (dirty) inodes.
    pub fn inode_put(&mut self, ino: &mut CInode, flags: PutFlags) {
        if let Some(buf) = ino.buf {
            if !flags.is_empty() && ino.dirty {
                let now = (self.clock)();
                let di = layout::as_inode_mut(self.bufs.data_mut(buf));
                if flags.contains(PutFlags::ATIME) {
                    di.atime = now;
                }
                if flags.contains(PutFlags::MTIME) {
                    di.mtime = now;
                }
                if flags.contains(PutFlags::CTIME) {
                    di.ctime = now;
                }
            }
            self.inode_put_coord(ino);
            self.bufs.put(buf);
            ino.buf = None;
        }
    }

    /// Release the double-indirect, indirect, and data buffers, keeping the
    /// inode buffer.  Used to shed pins before buffer-hungry operations.
    pub fn inode_put_coord(&mut self, ino: &mut CInode) {
        self.inode_put_data(ino);
        if let Some(i) = ino.indir.take() {
            self.bufs.put(i);
        }
        if let Some(d) = ino.dindir.take() {
            self.bufs.put(d);
        }
    }

    /// Release just the data-block buffer.
    pub fn inode_put_data(&mut self, ino: &mut CInode) {
        if let Some(d) = ino.data.take() {
            self.bufs.put(d);
        }
    }

    /// Attribute snapshot for `stat`.
    pub fn inode_stat(&self, ino: &CInode) -> InodeStat {
        let di = self.inode_ref(ino);
        InodeStat {
            ino: ino.inum,
            mode: di.mode,
            nlink: di.nlink,
            uid: di.uid,
            gid: di.gid,
            size: di.size,
            blocks: di.blocks,
            atime: di.atime,
            mtime: di.mtime,
            ctime: di.ctime,
        }
    }
}
