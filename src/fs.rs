//! The core API.
//!
//! [`Core`] owns the block device, the volume array, and the shared buffer
//! cache; every operation targets the current volume.  Each mutating
//! operation runs under the same discipline: try once; on no-space,
//! reclaim (finish pending deletions, transact away almost-free blocks)
//! and try again; then commit an automatic transaction point if the
//! operation's event bit is set in the volume's transaction mask.

use crate::bdev::BlockDev;
use crate::buf::BufferCache;
use crate::config::{UPDATE_ATIME, VOLUME_COUNT};
use crate::dir::{self, DirName};
use crate::error::{Error, Result};
use crate::format::FormatOpts;
use crate::inode::{CInode, Ftype, InodeStat, PutFlags};
use crate::layout::{mode, INODE_INVALID, INODE_ROOT};
use crate::volume::{MountFlags, TransactMask, VolConfig, VolCtx, VolStat, Volume};

/// Default timestamp source: a constant, for systems without a clock.
fn zero_clock() -> u32 {
    0
}

/// The filesystem core: one block device, [`VOLUME_COUNT`] volumes, one
/// shared buffer cache.
pub struct Core<D: BlockDev> {
    dev: D,
    bufs: BufferCache,
    vols: [Volume; VOLUME_COUNT],
    cur: usize,
    clock: fn() -> u32,
}

impl<D: BlockDev> Core<D> {
    pub fn new(dev: D, configs: [VolConfig; VOLUME_COUNT]) -> Core<D> {
        let mut index = 0u8;
        let vols = configs.map(|cfg| {
            let vol = Volume::new(index, cfg);
            index += 1;
            vol
        });
        Core {
            dev,
            bufs: BufferCache::new(),
            vols,
            cur: 0,
            clock: zero_clock,
        }
    }

    /// Hand the device back, abandoning all in-memory state.  Dropping the
    /// core without unmounting is exactly a power failure: on the next
    /// mount the volume is the last committed state.
    pub fn into_device(self) -> D {
        self.dev
    }

    /// Install a timestamp source for atime/mtime/ctime.
    pub fn set_clock(&mut self, clock: fn() -> u32) {
        self.clock = clock;
    }

    /// Select the volume subsequent calls operate on.
    pub fn vol_set_current(&mut self, vol: u8) -> Result<()> {
        if (vol as usize) >= VOLUME_COUNT {
            return Err(Error::InvalidArg);
        }
        self.cur = vol as usize;
        Ok(())
    }

    fn ctx(&mut self) -> VolCtx<'_, D> {
        VolCtx {
            vol: &mut self.vols[self.cur],
            bufs: &mut self.bufs,
            dev: &mut self.dev,
            clock: self.clock,
        }
    }

    fn vol(&self) -> &Volume {
        &self.vols[self.cur]
    }

    fn require_mounted(&self) -> Result<()> {
        if !self.vol().mounted {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        self.require_mounted()?;
        if self.vol().read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Run a mutating operation with disk-full recovery and an automatic
    /// transaction point.
    fn mutating<R>(
        &mut self,
        event: TransactMask,
        mut op: impl FnMut(&mut VolCtx<'_, D>) -> Result<R>,
    ) -> Result<R> {
        self.require_writable()?;

        let mut ctx = self.ctx();
        let mut res = op(&mut ctx);

        if matches!(res, Err(Error::NoSpace)) && ctx.handle_full().is_ok() {
            res = op(&mut ctx);
        }

        let val = res?;
        if !event.is_empty() && ctx.vol.trans_mask.contains(event) {
            ctx.transact()?;
        }
        Ok(val)
    }

    // --- Volume operations ---

    /// Write a fresh filesystem to the current volume's device.
    pub fn format(&mut self, opts: FormatOpts) -> Result<()> {
        self.ctx().format(opts)
    }

    pub fn mount(&mut self, flags: MountFlags) -> Result<()> {
        self.ctx().mount(flags)
    }

    /// Unmount, committing a transaction point first if the unmount event
    /// is in the transaction mask (otherwise the working state is
    /// discarded).
    pub fn unmount(&mut self) -> Result<()> {
        self.require_mounted()?;

        let mut ctx = self.ctx();
        if !ctx.vol.read_only && ctx.vol.trans_mask.contains(TransactMask::UMOUNT) {
            ctx.transact()?;
        }
        let count = ctx.vol.block_count;
        ctx.bufs.discard_range(ctx.vol, 0, count)?;
        ctx.dev.close(ctx.vol.index)?;
        ctx.vol.mounted = false;
        Ok(())
    }

    /// Commit a transaction point: atomically promote the working state to
    /// the committed state.
    pub fn transact(&mut self) -> Result<()> {
        self.require_writable()?;
        self.ctx().transact()
    }

    /// Discard the working state, reverting to the last committed state.
    /// No handles may be outstanding.
    pub fn rollback(&mut self) -> Result<()> {
        self.require_writable()?;
        self.ctx().rollback()
    }

    pub fn vol_stat(&mut self) -> Result<VolStat> {
        self.require_mounted()?;
        Ok(self.ctx().vol_stat())
    }

    pub fn trans_mask_set(&mut self, mask: TransactMask) -> Result<()> {
        self.require_writable()?;
        self.vols[self.cur].trans_mask = mask;
        Ok(())
    }

    pub fn trans_mask_get(&self) -> Result<TransactMask> {
        self.require_mounted()?;
        if self.vol().read_only {
            return Ok(TransactMask::empty());
        }
        Ok(self.vol().trans_mask)
    }

    // --- Namespace operations ---

    /// Create a file or directory named `name` under `pino`.
    pub fn create(&mut self, pino: u32, name: &[u8], m: u16) -> Result<u32> {
        if !mode::is_valid(m) {
            return Err(Error::InvalidArg);
        }
        let event = if mode::is_dir(m) {
            TransactMask::MKDIR
        } else {
            TransactMask::CREAT
        };

        self.mutating(event, |ctx| {
            dir::name_ok(name)?;

            let mut parent = ctx.inode_mount(pino, Ftype::Dir, false)?;
            let mut ino = match ctx.inode_create(pino, m) {
                Ok(ino) => ino,
                Err(e) => {
                    ctx.inode_put(&mut parent, PutFlags::empty());
                    return Err(e);
                }
            };

            let res = ctx
                .inode_branch(&mut parent)
                .and_then(|()| ctx.dir_entry_create(&mut parent, name, ino.inum));

            let out = match res {
                Ok(()) => Ok(ino.inum),
                Err(e) => {
                    // The fresh inode must not leak.
                    if ctx.inode_free(&mut ino).is_err() {
                        let _ = ctx.vol.critical_error();
                    }
                    Err(e)
                }
            };

            ctx.inode_put(&mut ino, PutFlags::empty());
            let pf = if out.is_ok() {
                PutFlags::MTIME | PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            ctx.inode_put(&mut parent, pf);
            out
        })
    }

    /// Create a hard link to `ino` named `name` under `pino`.
    pub fn link(&mut self, pino: u32, name: &[u8], ino: u32) -> Result<()> {
        self.mutating(TransactMask::LINK, |ctx| {
            dir::name_ok(name)?;

            let mut parent = ctx.inode_mount(pino, Ftype::Dir, false)?;
            let mut target = match ctx.inode_mount(ino, Ftype::NotDir, false) {
                Ok(t) => t,
                Err(e) => {
                    ctx.inode_put(&mut parent, PutFlags::empty());
                    return Err(e);
                }
            };

            let out = (|| {
                if ctx.inode_ref(&target).nlink == u16::MAX {
                    return Err(Error::TooManyLinks);
                }
                ctx.inode_branch(&mut parent)?;
                ctx.inode_branch(&mut target)?;
                ctx.dir_entry_create(&mut parent, name, ino)?;
                let nlink = ctx.inode_ref(&target).nlink;
                ctx.inode_mut(&target).nlink = nlink + 1;
                Ok(())
            })();

            let (tf, pf) = if out.is_ok() {
                (PutFlags::CTIME, PutFlags::MTIME | PutFlags::CTIME)
            } else {
                (PutFlags::empty(), PutFlags::empty())
            };
            ctx.inode_put(&mut target, tf);
            ctx.inode_put(&mut parent, pf);
            out
        })
    }

    /// Delete the entry `name` under `pino`, decrementing the target's
    /// link count.  With `orphan` set, an inode that loses its last link
    /// survives on the orphan list until explicitly freed (for callers
    /// that keep it open across the unlink).
    pub fn unlink(&mut self, pino: u32, name: &[u8], orphan: bool) -> Result<()> {
        self.mutating(TransactMask::UNLINK, |ctx| {
            dir::name_ok(name)?;

            let mut parent = ctx.inode_mount(pino, Ftype::Dir, false)?;
            let out = (|ctx: &mut VolCtx<'_, D>, parent: &mut CInode| {
                let (idx, target_num) = ctx.dir_entry_lookup(parent, name)?;
                ctx.inode_branch(parent)?;

                let mut target = ctx.inode_mount(target_num, Ftype::Any, false)?;
                let out = (|ctx: &mut VolCtx<'_, D>, target: &mut CInode| {
                    if target.directory && ctx.inode_ref(target).size > 0 {
                        return Err(Error::NotEmpty);
                    }

                    // Deletion must be able to proceed on a full volume.
                    ctx.vol.use_reserved_blocks = true;
                    let res = ctx.dir_entry_delete(parent, idx);
                    ctx.vol.use_reserved_blocks = false;
                    res?;

                    // Freeing the inode walks its whole tree; shed the
                    // parent's buffers first to stay within the minimum
                    // buffer count.
                    ctx.inode_put_coord(parent);

                    if let Err(e) = ctx.inode_link_dec(target, orphan) {
                        let _ = ctx.vol.critical_error();
                        return Err(e);
                    }
                    Ok(())
                })(&mut *ctx, &mut target);

                let tf = if out.is_ok() {
                    PutFlags::CTIME
                } else {
                    PutFlags::empty()
                };
                ctx.inode_put(&mut target, tf);
                out
            })(&mut *ctx, &mut parent);

            let pf = if out.is_ok() {
                PutFlags::MTIME | PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            ctx.inode_put(&mut parent, pf);
            out
        })
    }

    /// Rename `src_name` in `src_pino` to `dst_name` in `dst_pino`,
    /// atomically replacing any existing destination.
    pub fn rename(
        &mut self,
        src_pino: u32,
        src_name: &[u8],
        dst_pino: u32,
        dst_name: &[u8],
        orphan: bool,
    ) -> Result<()> {
        self.mutating(TransactMask::RENAME, |ctx| {
            dir::name_ok(src_name)?;
            dir::name_ok(dst_name)?;

            let mut srcp = ctx.inode_mount(src_pino, Ftype::Dir, true)?;
            let mut dstp_store = if src_pino == dst_pino {
                None
            } else {
                match ctx.inode_mount(dst_pino, Ftype::Dir, true) {
                    Ok(d) => Some(d),
                    Err(e) => {
                        ctx.inode_put(&mut srcp, PutFlags::empty());
                        return Err(e);
                    }
                }
            };

            let out = rename_locked(
                ctx,
                &mut srcp,
                &mut dstp_store,
                src_pino,
                src_name,
                dst_pino,
                dst_name,
                orphan,
            );

            let pf = if matches!(out, Ok(true)) {
                PutFlags::MTIME | PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            if let Some(mut d) = dstp_store {
                ctx.inode_put(&mut d, pf);
            }
            ctx.inode_put(&mut srcp, pf);
            out.map(|_| ())
        })
    }

    /// Look up `name` under `pino`.
    pub fn lookup(&mut self, pino: u32, name: &[u8]) -> Result<u32> {
        self.require_mounted()?;
        let mut ctx = self.ctx();

        let mut parent = ctx.inode_mount(pino, Ftype::Dir, false)?;
        let res = ctx.dir_entry_lookup(&mut parent, name);
        ctx.inode_put(&mut parent, PutFlags::empty());
        res.map(|(_, ino)| ino)
    }

    pub fn stat(&mut self, ino: u32) -> Result<InodeStat> {
        self.require_mounted()?;
        let mut ctx = self.ctx();

        let mut target = ctx.inode_mount(ino, Ftype::Any, false)?;
        let st = ctx.inode_stat(&target);
        ctx.inode_put(&mut target, PutFlags::empty());
        Ok(st)
    }

    /// Replace the permission bits, keeping the type bits.
    pub fn chmod(&mut self, ino: u32, m: u16) -> Result<()> {
        if m & !mode::PERM_MASK != 0 {
            return Err(Error::InvalidArg);
        }
        self.mutating(TransactMask::empty(), |ctx| {
            let mut target = ctx.inode_mount(ino, Ftype::Any, true)?;
            let old = ctx.inode_ref(&target).mode;
            ctx.inode_mut(&target).mode = (old & mode::IFMT) | m;
            ctx.inode_put(&mut target, PutFlags::CTIME);
            Ok(())
        })
    }

    pub fn chown(&mut self, ino: u32, uid: u32, gid: u32) -> Result<()> {
        self.mutating(TransactMask::empty(), |ctx| {
            let mut target = ctx.inode_mount(ino, Ftype::Any, true)?;
            {
                let di = ctx.inode_mut(&target);
                di.uid = uid;
                di.gid = gid;
            }
            ctx.inode_put(&mut target, PutFlags::CTIME);
            Ok(())
        })
    }

    pub fn utimes(&mut self, ino: u32, atime: u32, mtime: u32) -> Result<()> {
        self.mutating(TransactMask::empty(), |ctx| {
            let mut target = ctx.inode_mount(ino, Ftype::Any, true)?;
            {
                let di = ctx.inode_mut(&target);
                di.atime = atime;
                di.mtime = mtime;
            }
            ctx.inode_put(&mut target, PutFlags::CTIME);
            Ok(())
        })
    }

    // --- File data operations ---

    pub fn file_size(&mut self, ino: u32) -> Result<u64> {
        self.require_mounted()?;
        let mut ctx = self.ctx();

        let mut target = ctx.inode_mount(ino, Ftype::NotDir, false)?;
        let size = ctx.inode_ref(&target).size;
        ctx.inode_put(&mut target, PutFlags::empty());
        Ok(size)
    }

    /// Read up to `buf.len()` bytes at `offset`.  Returns the byte count,
    /// short only at EOF; sparse regions read as zeroes.
    pub fn file_read(&mut self, ino: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.require_mounted()?;
        let update_atime = UPDATE_ATIME && !self.vol().read_only;
        let mut ctx = self.ctx();

        let mut target = ctx.inode_mount(ino, Ftype::NotDir, false)?;
        let res = ctx.data_read(&mut target, offset, buf);

        let mut pf = PutFlags::empty();
        if res.is_ok() && update_atime && ctx.inode_branch(&mut target).is_ok() {
            pf = PutFlags::ATIME;
        }
        ctx.inode_put(&mut target, pf);
        res
    }

    /// Write `buf` at `offset`.  Returns the bytes written, short only
    /// when the volume fills after partial progress.
    pub fn file_write(&mut self, ino: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        self.mutating(TransactMask::WRITE, |ctx| {
            let mut target = ctx.inode_mount(ino, Ftype::NotDir, true)?;
            let res = ctx.data_write(&mut target, offset, buf);
            let pf = if res.is_ok() {
                PutFlags::MTIME | PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            ctx.inode_put(&mut target, pf);
            res
        })
    }

    /// Write into a region previously reserved with [`Core::file_reserve`];
    /// the reservation guarantees this cannot fail for lack of space.
    pub fn file_write_reserved(&mut self, ino: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        self.require_writable()?;
        self.vols[self.cur].use_reserved_inode_blocks = true;
        let res = self.file_write(ino, offset, buf);
        debug_assert!(!matches!(res, Err(Error::NoSpace)));
        self.vols[self.cur].use_reserved_inode_blocks = false;
        res
    }

    /// Set the file size, sparse-extending or freeing as needed.
    pub fn file_truncate(&mut self, ino: u32, size: u64) -> Result<()> {
        self.mutating(TransactMask::TRUNCATE, |ctx| {
            let mut target = ctx.inode_mount(ino, Ftype::NotDir, true)?;

            // Like deletion, shrinking must work on a full volume.
            ctx.vol.use_reserved_blocks = size < ctx.inode_ref(&target).size;
            let res = ctx.data_truncate(&mut target, size);
            ctx.vol.use_reserved_blocks = false;

            let pf = if res.is_ok() {
                PutFlags::MTIME | PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            ctx.inode_put(&mut target, pf);
            res
        })
    }

    /// Extend the file by `len` sparse bytes starting at `offset` (which
    /// must equal the current size) and reserve the blocks to fill them.
    pub fn file_reserve(&mut self, ino: u32, offset: u64, len: u64) -> Result<()> {
        self.mutating(TransactMask::empty(), |ctx| {
            let mut target = ctx.inode_mount(ino, Ftype::File, true)?;
            let res = ctx.data_reserve(&mut target, offset, len);
            let pf = if res.is_ok() {
                PutFlags::MTIME | PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            ctx.inode_put(&mut target, pf);
            res
        })
    }

    /// Drop the reservation from `offset` to EOF.
    pub fn file_unreserve(&mut self, ino: u32, offset: u64) -> Result<()> {
        self.require_writable()?;
        let mut ctx = self.ctx();

        let mut target = ctx.inode_mount(ino, Ftype::File, false)?;
        let res = ctx.data_unreserve(&mut target, offset);
        ctx.inode_put(&mut target, PutFlags::empty());
        res
    }

    // --- Directory operations ---

    /// Read the next directory entry at or after `*pos`, advancing it.
    /// `NotFound` marks the end of the directory.
    pub fn dir_read(&mut self, ino: u32, pos: &mut u32) -> Result<(DirName, u32)> {
        self.require_mounted()?;
        let update_atime = UPDATE_ATIME && !self.vol().read_only;
        let mut ctx = self.ctx();

        let mut target = ctx.inode_mount(ino, Ftype::Dir, false)?;
        let res = ctx.dir_entry_read(&mut target, pos);

        let mut pf = PutFlags::empty();
        if res.is_ok() && update_atime && ctx.inode_branch(&mut target).is_ok() {
            pf = PutFlags::ATIME;
        }
        ctx.inode_put(&mut target, pf);
        res
    }

    /// The parent of a directory; the root's parent is the invalid inode.
    pub fn dir_parent(&mut self, ino: u32) -> Result<u32> {
        self.require_mounted()?;
        if ino == INODE_ROOT {
            return Ok(INODE_INVALID);
        }
        let mut ctx = self.ctx();

        let mut target = ctx.inode_mount(ino, Ftype::Dir, false)?;
        let parent = ctx.inode_ref(&target).pinode;
        ctx.inode_put(&mut target, PutFlags::empty());

        if parent == INODE_INVALID {
            // An orphaned directory no longer has a parent.
            return Err(Error::NotFound);
        }
        Ok(parent)
    }

    /// Free one specific inode from the orphan list.
    pub fn free_orphan(&mut self, ino: u32) -> Result<()> {
        self.require_writable()?;
        let mut ctx = self.ctx();

        let mut prev: Option<CInode> = None;
        let mut cur = ctx.vol.mr().orphan_head;

        // Walk the list to the requested orphan, remembering who points
        // at it.
        while cur != ino {
            if cur == INODE_INVALID {
                if let Some(mut p) = prev {
                    ctx.inode_put(&mut p, PutFlags::empty());
                }
                return Err(Error::BadHandle);
            }
            let c = match ctx.inode_mount(cur, Ftype::Any, false) {
                Ok(c) => c,
                Err(e) => {
                    if let Some(mut p) = prev {
                        ctx.inode_put(&mut p, PutFlags::empty());
                    }
                    return Err(e);
                }
            };
            cur = ctx.inode_ref(&c).next_orphan;
            if let Some(mut p) = prev.replace(c) {
                ctx.inode_put(&mut p, PutFlags::empty());
            }
        }

        let res = (|ctx: &mut VolCtx<'_, D>, prev: &mut Option<CInode>| {
            let mut target = ctx.inode_mount(cur, Ftype::Any, false)?;
            let next = ctx.inode_ref(&target).next_orphan;

            let res = ctx.inode_free_orphan(&mut target);
            ctx.inode_put(&mut target, PutFlags::empty());
            res?;

            if ctx.vol.mr().orphan_head == ino {
                debug_assert!(prev.is_none());
                ctx.vol.mr_mut().orphan_head = next;
            } else if let Some(p) = prev.as_mut() {
                if let Err(e) = ctx.inode_branch(p) {
                    let _ = ctx.vol.critical_error();
                    return Err(e);
                }
                ctx.inode_mut(p).next_orphan = next;
            }

            if ctx.vol.mr().orphan_tail == ino {
                let new_tail = prev.as_ref().map(|p| p.inum).unwrap_or(INODE_INVALID);
                ctx.vol.mr_mut().orphan_tail = new_tail;
            }
            ctx.vol.branched = true;
            Ok(())
        })(&mut ctx, &mut prev);

        if let Some(mut p) = prev {
            ctx.inode_put(&mut p, PutFlags::empty());
        }
        res
    }

    /// Free up to `max` inodes from the defunct orphan list.
    pub fn free_orphans(&mut self, max: u32) -> Result<()> {
        self.require_writable()?;
        self.ctx().free_orphans(max)
    }
}

/// Rename with both parents mounted (possibly the same handle).  Returns
/// whether the namespace actually changed, which drives the timestamp
/// updates.
#[allow(clippy::too_many_arguments)]
fn rename_locked<D: BlockDev>(
    ctx: &mut VolCtx<'_, D>,
    srcp: &mut CInode,
    dstp_store: &mut Option<CInode>,
    src_pino: u32,
    src_name: &[u8],
    dst_pino: u32,
    dst_name: &[u8],
    orphan: bool,
) -> Result<bool> {
    let (src_idx, src_ino) = ctx.dir_entry_lookup(srcp, src_name)?;

    let dst_entry = {
        let dstp = dstp_store.as_mut().unwrap_or(&mut *srcp);
        match ctx.dir_entry_lookup(dstp, dst_name) {
            Ok(found) => Some(found),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        }
    };

    // Renaming a file over itself (same inode) changes nothing.
    if let Some((_, dst_ino)) = dst_entry {
        if dst_ino == src_ino {
            return Ok(false);
        }
    }

    let mut sino = ctx.inode_mount(src_ino, Ftype::Any, false)?;

    let out = (|ctx: &mut VolCtx<'_, D>, sino: &mut CInode| {
        let mut displaced: Option<CInode> = None;

        if let Some((_, dst_ino)) = dst_entry {
            let dino = ctx.inode_mount(dst_ino, Ftype::Any, false)?;

            // POSIX replacement rules.
            let check = if sino.directory && !dino.directory {
                Err(Error::NotDir)
            } else if !sino.directory && dino.directory {
                Err(Error::IsDir)
            } else if dino.directory && ctx.inode_ref(&dino).size > 0 {
                Err(Error::NotEmpty)
            } else {
                Ok(())
            };
            if let Err(e) = check {
                let mut d = dino;
                ctx.inode_put(&mut d, PutFlags::empty());
                return Err(e);
            }
            displaced = Some(dino);
        }

        // A directory must not move into its own subtree.
        if sino.directory && src_pino != dst_pino {
            match ctx.dir_is_ancestor(src_ino, dst_pino) {
                Ok(false) => {}
                Ok(true) => {
                    if let Some(mut d) = displaced.take() {
                        ctx.inode_put(&mut d, PutFlags::empty());
                    }
                    return Err(Error::InvalidArg);
                }
                Err(e) => {
                    if let Some(mut d) = displaced.take() {
                        ctx.inode_put(&mut d, PutFlags::empty());
                    }
                    return Err(e);
                }
            }
        }

        let res = (|ctx: &mut VolCtx<'_, D>| {
            match dst_entry {
                Some((dst_idx, _)) => {
                    let dstp = dstp_store.as_mut().unwrap_or(&mut *srcp);
                    ctx.dir_entry_set(dstp, dst_idx, src_ino)?;
                }
                None => {
                    let dstp = dstp_store.as_mut().unwrap_or(&mut *srcp);
                    ctx.dir_entry_create(dstp, dst_name, src_ino)?;
                }
            }
            ctx.dir_entry_delete(srcp, src_idx)?;

            ctx.inode_branch(sino)?;
            ctx.inode_mut(sino).pinode = dst_pino;

            if let Some(dino) = displaced.as_mut() {
                // Deleting the displaced inode walks its whole tree; shed
                // the parent chains first.
                ctx.inode_put_coord(srcp);
                if let Some(d) = dstp_store.as_mut() {
                    ctx.inode_put_coord(d);
                }
                if let Err(e) = ctx.inode_link_dec(dino, orphan) {
                    let _ = ctx.vol.critical_error();
                    return Err(e);
                }
            }
            Ok(())
        })(&mut *ctx);

        if let Some(mut d) = displaced {
            let pf = if res.is_ok() {
                PutFlags::CTIME
            } else {
                PutFlags::empty()
            };
            ctx.inode_put(&mut d, pf);
        }
        res.map(|()| true)
    })(&mut *ctx, &mut sino);

    let pf = if matches!(out, Ok(true)) {
        PutFlags::CTIME
    } else {
        PutFlags::empty()
    };
    ctx.inode_put(&mut sino, pf);
    out
}

/// [`Core`] behind a global mutex, for multi-task configurations: every
/// entry point is serialized, matching the single-mutator model.
pub struct SyncCore<D: BlockDev>(spin::Mutex<Core<D>>);

impl<D: BlockDev> SyncCore<D> {
    pub fn new(core: Core<D>) -> SyncCore<D> {
        SyncCore(spin::Mutex::new(core))
    }

    /// Acquire the core for one or more operations.
    pub fn lock(&self) -> spin::MutexGuard<'_, Core<D>> {
        self.0.lock()
    }

    pub fn into_inner(self) -> Core<D> {
        self.0.into_inner()
    }
}
