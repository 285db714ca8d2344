//! Directory entries.
//!
//! A directory is a file whose data is an array of fixed-size entries
//! (inode number plus padded name).  A free entry has an invalid inode
//! number.  Deleting the last live entry truncates trailing free entries,
//! so an empty directory always has size zero — which is exactly how
//! unlink decides emptiness.

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, LayoutVerified};

use crate::bdev::BlockDev;
use crate::config::NAME_MAX;
use crate::error::{Error, Result};
use crate::inode::{CInode, Ftype, PutFlags};
use crate::layout::{Dirent, DIRENT_SIZE, INODE_INVALID, INODE_ROOT};
use crate::volume::VolCtx;

/// A name handed back by `dir_read`.
pub type DirName = ArrayVec<u8, NAME_MAX>;

/// Check a directory entry name: non-empty, within `NAME_MAX`, and free of
/// separators and NULs.
pub fn name_ok(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArg);
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

/// Entry-sized bounce buffer with the alignment the on-disk view needs.
#[repr(align(4))]
struct DirentBuf([u8; DIRENT_SIZE]);

impl<'a, D: BlockDev> VolCtx<'a, D> {
    fn dirent_count(&self, pino: &CInode) -> u32 {
        (self.inode_ref(pino).size / DIRENT_SIZE as u64) as u32
    }

    fn dirent_at(&mut self, pino: &mut CInode, idx: u32) -> Result<Dirent> {
        let mut buf = DirentBuf([0; DIRENT_SIZE]);
        let n = self.data_read(pino, idx as u64 * DIRENT_SIZE as u64, &mut buf.0)?;
        if n != DIRENT_SIZE {
            return Err(self.vol.critical_error());
        }
        let view = LayoutVerified::<_, Dirent>::new(&buf.0[..]).expect("dirent view");
        Ok(*view.into_ref())
    }

    fn dirent_write(&mut self, pino: &mut CInode, idx: u32, de: &Dirent) -> Result<()> {
        let n = match self.data_write(pino, idx as u64 * DIRENT_SIZE as u64, de.as_bytes()) {
            Ok(n) => n,
            // A full directory surfaces as the file size cap.
            Err(Error::FileTooBig) => return Err(Error::NoSpace),
            Err(e) => return Err(e),
        };
        if n != DIRENT_SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Find `name`, returning its entry index and inode.
    pub fn dir_entry_lookup(&mut self, pino: &mut CInode, name: &[u8]) -> Result<(u32, u32)> {
        name_ok(name)?;

        for idx in 0..self.dirent_count(pino) {
            let de = self.dirent_at(pino, idx)?;
            if de.ino() != INODE_INVALID && de.name_bytes() == name {
                return Ok((idx, de.ino()));
            }
        }
        Err(Error::NotFound)
    }

    /// Add an entry for `(name, inum)`, reusing a free slot if one exists,
    /// else appending (which grows the directory through the normal data
    /// write path, COW cost rules included).
    pub fn dir_entry_create(&mut self, pino: &mut CInode, name: &[u8], inum: u32) -> Result<()> {
        name_ok(name)?;

        let count = self.dirent_count(pino);
        let mut slot = count;
        for idx in 0..count {
            let de = self.dirent_at(pino, idx)?;
            if de.ino() == INODE_INVALID {
                if slot == count {
                    slot = idx;
                }
            } else if de.name_bytes() == name {
                return Err(Error::Exists);
            }
        }

        self.dirent_write(pino, slot, &Dirent::new(inum, name))
    }

    /// Point an existing entry at a different inode (atomic-replace
    /// rename).
    pub fn dir_entry_set(&mut self, pino: &mut CInode, idx: u32, inum: u32) -> Result<()> {
        let mut de = self.dirent_at(pino, idx)?;
        de.set_ino(inum);
        self.dirent_write(pino, idx, &de)
    }

    /// Remove the entry at `idx`.  Removing the final live entry truncates
    /// every trailing free entry, shrinking an emptied directory to size
    /// zero.
    pub fn dir_entry_delete(&mut self, pino: &mut CInode, idx: u32) -> Result<()> {
        let count = self.dirent_count(pino);
        if idx >= count {
            log::error!("directory delete past end");
            return Err(Error::InvalidArg);
        }

        if idx == count - 1 {
            let mut keep = idx;
            while keep > 0 {
                let de = self.dirent_at(pino, keep - 1)?;
                if de.ino() != INODE_INVALID {
                    break;
                }
                keep -= 1;
            }
            self.data_truncate(pino, keep as u64 * DIRENT_SIZE as u64)
        } else {
            self.dirent_write(pino, idx, &Dirent::free())
        }
    }

    /// Read the next live entry at or after `*pos`, advancing `*pos` past
    /// it.  `NotFound` signals the end of the directory.
    pub fn dir_entry_read(&mut self, pino: &mut CInode, pos: &mut u32) -> Result<(DirName, u32)> {
        let count = self.dirent_count(pino);
        let mut idx = *pos;
        while idx < count {
            let de = self.dirent_at(pino, idx)?;
            idx += 1;
            if de.ino() != INODE_INVALID {
                *pos = idx;
                let mut name = DirName::new();
                name.try_extend_from_slice(de.name_bytes())
                    .expect("name fits NAME_MAX");
                return Ok((name, de.ino()));
            }
        }
        *pos = idx;
        Err(Error::NotFound)
    }

    /// Whether `anc` appears on the parent chain of directory `start`
    /// (inclusive).  Used to reject renaming a directory into its own
    /// subtree.
    pub fn dir_is_ancestor(&mut self, anc: u32, start: u32) -> Result<bool> {
        let mut cur = start;
        // The parent chain cannot be longer than the inode table.
        for _ in 0..=self.vol.inode_count {
            if cur == anc {
                return Ok(true);
            }
            if cur == INODE_ROOT || cur == INODE_INVALID {
                return Ok(false);
            }
            let mut ino = self.inode_mount(cur, Ftype::Dir, false)?;
            let parent = self.inode_ref(&ino).pinode;
            self.inode_put(&mut ino, PutFlags::empty());
            cur = parent;
        }
        Err(self.vol.critical_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(name_ok(b"ok-name.txt").is_ok());
        assert_eq!(name_ok(b""), Err(Error::InvalidArg));
        assert_eq!(name_ok(b"a/b"), Err(Error::InvalidArg));
        assert_eq!(name_ok(b"nul\0byte"), Err(Error::InvalidArg));
        assert_eq!(name_ok(&[b'x'; NAME_MAX]), Ok(()));
        assert_eq!(name_ok(&[b'x'; NAME_MAX + 1]), Err(Error::NameTooLong));
    }
}
