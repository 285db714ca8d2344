//! Namespace operations: create, link, unlink, rename, directory reads,
//! attributes, and orphan handling.

mod common;

use common::{crash_and_remount, fresh_core};
use duofs::{mode, Error, MountFlags, TransactMask, INODE_INVALID, INODE_ROOT};

#[test]
fn create_and_lookup() {
    let mut core = fresh_core(2048, 32);

    let a = core.create(INODE_ROOT, b"a", mode::IFREG | 0o644).unwrap();
    let b = core.create(INODE_ROOT, b"b", mode::IFDIR | 0o755).unwrap();
    assert_ne!(a, b);

    assert_eq!(core.lookup(INODE_ROOT, b"a").unwrap(), a);
    assert_eq!(core.lookup(INODE_ROOT, b"b").unwrap(), b);
    assert_eq!(core.lookup(INODE_ROOT, b"c").unwrap_err(), Error::NotFound);

    // Nested creation.
    let c = core.create(b, b"c", mode::IFREG | 0o600).unwrap();
    assert_eq!(core.lookup(b, b"c").unwrap(), c);
    assert_eq!(core.dir_parent(b).unwrap(), INODE_ROOT);
}

#[test]
fn create_rejects_bad_names_and_duplicates() {
    let mut core = fresh_core(2048, 32);

    core.create(INODE_ROOT, b"dup", mode::IFREG | 0o644).unwrap();
    assert_eq!(
        core.create(INODE_ROOT, b"dup", mode::IFREG | 0o644).unwrap_err(),
        Error::Exists
    );
    assert_eq!(
        core.create(INODE_ROOT, b"", mode::IFREG | 0o644).unwrap_err(),
        Error::InvalidArg
    );
    assert_eq!(
        core.create(INODE_ROOT, b"a/b", mode::IFREG | 0o644).unwrap_err(),
        Error::InvalidArg
    );
    assert_eq!(
        core.create(INODE_ROOT, &[b'n'; 64], mode::IFREG | 0o644).unwrap_err(),
        Error::NameTooLong
    );
    assert_eq!(
        core.create(INODE_ROOT, b"badmode", 0o644).unwrap_err(),
        Error::InvalidArg
    );
}

#[test]
fn create_in_file_is_not_dir() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();
    assert_eq!(
        core.create(f, b"child", mode::IFREG | 0o644).unwrap_err(),
        Error::NotDir
    );
}

#[test]
fn hard_links_share_data_and_count() {
    let mut core = fresh_core(2048, 32);

    let ino = core.create(INODE_ROOT, b"orig", mode::IFREG | 0o644).unwrap();
    core.file_write(ino, 0, b"shared").unwrap();

    core.link(INODE_ROOT, b"alias", ino).unwrap();
    assert_eq!(core.lookup(INODE_ROOT, b"alias").unwrap(), ino);
    assert_eq!(core.stat(ino).unwrap().nlink, 2);

    // Deleting one name keeps the file alive.
    core.unlink(INODE_ROOT, b"orig", false).unwrap();
    assert_eq!(core.stat(ino).unwrap().nlink, 1);
    let mut buf = [0u8; 6];
    core.file_read(ino, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");

    core.unlink(INODE_ROOT, b"alias", false).unwrap();
    assert_eq!(core.stat(ino).unwrap_err(), Error::BadHandle);
}

#[test]
fn link_to_directory_is_rejected() {
    let mut core = fresh_core(2048, 32);
    let d = core.create(INODE_ROOT, b"d", mode::IFDIR | 0o755).unwrap();
    assert_eq!(
        core.link(INODE_ROOT, b"dlink", d).unwrap_err(),
        Error::IsDir
    );
}

#[test]
fn unlink_nonempty_directory_fails() {
    let mut core = fresh_core(2048, 32);
    let d = core.create(INODE_ROOT, b"d", mode::IFDIR | 0o755).unwrap();
    core.create(d, b"child", mode::IFREG | 0o644).unwrap();

    assert_eq!(
        core.unlink(INODE_ROOT, b"d", false).unwrap_err(),
        Error::NotEmpty
    );

    // Emptied, it goes.
    core.unlink(d, b"child", false).unwrap();
    core.unlink(INODE_ROOT, b"d", false).unwrap();
    assert_eq!(core.lookup(INODE_ROOT, b"d").unwrap_err(), Error::NotFound);
}

#[test]
fn rename_within_and_across_directories() {
    let mut core = fresh_core(2048, 32);

    let f = core.create(INODE_ROOT, b"old", mode::IFREG | 0o644).unwrap();
    core.file_write(f, 0, b"payload").unwrap();

    core.rename(INODE_ROOT, b"old", INODE_ROOT, b"new", false).unwrap();
    assert_eq!(core.lookup(INODE_ROOT, b"old").unwrap_err(), Error::NotFound);
    assert_eq!(core.lookup(INODE_ROOT, b"new").unwrap(), f);

    let d = core.create(INODE_ROOT, b"dir", mode::IFDIR | 0o755).unwrap();
    core.rename(INODE_ROOT, b"new", d, b"moved", false).unwrap();
    assert_eq!(core.lookup(d, b"moved").unwrap(), f);

    let mut buf = [0u8; 7];
    core.file_read(f, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
}

#[test]
fn rename_atomic_replace_deletes_target() {
    let mut core = fresh_core(2048, 32);

    let a = core.create(INODE_ROOT, b"a", mode::IFREG | 0o644).unwrap();
    let b = core.create(INODE_ROOT, b"b", mode::IFREG | 0o644).unwrap();
    core.file_write(a, 0, b"from-a").unwrap();
    core.file_write(b, 0, b"from-b").unwrap();

    core.rename(INODE_ROOT, b"a", INODE_ROOT, b"b", false).unwrap();

    assert_eq!(core.lookup(INODE_ROOT, b"a").unwrap_err(), Error::NotFound);
    assert_eq!(core.lookup(INODE_ROOT, b"b").unwrap(), a);
    // The displaced inode is gone.
    assert_eq!(core.stat(b).unwrap_err(), Error::BadHandle);
}

#[test]
fn rename_directory_updates_parent_and_rejects_cycles() {
    let mut core = fresh_core(2048, 32);

    let outer = core.create(INODE_ROOT, b"outer", mode::IFDIR | 0o755).unwrap();
    let inner = core.create(outer, b"inner", mode::IFDIR | 0o755).unwrap();

    // Moving a directory beneath itself must fail.
    assert_eq!(
        core.rename(INODE_ROOT, b"outer", inner, b"oops", false).unwrap_err(),
        Error::InvalidArg
    );

    // A legal directory move updates the parent pointer.
    core.rename(outer, b"inner", INODE_ROOT, b"inner", false).unwrap();
    assert_eq!(core.dir_parent(inner).unwrap(), INODE_ROOT);
}

#[test]
fn rename_type_mismatches() {
    let mut core = fresh_core(2048, 32);

    let _f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();
    let d = core.create(INODE_ROOT, b"d", mode::IFDIR | 0o755).unwrap();

    assert_eq!(
        core.rename(INODE_ROOT, b"f", INODE_ROOT, b"d", false).unwrap_err(),
        Error::IsDir
    );
    assert_eq!(
        core.rename(INODE_ROOT, b"d", INODE_ROOT, b"f", false).unwrap_err(),
        Error::NotDir
    );

    // Replacing a non-empty directory with a directory fails.
    core.create(d, b"kid", mode::IFREG | 0o644).unwrap();
    core.create(INODE_ROOT, b"d2", mode::IFDIR | 0o755).unwrap();
    assert_eq!(
        core.rename(INODE_ROOT, b"d2", INODE_ROOT, b"d", false).unwrap_err(),
        Error::NotEmpty
    );
}

#[test]
fn dir_read_enumerates_live_entries() {
    let mut core = fresh_core(2048, 32);

    let names: &[&[u8]] = &[b"one", b"two", b"three", b"four"];
    for n in names {
        core.create(INODE_ROOT, n, mode::IFREG | 0o644).unwrap();
    }
    core.unlink(INODE_ROOT, b"two", false).unwrap();

    let mut seen = Vec::new();
    let mut pos = 0u32;
    loop {
        match core.dir_read(INODE_ROOT, &mut pos) {
            Ok((name, ino)) => {
                assert_ne!(ino, INODE_INVALID);
                seen.push(name.to_vec());
            }
            Err(Error::NotFound) => break,
            Err(e) => panic!("dir_read failed: {e}"),
        }
    }

    assert_eq!(seen.len(), 3);
    assert!(seen.contains(&b"one".to_vec()));
    assert!(!seen.contains(&b"two".to_vec()));
    assert!(seen.contains(&b"three".to_vec()));
    assert!(seen.contains(&b"four".to_vec()));
}

#[test]
fn attributes_roundtrip() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o640).unwrap();

    let st = core.stat(f).unwrap();
    assert!(mode::is_reg(st.mode));
    assert_eq!(st.mode & mode::PERM_MASK, 0o640);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.size, 0);

    core.chmod(f, 0o400).unwrap();
    assert_eq!(core.stat(f).unwrap().mode, mode::IFREG | 0o400);
    // Type bits are not permission bits.
    assert_eq!(
        core.chmod(f, mode::IFDIR | 0o644).unwrap_err(),
        Error::InvalidArg
    );

    core.chown(f, 1000, 100).unwrap();
    let st = core.stat(f).unwrap();
    assert_eq!((st.uid, st.gid), (1000, 100));

    core.utimes(f, 111, 222).unwrap();
    let st = core.stat(f).unwrap();
    assert_eq!((st.atime, st.mtime), (111, 222));
}

#[test]
fn clock_stamps_new_inodes() {
    let mut core = fresh_core(2048, 32);
    core.set_clock(|| 4242);
    let f = core.create(INODE_ROOT, b"timed", mode::IFREG | 0o644).unwrap();
    let st = core.stat(f).unwrap();
    assert_eq!(st.ctime, 4242);
    assert_eq!(st.mtime, 4242);
}

#[test]
fn inode_exhaustion_and_slot_reuse() {
    // Manual transactions: deleted inodes keep an almost-free slot until
    // a transaction point, so their numbers cannot be reused before one.
    let mut core = fresh_core(2048, 4);
    core.trans_mask_set(TransactMask::empty()).unwrap();

    let mut inos = Vec::new();
    for i in 0..3u8 {
        inos.push(
            core.create(INODE_ROOT, &[b'f', b'0' + i], mode::IFREG | 0o644)
                .unwrap(),
        );
    }
    assert_eq!(
        core.create(INODE_ROOT, b"over", mode::IFREG | 0o644).unwrap_err(),
        Error::TooManyOpenFiles
    );

    core.transact().unwrap();
    core.unlink(INODE_ROOT, b"f0", false).unwrap();

    // The slot is almost-free until the next transaction point.
    assert_eq!(
        core.create(INODE_ROOT, b"again", mode::IFREG | 0o644).unwrap_err(),
        Error::TooManyOpenFiles
    );

    core.transact().unwrap();
    let again = core.create(INODE_ROOT, b"again", mode::IFREG | 0o644).unwrap();
    assert_eq!(again, inos[0]);
}

#[test]
fn orphan_lifecycle() {
    let mut core = fresh_core(2048, 32);

    let ino = core.create(INODE_ROOT, b"open-file", mode::IFREG | 0o644).unwrap();
    core.file_write(ino, 0, b"still readable").unwrap();

    // Unlinked while "open": parked on the orphan list, not freed.
    core.unlink(INODE_ROOT, b"open-file", true).unwrap();
    assert_eq!(core.lookup(INODE_ROOT, b"open-file").unwrap_err(), Error::NotFound);

    let mut buf = [0u8; 14];
    core.file_read(ino, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"still readable");
    assert_eq!(core.stat(ino).unwrap().nlink, 0);

    core.transact().unwrap();

    // Remount with SKIP_DELETE: orphans are promoted to defunct, still
    // not freed.
    let mut core = crash_and_remount(core, MountFlags::SKIP_DELETE);
    assert_eq!(core.stat(ino).unwrap().nlink, 0);

    // Explicit reaping empties the defunct list.
    core.free_orphans(u32::MAX).unwrap();
    assert_eq!(core.stat(ino).unwrap_err(), Error::BadHandle);
}

#[test]
fn orphans_reaped_on_normal_mount() {
    let mut core = fresh_core(2048, 32);

    let ino = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();
    core.unlink(INODE_ROOT, b"f", true).unwrap();
    core.transact().unwrap();

    let mut core = crash_and_remount(core, MountFlags::empty());
    assert_eq!(core.stat(ino).unwrap_err(), Error::BadHandle);
}

#[test]
fn free_orphan_removes_single_list_entry() {
    let mut core = fresh_core(2048, 32);

    let a = core.create(INODE_ROOT, b"a", mode::IFREG | 0o644).unwrap();
    let b = core.create(INODE_ROOT, b"b", mode::IFREG | 0o644).unwrap();
    let c = core.create(INODE_ROOT, b"c", mode::IFREG | 0o644).unwrap();
    core.unlink(INODE_ROOT, b"a", true).unwrap();
    core.unlink(INODE_ROOT, b"b", true).unwrap();
    core.unlink(INODE_ROOT, b"c", true).unwrap();

    // Free the middle orphan; its neighbors stay reachable.
    core.free_orphan(b).unwrap();
    assert_eq!(core.stat(b).unwrap_err(), Error::BadHandle);
    assert_eq!(core.stat(a).unwrap().nlink, 0);
    assert_eq!(core.stat(c).unwrap().nlink, 0);

    core.free_orphan(a).unwrap();
    core.free_orphan(c).unwrap();
    assert_eq!(core.free_orphan(c).unwrap_err(), Error::BadHandle);
}

#[test]
fn dir_parent_of_root_is_invalid() {
    let mut core = fresh_core(2048, 32);
    assert_eq!(core.dir_parent(INODE_ROOT).unwrap(), INODE_INVALID);

    let d = core.create(INODE_ROOT, b"d", mode::IFDIR | 0o755).unwrap();
    assert_eq!(core.dir_parent(d).unwrap(), INODE_ROOT);
}

#[test]
fn symlink_mode_is_stored() {
    let mut core = fresh_core(2048, 32);
    let l = core.create(INODE_ROOT, b"l", mode::IFLNK | 0o777).unwrap();
    core.file_write(l, 0, b"target/path").unwrap();

    let st = core.stat(l).unwrap();
    assert!(mode::is_lnk(st.mode));
    assert_eq!(st.size, 11);
}
