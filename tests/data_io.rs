//! File data: reads, writes, sparse regions, truncation, copy-on-write
//! cost, disk-full recovery, and space reservation.

mod common;

use common::{crash_and_remount, fresh_core, pattern};
use duofs::config::{BLOCK_SIZE, INODE_SIZE_MAX};
use duofs::{mode, Error, MountFlags, INODE_ROOT};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

#[test]
fn write_read_roundtrip_unaligned() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();

    // Straddle block boundaries in both offset and length.
    let data = pattern(3 * BLOCK_SIZE + 77, 3);
    let off = (BLOCK_SIZE - 13) as u64;
    assert_eq!(core.file_write(f, off, &data).unwrap(), data.len());
    assert_eq!(core.file_size(f).unwrap(), off + data.len() as u64);

    let mut back = vec![0u8; data.len()];
    assert_eq!(core.file_read(f, off, &mut back).unwrap(), data.len());
    assert_eq!(back, data);

    // The head of the file was never written and reads as zeroes.
    let mut head = vec![0xffu8; off as usize];
    assert_eq!(core.file_read(f, 0, &mut head).unwrap(), off as usize);
    assert!(head.iter().all(|&b| b == 0));
}

#[test]
fn random_writes_match_model() {
    let mut core = fresh_core(4096, 16);
    let f = core.create(INODE_ROOT, b"rand", mode::IFREG | 0o644).unwrap();

    let file_span = 200 * BLOCK_SIZE;
    let mut model = vec![0u8; file_span];
    let mut high_water = 0usize;
    let mut rng = StdRng::seed_from_u64(0xd00f);

    for _ in 0..40 {
        let off = rng.gen_range(0..file_span - 1);
        let len = rng.gen_range(1..(4 * BLOCK_SIZE).min(file_span - off));
        let mut chunk = vec![0u8; len];
        rng.fill_bytes(&mut chunk);

        assert_eq!(core.file_write(f, off as u64, &chunk).unwrap(), len);
        model[off..off + len].copy_from_slice(&chunk);
        high_water = high_water.max(off + len);
    }

    assert_eq!(core.file_size(f).unwrap(), high_water as u64);
    let mut back = vec![0u8; high_water];
    assert_eq!(core.file_read(f, 0, &mut back).unwrap(), high_water);
    assert_eq!(back, model[..high_water]);
}

#[test]
fn read_past_eof_is_short() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();
    core.file_write(f, 0, b"0123456789").unwrap();

    let mut buf = [0u8; 32];
    assert_eq!(core.file_read(f, 4, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"456789");
    assert_eq!(core.file_read(f, 10, &mut buf).unwrap(), 0);
    assert_eq!(core.file_read(f, 999, &mut buf).unwrap(), 0);
}

#[test]
fn sparse_file_reads_zero_and_costs_nothing() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"sparse", mode::IFREG | 0o644).unwrap();

    let before = core.vol_stat().unwrap().free_blocks;
    core.file_truncate(f, (100 * BLOCK_SIZE) as u64).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, before);
    assert_eq!(core.stat(f).unwrap().blocks, 0);

    let mut buf = vec![0xaau8; 2 * BLOCK_SIZE];
    assert_eq!(
        core.file_read(f, (50 * BLOCK_SIZE) as u64, &mut buf).unwrap(),
        buf.len()
    );
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn truncate_shrink_then_expand_zeroes_tail() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"t", mode::IFREG | 0o644).unwrap();

    let data = pattern(BLOCK_SIZE, 9);
    core.file_write(f, 0, &data).unwrap();

    // Shrink to mid-block, then grow back: the stale second half must not
    // resurface.
    core.file_truncate(f, (BLOCK_SIZE / 2) as u64).unwrap();
    assert_eq!(core.file_size(f).unwrap(), (BLOCK_SIZE / 2) as u64);
    core.file_truncate(f, BLOCK_SIZE as u64).unwrap();

    let mut back = vec![0u8; BLOCK_SIZE];
    assert_eq!(core.file_read(f, 0, &mut back).unwrap(), BLOCK_SIZE);
    assert_eq!(&back[..BLOCK_SIZE / 2], &data[..BLOCK_SIZE / 2]);
    assert!(back[BLOCK_SIZE / 2..].iter().all(|&b| b == 0));
}

#[test]
fn truncate_to_zero_frees_blocks_after_transact() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"t", mode::IFREG | 0o644).unwrap();

    let baseline = core.vol_stat().unwrap().free_blocks;
    let data = pattern(20 * BLOCK_SIZE, 1);
    core.file_write(f, 0, &data).unwrap();
    core.transact().unwrap();
    assert!(core.vol_stat().unwrap().free_blocks < baseline);

    // Default mask: truncate commits automatically, so almost-free blocks
    // return to the pool.
    core.file_truncate(f, 0).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, baseline);
    assert_eq!(core.stat(f).unwrap().blocks, 0);
}

#[test]
fn file_size_limits() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"big", mode::IFREG | 0o644).unwrap();

    assert_eq!(
        core.file_write(f, INODE_SIZE_MAX, b"x").unwrap_err(),
        Error::FileTooBig
    );
    assert_eq!(
        core.file_truncate(f, INODE_SIZE_MAX + 1).unwrap_err(),
        Error::FileTooBig
    );

    // The maximum size itself is a legal (sparse) file.
    core.file_truncate(f, INODE_SIZE_MAX).unwrap();
    assert_eq!(core.file_size(f).unwrap(), INODE_SIZE_MAX);

    let mut buf = [0xffu8; 16];
    assert_eq!(core.file_read(f, INODE_SIZE_MAX - 16, &mut buf).unwrap(), 16);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn cow_cost_is_bounded_by_tree_depth() {
    let mut core = fresh_core(4096, 16);
    let f = core.create(INODE_ROOT, b"deep", mode::IFREG | 0o644).unwrap();

    // A block in the double-indirect range costs exactly three new
    // blocks: double indirect, indirect, data.
    let dindir_off = duofs::config::INODE_INDIR_BLOCKS as u64 * BLOCK_SIZE as u64
        + duofs::config::DIRECT_POINTERS as u64 * BLOCK_SIZE as u64;
    let before = core.vol_stat().unwrap().free_blocks;
    core.file_write(f, dindir_off, &pattern(BLOCK_SIZE, 2)).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, before - 3);

    // The next block shares both parents, already branched: one block.
    core.file_write(f, dindir_off + BLOCK_SIZE as u64, &pattern(BLOCK_SIZE, 3))
        .unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, before - 4);

    // Overwriting a block that is new this transaction costs nothing.
    core.file_write(f, dindir_off, &pattern(BLOCK_SIZE, 4)).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, before - 4);
}

#[test]
fn overwrite_after_commit_branches_once() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();

    core.file_write(f, 0, &pattern(BLOCK_SIZE, 5)).unwrap();
    core.transact().unwrap();

    // Overwriting committed data allocates a new block and strands the
    // old one as almost-free; net free count is restored by the commit.
    let committed_free = core.vol_stat().unwrap().free_blocks;
    core.file_write(f, 0, &pattern(BLOCK_SIZE, 6)).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, committed_free - 1);

    core.transact().unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, committed_free);
}

#[test]
fn new_blocks_freed_in_same_transaction_return_immediately() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"f", mode::IFREG | 0o644).unwrap();

    let before = core.vol_stat().unwrap().free_blocks;
    core.file_write(f, 0, &pattern(4 * BLOCK_SIZE, 7)).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, before - 4);

    // Blocks allocated this transaction go straight back to free; no
    // transaction point needed.
    let mut core2 = core;
    core2
        .trans_mask_set(duofs::TransactMask::empty())
        .unwrap();
    core2.file_truncate(f, 0).unwrap();
    assert_eq!(core2.vol_stat().unwrap().free_blocks, before);
}

#[test]
fn volume_fills_and_recovers_after_delete() {
    let mut core = fresh_core(512, 8);
    let hog = core.create(INODE_ROOT, b"hog", mode::IFREG | 0o644).unwrap();
    let g = core.create(INODE_ROOT, b"g", mode::IFREG | 0o644).unwrap();

    // Fill the volume with large appends...
    let chunk = pattern(16 * BLOCK_SIZE, 8);
    let mut total = 0u64;
    loop {
        match core.file_write(hog, total, &chunk) {
            Ok(n) => {
                total += n as u64;
                if n < chunk.len() {
                    // Partial write: the volume just filled.
                    break;
                }
            }
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected write error: {e}"),
        }
    }
    assert!(total > 0);

    // ...then drain the last stragglers with single-block writes into
    // g's direct range, which cost exactly one block each.
    let one = pattern(BLOCK_SIZE, 11);
    let mut g_off = 0u64;
    while let Ok(n) = core.file_write(g, g_off, &one) {
        assert_eq!(n, one.len());
        g_off += n as u64;
    }

    // Deleting still works on the full volume thanks to the withheld
    // deletion reserve, and its automatic transaction point recovers the
    // space for new writes.
    core.unlink(INODE_ROOT, b"hog", false).unwrap();
    assert_eq!(core.file_write(g, g_off, &chunk).unwrap(), chunk.len());
}

#[test]
fn reserve_guarantees_writes_and_unreserve_balances() {
    let mut core = fresh_core(512, 8);
    let f = core.create(INODE_ROOT, b"r", mode::IFREG | 0o644).unwrap();

    let size0 = core.file_size(f).unwrap();
    assert_eq!(size0, 0);

    // Reserve a region, then eat the rest of the disk with another file.
    let reserve_len = 32 * BLOCK_SIZE as u64;
    core.file_reserve(f, 0, reserve_len).unwrap();
    assert_eq!(core.file_size(f).unwrap(), reserve_len);

    let hog = core.create(INODE_ROOT, b"hog", mode::IFREG | 0o644).unwrap();
    let chunk = pattern(16 * BLOCK_SIZE, 9);
    let mut off = 0u64;
    loop {
        match core.file_write(hog, off, &chunk) {
            Ok(n) => {
                off += n as u64;
                if n < chunk.len() {
                    break;
                }
            }
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected write error: {e}"),
        }
    }

    // The reserved region is still writable despite the full volume.
    let payload = pattern(reserve_len as usize, 10);
    assert_eq!(
        core.file_write_reserved(f, 0, &payload).unwrap(),
        payload.len()
    );

    let mut back = vec![0u8; payload.len()];
    core.file_read(f, 0, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn reserve_then_unreserve_roundtrip() {
    let mut core = fresh_core(2048, 32);
    let f = core.create(INODE_ROOT, b"r", mode::IFREG | 0o644).unwrap();

    let free0 = core.vol_stat().unwrap().free_blocks;
    core.file_reserve(f, 0, (10 * BLOCK_SIZE) as u64).unwrap();
    // Reservations come out of the reported free count.
    assert!(core.vol_stat().unwrap().free_blocks < free0);

    core.file_unreserve(f, 0).unwrap();
    assert_eq!(core.vol_stat().unwrap().free_blocks, free0);
}

#[test]
fn reserve_rejects_oversized_and_misplaced_requests() {
    let mut core = fresh_core(512, 8);
    let f = core.create(INODE_ROOT, b"r", mode::IFREG | 0o644).unwrap();

    // Offset must be the current EOF.
    assert_eq!(
        core.file_reserve(f, 10, 100).unwrap_err(),
        Error::InvalidArg
    );
    // More than the volume holds.
    assert_eq!(
        core.file_reserve(f, 0, (600 * BLOCK_SIZE) as u64).unwrap_err(),
        Error::NoSpace
    );
    // Reservation failure leaves the size untouched.
    assert_eq!(core.file_size(f).unwrap(), 0);
}

#[test]
fn data_survives_remount_after_commit() {
    let mut core = fresh_core(4096, 16);
    let f = core.create(INODE_ROOT, b"persist", mode::IFREG | 0o644).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut data = vec![0u8; 37 * BLOCK_SIZE + 123];
    rng.fill_bytes(&mut data);

    assert_eq!(core.file_write(f, 0, &data).unwrap(), data.len());
    core.transact().unwrap();

    let mut core = crash_and_remount(core, MountFlags::empty());
    let mut back = vec![0u8; data.len()];
    assert_eq!(core.file_read(f, 0, &mut back).unwrap(), data.len());
    assert_eq!(back, data);
}

#[test]
fn directory_data_is_rejected_for_file_ops() {
    let mut core = fresh_core(2048, 32);
    let d = core.create(INODE_ROOT, b"d", mode::IFDIR | 0o755).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(core.file_read(d, 0, &mut buf).unwrap_err(), Error::IsDir);
    assert_eq!(core.file_write(d, 0, b"oops").unwrap_err(), Error::IsDir);
    assert_eq!(core.file_truncate(d, 0).unwrap_err(), Error::IsDir);
}

#[test]
fn two_volumes_are_independent() {
    let disk = common::MemDisk::new(2, 2048 * 2);
    let mut core = duofs::Core::new(disk, common::configs());

    for v in 0..2u8 {
        core.vol_set_current(v).unwrap();
        core.format(duofs::FormatOpts { inode_count: 16 }).unwrap();
        core.mount(MountFlags::empty()).unwrap();
    }

    core.vol_set_current(0).unwrap();
    let a = core.create(INODE_ROOT, b"only-on-0", mode::IFREG | 0o644).unwrap();
    core.file_write(a, 0, b"zero").unwrap();

    core.vol_set_current(1).unwrap();
    assert_eq!(
        core.lookup(INODE_ROOT, b"only-on-0").unwrap_err(),
        Error::NotFound
    );
    let b = core.create(INODE_ROOT, b"only-on-1", mode::IFREG | 0o644).unwrap();
    core.file_write(b, 0, b"one!").unwrap();

    core.vol_set_current(0).unwrap();
    let mut buf = [0u8; 4];
    core.file_read(a, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"zero");
}
