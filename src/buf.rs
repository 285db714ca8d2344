//! Block buffer cache.
//!
//! A fixed pool of block-sized buffers, shared by every volume, with a
//! simple LRU replacement scheme.  All metadata I/O passes through here;
//! buffers are pinned by reference count and addressed by index, so a
//! cached inode can hold several buffers at once while the cache itself
//! stays uniquely borrowed (callers keep `BufIdx` handles, not references).
//!
//! Interface sketch:
//! * `get` pins a buffer for a block, reading or zero-filling it.
//! * `dirty`/`branch` mark it for write-back (branch also rebinds the
//!   buffer to a freshly allocated block, which is how copy-on-write
//!   happens).
//! * `put` drops one pin; unpinned buffers are eviction candidates.
//! * `flush_range` finalizes (signature, sequence, CRC) and writes dirty
//!   buffers back.

use crate::bdev::BlockDev;
use crate::config::{BLOCK_SIZE, BUFFER_COUNT};
use crate::crc;
use crate::error::{Error, Result};
use crate::layout::{self, MetaKind, BLOCK_INVALID};
use crate::volume::{block_read, block_write, Volume};

bitflags::bitflags! {
    pub struct BufFlags: u16 {
        /// Buffer contents differ from disk.
        const DIRTY = 0x0001;
        /// Zero-fill instead of reading; only valid with DIRTY at `get`
        /// time and never stored.
        const NEW = 0x0002;

        const META_MASTER = 0x0010;
        const META_IMAP   = 0x0020;
        const META_INODE  = 0x0040;
        const META_INDIR  = 0x0080;
        const META_DINDIR = 0x0100;

        const META_MASK = Self::META_MASTER.bits
            | Self::META_IMAP.bits
            | Self::META_INODE.bits
            | Self::META_INDIR.bits
            | Self::META_DINDIR.bits;
    }
}

impl BufFlags {
    fn meta_kind(self) -> Option<MetaKind> {
        match self & BufFlags::META_MASK {
            BufFlags::META_MASTER => Some(MetaKind::Master),
            BufFlags::META_IMAP => Some(MetaKind::Imap),
            BufFlags::META_INODE => Some(MetaKind::Inode),
            BufFlags::META_INDIR => Some(MetaKind::Indir),
            BufFlags::META_DINDIR => Some(MetaKind::Dindir),
            _ => None,
        }
    }

    fn type_is_valid(self) -> bool {
        (self & BufFlags::META_MASK).bits().count_ones() <= 1
    }
}

/// Index of a pinned buffer.  Valid until the matching `put`/`discard`.
pub type BufIdx = u8;

/// Per-buffer bookkeeping, kept small so head scans stay cache-friendly.
#[derive(Clone, Copy)]
struct BufHead {
    /// Block the buffer holds, or `BLOCK_INVALID` if unused.
    block: u32,
    vol: u8,
    refs: u8,
    flags: BufFlags,
}

impl BufHead {
    const fn new() -> BufHead {
        BufHead {
            block: BLOCK_INVALID,
            vol: 0,
            refs: 0,
            flags: BufFlags::empty(),
        }
    }
}

#[repr(align(8))]
struct Pool([u8; BUFFER_COUNT * BLOCK_SIZE]);

pub struct BufferCache {
    /// Buffers with at least one reference.
    num_used: u16,
    /// Buffer indices in MRU..LRU order; each index appears exactly once.
    mru: [u8; BUFFER_COUNT],
    heads: [BufHead; BUFFER_COUNT],
    pool: Pool,
}

impl BufferCache {
    pub fn new() -> BufferCache {
        let mut mru = [0u8; BUFFER_COUNT];
        for (i, m) in mru.iter_mut().enumerate() {
            // Freshly initialized, buffers are claimed in array order.
            *m = (BUFFER_COUNT - 1 - i) as u8;
        }
        BufferCache {
            num_used: 0,
            mru,
            heads: [BufHead::new(); BUFFER_COUNT],
            pool: Pool([0; BUFFER_COUNT * BLOCK_SIZE]),
        }
    }

    pub fn data(&self, idx: BufIdx) -> &[u8; BLOCK_SIZE] {
        let start = idx as usize * BLOCK_SIZE;
        self.pool.0[start..start + BLOCK_SIZE]
            .try_into()
            .expect("buffer pool slice")
    }

    pub fn data_mut(&mut self, idx: BufIdx) -> &mut [u8; BLOCK_SIZE] {
        let start = idx as usize * BLOCK_SIZE;
        (&mut self.pool.0[start..start + BLOCK_SIZE])
            .try_into()
            .expect("buffer pool slice")
    }

    /// The block a pinned buffer is currently bound to.
    pub fn block_no(&self, idx: BufIdx) -> u32 {
        self.heads[idx as usize].block
    }

    /// Pin and return a buffer for `block`.
    ///
    /// `NEW` means the block was just allocated: the buffer is zero-filled
    /// instead of read, and it is a critical error for the block to already
    /// be cached (a free block has no buffer).
    pub fn get<D: BlockDev>(
        &mut self,
        dev: &mut D,
        vol: &mut Volume,
        block: u32,
        flags: BufFlags,
    ) -> Result<BufIdx> {
        if block >= vol.block_count
            || !flags.type_is_valid()
            || (flags.contains(BufFlags::NEW) && !flags.contains(BufFlags::DIRTY))
        {
            log::error!("buffer get: bad request for block {}", block);
            return Err(Error::InvalidArg);
        }

        let idx = if let Some(idx) = self.find(vol.index, block) {
            // An existing buffer must match the requested metadata type,
            // and NEW must never hit: the block was supposedly free.
            let head = &self.heads[idx as usize];
            if flags.contains(BufFlags::NEW)
                || (flags & BufFlags::META_MASK) != (head.flags & BufFlags::META_MASK)
            {
                return Err(vol.critical_error());
            }
            idx
        } else {
            if self.num_used as usize == BUFFER_COUNT {
                // The minimum-buffer-count rule should make this
                // impossible.
                return Err(vol.critical_error());
            }

            let idx = match self.lru_unreferenced() {
                Some(idx) => idx,
                None => return Err(vol.critical_error()),
            };

            let head = self.heads[idx as usize];
            if head.flags.contains(BufFlags::DIRTY) && head.block != BLOCK_INVALID {
                self.write_out(dev, vol, idx)?;
            }

            if flags.contains(BufFlags::NEW) {
                self.data_mut(idx).fill(0);
            } else {
                // Unbind before reading: a failed read may leave the
                // buffer partially overwritten, and it must not continue
                // to pass for the old block's contents.
                self.heads[idx as usize].block = BLOCK_INVALID;

                block_read(
                    dev,
                    vol.index,
                    vol.block_sector_shift,
                    block,
                    1,
                    self.data_mut(idx),
                )?;

                if let Some(kind) = flags.meta_kind() {
                    if !validate_node(self.data(idx), kind, vol) {
                        // A corrupt metadata node is a critical error,
                        // except for the master block: an unformatted
                        // volume is expected to fail here.
                        if kind == MetaKind::Master {
                            return Err(Error::Io);
                        }
                        return Err(vol.critical_error());
                    }
                    if crate::layout::ENDIAN_SWAP {
                        layout::swap_node(self.data_mut(idx), kind);
                    }
                }
            }

            let head = &mut self.heads[idx as usize];
            head.vol = vol.index;
            head.block = block;
            head.flags = BufFlags::empty();
            idx
        };

        let head = &mut self.heads[idx as usize];
        head.refs += 1;
        if head.refs == 1 {
            self.num_used += 1;
        }
        // NEW only directs the fill above; it is not a stored state.
        head.flags |= flags & !BufFlags::NEW;

        self.make_mru(idx);
        Ok(idx)
    }

    /// Release one reference.  The buffer keeps its place in the recency
    /// order so a quick re-get is cheap.
    pub fn put(&mut self, idx: BufIdx) {
        let head = &mut self.heads[idx as usize];
        debug_assert!(head.refs > 0);
        if head.refs == 0 {
            log::error!("buffer put: refcount underflow");
            return;
        }
        head.refs -= 1;
        if head.refs == 0 {
            self.num_used -= 1;
        }
    }

    /// Mark a pinned buffer dirty.
    pub fn dirty(&mut self, idx: BufIdx) {
        let head = &mut self.heads[idx as usize];
        debug_assert!(head.refs > 0);
        head.flags |= BufFlags::DIRTY;
    }

    /// Rebind a pinned clean buffer to `new_block` and mark it dirty: the
    /// copy-on-write primitive.  The old block's content is preserved in
    /// the buffer and will be written to the new location.
    pub fn branch(&mut self, vol: &Volume, idx: BufIdx, new_block: u32) {
        if new_block >= vol.block_count {
            log::error!("buffer branch: block {} out of range", new_block);
            return;
        }
        let head = &mut self.heads[idx as usize];
        debug_assert!(head.refs > 0);
        debug_assert!(!head.flags.contains(BufFlags::DIRTY));
        head.flags |= BufFlags::DIRTY;
        head.block = new_block;
    }

    /// Release and invalidate a buffer.  The caller must hold the sole
    /// reference.
    pub fn discard(&mut self, idx: BufIdx) {
        let head = &mut self.heads[idx as usize];
        debug_assert_eq!(head.refs, 1);
        head.refs = 0;
        head.block = BLOCK_INVALID;
        head.flags = BufFlags::empty();
        self.num_used -= 1;
        self.make_lru(idx);
    }

    /// Write back every dirty buffer of this volume within the range.
    pub fn flush_range<D: BlockDev>(
        &mut self,
        dev: &mut D,
        vol: &mut Volume,
        start: u32,
        count: u32,
    ) -> Result<()> {
        if start >= vol.block_count || vol.block_count - start < count || count == 0 {
            log::error!("buffer flush: bad range");
            return Err(Error::InvalidArg);
        }

        for i in 0..BUFFER_COUNT {
            let head = self.heads[i];
            if head.vol == vol.index
                && head.block != BLOCK_INVALID
                && head.flags.contains(BufFlags::DIRTY)
                && head.block >= start
                && head.block - start < count
            {
                self.write_out(dev, vol, i as BufIdx)?;
                self.heads[i].flags.remove(BufFlags::DIRTY);
            }
        }
        Ok(())
    }

    /// Invalidate every cached block of this volume within the range.  A
    /// live reference inside the range indicates a logic bug.
    pub fn discard_range(&mut self, vol: &mut Volume, start: u32, count: u32) -> Result<()> {
        if start >= vol.block_count || vol.block_count - start < count || count == 0 {
            log::error!("buffer discard: bad range");
            return Err(Error::InvalidArg);
        }

        for i in 0..BUFFER_COUNT {
            let head = self.heads[i];
            if head.vol == vol.index
                && head.block != BLOCK_INVALID
                && head.block >= start
                && head.block - start < count
            {
                if head.refs != 0 {
                    return Err(vol.critical_error());
                }
                self.heads[i].block = BLOCK_INVALID;
                self.heads[i].flags = BufFlags::empty();
                self.make_lru(i as BufIdx);
            }
        }
        Ok(())
    }

    /// Read a range of blocks directly from disk, bypassing the cache.
    /// Dirty buffers in the range are flushed first so the device holds
    /// current data.
    pub fn read_range<D: BlockDev>(
        &mut self,
        dev: &mut D,
        vol: &mut Volume,
        start: u32,
        count: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        self.flush_range(dev, vol, start, count)?;
        block_read(dev, vol.index, vol.block_sector_shift, start, count, dst)
    }

    /// Write a range of blocks directly to disk.  Any cached copies are
    /// stale afterwards and are invalidated.
    pub fn write_range<D: BlockDev>(
        &mut self,
        dev: &mut D,
        vol: &mut Volume,
        start: u32,
        count: u32,
        src: &[u8],
    ) -> Result<()> {
        if start >= vol.block_count || vol.block_count - start < count || count == 0 {
            log::error!("buffer write range: bad range");
            return Err(Error::InvalidArg);
        }
        block_write(dev, vol.index, vol.block_sector_shift, start, count, src)?;
        self.discard_range(vol, start, count)
    }

    fn find(&self, vol: u8, block: u32) -> Option<BufIdx> {
        self.heads
            .iter()
            .position(|h| h.vol == vol && h.block == block && h.block != BLOCK_INVALID)
            .map(|i| i as BufIdx)
    }

    /// The least recently used buffer with no references.
    fn lru_unreferenced(&self) -> Option<BufIdx> {
        self.mru
            .iter()
            .rev()
            .copied()
            .find(|&i| self.heads[i as usize].refs == 0)
    }

    fn write_out<D: BlockDev>(&mut self, dev: &mut D, vol: &mut Volume, idx: BufIdx) -> Result<()> {
        let head = self.heads[idx as usize];
        debug_assert!(head.flags.contains(BufFlags::DIRTY));

        let kind = head.flags.meta_kind();
        if let Some(kind) = kind {
            finalize_node(self.data_mut(idx), kind, vol)?;
        }

        let res = block_write(
            dev,
            vol.index,
            vol.block_sector_shift,
            head.block,
            1,
            self.data(idx),
        );

        // The cached copy stays in native byte order.
        if crate::layout::ENDIAN_SWAP {
            if let Some(kind) = kind {
                layout::swap_node(self.data_mut(idx), kind);
            }
        }
        res
    }

    fn make_mru(&mut self, idx: BufIdx) {
        let pos = self
            .mru
            .iter()
            .position(|&i| i == idx)
            .expect("buffer index missing from MRU order");
        self.mru.copy_within(0..pos, 1);
        self.mru[0] = idx;
    }

    fn make_lru(&mut self, idx: BufIdx) {
        let pos = self
            .mru
            .iter()
            .position(|&i| i == idx)
            .expect("buffer index missing from MRU order");
        self.mru.copy_within(pos + 1.., pos);
        self.mru[BUFFER_COUNT - 1] = idx;
    }
}

/// Check a metadata node read from disk: signature, CRC, and sequence.
/// Runs on disk-order bytes, before any endian swap.
fn validate_node(block: &[u8; BLOCK_SIZE], kind: MetaKind, vol: &Volume) -> bool {
    let hdr = layout::as_header(block);
    let (sig, seq) = if crate::layout::ENDIAN_SWAP {
        (hdr.signature.swap_bytes(), hdr.sequence.swap_bytes())
    } else {
        (hdr.signature, hdr.sequence)
    };

    if sig != kind.signature() {
        return false;
    }

    let stored = u32::from_le_bytes(block[4..8].try_into().expect("crc field"));
    if crc::node(block) != stored {
        return false;
    }

    // A sequence at or above the volume's next sequence is from a future
    // or foreign format.  Before the metaroots are read the current
    // sequence is unknown and the check is skipped.
    if vol.mounted && seq >= vol.sequence {
        return false;
    }

    true
}

/// Stamp signature, sequence, and CRC on a dirty metadata node and put it
/// in disk byte order.
fn finalize_node(block: &mut [u8; BLOCK_SIZE], kind: MetaKind, vol: &mut Volume) -> Result<()> {
    let seq = vol.sequence;
    vol.seq_increment()?;
    layout::stamp_node(block, kind, seq);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::{Geometry, OpenMode};
    use crate::volume::VolConfig;

    /// A trivial single-volume RAM device for cache-level tests.
    struct TestDisk {
        sectors: Vec<u8>,
    }

    impl TestDisk {
        fn new(sector_count: u64) -> TestDisk {
            TestDisk {
                sectors: vec![0; (sector_count * 512) as usize],
            }
        }
    }

    impl BlockDev for TestDisk {
        fn open(&mut self, _vol: u8, _mode: OpenMode) -> Result<()> {
            Ok(())
        }

        fn close(&mut self, _vol: u8) -> Result<()> {
            Ok(())
        }

        fn geometry(&self, _vol: u8) -> Result<Geometry> {
            Ok(Geometry {
                sector_size: 512,
                sector_count: (self.sectors.len() / 512) as u64,
            })
        }

        fn read(&mut self, _vol: u8, sector: u64, count: u32, buf: &mut [u8]) -> Result<()> {
            let start = sector as usize * 512;
            let len = count as usize * 512;
            buf[..len].copy_from_slice(&self.sectors[start..start + len]);
            Ok(())
        }

        fn write(&mut self, _vol: u8, sector: u64, count: u32, buf: &[u8]) -> Result<()> {
            let start = sector as usize * 512;
            let len = count as usize * 512;
            self.sectors[start..start + len].copy_from_slice(&buf[..len]);
            Ok(())
        }

        fn flush(&mut self, _vol: u8) -> Result<()> {
            Ok(())
        }
    }

    fn test_vol(blocks: u32) -> Volume {
        let mut vol = Volume::new(0, VolConfig::default());
        vol.init_block_geometry(512, (blocks as u64) << 1).unwrap();
        vol
    }

    #[test]
    fn new_buffer_is_zeroed_and_pinned() {
        let mut dev = TestDisk::new(256);
        let mut vol = test_vol(128);
        let mut cache = BufferCache::new();

        let idx = cache
            .get(&mut dev, &mut vol, 7, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap();
        assert!(cache.data(idx).iter().all(|&b| b == 0));
        assert_eq!(cache.block_no(idx), 7);
        cache.put(idx);
    }

    #[test]
    fn get_same_block_shares_buffer() {
        let mut dev = TestDisk::new(256);
        let mut vol = test_vol(128);
        let mut cache = BufferCache::new();

        let a = cache
            .get(&mut dev, &mut vol, 9, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap();
        let b = cache.get(&mut dev, &mut vol, 9, BufFlags::empty()).unwrap();
        assert_eq!(a, b);
        cache.put(a);
        cache.put(b);
    }

    #[test]
    fn new_on_cached_block_is_critical() {
        let mut dev = TestDisk::new(256);
        let mut vol = test_vol(128);
        let mut cache = BufferCache::new();

        let idx = cache
            .get(&mut dev, &mut vol, 3, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap();
        cache.put(idx);
        let err = cache
            .get(&mut dev, &mut vol, 3, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap_err();
        assert_eq!(err, Error::Corrupt);
        assert!(vol.read_only);
    }

    #[test]
    fn dirty_data_survives_eviction() {
        let mut dev = TestDisk::new(2048);
        let mut vol = test_vol(1024);
        let mut cache = BufferCache::new();

        let idx = cache
            .get(&mut dev, &mut vol, 40, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap();
        cache.data_mut(idx)[0] = 0xaa;
        cache.put(idx);

        // Cycle enough other blocks through to evict block 40.
        for b in 100..100 + BUFFER_COUNT as u32 {
            let i = cache
                .get(&mut dev, &mut vol, b, BufFlags::NEW | BufFlags::DIRTY)
                .unwrap();
            cache.put(i);
        }

        let again = cache.get(&mut dev, &mut vol, 40, BufFlags::empty()).unwrap();
        assert_eq!(cache.data(again)[0], 0xaa);
        cache.put(again);
    }

    #[test]
    fn flush_then_discard_round_trips_through_disk() {
        let mut dev = TestDisk::new(2048);
        let mut vol = test_vol(1024);
        let mut cache = BufferCache::new();

        let idx = cache
            .get(&mut dev, &mut vol, 11, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap();
        cache.data_mut(idx)[123] = 0x5a;
        cache.put(idx);

        cache.flush_range(&mut dev, &mut vol, 11, 1).unwrap();
        cache.discard_range(&mut vol, 11, 1).unwrap();

        let again = cache.get(&mut dev, &mut vol, 11, BufFlags::empty()).unwrap();
        assert_eq!(cache.data(again)[123], 0x5a);
        cache.put(again);
    }

    #[test]
    fn discard_range_with_live_reference_is_critical() {
        let mut dev = TestDisk::new(256);
        let mut vol = test_vol(128);
        let mut cache = BufferCache::new();

        let _idx = cache
            .get(&mut dev, &mut vol, 5, BufFlags::NEW | BufFlags::DIRTY)
            .unwrap();
        assert_eq!(cache.discard_range(&mut vol, 5, 1), Err(Error::Corrupt));
    }
}
