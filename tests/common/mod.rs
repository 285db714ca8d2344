//! Shared test fixture: an in-memory block device and core constructors.

// Each integration test binary compiles its own copy; not all of them use
// every helper.
#![allow(dead_code)]

use duofs::{BlockDev, Core, Error, FormatOpts, Geometry, MountFlags, OpenMode, Result, VolConfig};

pub const SECTOR_SIZE: u32 = 512;
pub const SECTORS_PER_BLOCK: u64 = 2;

/// RAM-backed block device, one image per volume.  Surviving
/// `Core::into_device` is what makes power-failure simulation possible:
/// drop the core, keep the disk, mount again.
pub struct MemDisk {
    images: Vec<Vec<u8>>,
    open: Vec<bool>,
}

impl MemDisk {
    pub fn new(vols: usize, sectors: u64) -> MemDisk {
        MemDisk {
            images: (0..vols)
                .map(|_| vec![0u8; (sectors * SECTOR_SIZE as u64) as usize])
                .collect(),
            open: vec![false; vols],
        }
    }

    /// Raw image access, for corrupting metadata in crash tests.
    pub fn image_mut(&mut self, vol: u8) -> &mut Vec<u8> {
        &mut self.images[vol as usize]
    }

    pub fn block_bytes_mut(&mut self, vol: u8, block: u32) -> &mut [u8] {
        let start = block as usize * 1024;
        &mut self.images[vol as usize][start..start + 1024]
    }
}

impl BlockDev for MemDisk {
    fn open(&mut self, vol: u8, _mode: OpenMode) -> Result<()> {
        self.open[vol as usize] = true;
        Ok(())
    }

    fn close(&mut self, vol: u8) -> Result<()> {
        self.open[vol as usize] = false;
        Ok(())
    }

    fn geometry(&self, vol: u8) -> Result<Geometry> {
        Ok(Geometry {
            sector_size: SECTOR_SIZE,
            sector_count: (self.images[vol as usize].len() / SECTOR_SIZE as usize) as u64,
        })
    }

    fn read(&mut self, vol: u8, sector: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        let start = (sector * SECTOR_SIZE as u64) as usize;
        let len = (count * SECTOR_SIZE) as usize;
        let image = &self.images[vol as usize];
        if start + len > image.len() {
            return Err(Error::Io);
        }
        buf[..len].copy_from_slice(&image[start..start + len]);
        Ok(())
    }

    fn write(&mut self, vol: u8, sector: u64, count: u32, buf: &[u8]) -> Result<()> {
        let start = (sector * SECTOR_SIZE as u64) as usize;
        let len = (count * SECTOR_SIZE) as usize;
        let image = &mut self.images[vol as usize];
        if start + len > image.len() {
            return Err(Error::Io);
        }
        image[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn flush(&mut self, _vol: u8) -> Result<()> {
        Ok(())
    }
}

pub fn configs() -> [VolConfig; 2] {
    [
        VolConfig {
            atomic_sector_write: false,
        },
        VolConfig {
            atomic_sector_write: true,
        },
    ]
}

/// Format and mount a fresh volume 0.
pub fn fresh_core(blocks: u32, inode_count: u32) -> Core<MemDisk> {
    let disk = MemDisk::new(2, blocks as u64 * SECTORS_PER_BLOCK);
    let mut core = Core::new(disk, configs());
    core.format(FormatOpts { inode_count }).expect("format");
    core.mount(MountFlags::empty()).expect("mount");
    core
}

/// Simulate a power failure: abandon all in-memory state, then mount the
/// surviving image again.
pub fn crash_and_remount(core: Core<MemDisk>, flags: MountFlags) -> Core<MemDisk> {
    let disk = core.into_device();
    let mut core = Core::new(disk, configs());
    core.mount(flags).expect("remount");
    core
}

/// Crash without remounting, handing back the raw device.
pub fn crash(core: Core<MemDisk>) -> MemDisk {
    core.into_device()
}

/// A recognizable data pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
