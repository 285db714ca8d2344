//! Block device interface consumed by the core.
//!
//! The core addresses devices by volume number and sector; translating
//! blocks to sectors is the volume's job.  Implementations back this with
//! flash, eMMC, a disk partition, or RAM.

use crate::error::Result;

/// How a volume's device is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Device geometry reported by [`BlockDev::geometry`].
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub sector_size: u32,
    pub sector_count: u64,
}

/// Sector-addressed storage under the core.
///
/// `flush` must not return until every previously written sector is on the
/// media; the transaction point's atomicity rests on that.
pub trait BlockDev {
    fn open(&mut self, vol: u8, mode: OpenMode) -> Result<()>;
    fn close(&mut self, vol: u8) -> Result<()>;
    fn geometry(&self, vol: u8) -> Result<Geometry>;
    fn read(&mut self, vol: u8, sector: u64, count: u32, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, vol: u8, sector: u64, count: u32, buf: &[u8]) -> Result<()>;
    fn flush(&mut self, vol: u8) -> Result<()>;
}

impl<T: BlockDev + ?Sized> BlockDev for &mut T {
    fn open(&mut self, vol: u8, mode: OpenMode) -> Result<()> {
        (**self).open(vol, mode)
    }

    fn close(&mut self, vol: u8) -> Result<()> {
        (**self).close(vol)
    }

    fn geometry(&self, vol: u8) -> Result<Geometry> {
        (**self).geometry(vol)
    }

    fn read(&mut self, vol: u8, sector: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(vol, sector, count, buf)
    }

    fn write(&mut self, vol: u8, sector: u64, count: u32, buf: &[u8]) -> Result<()> {
        (**self).write(vol, sector, count, buf)
    }

    fn flush(&mut self, vol: u8) -> Result<()> {
        (**self).flush(vol)
    }
}
