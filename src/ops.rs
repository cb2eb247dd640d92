use crate::error::BdevResult;
#[rustversion::before(1.75)]
use async_trait::async_trait;

/// Static properties of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDevInfo {
    /// Sector size in bytes; all I/O is addressed and sized in these units.
    pub sector_size: u32,
    /// Current device length in sectors.
    pub size_sectors: u64,
    /// Whether the device accepts writes.
    pub read_write: bool,
}

impl BlockDevInfo {
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_sectors * self.sector_size as u64
    }
}

/// Contract of the lower-level resizable block device the engine runs on,
/// so that qcow2-bdev can be used with multiple storage backends.
///
/// All I/O operates on whole sectors; each buffer is a contiguous,
/// page-aligned byte range whose length is a multiple of the sector size.
/// Growing the device via `resize` exposes the new sectors as zeroes.
#[rustversion::attr(before(1.75), async_trait(?Send))]
#[rustversion::attr(since(1.75), allow(async_fn_in_trait))]
pub trait BlockDevOps {
    async fn get_info(&self) -> BdevResult<BlockDevInfo>;
    async fn read(&self, sector: u64, bufs: &mut [&mut [u8]]) -> BdevResult<()>;
    async fn write(&self, sector: u64, bufs: &[&[u8]]) -> BdevResult<()>;
    async fn resize(&self, size_sectors: u64) -> BdevResult<()>;
    async fn flush(&self) -> BdevResult<()>;
    async fn disconnect(&self);
}
