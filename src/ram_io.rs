use crate::error::{BdevError, BdevResult};
use crate::ops::{BlockDevInfo, BlockDevOps};
#[rustversion::before(1.75)]
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

/// Memory-backed block device.
///
/// The storage is shared through an `Rc`, so a test (or tool) can keep a
/// handle to the raw bytes across engine disconnect/reconnect cycles and
/// inspect or patch the on-disk state directly.
pub struct RamDisk {
    data: Rc<RefCell<Vec<u8>>>,
    sector_size: u32,
    read_write: bool,
    disconnected: Cell<bool>,
}

impl RamDisk {
    pub fn new(sector_size: u32) -> Self {
        Self::with_data(Rc::new(RefCell::new(Vec::new())), sector_size)
    }

    pub fn with_data(data: Rc<RefCell<Vec<u8>>>, sector_size: u32) -> Self {
        assert!(sector_size.is_power_of_two());
        RamDisk {
            data,
            sector_size,
            read_write: true,
            disconnected: Cell::new(false),
        }
    }

    /// Shared handle to the raw device bytes.
    pub fn shared_data(&self) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.data)
    }

    fn check_alive(&self) -> BdevResult<()> {
        if self.disconnected.get() {
            Err(BdevError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn range(&self, sector: u64, len: usize) -> BdevResult<std::ops::Range<usize>> {
        let start = (sector * self.sector_size as u64) as usize;
        let end = start + len;
        if len & (self.sector_size as usize - 1) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer length {} is not sector sized", len),
            )
            .into());
        }
        if end > self.data.borrow().len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("sector {} + {} bytes is out of range", sector, len),
            )
            .into());
        }
        Ok(start..end)
    }
}

#[rustversion::attr(before(1.75), async_trait(?Send))]
impl BlockDevOps for RamDisk {
    async fn get_info(&self) -> BdevResult<BlockDevInfo> {
        self.check_alive()?;
        Ok(BlockDevInfo {
            sector_size: self.sector_size,
            size_sectors: (self.data.borrow().len() as u64) / self.sector_size as u64,
            read_write: self.read_write,
        })
    }

    async fn read(&self, sector: u64, bufs: &mut [&mut [u8]]) -> BdevResult<()> {
        self.check_alive()?;
        let mut at = sector;
        for buf in bufs.iter_mut() {
            let range = self.range(at, buf.len())?;
            buf.copy_from_slice(&self.data.borrow()[range]);
            at += (buf.len() / self.sector_size as usize) as u64;
        }
        Ok(())
    }

    async fn write(&self, sector: u64, bufs: &[&[u8]]) -> BdevResult<()> {
        self.check_alive()?;
        let mut at = sector;
        for buf in bufs {
            let range = self.range(at, buf.len())?;
            self.data.borrow_mut()[range].copy_from_slice(buf);
            at += (buf.len() / self.sector_size as usize) as u64;
        }
        Ok(())
    }

    async fn resize(&self, size_sectors: u64) -> BdevResult<()> {
        self.check_alive()?;
        let bytes = (size_sectors * self.sector_size as u64) as usize;
        self.data.borrow_mut().resize(bytes, 0);
        Ok(())
    }

    async fn flush(&self) -> BdevResult<()> {
        self.check_alive()
    }

    async fn disconnect(&self) {
        self.disconnected.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_resize_zero_fills() {
        block_on(async {
            let disk = RamDisk::new(512);
            disk.resize(4).await.unwrap();
            let info = disk.get_info().await.unwrap();
            assert_eq!(info.size_sectors, 4);
            assert_eq!(info.sector_size, 512);

            let mut buf = vec![0xffu8; 512];
            disk.read(3, &mut [&mut buf[..]]).await.unwrap();
            assert!(buf.iter().all(|b| *b == 0));
        });
    }

    #[test]
    fn test_write_read_roundtrip() {
        block_on(async {
            let disk = RamDisk::new(512);
            disk.resize(8).await.unwrap();

            let payload = vec![0x5au8; 1024];
            disk.write(2, &[&payload[..]]).await.unwrap();

            let mut buf = vec![0u8; 1024];
            disk.read(2, &mut [&mut buf[..]]).await.unwrap();
            assert_eq!(buf, payload);
        });
    }

    #[test]
    fn test_out_of_range_is_backing_error() {
        block_on(async {
            let disk = RamDisk::new(512);
            disk.resize(1).await.unwrap();

            let mut buf = vec![0u8; 512];
            let err = disk.read(1, &mut [&mut buf[..]]).await.unwrap_err();
            assert!(matches!(err, BdevError::Backing(_)));
        });
    }

    #[test]
    fn test_disconnect_fails_io() {
        block_on(async {
            let disk = RamDisk::new(512);
            disk.resize(1).await.unwrap();
            disk.disconnect().await;

            let mut buf = vec![0u8; 512];
            let err = disk.read(0, &mut [&mut buf[..]]).await.unwrap_err();
            assert!(matches!(err, BdevError::Disconnected));
        });
    }
}
