use crate::error::{BdevError, BdevResult};
use crate::ops::{BlockDevInfo, BlockDevOps};
#[rustversion::before(1.75)]
use async_trait::async_trait;
use std::cell::Cell;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// File-backed block device on tokio's async file I/O.
#[derive(Debug)]
pub struct BlockIoTokio {
    file: tokio::sync::Mutex<File>,
    read_write: bool,
    disconnected: Cell<bool>,
}

impl BlockIoTokio {
    pub const SECTOR_SIZE: u32 = 512;

    pub async fn new(path: &Path, ro: bool) -> BdevResult<BlockIoTokio> {
        let file = OpenOptions::new()
            .read(true)
            .write(!ro)
            .open(path)
            .await?;

        Ok(BlockIoTokio {
            file: tokio::sync::Mutex::new(file),
            read_write: !ro,
            disconnected: Cell::new(false),
        })
    }

    /// Create (or truncate) the file at `path` and open it read-write.
    pub async fn create(path: &Path) -> BdevResult<BlockIoTokio> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;

        Ok(BlockIoTokio {
            file: tokio::sync::Mutex::new(file),
            read_write: true,
            disconnected: Cell::new(false),
        })
    }

    fn check_alive(&self) -> BdevResult<()> {
        if self.disconnected.get() {
            Err(BdevError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[rustversion::attr(before(1.75), async_trait(?Send))]
impl BlockDevOps for BlockIoTokio {
    async fn get_info(&self) -> BdevResult<BlockDevInfo> {
        self.check_alive()?;
        let file = self.file.lock().await;
        let len = file.metadata().await?.len();
        Ok(BlockDevInfo {
            sector_size: Self::SECTOR_SIZE,
            size_sectors: len / Self::SECTOR_SIZE as u64,
            read_write: self.read_write,
        })
    }

    async fn read(&self, sector: u64, bufs: &mut [&mut [u8]]) -> BdevResult<()> {
        self.check_alive()?;
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(sector * Self::SECTOR_SIZE as u64))
            .await?;
        for buf in bufs.iter_mut() {
            file.read_exact(buf).await?;
        }
        Ok(())
    }

    async fn write(&self, sector: u64, bufs: &[&[u8]]) -> BdevResult<()> {
        self.check_alive()?;
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(sector * Self::SECTOR_SIZE as u64))
            .await?;
        for buf in bufs {
            file.write_all(buf).await?;
        }
        Ok(())
    }

    async fn resize(&self, size_sectors: u64) -> BdevResult<()> {
        self.check_alive()?;
        let file = self.file.lock().await;
        file.set_len(size_sectors * Self::SECTOR_SIZE as u64)
            .await?;
        Ok(())
    }

    async fn flush(&self) -> BdevResult<()> {
        self.check_alive()?;
        let file = self.file.lock().await;
        file.sync_all().await?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.set(true);
    }
}
