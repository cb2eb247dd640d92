use crate::error::{BdevError, BdevResult};
use crate::ops::{BlockDevInfo, BlockDevOps};
#[rustversion::before(1.75)]
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// File-backed block device driven by blocking pread/pwrite. Useful where
/// no async runtime is wanted; the async methods complete immediately.
#[derive(Debug)]
pub struct BlockIoSync {
    _file: RefCell<File>,
    fd: i32,
    read_write: bool,
    disconnected: Cell<bool>,
}

impl BlockIoSync {
    pub const SECTOR_SIZE: u32 = 512;

    pub fn new(path: &Path, ro: bool) -> BdevResult<BlockIoSync> {
        let file = OpenOptions::new().read(true).write(!ro).open(path)?;

        let fd = file.as_raw_fd();
        Ok(BlockIoSync {
            _file: RefCell::new(file),
            fd,
            read_write: !ro,
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
impl BlockDevOps for BlockIoSync {
    async fn get_info(&self) -> BdevResult<BlockDevInfo> {
        self.check_alive()?;
        let len = self._file.borrow().metadata()?.len();
        Ok(BlockDevInfo {
            sector_size: Self::SECTOR_SIZE,
            size_sectors: len / Self::SECTOR_SIZE as u64,
            read_write: self.read_write,
        })
    }

    async fn read(&self, sector: u64, bufs: &mut [&mut [u8]]) -> BdevResult<()> {
        self.check_alive()?;
        let mut offset = sector * Self::SECTOR_SIZE as u64;
        for buf in bufs.iter_mut() {
            let res = unsafe {
                libc::pread(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    offset as i64,
                )
            };
            if res < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            if (res as usize) != buf.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read: asked {}, got {}", buf.len(), res),
                )
                .into());
            }
            offset += buf.len() as u64;
        }
        Ok(())
    }

    async fn write(&self, sector: u64, bufs: &[&[u8]]) -> BdevResult<()> {
        self.check_alive()?;
        let mut offset = sector * Self::SECTOR_SIZE as u64;
        for buf in bufs {
            let res = unsafe {
                libc::pwrite(
                    self.fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    offset as i64,
                )
            };
            if res < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            if (res as usize) != buf.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write: asked {}, wrote {}", buf.len(), res),
                )
                .into());
            }
            offset += buf.len() as u64;
        }
        Ok(())
    }

    async fn resize(&self, size_sectors: u64) -> BdevResult<()> {
        self.check_alive()?;
        let len = (size_sectors * Self::SECTOR_SIZE as u64) as libc::off_t;
        nix::unistd::ftruncate(self.fd, len)
            .map_err(|e| BdevError::Backing(std::io::Error::from(e)))?;
        Ok(())
    }

    async fn flush(&self) -> BdevResult<()> {
        self.check_alive()?;
        nix::unistd::fsync(self.fd).map_err(|e| BdevError::Backing(std::io::Error::from(e)))?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.set(true);
    }
}
