use crate::dev::{BdevParams, Qcow2Bdev};
use crate::error::BdevResult;
use crate::sync_io::BlockIoSync;
use crate::tokio_io::BlockIoTokio;
use std::path::Path;

/// Format a fresh image file at `path` and return an engine over it.
pub async fn qcow2_create_file(
    path: &Path,
    size_bytes: u64,
    params: &BdevParams,
) -> BdevResult<Qcow2Bdev<BlockIoTokio>> {
    let io = BlockIoTokio::create(path).await?;
    Qcow2Bdev::create(io, size_bytes, params).await
}

/// Open an engine over an existing image file.
pub async fn qcow2_connect_file(
    path: &Path,
    params: &BdevParams,
) -> BdevResult<Qcow2Bdev<BlockIoTokio>> {
    let io = BlockIoTokio::new(path, false).await?;
    Qcow2Bdev::connect(io, params).await
}

/// Open an engine over an existing image file through the blocking I/O
/// backend; no runtime-specific resources are involved.
pub async fn qcow2_connect_file_sync(
    path: &Path,
    ro: bool,
    params: &BdevParams,
) -> BdevResult<Qcow2Bdev<BlockIoSync>> {
    let io = BlockIoSync::new(path, ro)?;
    Qcow2Bdev::connect(io, params).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;

    #[test]
    fn test_create_then_connect_file() {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let rt = Builder::new_current_thread().enable_all().build().unwrap();

        rt.block_on(async {
            let params = BdevParams::default();
            let size = 64u64 << 20;

            let dev = qcow2_create_file(tmpfile.path(), size, &params)
                .await
                .unwrap();
            let payload = vec![0x42u8; 512];
            dev.write(7, &[&payload[..]]).await.unwrap();
            dev.disconnect().await.unwrap();

            let dev = qcow2_connect_file(tmpfile.path(), &params).await.unwrap();
            assert_eq!(dev.info.virtual_size(), size);

            let mut buf = vec![0u8; 512];
            dev.read(7, &mut [&mut buf[..]]).await.unwrap();
            assert_eq!(buf, payload);
            dev.disconnect().await.unwrap();
        });
    }

    #[test]
    fn test_connect_sync_backend() {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let rt = Builder::new_current_thread().enable_all().build().unwrap();

        rt.block_on(async {
            let params = BdevParams::default();
            let dev = qcow2_create_file(tmpfile.path(), 16 << 20, &params)
                .await
                .unwrap();
            let payload = vec![0x9cu8; 512];
            dev.write(0, &[&payload[..]]).await.unwrap();
            dev.disconnect().await.unwrap();

            let dev = qcow2_connect_file_sync(tmpfile.path(), true, &params)
                .await
                .unwrap();
            let mut buf = vec![0u8; 512];
            dev.read(0, &mut [&mut buf[..]]).await.unwrap();
            assert_eq!(buf, payload);
        });
    }
}
