use crate::cache::{SectorCache, DEF_CACHE_BYTES};
use crate::error::{BdevError, BdevResult};
use crate::header::Qcow2Header;
use crate::helpers::{checked_bufs_len, checked_bufs_len_mut, IntAlignment, IoBuf};
use crate::offset::{split_sector, OffsetWord, VirtAddr};
use crate::ops::{BlockDevInfo, BlockDevOps};
use crate::zero_buf;
use futures_locks::Mutex as AsyncMutex;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sector size of the virtual disk the engine exposes, independent of the
/// backing device's physical sector size.
pub const VIRTUAL_SECTOR_SIZE: usize = 512;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct BdevParams {
    /// Upper bound on dirty bytes the sector cache holds before lazily
    /// writing back.
    pub cache_bytes: usize,
}

impl Default for BdevParams {
    fn default() -> Self {
        BdevParams {
            cache_bytes: DEF_CACHE_BYTES,
        }
    }
}

/// Read-only geometry derived from the header at connect time.
#[derive(Debug)]
pub struct Qcow2Info {
    pub cluster_bits: u32,
    pub sector_size: u32,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    virtual_size: Cell<u64>,
}

impl Qcow2Info {
    fn new(h: &Qcow2Header, sector_size: u32) -> BdevResult<Qcow2Info> {
        let cluster_bits = h.cluster_bits();
        let cluster_size = 1u64
            .checked_shl(cluster_bits)
            .ok_or_else(|| format!("cluster_bits={} is too large", cluster_bits))?;

        if cluster_size < sector_size as u64 || cluster_size % sector_size as u64 != 0 {
            return Err(format!(
                "cluster size {} is not a multiple of the {}-byte backing sector",
                cluster_size, sector_size
            )
            .into());
        }

        let covered = h.l1_size() as u64 * Qcow2Header::bytes_per_l2(cluster_bits);
        if covered < h.size() {
            return Err(format!(
                "l1 table with {} entries covers {} bytes, image is {} bytes",
                h.l1_size(),
                covered,
                h.size()
            )
            .into());
        }

        Ok(Qcow2Info {
            cluster_bits,
            sector_size,
            l1_size: h.l1_size(),
            l1_table_offset: h.l1_table_offset(),
            refcount_table_offset: h.refcount_table_offset(),
            virtual_size: Cell::new(h.size()),
        })
    }

    #[inline]
    pub fn cluster_size(&self) -> usize {
        1usize << self.cluster_bits
    }

    /// 16-bit counters per refcount block cluster.
    #[inline]
    pub fn refcounts_per_cluster(&self) -> usize {
        self.cluster_size() / 2
    }

    /// Offset words per L2 table cluster.
    #[inline]
    pub fn l2_entries(&self) -> usize {
        self.cluster_size() / OffsetWord::SIZE
    }

    #[inline]
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size.get()
    }

    /// Largest virtual size the initially allocated L1 table can address.
    #[inline]
    pub fn max_virtual_size(&self) -> u64 {
        self.l1_size as u64 * Qcow2Header::bytes_per_l2(self.cluster_bits)
    }
}

/// The virtual-disk engine: allocator, two-level address translator,
/// refcount bookkeeping and the sector façade, generic over the backing
/// block device.
///
/// The in-memory state is only the header-derived geometry plus the next
/// free cluster; every metadata relationship lives on disk as byte
/// offsets.
pub struct Qcow2Bdev<B> {
    base: Rc<B>,
    header: RefCell<Qcow2Header>,
    pub info: Qcow2Info,

    // allocator; mutated only inside extend()
    next_cluster: AtomicU64,
    // serializes allocating walks, which interleave refcount updates and
    // parent-entry writes across suspension points
    alloc_m: AsyncMutex<()>,

    cache: SectorCache<B>,
}

impl<B> std::fmt::Debug for Qcow2Bdev<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qcow2Bdev").field("info", &self.info).finish_non_exhaustive()
    }
}

impl<B: BlockDevOps> Qcow2Bdev<B> {
    fn build(base: B, header: Qcow2Header, info: Qcow2Info, params: &BdevParams) -> Self {
        let base = Rc::new(base);
        let cache = SectorCache::new(Rc::clone(&base), info.sector_size, params.cache_bytes);
        Qcow2Bdev {
            base,
            header: RefCell::new(header),
            info,
            next_cluster: AtomicU64::new(0),
            alloc_m: AsyncMutex::new(()),
            cache,
        }
    }

    /// Open an engine over an already formatted backing device.
    pub async fn connect(base: B, params: &BdevParams) -> BdevResult<Self> {
        let binfo = base.get_info().await?;
        if binfo.sector_size as usize != VIRTUAL_SECTOR_SIZE {
            return Err(BdevError::Unsupported("sector size"));
        }

        let mut buf = IoBuf::new(binfo.sector_size as usize);
        base.read(0, &mut [&mut buf[..]]).await?;
        let header = Qcow2Header::from_buf(&buf).map_err(|e| e.prepend("header"))?;
        let info = Qcow2Info::new(&header, binfo.sector_size)?;

        let base_bytes = binfo.size_bytes();
        if base_bytes % info.cluster_size() as u64 != 0 {
            return Err(format!(
                "backing device length {} is not a whole number of clusters",
                base_bytes
            )
            .into());
        }

        log::info!(
            "connect: size {} cluster_bits {} l1_size {} clusters {}",
            info.virtual_size(),
            info.cluster_bits,
            info.l1_size,
            base_bytes >> info.cluster_bits
        );

        let dev = Self::build(base, header, info, params);
        dev.next_cluster
            .store(base_bytes >> dev.info.cluster_bits, Ordering::Relaxed);
        Ok(dev)
    }

    /// Format a fresh image on `base` and open an engine over it.
    ///
    /// Layout: header in cluster 0, refcount table in cluster 1, L1 table
    /// from cluster 2; the first refcount block is appended by the
    /// allocator while the initial metadata refcounts are recorded.
    pub async fn create(base: B, size_bytes: u64, params: &BdevParams) -> BdevResult<Self> {
        let binfo = base.get_info().await?;
        if binfo.sector_size as usize != VIRTUAL_SECTOR_SIZE {
            return Err(BdevError::Unsupported("sector size"));
        }
        if !binfo.read_write {
            return Err("create: backing device is read-only".into());
        }
        if size_bytes == 0 || size_bytes % VIRTUAL_SECTOR_SIZE as u64 != 0 {
            return Err(format!(
                "virtual size {} is not a positive multiple of {}",
                size_bytes, VIRTUAL_SECTOR_SIZE
            )
            .into());
        }

        let cluster_bits = 16u32;
        let cluster_size = 1u64 << cluster_bits;
        let header = Qcow2Header::new_formatted(size_bytes, cluster_bits);
        let info = Qcow2Info::new(&header, binfo.sector_size)?;

        let l1_bytes = header.l1_size() as u64 * OffsetWord::SIZE as u64;
        let l1_clusters = l1_bytes.align_up(cluster_size).unwrap() / cluster_size;
        let first_free = 2 * cluster_size + l1_clusters * cluster_size;

        log::info!(
            "create: size {} l1_size {} l1_clusters {}",
            size_bytes,
            header.l1_size(),
            l1_clusters
        );

        base.resize(first_free / binfo.sector_size as u64).await?;

        let dev = Self::build(base, header, info, params);
        dev.next_cluster
            .store(first_free >> cluster_bits, Ordering::Relaxed);

        // header occupies all of cluster 0, zero past the struct
        let mut cluster = IoBuf::new(cluster_size as usize);
        let hdr = dev.header.borrow().serialize_to_buf()?;
        cluster[..hdr.len()].copy_from_slice(&hdr);
        dev.call_write(0, &cluster).await?;

        cluster.zero_buf();
        dev.call_write(cluster_size, &cluster).await?; // refcount table

        // metadata refcounts: header, refcount table, L1 clusters. The
        // first increment allocates the initial refcount block.
        dev.incr_refcount(0).await?;
        dev.incr_refcount(1).await?;
        for i in 0..l1_clusters {
            dev.incr_refcount(2 + i).await?;
        }

        cluster.zero_buf();
        for i in 0..l1_clusters {
            dev.call_write(2 * cluster_size + i * cluster_size, &cluster)
                .await?;
        }

        Ok(dev)
    }

    /// One past the last allocated cluster; equals the backing length in
    /// clusters.
    #[inline]
    pub fn next_cluster(&self) -> u64 {
        self.next_cluster.load(Ordering::Relaxed)
    }

    pub fn header(&self) -> std::cell::Ref<'_, Qcow2Header> {
        self.header.borrow()
    }

    #[inline]
    async fn call_read(&self, offset: u64, buf: &mut IoBuf) -> BdevResult<()> {
        log::trace!("base read off {:x} len {}", offset, buf.len());
        let (sector, within) = split_sector(offset, self.info.sector_size);
        debug_assert_eq!(within, 0);
        self.base.read(sector, &mut [&mut buf[..]]).await
    }

    #[inline]
    async fn call_write(&self, offset: u64, buf: &IoBuf) -> BdevResult<()> {
        log::trace!("base write off {:x} len {}", offset, buf.len());
        let (sector, within) = split_sector(offset, self.info.sector_size);
        debug_assert_eq!(within, 0);
        self.base.write(sector, &[&buf[..]]).await
    }

    /// Read the backing sector containing `byte_off`; returns the sector
    /// buffer and the offset of `byte_off` within it.
    async fn read_meta_sector(&self, byte_off: u64) -> BdevResult<(IoBuf, usize)> {
        let ss = self.info.sector_size;
        let (sector, within) = split_sector(byte_off, ss);
        let mut buf = IoBuf::new(ss as usize);
        self.base.read(sector, &mut [&mut buf[..]]).await?;
        Ok((buf, within))
    }

    async fn write_meta_sector(&self, byte_off: u64, buf: &IoBuf) -> BdevResult<()> {
        let ss = self.info.sector_size;
        let (sector, _) = split_sector(byte_off, ss);
        self.base.write(sector, &[&buf[..]]).await
    }

    async fn load_entry(&self, byte_off: u64) -> BdevResult<OffsetWord> {
        let (buf, within) = self.read_meta_sector(byte_off).await?;
        let (word, _) = OffsetWord::read(&buf[within..])?;
        Ok(word)
    }

    async fn store_entry(&self, byte_off: u64, word: OffsetWord) -> BdevResult<()> {
        let (mut buf, within) = self.read_meta_sector(byte_off).await?;
        word.write(&mut buf[within..])?;
        self.write_meta_sector(byte_off, &buf).await
    }

    /// Hand out the next free cluster, growing the backing device to cover
    /// it. Callers on allocating paths hold `alloc_m`.
    async fn extend(&self) -> BdevResult<u64> {
        let next = self.next_cluster.fetch_add(1, Ordering::Relaxed);
        let new_bytes = (next + 1) << self.info.cluster_bits;
        debug_assert_eq!(new_bytes % self.info.sector_size as u64, 0);

        self.base
            .resize(new_bytes / self.info.sector_size as u64)
            .await?;

        let offset = next << self.info.cluster_bits;
        log::trace!("extend: cluster {} at {:x}", next, offset);
        Ok(offset)
    }

    /// Bump the 16-bit refcount of `cluster_index`, allocating the
    /// refcount block on first use.
    async fn incr_refcount(&self, cluster_index: u64) -> BdevResult<()> {
        let info = &self.info;
        let rcpc = info.refcounts_per_cluster() as u64;
        let block_index = cluster_index / rcpc;
        let slot = (cluster_index % rcpc) as usize;

        if block_index > 0 {
            return Err(BdevError::Unsupported("refcount table growth"));
        }

        let entry_off = info.refcount_table_offset + (OffsetWord::SIZE as u64) * block_index;
        let entry = self.load_entry(entry_off).await?;

        if entry.is_zero() {
            let rb_off = self.extend().await?;

            let mut block = IoBuf::new(info.cluster_size());
            block[2 * slot..2 * slot + 2].copy_from_slice(&1u16.to_be_bytes());
            self.call_write(rb_off, &block).await?;

            // The new block's own cluster stays at refcount zero; callers
            // that audit the image must account for this bootstrap hole.
            self.store_entry(entry_off, OffsetWord::from_offset(rb_off))
                .await?;
            log::debug!("refcount block allocated at {:x}", rb_off);
        } else {
            let slot_off = entry.to_bytes() + 2 * slot as u64;
            let (mut buf, within) = self.read_meta_sector(slot_off).await?;
            let cur = u16::from_be_bytes(buf[within..within + 2].try_into().unwrap());
            let bumped = cur
                .checked_add(1)
                .ok_or_else(|| format!("refcount overflow for cluster {}", cluster_index))?;
            buf[within..within + 2].copy_from_slice(&bumped.to_be_bytes());
            self.write_meta_sector(slot_off, &buf).await?;
        }
        Ok(())
    }

    /// Current refcount of `cluster_index`; 0 when the refcount block was
    /// never allocated.
    pub async fn read_refcount(&self, cluster_index: u64) -> BdevResult<u16> {
        let info = &self.info;
        let rcpc = info.refcounts_per_cluster() as u64;
        if cluster_index / rcpc > 0 {
            return Err(BdevError::Unsupported("refcount table growth"));
        }
        let slot = (cluster_index % rcpc) as usize;

        let entry = self.load_entry(info.refcount_table_offset).await?;
        if entry.is_zero() {
            return Ok(0);
        }
        let (buf, within) = self.read_meta_sector(entry.to_bytes() + 2 * slot as u64).await?;
        Ok(u16::from_be_bytes(buf[within..within + 2].try_into().unwrap()))
    }

    /// Translate a decomposed guest address to a physical byte offset,
    /// materializing missing L2 tables and data clusters when `allocate`
    /// is set. Refcount updates and parent-entry writes complete before a
    /// fresh mapping is returned.
    async fn walk(&self, addr: &VirtAddr, allocate: bool) -> BdevResult<Option<u64>> {
        let info = &self.info;
        let word_size = OffsetWord::SIZE as u64;

        if addr.l1_index >= info.l1_size as u64 {
            return Err(format!("l1 index {} out of bounds", addr.l1_index).into());
        }

        let l1_entry_off = info.l1_table_offset + word_size * addr.l1_index;
        let l1 = self.load_entry(l1_entry_off).await?;

        let l2_table = if l1.is_zero() {
            if !allocate {
                return Ok(None);
            }
            let l2_off = self.extend().await?;
            self.incr_refcount(l2_off >> info.cluster_bits).await?;
            self.store_entry(l1_entry_off, OffsetWord::from_offset(l2_off))
                .await?;
            log::trace!("walk: l2 table for l1[{}] at {:x}", addr.l1_index, l2_off);
            l2_off
        } else if l1.is_compressed() {
            return Err(BdevError::Unsupported("compressed"));
        } else {
            l1.to_bytes()
        };

        let l2_entry_off = l2_table + word_size * addr.l2_index;
        let l2 = self.load_entry(l2_entry_off).await?;

        let data = if l2.is_zero() {
            if !allocate {
                return Ok(None);
            }
            let cluster = self.extend().await?;
            self.incr_refcount(cluster >> info.cluster_bits).await?;
            self.store_entry(l2_entry_off, OffsetWord::from_offset(cluster))
                .await?;
            log::trace!("walk: data cluster for l2[{}] at {:x}", addr.l2_index, cluster);
            cluster
        } else if l2.is_compressed() {
            return Err(BdevError::Unsupported("compressed"));
        } else {
            l2.to_bytes()
        };

        Ok(Some(data + addr.in_cluster as u64))
    }

    /// Non-allocating translation of a guest byte address, for tooling.
    pub async fn map_virtual(&self, byte: u64) -> BdevResult<Option<u64>> {
        if byte >= self.info.virtual_size() {
            return Err("address beyond the end of the virtual disk".into());
        }
        let addr = VirtAddr::split(byte, self.info.cluster_bits);
        self.walk(&addr, false).await
    }

    fn check_bounds(&self, sector: u64, total: usize) -> BdevResult<()> {
        let end = sector
            .checked_mul(VIRTUAL_SECTOR_SIZE as u64)
            .and_then(|s| s.checked_add(total as u64));
        match end {
            Some(end) if end <= self.info.virtual_size() => Ok(()),
            _ => Err(format!(
                "sector {} + {} bytes is beyond the {}-byte virtual disk",
                sector,
                total,
                self.info.virtual_size()
            )
            .into()),
        }
    }

    /// Read virtual sectors. Unmapped sectors read as zeroes; mapped
    /// sectors come through the write-back cache.
    pub async fn read(&self, sector: u64, bufs: &mut [&mut [u8]]) -> BdevResult<()> {
        if self.cache.is_disconnected() {
            return Err(BdevError::Disconnected);
        }
        let total = checked_bufs_len_mut(bufs, VIRTUAL_SECTOR_SIZE)?;
        if total == 0 {
            return Ok(());
        }
        self.check_bounds(sector, total)?;
        log::trace!("read: sector {} len {}", sector, total);

        let mut cur = sector;
        for buf in bufs.iter_mut() {
            for slice in buf.chunks_mut(VIRTUAL_SECTOR_SIZE) {
                let byte = cur * VIRTUAL_SECTOR_SIZE as u64;
                let addr = VirtAddr::split(byte, self.info.cluster_bits);
                match self.walk(&addr, false).await? {
                    None => zero_buf!(slice),
                    Some(phys) => {
                        let (psec, within) = split_sector(phys, self.info.sector_size);
                        debug_assert_eq!(within, 0);
                        self.cache.read(psec, &mut [slice]).await?;
                    }
                }
                cur += 1;
            }
        }
        Ok(())
    }

    /// Write virtual sectors through the cache, allocating metadata and
    /// data clusters on demand.
    pub async fn write(&self, sector: u64, bufs: &[&[u8]]) -> BdevResult<()> {
        if self.cache.is_disconnected() {
            return Err(BdevError::Disconnected);
        }
        let total = checked_bufs_len(bufs, VIRTUAL_SECTOR_SIZE)?;
        if total == 0 {
            return Ok(());
        }
        self.check_bounds(sector, total)?;
        log::trace!("write: sector {} len {}", sector, total);

        let mut cur = sector;
        for buf in bufs {
            for slice in buf.chunks(VIRTUAL_SECTOR_SIZE) {
                let byte = cur * VIRTUAL_SECTOR_SIZE as u64;
                let addr = VirtAddr::split(byte, self.info.cluster_bits);

                // the metadata portion of the allocating walk must not
                // interleave with other allocators
                let phys = {
                    let _alloc = self.alloc_m.lock().await;
                    self.walk(&addr, true).await?
                };
                let phys = phys
                    .ok_or_else(|| BdevError::Unknown("internal: unmapped after allocation".into()))?;

                let (psec, within) = split_sector(phys, self.info.sector_size);
                debug_assert_eq!(within, 0);
                self.cache.write(psec, &[slice]).await?;
                cur += 1;
            }
        }
        Ok(())
    }

    /// Grow the virtual disk. The new size must be a sector multiple and
    /// stay within what the initially allocated L1 table can address.
    pub async fn resize(&self, new_size_bytes: u64) -> BdevResult<()> {
        if new_size_bytes % VIRTUAL_SECTOR_SIZE as u64 != 0 {
            return Err(format!(
                "virtual size {} is not a multiple of {}",
                new_size_bytes, VIRTUAL_SECTOR_SIZE
            )
            .into());
        }
        let cur = self.info.virtual_size();
        if new_size_bytes < cur {
            return Err(BdevError::Unsupported("shrink"));
        }
        if new_size_bytes > self.info.max_virtual_size() {
            return Err(BdevError::Unsupported("l1 growth"));
        }
        if new_size_bytes == cur {
            return Ok(());
        }

        let hdr = {
            let mut header = self.header.borrow_mut();
            header.set_size(new_size_bytes);
            header.serialize_to_buf()?
        };
        let mut buf = IoBuf::new(self.info.sector_size as usize);
        buf[..hdr.len()].copy_from_slice(&hdr);
        self.call_write(0, &buf).await?;

        self.info.virtual_size.set(new_size_bytes);
        log::info!("resize: virtual size {} -> {}", cur, new_size_bytes);
        Ok(())
    }

    pub async fn get_info(&self) -> BdevResult<BlockDevInfo> {
        Ok(BlockDevInfo {
            sector_size: VIRTUAL_SECTOR_SIZE as u32,
            size_sectors: self.info.virtual_size() / VIRTUAL_SECTOR_SIZE as u64,
            read_write: true,
        })
    }

    /// Write back all cached sectors and flush the backing device.
    pub async fn flush(&self) -> BdevResult<()> {
        self.cache.flush().await
    }

    /// Flush and release the backing device. Subsequent reads and writes
    /// fail with `Disconnected`.
    pub async fn disconnect(&self) -> BdevResult<()> {
        log::info!("disconnect");
        self.cache.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram_io::RamDisk;
    use futures::executor::block_on;

    #[test]
    fn test_info_geometry() {
        let h = Qcow2Header::new_formatted(1 << 30, 16);
        let info = Qcow2Info::new(&h, 512).unwrap();
        assert_eq!(info.cluster_size(), 65536);
        assert_eq!(info.refcounts_per_cluster(), 32768);
        assert_eq!(info.l2_entries(), 8192);
        assert_eq!(info.max_virtual_size(), 1 << 30);
    }

    #[test]
    fn test_create_layout() {
        block_on(async {
            let disk = RamDisk::new(512);
            let data = disk.shared_data();
            let dev = Qcow2Bdev::create(disk, 1 << 30, &BdevParams::default())
                .await
                .unwrap();

            // header + refcount table + one L1 cluster + the refcount
            // block appended by the first increment
            assert_eq!(data.borrow().len(), 4 * 65536);
            assert_eq!(dev.next_cluster(), 4);

            let info = dev.get_info().await.unwrap();
            assert_eq!(info.sector_size, 512);
            assert_eq!(info.size_sectors, (1 << 30) / 512);
        });
    }

    #[test]
    fn test_out_of_bounds_io_refused() {
        block_on(async {
            let disk = RamDisk::new(512);
            let dev = Qcow2Bdev::create(disk, 1 << 20, &BdevParams::default())
                .await
                .unwrap();

            let mut buf = vec![0u8; 512];
            let last = (1 << 20) / 512 - 1;
            dev.read(last, &mut [&mut buf[..]]).await.unwrap();
            assert!(dev.read(last + 1, &mut [&mut buf[..]]).await.is_err());

            let payload = vec![0u8; 1024];
            assert!(dev.write(last, &[&payload[..]]).await.is_err());
        });
    }

    #[test]
    fn test_unaligned_buffer_refused() {
        block_on(async {
            let disk = RamDisk::new(512);
            let dev = Qcow2Bdev::create(disk, 1 << 20, &BdevParams::default())
                .await
                .unwrap();

            let payload = vec![0u8; 100];
            assert!(dev.write(0, &[&payload[..]]).await.is_err());
        });
    }

    #[test]
    fn test_resize_rules() {
        block_on(async {
            let disk = RamDisk::new(512);
            let dev = Qcow2Bdev::create(disk, 1 << 30, &BdevParams::default())
                .await
                .unwrap();

            // l1_size is 2 for 1 GiB, which addresses exactly 1 GiB
            let err = dev.resize((1 << 30) + 65536).await.unwrap_err();
            assert!(matches!(err, BdevError::Unsupported("l1 growth")));

            let err = dev.resize(1 << 29).await.unwrap_err();
            assert!(matches!(err, BdevError::Unsupported("shrink")));

            assert!(dev.resize(513).await.is_err());
            dev.resize(1 << 30).await.unwrap();
        });
    }
}
