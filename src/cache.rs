use crate::error::{BdevError, BdevResult};
use crate::helpers::IoBuf;
use crate::ops::BlockDevOps;
use crate::rlock::RangeLocks;
use futures_locks::Mutex as AsyncMutex;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Set of disjoint inclusive sector intervals, keyed by interval start.
/// Inserting coalesces overlapping and adjacent intervals, so sectors
/// written back-to-back flush as one backing I/O.
#[derive(Debug, Default)]
pub(crate) struct IntervalSet {
    map: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn insert(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        let mut s = start;
        let mut e = end;

        let touching: Vec<u64> = self
            .map
            .range(..=e.saturating_add(1))
            .filter(|(_, &v)| v.saturating_add(1) >= s)
            .map(|(&k, _)| k)
            .collect();
        for k in touching {
            let v = self.map.remove(&k).unwrap();
            s = s.min(k);
            e = e.max(v);
        }
        self.map.insert(s, e);
    }

    pub fn intersects(&self, start: u64, end: u64) -> bool {
        self.map
            .range(..=end)
            .next_back()
            .map_or(false, |(_, &v)| v >= start)
    }

    /// Subtract `[start, end]`, splitting intervals that straddle the
    /// boundary.
    pub fn remove(&mut self, start: u64, end: u64) {
        let overlapping: Vec<u64> = self
            .map
            .range(..=end)
            .filter(|(_, &v)| v >= start)
            .map(|(&k, _)| k)
            .collect();
        for k in overlapping {
            let v = self.map.remove(&k).unwrap();
            if k < start {
                self.map.insert(k, start - 1);
            }
            if v > end {
                self.map.insert(end + 1, v);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<(u64, u64)> {
        self.map.iter().map(|(&k, &v)| (k, v)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Default bound on dirty bytes held in memory before writes spill to the
/// backing device.
pub const DEF_CACHE_BYTES: usize = 100 << 20;

/// Write-back sector cache between the engine and the backing device.
///
/// Writes land in memory and reach the backing device only on size
/// pressure, explicit flush, or disconnect. Exclusive interval locks keep
/// overlapping reads and writes from interleaving across suspension
/// points.
pub(crate) struct SectorCache<B> {
    base: Rc<B>,
    sector_size: usize,
    max_bytes: usize,

    bufs: RefCell<HashMap<u64, IoBuf>>,
    in_cache: RefCell<IntervalSet>,
    cur_bytes: Cell<usize>,

    locks: RangeLocks,
    write_back_m: AsyncMutex<()>,
    disconnect_m: AsyncMutex<()>,
    disconnected: Cell<bool>,
}

impl<B: BlockDevOps> SectorCache<B> {
    pub fn new(base: Rc<B>, sector_size: u32, max_bytes: usize) -> Self {
        SectorCache {
            base,
            sector_size: sector_size as usize,
            max_bytes,
            bufs: RefCell::new(HashMap::new()),
            cur_bytes: Cell::new(0),
            in_cache: RefCell::new(IntervalSet::default()),
            locks: RangeLocks::new(),
            write_back_m: AsyncMutex::new(()),
            disconnect_m: AsyncMutex::new(()),
            disconnected: Cell::new(false),
        }
    }

    #[cfg(test)]
    pub fn cached_bytes(&self) -> usize {
        self.cur_bytes.get()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.get()
    }

    fn sectors_of(&self, total: usize) -> u64 {
        debug_assert!(total % self.sector_size == 0 && total > 0);
        (total / self.sector_size) as u64
    }

    pub async fn read(&self, start: u64, bufs: &mut [&mut [u8]]) -> BdevResult<()> {
        if self.disconnected.get() {
            return Err(BdevError::Disconnected);
        }

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let end = start + self.sectors_of(total) - 1;
        let _guard = self.locks.lock(start, end).await;

        if !self.in_cache.borrow().intersects(start, end) {
            return self.base.read(start, bufs).await;
        }

        let mut sector = start;
        for buf in bufs.iter_mut() {
            for slice in buf.chunks_mut(self.sector_size) {
                let hit = match self.bufs.borrow().get(&sector) {
                    Some(cached) => {
                        slice.copy_from_slice(cached);
                        true
                    }
                    None => false,
                };
                if !hit {
                    self.base.read(sector, &mut [slice]).await?;
                }
                sector += 1;
            }
        }
        Ok(())
    }

    pub async fn write(&self, start: u64, bufs: &[&[u8]]) -> BdevResult<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        if self.cur_bytes.get() + total > self.max_bytes {
            log::warn!(
                "cache pressure: {} + {} bytes over {} limit, writing back",
                self.cur_bytes.get(),
                total,
                self.max_bytes
            );
            self.lazy_write_back().await?;
        }

        // The disconnect mutex blocks new entries once disconnect has
        // started; entries never appear after the final flush.
        let _disc = self.disconnect_m.lock().await;
        if self.disconnected.get() {
            return Err(BdevError::Disconnected);
        }

        let end = start + self.sectors_of(total) - 1;
        let _guard = self.locks.lock(start, end).await;

        let mut sector = start;
        for buf in bufs {
            for slice in buf.chunks(self.sector_size) {
                let mut cached = IoBuf::new(self.sector_size);
                cached.copy_from_slice(slice);
                if self.bufs.borrow_mut().insert(sector, cached).is_none() {
                    self.cur_bytes.set(self.cur_bytes.get() + self.sector_size);
                }
                sector += 1;
            }
        }
        self.in_cache.borrow_mut().insert(start, end);
        Ok(())
    }

    /// Flush every pending interval to the backing device as one coalesced
    /// write per interval. At most one traversal runs at a time.
    pub async fn lazy_write_back(&self) -> BdevResult<()> {
        let _wb = self.write_back_m.lock().await;

        let intervals = self.in_cache.borrow().to_vec();
        log::debug!("write back: {} intervals", intervals.len());

        for (x, y) in intervals {
            let _guard = self.locks.lock(x, y).await;

            let mut out: Vec<IoBuf> = Vec::with_capacity((y - x + 1) as usize);
            {
                let mut map = self.bufs.borrow_mut();
                for sector in x..=y {
                    match map.remove(&sector) {
                        Some(buf) => out.push(buf),
                        None => {
                            return Err(BdevError::Unknown(format!(
                                "pending interval [{}, {}] lost sector {}",
                                x, y, sector
                            )))
                        }
                    }
                }
            }
            self.in_cache.borrow_mut().remove(x, y);
            self.cur_bytes
                .set(self.cur_bytes.get() - out.len() * self.sector_size);

            let refs: Vec<&[u8]> = out.iter().map(|b| &b[..]).collect();
            self.base.write(x, &refs).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> BdevResult<()> {
        self.lazy_write_back().await?;
        self.base.flush().await
    }

    pub async fn disconnect(&self) -> BdevResult<()> {
        {
            let _disc = self.disconnect_m.lock().await;
            if self.disconnected.replace(true) {
                return Ok(());
            }
        }
        self.flush().await?;
        self.base.disconnect().await;
        Ok(())
    }
}
