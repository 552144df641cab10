//! Free-sector map.
//!
//! One bit per file-system sector, persisted in `FREE_MAP_SECTOR`. The
//! in-memory image is the on-disk sector itself; every change is written
//! through the buffer cache so a flush always has a current map to push out.

use spin::Mutex;
use std::sync::Arc;

use crate::bio::Bcache;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SECTOR_SIZE};

struct FreeMapInner {
    /// The on-disk image: bit `s` set means sector `s` is allocated.
    bits: [u8; SECTOR_SIZE],
    sectors: u32,
}

impl FreeMapInner {
    fn test(&self, sector: u32) -> bool {
        self.bits[sector as usize / 8] & (1 << (sector % 8)) != 0
    }

    fn mark(&mut self, sector: u32, used: bool) {
        let mask = 1 << (sector % 8);
        if used {
            self.bits[sector as usize / 8] |= mask;
        } else {
            self.bits[sector as usize / 8] &= !mask;
        }
    }
}

pub struct FreeMap {
    cache: Arc<Bcache>,
    inner: Mutex<FreeMapInner>,
}

impl FreeMap {
    /// Creates a fresh map for a device of `sectors` sectors, with the map
    /// sector and the root-directory sector pre-allocated, and persists it.
    pub fn format(cache: Arc<Bcache>, sectors: u32) -> Self {
        assert!(
            sectors as usize <= SECTOR_SIZE * 8,
            "free map does not fit in one sector"
        );
        let map = Self {
            cache,
            inner: Mutex::new(FreeMapInner {
                bits: [0; SECTOR_SIZE],
                sectors,
            }),
        };
        {
            let mut inner = map.inner.lock();
            inner.mark(FREE_MAP_SECTOR, true);
            inner.mark(ROOT_DIR_SECTOR, true);
            map.write_back(&inner);
        }
        map
    }

    /// Loads the map from disk.
    pub fn open(cache: Arc<Bcache>, sectors: u32) -> Self {
        let mut bits = [0; SECTOR_SIZE];
        cache.read(FREE_MAP_SECTOR, &mut bits);
        Self {
            cache,
            inner: Mutex::new(FreeMapInner { bits, sectors }),
        }
    }

    /// Allocates one sector. Returns `None` when the map is exhausted.
    pub fn allocate(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let sector = (0..inner.sectors).find(|&s| !inner.test(s))?;
        inner.mark(sector, true);
        self.write_back(&inner);
        Some(sector)
    }

    /// Returns `sector` to the map.
    pub fn release(&self, sector: u32) {
        let mut inner = self.inner.lock();
        assert!(inner.test(sector), "releasing a free sector");
        inner.mark(sector, false);
        self.write_back(&inner);
    }

    /// Whether `sector` is marked allocated.
    pub fn is_allocated(&self, sector: u32) -> bool {
        self.inner.lock().test(sector)
    }

    /// Number of allocated sectors. For assertions and tests.
    pub fn used(&self) -> usize {
        let inner = self.inner.lock();
        (0..inner.sectors).filter(|&s| inner.test(s)).count()
    }

    fn write_back(&self, inner: &FreeMapInner) {
        self.cache.write(FREE_MAP_SECTOR, &inner.bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDisk};

    fn setup() -> (Arc<Bcache>, FreeMap) {
        let disk = Arc::new(MemDisk::new(64));
        let cache = Arc::new(Bcache::new(disk as Arc<dyn BlockDevice>));
        cache.enable();
        let map = FreeMap::format(Arc::clone(&cache), 64);
        (cache, map)
    }

    #[test]
    fn reserved_sectors_start_allocated() {
        let (_cache, map) = setup();
        assert_eq!(map.used(), 2);
        let first = map.allocate().unwrap();
        assert!(first > ROOT_DIR_SECTOR);
    }

    #[test]
    fn allocate_release_round_trip() {
        let (_cache, map) = setup();
        let a = map.allocate().unwrap();
        let b = map.allocate().unwrap();
        assert_ne!(a, b);
        map.release(a);
        assert_eq!(map.allocate(), Some(a));
        map.release(a);
        map.release(b);
        assert_eq!(map.used(), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_cache, map) = setup();
        for _ in 0..62 {
            assert!(map.allocate().is_some());
        }
        assert_eq!(map.allocate(), None);
    }

    #[test]
    fn map_survives_reopen() {
        let (cache, map) = setup();
        let a = map.allocate().unwrap();
        let reopened = FreeMap::open(Arc::clone(&cache), 64);
        assert_eq!(reopened.used(), 3);
        reopened.release(a);
        assert_eq!(reopened.used(), 2);
    }
}
