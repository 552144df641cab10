//! Buffer cache.
//!
//! A fixed array of `NBUF` slots holding cached copies of file-system
//! sectors. Caching sectors in memory reduces the number of device reads and
//! gives every sector one synchronization point.
//!
//! Interface:
//! * `read`/`write` move whole sectors through the cache.
//! * `read_bytes`/`write_bytes` move sub-ranges of one sector.
//! * `tick` schedules a periodic write-back; the flush itself happens on the
//!   next write so it never runs in interrupt context.
//! * `disable` writes everything back and turns the cache off; from then on
//!   every operation goes straight to the device.
//!
//! Eviction is clock-like second chance: a cursor scans the array
//! circularly, sparing each recently-accessed slot once. The cursor is part
//! of the cache state so it persists across calls.

use array_macro::array;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::param::{CACHE_FLUSH_TICKS, NBUF, SECTOR_SIZE};
use crate::trace;
use std::sync::Arc;

struct BufSlot {
    sector: u32,
    in_use: bool,
    dirty: bool,
    access: bool,
    pin: bool,
    data: [u8; SECTOR_SIZE],
}

impl BufSlot {
    const fn new() -> Self {
        Self {
            sector: 0,
            in_use: false,
            dirty: false,
            access: false,
            pin: false,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct BcacheInner {
    slots: Box<[BufSlot; NBUF]>,
    enabled: bool,
    /// Clock hand for second-chance eviction.
    cursor: usize,
    ticks: u64,
    /// The next write flushes all dirty slots first.
    sync_write: bool,
}

pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    inner: Mutex<BcacheInner>,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            inner: Mutex::new(BcacheInner {
                slots: Box::new(array![_ => BufSlot::new(); NBUF]),
                enabled: false,
                cursor: 0,
                ticks: 0,
                sync_write: false,
            }),
        }
    }

    /// The device behind the cache.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Turns the cache on.
    pub fn enable(&self) {
        self.inner.lock().enabled = true;
    }

    /// Writes everything back and turns the cache off. Ordered before any
    /// subsequent raw-device access.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        if inner.enabled {
            self.sync_locked(&mut inner);
            inner.enabled = false;
        }
    }

    /// Writes all dirty slots back to the device.
    pub fn sync(&self) {
        let mut inner = self.inner.lock();
        if inner.enabled {
            self.sync_locked(&mut inner);
        }
    }

    /// Tick handler. Every `CACHE_FLUSH_TICKS` ticks, arms the periodic
    /// flush; the next write performs it.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        inner.ticks += 1;
        if inner.ticks % CACHE_FLUSH_TICKS == 0 {
            inner.sync_write = true;
        }
    }

    /// Reads sector `sector` into `buf`, which must hold one full sector.
    ///
    /// A miss loads the sector from the device and then triggers read-ahead
    /// of the next sector, which costs nothing extra if it is already
    /// cached.
    pub fn read(&self, sector: u32, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "Bcache::read");

        let mut inner = self.inner.lock();
        if !inner.enabled {
            drop(inner);
            self.dev.read(sector, buf);
            return;
        }

        let slot = match self.access(&mut inner, sector, true) {
            Some(slot) => slot,
            None => {
                // Nothing evictable; serve the read around the cache.
                drop(inner);
                self.dev.read(sector, buf);
                return;
            }
        };
        buf.copy_from_slice(&inner.slots[slot].data);

        if sector + 1 < self.dev.size() {
            let _ = self.access(&mut inner, sector + 1, true);
        }
    }

    /// Reads `buf.len()` bytes of sector `sector` starting at `ofs`.
    pub fn read_bytes(&self, sector: u32, ofs: usize, buf: &mut [u8]) {
        assert!(ofs + buf.len() <= SECTOR_SIZE, "Bcache::read_bytes");

        let mut inner = self.inner.lock();
        if !inner.enabled {
            drop(inner);
            let mut bounce = [0; SECTOR_SIZE];
            self.dev.read(sector, &mut bounce);
            buf.copy_from_slice(&bounce[ofs..ofs + buf.len()]);
            return;
        }

        let slot = self
            .access(&mut inner, sector, true)
            .expect("Bcache::read_bytes: cache access failed");
        buf.copy_from_slice(&inner.slots[slot].data[ofs..ofs + buf.len()]);
    }

    /// Writes `buf`, one full sector, to sector `sector`.
    ///
    /// The slot is populated without a device read since the write covers
    /// all of it. Callers of the raw device must not race this.
    pub fn write(&self, sector: u32, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "Bcache::write");

        let mut inner = self.inner.lock();
        if !inner.enabled {
            drop(inner);
            self.dev.write(sector, buf);
            return;
        }

        let slot = match self.access(&mut inner, sector, false) {
            Some(slot) => slot,
            None => {
                drop(inner);
                self.dev.write(sector, buf);
                return;
            }
        };
        inner.slots[slot].data.copy_from_slice(buf);
        inner.slots[slot].dirty = true;

        if inner.sync_write {
            self.sync_locked(&mut inner);
            inner.sync_write = false;
        }
    }

    /// Writes `buf.len()` bytes to sector `sector` starting at `ofs`.
    pub fn write_bytes(&self, sector: u32, ofs: usize, buf: &[u8]) {
        assert!(ofs + buf.len() <= SECTOR_SIZE, "Bcache::write_bytes");

        let mut inner = self.inner.lock();
        if !inner.enabled {
            drop(inner);
            let mut bounce = [0; SECTOR_SIZE];
            self.dev.read(sector, &mut bounce);
            bounce[ofs..ofs + buf.len()].copy_from_slice(buf);
            self.dev.write(sector, &bounce);
            return;
        }

        // A partial write needs the rest of the sector, so populate with a
        // device read on miss.
        let slot = self
            .access(&mut inner, sector, true)
            .expect("Bcache::write_bytes: cache access failed");
        inner.slots[slot].data[ofs..ofs + buf.len()].copy_from_slice(buf);
        inner.slots[slot].dirty = true;

        if inner.sync_write {
            self.sync_locked(&mut inner);
            inner.sync_write = false;
        }
    }

    /// Finds the slot caching `sector`, loading it first on a miss. `read`
    /// controls whether a miss populates the slot from the device. Returns
    /// `None` if every slot is pinned.
    fn access(&self, inner: &mut BcacheInner, sector: u32, read: bool) -> Option<usize> {
        let found = inner
            .slots
            .iter()
            .position(|slot| slot.in_use && slot.sector == sector);

        let slot = match found {
            Some(slot) => slot,
            None => {
                let slot = self.evict(inner)?;
                let entry = &mut inner.slots[slot];
                entry.in_use = true;
                entry.sector = sector;
                entry.dirty = false;
                entry.access = false;
                entry.pin = false;
                if read {
                    self.dev.read(sector, &mut entry.data);
                }
                slot
            }
        };

        inner.slots[slot].access = true;
        Some(slot)
    }

    /// Second-chance scan for a reusable slot. Examines at most `2 * NBUF`
    /// slots; returns `None` if every one of them is pinned.
    fn evict(&self, inner: &mut BcacheInner) -> Option<usize> {
        let mut hand = inner.cursor % NBUF;

        for _ in 0..2 * NBUF {
            let i = hand % NBUF;
            hand += 1;

            let slot = &mut inner.slots[i];
            if !slot.in_use {
                inner.cursor = hand;
                return Some(i);
            }
            if slot.pin {
                continue;
            }
            if slot.access {
                slot.access = false;
                continue;
            }

            if slot.dirty {
                trace!("bcache: write back sector {}", slot.sector);
                self.dev.write(slot.sector, &slot.data);
                slot.dirty = false;
            }
            slot.in_use = false;
            inner.cursor = hand;
            return Some(i);
        }

        inner.cursor = hand;
        None
    }

    fn sync_locked(&self, inner: &mut BcacheInner) {
        for slot in inner.slots.iter_mut() {
            if slot.dirty {
                self.dev.write(slot.sector, &slot.data);
                slot.dirty = false;
            }
        }
    }
}
