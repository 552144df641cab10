//! Swap partition.
//!
//! The swap device stores one page per slot, `PAGE_SECTORS` consecutive
//! sectors starting at `slot * PAGE_SECTORS`, with no on-disk header. A
//! bitmap marks each slot busy or free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitmaps::Bitmap;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::param::{NSWAP, PAGE_SECTORS, SECTOR_SIZE};
use crate::trace;
use crate::vm::frame::Page;

pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    /// Page slots on the device, at most `NSWAP`.
    pages: usize,
    map: Mutex<Bitmap<NSWAP>>,
    installs: AtomicUsize,
    uninstalls: AtomicUsize,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let pages = (dev.size() as usize / PAGE_SECTORS).min(NSWAP);
        Self {
            dev,
            pages,
            map: Mutex::new(Bitmap::new()),
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
        }
    }

    /// Slot capacity of the partition.
    pub fn pages(&self) -> usize {
        self.pages
    }

    fn slot_sector(&self, index: usize) -> u32 {
        debug_assert!(index < self.pages);
        (index * PAGE_SECTORS) as u32
    }

    /// Copies `page` into a free slot and returns its index. Swap-space
    /// exhaustion is unrecoverable.
    pub fn install(&self, page: &Page) -> usize {
        let index = {
            let mut map = self.map.lock();
            let index = map
                .first_false_index()
                .filter(|&index| index < self.pages)
                .expect("swap: out of swap space");
            let _ = map.set(index, true);
            index
        };
        trace!("swap: install slot {}", index);

        let sector = self.slot_sector(index);
        for i in 0..PAGE_SECTORS {
            self.dev
                .write(sector + i as u32, &page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
        let _ = self.installs.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Reads slot `index` back into `page` and frees the slot.
    pub fn uninstall(&self, index: usize, page: &mut Page) {
        assert!(index < self.pages, "swap: slot out of range");
        assert!(self.map.lock().get(index), "swap: uninstalling a free slot");
        trace!("swap: uninstall slot {}", index);

        let sector = self.slot_sector(index);
        for i in 0..PAGE_SECTORS {
            self.dev.read(
                sector + i as u32,
                &mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        let _ = self.map.lock().set(index, false);
        let _ = self.uninstalls.fetch_add(1, Ordering::SeqCst);
    }

    /// Frees slot `index` without reading it; used when the owner exits
    /// while the page is swapped out.
    pub fn remove(&self, index: usize) {
        assert!(index < self.pages, "swap: slot out of range");
        let mut map = self.map.lock();
        assert!(map.get(index), "swap: removing a free slot");
        let _ = map.set(index, false);
    }

    /// Pages copied out so far.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Pages read back so far.
    pub fn uninstall_count(&self) -> usize {
        self.uninstalls.load(Ordering::SeqCst)
    }

    /// Busy slots. For assertions and tests.
    pub fn used(&self) -> usize {
        let map = self.map.lock();
        (0..self.pages).filter(|&index| map.get(index)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn table(pages: usize) -> SwapTable {
        let dev = Arc::new(MemDisk::new((pages * PAGE_SECTORS) as u32));
        SwapTable::new(dev as Arc<dyn BlockDevice>)
    }

    #[test]
    fn page_round_trips_through_a_slot() {
        let swap = table(4);
        let mut page = Page::DEFAULT;
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let index = swap.install(&page);
        let mut back = Page::DEFAULT;
        swap.uninstall(index, &mut back);
        assert!(page.iter().eq(back.iter()));
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn slots_are_reused_after_remove() {
        let swap = table(2);
        let page = Page::DEFAULT;
        let a = swap.install(&page);
        let b = swap.install(&page);
        assert_ne!(a, b);
        swap.remove(a);
        assert_eq!(swap.install(&page), a);
    }

    #[test]
    #[should_panic(expected = "out of swap space")]
    fn exhaustion_panics() {
        let swap = table(1);
        let page = Page::DEFAULT;
        let _ = swap.install(&page);
        let _ = swap.install(&page);
    }
}
