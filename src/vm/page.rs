//! Supplemental page table.
//!
//! The page directory records only what the hardware needs; this table
//! supplements it with where each user page actually lives and how to bring
//! it back. Each entry combines a state, `NotLoaded`/`Loaded`/`Swapped`,
//! with a type, `Normal`/`Zero`/`Code`/`Mmap`. The state carries the frame
//! or the swap slot, so an entry cannot be loaded without a frame or swapped
//! without a slot. Mmap pages never enter swap at all: eviction writes them
//! back to their file and discards them.
//!
//! The fault handler resolves a page-aligned fault address: file-backed
//! pages load lazily from their backing file, swapped pages come back from
//! the swap partition, anything else is unhandled and the process dies.

use core::mem;
use std::collections::HashMap;
use std::sync::Arc;

use spin::Mutex;

use crate::file::File;
use crate::param::{pg_ofs, pg_round_down, PGSIZE, USER_TOP};
use crate::vm::frame::{AllocFlags, FrameTable, KPage};
use crate::vm::pagedir::PageDir;
use crate::vm::swap::SwapTable;
use crate::{trace, Error};

/// File identity behind a `Code` or `Mmap` page.
pub struct FileBacking {
    pub file: Arc<File>,
    pub offset: u32,
    /// Bytes read from the file at `offset`; the rest of the page is zero.
    pub read_bytes: u32,
    pub zero_bytes: u32,
}

pub(crate) enum PageType {
    /// Plain anonymous memory.
    Normal,
    /// Anonymous memory that starts zeroed; once faulted in it behaves like
    /// `Normal`.
    Zero,
    /// Lazily loaded from an executable image; evicted to swap.
    Code(FileBacking),
    /// Backed by a file; written back there on eviction, never swapped.
    Mmap(FileBacking),
}

pub(crate) enum PageState {
    NotLoaded,
    Loaded(KPage),
    Swapped(usize),
}

pub(crate) struct EntryInner {
    pub(crate) state: PageState,
    pub(crate) typ: PageType,
    pub(crate) writable: bool,
    pub(crate) pinned: bool,
    /// Sticky software dirty bit; kernel-mode stores bypass the hardware
    /// bit, and the hardware bit dies with the mapping.
    pub(crate) dirty: bool,
}

pub struct SuppEntry {
    upage: usize,
    /// The owner's page directory; eviction reaches the victim's address
    /// space through this.
    pagedir: Arc<PageDir>,
    pub(crate) inner: Mutex<EntryInner>,
}

pub(crate) enum EvictOutcome {
    Evicted,
    Spared,
    Stale,
}

impl SuppEntry {
    pub fn upage(&self) -> usize {
        self.upage
    }

    /// Second-chance probe and, on election, the eviction itself. Called by
    /// the frame table with no list lock held.
    pub(crate) fn try_evict(&self, swap: &SwapTable) -> EvictOutcome {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, PageState::Loaded(_)) {
            return EvictOutcome::Stale;
        }
        if inner.pinned {
            return EvictOutcome::Spared;
        }
        if self.pagedir.test_and_clear_accessed(self.upage) {
            return EvictOutcome::Spared;
        }

        let kpage = match mem::replace(&mut inner.state, PageState::NotLoaded) {
            PageState::Loaded(kpage) => kpage,
            _ => unreachable!(),
        };

        match &inner.typ {
            PageType::Mmap(backing) => {
                trace!("evict: write back mmap page {:#x}", self.upage);
                let dirty = inner.dirty || self.pagedir.is_dirty(self.upage);
                if dirty {
                    let n = backing
                        .file
                        .write_at(&kpage[..backing.read_bytes as usize], backing.offset);
                    assert_eq!(n, backing.read_bytes as usize, "mmap write-back");
                }
                inner.dirty = false;
                self.pagedir.clear_page(self.upage);
            }
            _ => {
                trace!("evict: swap out page {:#x}", self.upage);
                let index = swap.install(&kpage);
                self.pagedir.clear_page(self.upage);
                inner.state = PageState::Swapped(index);
            }
        }
        // The frame goes back to the pool here.
        drop(kpage);
        EvictOutcome::Evicted
    }
}

/// Per-process sparse map from user page base to its supplemental entry.
pub struct SuppTable {
    frames: Arc<FrameTable>,
    swap: Arc<SwapTable>,
    pagedir: Arc<PageDir>,
    entries: Mutex<HashMap<usize, Arc<SuppEntry>>>,
}

impl SuppTable {
    pub fn new(frames: Arc<FrameTable>, swap: Arc<SwapTable>, pagedir: Arc<PageDir>) -> Self {
        Self {
            frames,
            swap,
            pagedir,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn pagedir(&self) -> &Arc<PageDir> {
        &self.pagedir
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, upage: usize, typ: PageType, writable: bool) -> Result<Arc<SuppEntry>, Error> {
        if pg_ofs(upage) != 0 || upage >= USER_TOP {
            return Err(Error::Invalid);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return Err(Error::AlreadyExists);
        }
        let entry = Arc::new(SuppEntry {
            upage,
            pagedir: Arc::clone(&self.pagedir),
            inner: Mutex::new(EntryInner {
                state: PageState::NotLoaded,
                typ,
                writable,
                pinned: false,
                dirty: false,
            }),
        });
        let _ = entries.insert(upage, Arc::clone(&entry));
        Ok(entry)
    }

    /// Registers one lazily loaded page of an executable image.
    pub fn insert_code(
        &self,
        file: Arc<File>,
        offset: u32,
        upage: usize,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<(), Error> {
        assert_eq!(read_bytes as usize + zero_bytes as usize, PGSIZE);
        let backing = FileBacking {
            file,
            offset,
            read_bytes,
            zero_bytes,
        };
        let _ = self.insert(upage, PageType::Code(backing), writable)?;
        Ok(())
    }

    /// Registers one page of a memory-mapped file.
    pub fn insert_mmap(
        &self,
        file: Arc<File>,
        offset: u32,
        upage: usize,
        read_bytes: u32,
        zero_bytes: u32,
    ) -> Result<(), Error> {
        assert_eq!(read_bytes as usize + zero_bytes as usize, PGSIZE);
        let backing = FileBacking {
            file,
            offset,
            read_bytes,
            zero_bytes,
        };
        let _ = self.insert(upage, PageType::Mmap(backing), true)?;
        Ok(())
    }

    /// Registers `read_bytes + zero_bytes` bytes of file-backed pages
    /// starting at `upage`: `read_bytes` from the file at `ofs`, the rest
    /// zeroed. All target pages must be unmapped; nothing is inserted
    /// otherwise.
    pub fn insert_segment(
        &self,
        file: Arc<File>,
        ofs: u32,
        upage: usize,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
        mmap: bool,
    ) -> Result<(), Error> {
        assert_eq!((read_bytes as usize + zero_bytes as usize) % PGSIZE, 0);
        assert_eq!(pg_ofs(upage), 0);
        assert_eq!(ofs as usize % PGSIZE, 0);

        let pages = (read_bytes as usize + zero_bytes as usize) / PGSIZE;
        {
            let entries = self.entries.lock();
            for i in 0..pages {
                let page = upage + i * PGSIZE;
                if page >= USER_TOP || entries.contains_key(&page) {
                    return Err(Error::AlreadyExists);
                }
            }
        }

        let mut read_left = read_bytes;
        for i in 0..pages {
            let page = upage + i * PGSIZE;
            let page_read = read_left.min(PGSIZE as u32);
            let page_zero = PGSIZE as u32 - page_read;
            let offset = ofs + (i * PGSIZE) as u32;
            if mmap {
                self.insert_mmap(Arc::clone(&file), offset, page, page_read, page_zero)?;
            } else {
                self.insert_code(
                    Arc::clone(&file),
                    offset,
                    page,
                    page_read,
                    page_zero,
                    writable,
                )?;
            }
            read_left -= page_read;
        }
        Ok(())
    }

    /// Registers one stack page, zeroed if `zero`, and loads it at once so
    /// it is present for the access about to happen.
    pub fn insert_stack(&self, upage: usize, zero: bool) -> Result<(), Error> {
        let typ = if zero { PageType::Zero } else { PageType::Normal };
        let entry = self.insert(upage, typ, true)?;
        let mut inner = entry.inner.lock();
        if !self.load_zero(&entry, &mut inner) {
            drop(inner);
            let _ = self.entries.lock().remove(&upage);
            return Err(Error::NoMemory);
        }
        Ok(())
    }

    /// Pins or unpins a page, fencing it from eviction. Returns whether the
    /// page is known.
    pub fn set_pin(&self, upage: usize, pinned: bool) -> bool {
        let entry = match self.entries.lock().get(&upage) {
            Some(entry) => Arc::clone(entry),
            None => return false,
        };
        entry.inner.lock().pinned = pinned;
        true
    }

    /// Resolves a fault at `addr`. Returns whether it was handled.
    pub fn page_fault(&self, addr: usize) -> bool {
        if addr >= USER_TOP {
            return false;
        }
        let upage = pg_round_down(addr);
        let entry = match self.entries.lock().get(&upage) {
            Some(entry) => Arc::clone(entry),
            None => return false,
        };
        let mut inner = entry.inner.lock();
        match (&inner.state, &inner.typ) {
            (PageState::NotLoaded, PageType::Code(_)) | (PageState::NotLoaded, PageType::Mmap(_)) => {
                self.load_file(&entry, &mut inner)
            }
            (PageState::Swapped(_), _) => self.unswap(&entry, &mut inner),
            _ => false,
        }
    }

    /// Loads a file-backed page: frame, file read, zero tail, install.
    fn load_file(&self, entry: &Arc<SuppEntry>, inner: &mut EntryInner) -> bool {
        let mut kpage = self.frames.allocate_or_evict(AllocFlags::USER);
        let backing = match &inner.typ {
            PageType::Code(backing) | PageType::Mmap(backing) => backing,
            _ => unreachable!("load_file on an anonymous page"),
        };
        trace!("load file page {:#x} ofs {}", entry.upage, backing.offset);

        let read_bytes = backing.read_bytes as usize;
        if backing.file.read_at(&mut kpage[..read_bytes], backing.offset) != read_bytes {
            return false;
        }
        kpage[read_bytes..].fill(0);

        if !self.pagedir.set_page(entry.upage, inner.writable) {
            return false;
        }
        inner.state = PageState::Loaded(kpage);
        self.frames.link(Arc::clone(entry));
        true
    }

    /// Loads an anonymous page as zeros.
    fn load_zero(&self, entry: &Arc<SuppEntry>, inner: &mut EntryInner) -> bool {
        let kpage = self
            .frames
            .allocate_or_evict(AllocFlags::USER | AllocFlags::ZERO);
        if !self.pagedir.set_page(entry.upage, inner.writable) {
            return false;
        }
        inner.state = PageState::Loaded(kpage);
        self.frames.link(Arc::clone(entry));
        true
    }

    /// Brings a swapped page back: frame, install, slot read, slot free.
    ///
    /// The allocation may evict other pages, never this one; a swapped entry
    /// carries no frame.
    fn unswap(&self, entry: &Arc<SuppEntry>, inner: &mut EntryInner) -> bool {
        let index = match inner.state {
            PageState::Swapped(index) => index,
            _ => unreachable!("unswap of a resident page"),
        };
        trace!("unswap page {:#x} from slot {}", entry.upage, index);

        let mut kpage = self.frames.allocate_or_evict(AllocFlags::USER);
        if !self.pagedir.set_page(entry.upage, inner.writable) {
            return false;
        }
        self.swap.uninstall(index, &mut kpage);
        inner.state = PageState::Loaded(kpage);
        self.frames.link(Arc::clone(entry));
        true
    }

    /// Unloads and forgets one page. Loaded mmap pages are written back if
    /// dirty; swapped pages give their slot up. Returns whether the page was
    /// known.
    pub fn destroy(&self, upage: usize) -> bool {
        let entry = match self.entries.lock().remove(&upage) {
            Some(entry) => entry,
            None => return false,
        };
        self.destroy_entry(&entry);
        true
    }

    /// Tears every page down; the page directory itself goes last.
    pub fn destroy_all(&self) {
        let entries: Vec<_> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            self.destroy_entry(entry);
        }
        self.pagedir.destroy();
    }

    fn destroy_entry(&self, entry: &Arc<SuppEntry>) {
        let mut inner = entry.inner.lock();
        match mem::replace(&mut inner.state, PageState::NotLoaded) {
            PageState::Loaded(kpage) => {
                if let PageType::Mmap(backing) = &inner.typ {
                    let dirty = inner.dirty || self.pagedir.is_dirty(entry.upage);
                    if dirty {
                        let n = backing
                            .file
                            .write_at(&kpage[..backing.read_bytes as usize], backing.offset);
                        assert_eq!(n, backing.read_bytes as usize, "mmap write-back");
                    }
                }
                self.pagedir.clear_page(entry.upage);
                self.frames.unlink(entry);
                drop(kpage);
            }
            PageState::Swapped(index) => self.swap.remove(index),
            PageState::NotLoaded => {}
        }
    }

    /// Runs `f` on the loaded entry covering `upage`, faulting it in first
    /// if needed. The entry lock is held across `f`, so eviction cannot pull
    /// the frame out from under the access.
    fn with_loaded<R>(
        &self,
        upage: usize,
        f: impl FnOnce(&mut EntryInner) -> Result<R, Error>,
    ) -> Result<R, Error> {
        if upage >= USER_TOP {
            return Err(Error::FaultUnhandled);
        }
        let entry = match self.entries.lock().get(&upage) {
            Some(entry) => Arc::clone(entry),
            None => return Err(Error::FaultUnhandled),
        };
        let mut inner = entry.inner.lock();
        if !matches!(inner.state, PageState::Loaded(_)) {
            let handled = match (&inner.state, &inner.typ) {
                (PageState::NotLoaded, PageType::Code(_))
                | (PageState::NotLoaded, PageType::Mmap(_)) => self.load_file(&entry, &mut inner),
                (PageState::Swapped(_), _) => self.unswap(&entry, &mut inner),
                _ => false,
            };
            if !handled {
                return Err(Error::FaultUnhandled);
            }
        }
        f(&mut inner)
    }

    /// Copies `buf` into user memory at `addr`, faulting pages in as
    /// needed. Fails on unmapped or read-only pages.
    pub fn write_user(&self, addr: usize, buf: &[u8]) -> Result<(), Error> {
        let mut at = addr;
        let mut done = 0;
        while done < buf.len() {
            let upage = pg_round_down(at);
            let ofs = at - upage;
            let n = (PGSIZE - ofs).min(buf.len() - done);
            self.with_loaded(upage, |inner| {
                if !inner.writable {
                    return Err(Error::FaultUnhandled);
                }
                let kpage = match &mut inner.state {
                    PageState::Loaded(kpage) => kpage,
                    _ => unreachable!(),
                };
                kpage[ofs..ofs + n].copy_from_slice(&buf[done..done + n]);
                inner.dirty = true;
                self.pagedir.set_accessed(upage);
                self.pagedir.set_dirty(upage);
                Ok(())
            })?;
            at += n;
            done += n;
        }
        Ok(())
    }

    /// Copies user memory at `addr` into `buf`, faulting pages in as
    /// needed.
    pub fn read_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), Error> {
        let mut at = addr;
        let mut done = 0;
        while done < buf.len() {
            let upage = pg_round_down(at);
            let ofs = at - upage;
            let n = (PGSIZE - ofs).min(buf.len() - done);
            self.with_loaded(upage, |inner| {
                let kpage = match &inner.state {
                    PageState::Loaded(kpage) => kpage,
                    _ => unreachable!(),
                };
                buf[done..done + n].copy_from_slice(&kpage[ofs..ofs + n]);
                self.pagedir.set_accessed(upage);
                Ok(())
            })?;
            at += n;
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDisk};
    use crate::param::PAGE_SECTORS;
    use crate::vm::frame::UserPool;

    fn supp_table(frames: usize, swap_pages: usize) -> SuppTable {
        let pool = UserPool::new(frames);
        let swap_dev =
            Arc::new(MemDisk::new((swap_pages * PAGE_SECTORS) as u32)) as Arc<dyn BlockDevice>;
        let swap = Arc::new(SwapTable::new(swap_dev));
        let frames = Arc::new(FrameTable::new(pool, Arc::clone(&swap)));
        SuppTable::new(frames, swap, Arc::new(PageDir::new()))
    }

    const P0: usize = 0x1000_0000;
    const P1: usize = P0 + PGSIZE;
    const P2: usize = P0 + 2 * PGSIZE;

    #[test]
    fn second_chance_spares_the_accessed_page() {
        let supp = supp_table(2, 8);
        supp.insert_stack(P0, true).unwrap();
        supp.insert_stack(P1, true).unwrap();

        // Touch P0 so its accessed bit is set; P1 stays cold.
        let mut byte = [0u8; 1];
        supp.read_user(P0, &mut byte).unwrap();

        // The third page forces one eviction: P0 is probed first, spared,
        // and P1 goes to swap.
        supp.insert_stack(P2, true).unwrap();
        assert!(supp.pagedir().is_mapped(P0));
        assert!(!supp.pagedir().is_mapped(P1));
        assert!(supp.pagedir().is_mapped(P2));
    }

    #[test]
    fn swapped_page_keeps_its_bytes() {
        let supp = supp_table(1, 8);
        supp.insert_stack(P0, true).unwrap();
        supp.write_user(P0, b"first page").unwrap();

        // P1 displaces P0; the fault on the read brings P0 back.
        supp.insert_stack(P1, true).unwrap();
        assert!(!supp.pagedir().is_mapped(P0));

        let mut out = [0u8; 10];
        supp.read_user(P0, &mut out).unwrap();
        assert_eq!(&out, b"first page");
    }

    #[test]
    fn pinned_page_is_skipped_by_eviction() {
        let supp = supp_table(2, 8);
        supp.insert_stack(P0, true).unwrap();
        assert!(supp.set_pin(P0, true));
        supp.insert_stack(P1, true).unwrap();

        supp.insert_stack(P2, true).unwrap();
        assert!(supp.pagedir().is_mapped(P0), "pinned page was evicted");
        assert!(!supp.pagedir().is_mapped(P1));
    }

    #[test]
    fn destroy_releases_the_swap_slot() {
        let supp = supp_table(1, 8);
        supp.insert_stack(P0, true).unwrap();
        supp.insert_stack(P1, true).unwrap();
        assert_eq!(supp.swap.used(), 1);

        assert!(supp.destroy(P0));
        assert_eq!(supp.swap.used(), 0);
        assert!(!supp.destroy(P0));
    }

    #[test]
    fn teardown_releases_everything() {
        let supp = supp_table(2, 8);
        for i in 0..5 {
            supp.insert_stack(P0 + i * PGSIZE, true).unwrap();
        }
        supp.destroy_all();
        assert!(supp.is_empty());
        assert_eq!(supp.swap.used(), 0);
        assert_eq!(supp.frames.resident(), 0);
    }
}
