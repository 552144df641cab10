//! Physical user-frame pool and the global frame table.
//!
//! The pool hands out whole 4096-byte pages from a bounded budget; a page
//! returns to the budget when its `KPage` handle drops. Every loaded
//! supplemental entry is linked into one global list, the eviction pool.
//!
//! Victim selection is second chance: pop the head; a pinned entry rotates
//! to the tail, an entry whose hardware accessed bit is set loses the bit
//! and rotates, anything else is the victim. The list order makes the scan
//! fair: a frame spared once comes around again only after every other
//! candidate has been probed.

use core::ops::{Deref, DerefMut};
use std::collections::VecDeque;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::param::PGSIZE;
use crate::trace;
use crate::vm::page::{EvictOutcome, SuppEntry};
use crate::vm::swap::SwapTable;

bitflags! {
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Hand the page out zeroed.
        const ZERO = 1 << 1;
    }
}

/// Page type.
#[repr(align(4096))]
pub struct Page {
    inner: [u8; PGSIZE],
}

impl Page {
    pub const DEFAULT: Self = Self { inner: [0; PGSIZE] };
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Bounded budget of user frames.
pub struct UserPool {
    capacity: usize,
    avail: Mutex<usize>,
}

impl UserPool {
    pub fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: frames,
            avail: Mutex::new(frames),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.avail.lock()
    }

    /// Takes one frame from the budget. `None` when the pool is dry.
    fn get(self: &Arc<Self>, flags: AllocFlags) -> Option<KPage> {
        assert!(flags.contains(AllocFlags::USER), "UserPool::get");
        let mut avail = self.avail.lock();
        if *avail == 0 {
            return None;
        }
        *avail -= 1;
        drop(avail);

        // Fresh pages are zeroed either way; ZERO is a documented promise,
        // not extra work, in the hosted pool.
        Some(KPage {
            page: Box::new(Page::DEFAULT),
            pool: Arc::clone(self),
        })
    }
}

/// An owned user frame. Dropping it returns the frame to the pool.
pub struct KPage {
    page: Box<Page>,
    pool: Arc<UserPool>,
}

impl Deref for KPage {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl DerefMut for KPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.page
    }
}

impl Drop for KPage {
    fn drop(&mut self) {
        *self.pool.avail.lock() += 1;
    }
}

/// The global eviction pool: every frame-resident supplemental entry.
pub struct FrameTable {
    pool: Arc<UserPool>,
    swap: Arc<SwapTable>,
    list: Mutex<VecDeque<Arc<SuppEntry>>>,
}

impl FrameTable {
    pub fn new(pool: Arc<UserPool>, swap: Arc<SwapTable>) -> Self {
        Self {
            pool,
            swap,
            list: Mutex::new(VecDeque::new()),
        }
    }

    /// Allocates a frame, or fails when the pool is dry.
    pub fn allocate(&self, flags: AllocFlags) -> Option<KPage> {
        self.pool.get(flags)
    }

    /// Allocates a frame, evicting until one is free. Panics if nothing can
    /// be evicted; callers must keep pinning bounded.
    pub fn allocate_or_evict(&self, flags: AllocFlags) -> KPage {
        loop {
            if let Some(kpage) = self.pool.get(flags) {
                return kpage;
            }
            trace!("frame table: memory full, evicting");
            assert!(self.evict(), "frame table: every frame is pinned");
        }
    }

    /// Links a freshly loaded entry into the eviction pool.
    pub fn link(&self, entry: Arc<SuppEntry>) {
        self.list.lock().push_back(entry);
    }

    /// Unlinks an entry on unload; a no-op if an eviction already popped it.
    pub fn unlink(&self, entry: &Arc<SuppEntry>) {
        self.list
            .lock()
            .retain(|other| !Arc::ptr_eq(other, entry));
    }

    /// Second-chance eviction. Returns whether a frame was freed. Examines
    /// at most two full rounds of the pool before giving up.
    fn evict(&self) -> bool {
        let bound = 2 * self.list.lock().len();
        for _ in 0..bound.max(1) {
            let victim = match self.list.lock().pop_front() {
                Some(victim) => victim,
                None => return false,
            };
            match victim.try_evict(&self.swap) {
                EvictOutcome::Evicted => return true,
                EvictOutcome::Spared => self.list.lock().push_back(victim),
                // The owner unloaded it between pop and probe.
                EvictOutcome::Stale => {}
            }
        }
        false
    }

    /// Frames currently linked. For assertions and tests.
    pub fn resident(&self) -> usize {
        self.list.lock().len()
    }
}
