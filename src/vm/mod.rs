//! Virtual memory: user-frame pool, frame table with second-chance
//! eviction, swap partition, per-process page directories and supplemental
//! page tables, and memory-mapped files.

use std::sync::Arc;

use crate::device::BlockDevice;
use crate::vm::frame::{FrameTable, UserPool};
use crate::vm::page::SuppTable;
use crate::vm::pagedir::PageDir;
use crate::vm::swap::SwapTable;

pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod swap;

/// VM root handle: the machine-wide pieces every process shares.
pub struct Vm {
    pool: Arc<UserPool>,
    frames: Arc<FrameTable>,
    swap: Arc<SwapTable>,
}

impl Vm {
    /// Builds the VM over `swap_dev` with a budget of `user_frames` frames.
    pub fn new(swap_dev: Arc<dyn BlockDevice>, user_frames: usize) -> Arc<Self> {
        let pool = UserPool::new(user_frames);
        let swap = Arc::new(SwapTable::new(swap_dev));
        let frames = Arc::new(FrameTable::new(Arc::clone(&pool), Arc::clone(&swap)));
        Arc::new(Self { pool, frames, swap })
    }

    pub fn pool(&self) -> &Arc<UserPool> {
        &self.pool
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn swap(&self) -> &Arc<SwapTable> {
        &self.swap
    }

    /// A supplemental table for a new process, with its own page directory.
    pub fn new_supp_table(&self) -> SuppTable {
        SuppTable::new(
            Arc::clone(&self.frames),
            Arc::clone(&self.swap),
            Arc::new(PageDir::new()),
        )
    }
}
