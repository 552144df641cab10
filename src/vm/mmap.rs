//! Memory-mapped files.
//!
//! A mapping covers `round_up(file length)` bytes of user pages backed by a
//! duplicate of the file handle, so the mapping's position is independent of
//! the descriptor it was created from. The final page's zero tail is the
//! rounding slack. Destroying the mapping tears the pages down, writing
//! loaded dirty ones back, and closes the backing handle last.

use std::sync::Arc;

use crate::file::File;
use crate::fs::Itable;
use crate::param::{pg_ofs, pg_round_up, PGSIZE};
use crate::vm::page::SuppTable;
use crate::Error;

pub struct MmapFile {
    file: Arc<File>,
    uaddr: usize,
    page_cnt: usize,
}

impl MmapFile {
    /// Maps `file` at the page-aligned address `uaddr`. Fails on a null or
    /// unaligned address, an empty file, or overlap with existing pages.
    pub fn create(
        supp: &SuppTable,
        itable: &Itable,
        file: &File,
        uaddr: usize,
    ) -> Result<Self, Error> {
        if uaddr == 0 || pg_ofs(uaddr) != 0 {
            return Err(Error::Invalid);
        }
        let read_bytes = file.len();
        if read_bytes == 0 {
            return Err(Error::Invalid);
        }

        let byte_cnt = pg_round_up(read_bytes as usize);
        let zero_bytes = (byte_cnt - read_bytes as usize) as u32;
        let page_cnt = byte_cnt / PGSIZE;

        let file = Arc::new(file.reopen());
        if let Err(err) =
            supp.insert_segment(Arc::clone(&file), 0, uaddr, read_bytes, zero_bytes, true, true)
        {
            // No pages were inserted, so the duplicate is ours alone.
            File::close_shared(file, itable);
            return Err(err);
        }

        Ok(Self {
            file,
            uaddr,
            page_cnt,
        })
    }

    pub fn uaddr(&self) -> usize {
        self.uaddr
    }

    pub fn page_cnt(&self) -> usize {
        self.page_cnt
    }

    /// Unmaps every page, writing loaded dirty ones back to the file, then
    /// closes the backing handle.
    pub fn destroy(self, supp: &SuppTable, itable: &Itable) {
        for i in 0..self.page_cnt {
            assert!(
                supp.destroy(self.uaddr + i * PGSIZE),
                "mmap page vanished from the supplemental table"
            );
        }

        File::close_shared(self.file, itable);
    }
}
