//! Per-process page directory.
//!
//! Stands in for the MMU mapping of one user address space: which user pages
//! are present, whether they are writable, and the accessed and dirty bits
//! the hardware would keep per PTE. The dirty bit vanishes with the mapping
//! when a page is uninstalled, which is why the supplemental table keeps its
//! own sticky copy.

use std::collections::HashMap;

use spin::Mutex;

use crate::param::pg_ofs;

struct Pte {
    writable: bool,
    accessed: bool,
    dirty: bool,
}

pub struct PageDir {
    ptes: Mutex<HashMap<usize, Pte>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            ptes: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a mapping for `upage`. Fails if one is already present.
    pub fn set_page(&self, upage: usize, writable: bool) -> bool {
        debug_assert_eq!(pg_ofs(upage), 0);
        let mut ptes = self.ptes.lock();
        if ptes.contains_key(&upage) {
            return false;
        }
        let _ = ptes.insert(
            upage,
            Pte {
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    /// Drops the mapping for `upage`, and with it the hardware bits.
    pub fn clear_page(&self, upage: usize) {
        let _ = self.ptes.lock().remove(&upage);
    }

    pub fn is_mapped(&self, upage: usize) -> bool {
        self.ptes.lock().contains_key(&upage)
    }

    pub fn is_writable(&self, upage: usize) -> bool {
        self.ptes.lock().get(&upage).map_or(false, |pte| pte.writable)
    }

    pub fn set_accessed(&self, upage: usize) {
        if let Some(pte) = self.ptes.lock().get_mut(&upage) {
            pte.accessed = true;
        }
    }

    /// Reads and clears the accessed bit, the second-chance probe.
    pub fn test_and_clear_accessed(&self, upage: usize) -> bool {
        match self.ptes.lock().get_mut(&upage) {
            Some(pte) => {
                let was = pte.accessed;
                pte.accessed = false;
                was
            }
            None => false,
        }
    }

    pub fn set_dirty(&self, upage: usize) {
        if let Some(pte) = self.ptes.lock().get_mut(&upage) {
            pte.dirty = true;
        }
    }

    pub fn is_dirty(&self, upage: usize) -> bool {
        self.ptes.lock().get(&upage).map_or(false, |pte| pte.dirty)
    }

    /// Tears the directory down. Every mapping must already be uninstalled
    /// by supplemental-table teardown; anything left is simply dropped.
    pub fn destroy(&self) {
        self.ptes.lock().clear();
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PGSIZE;

    #[test]
    fn double_install_is_refused() {
        let pd = PageDir::new();
        assert!(pd.set_page(PGSIZE, true));
        assert!(!pd.set_page(PGSIZE, false));
        pd.clear_page(PGSIZE);
        assert!(pd.set_page(PGSIZE, false));
    }

    #[test]
    fn accessed_bit_clears_on_probe() {
        let pd = PageDir::new();
        pd.set_page(0, true);
        pd.set_accessed(0);
        assert!(pd.test_and_clear_accessed(0));
        assert!(!pd.test_and_clear_accessed(0));
    }

    #[test]
    fn dirty_bit_vanishes_with_mapping() {
        let pd = PageDir::new();
        pd.set_page(0, true);
        pd.set_dirty(0);
        assert!(pd.is_dirty(0));
        pd.clear_page(0);
        assert!(!pd.is_dirty(0));
    }
}
