//! Page directories.
//!
//! A directory owns its 4 KiB directory frame plus every page-table frame
//! installed beneath it, keyed by directory index. Directory entry 0 (the
//! bottom 4 MiB: kernel code, heap, supervisor pool) is shared by reference
//! with the kernel directory in every address space.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::arch;
use crate::vm::addr::{LinearAddress, PhysicalAddress};
use crate::vm::memory_manager::MemoryManager;
use crate::vm::page_entry::PageDirectoryEntry;
use crate::vm::physical_page::PhysicalPage;

pub struct PageDirectory {
    directory_page: Arc<PhysicalPage>,
    table_pages: Mutex<BTreeMap<u32, Arc<PhysicalPage>>>,
}

impl PageDirectory {
    /// Wrap the directory frame the boot environment placed at `paddr`.
    /// Only the kernel directory is created this way.
    pub(crate) fn at_fixed_address(paddr: PhysicalAddress) -> Arc<Self> {
        Arc::new(Self {
            directory_page: PhysicalPage::wrapper(paddr, true),
            table_pages: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn from_directory_page(directory_page: Arc<PhysicalPage>) -> Arc<Self> {
        Arc::new(Self {
            directory_page,
            table_pages: Mutex::new(BTreeMap::new()),
        })
    }

    /// Allocate and populate a directory for a new address space. Fails
    /// soft when the supervisor pool is exhausted.
    pub fn new() -> Option<Arc<Self>> {
        MemoryManager::the().populate_page_directory()
    }

    /// Physical address to load into CR3 for this address space.
    pub fn cr3(&self) -> u32 {
        self.directory_page.paddr().get()
    }

    pub(crate) fn entries(&self) -> *mut u32 {
        arch::phys_ptr(self.directory_page.paddr()) as *mut u32
    }

    pub(crate) fn entry(&self, index: u32) -> PageDirectoryEntry {
        debug_assert!(index < 1024);
        // SAFETY: index < 1024, within the directory frame.
        PageDirectoryEntry::at(unsafe { self.entries().add(index as usize) })
    }

    pub(crate) fn has_table_page(&self, index: u32) -> bool {
        self.table_pages.lock().contains_key(&index)
    }

    /// Record ownership of the page-table frame serving `index`.
    pub(crate) fn set_table_page(&self, index: u32, page: Arc<PhysicalPage>) {
        self.table_pages.lock().insert(index, page);
    }

    /// Invalidate the TLB entry for `laddr`, but only when this directory
    /// is live in CR3; a non-active directory is refreshed by the CR3
    /// reload at the next switch to it.
    pub fn flush(&self, laddr: LinearAddress) {
        if arch::current_cr3() == self.cr3() {
            arch::invlpg(laddr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory_manager::testing::vm_test_scope;

    #[test]
    fn test_new_directory_shares_kernel_entry_zero() {
        let _scope = vm_test_scope();
        let mm = MemoryManager::the();

        let pd = PageDirectory::new().unwrap();
        assert_eq!(
            pd.entry(0).raw(),
            mm.kernel_page_directory().entry(0).raw()
        );
        // Everything else starts empty.
        for index in 1..1024 {
            assert!(!pd.entry(index).is_present());
        }
    }

    #[test]
    fn test_directory_frame_returns_on_drop() {
        let _scope = vm_test_scope();
        let mm = MemoryManager::the();

        let free_before = mm.supervisor_pages_free();
        let pd = PageDirectory::new().unwrap();
        assert_eq!(mm.supervisor_pages_free(), free_before - 1);
        drop(pd);
        assert_eq!(mm.supervisor_pages_free(), free_before);
    }
}
