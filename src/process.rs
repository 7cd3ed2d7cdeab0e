//! Minimal process model.
//!
//! The memory manager needs exactly this much of a process: a name and pid
//! for diagnostics, the privilege ring for pointer validation, the page
//! directory, and the region list the fault handler searches. Scheduling
//! and ring-3 entry live elsewhere; what belongs here is the address-space
//! clone, since it drives the region cloning that arms copy-on-write.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::InterruptDisabler;
use crate::fs::Inode;
use crate::vm::addr::LinearAddress;
use crate::vm::memory_manager::MemoryManager;
use crate::vm::page_directory::PageDirectory;
use crate::vm::region::Region;

/// Privilege ring a process runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    Ring0,
    Ring3,
}

pub struct Process {
    name: String,
    pid: u32,
    ring: Ring,
    page_directory: Arc<PageDirectory>,
    regions: Mutex<Vec<Arc<Region>>>,
}

impl Process {
    /// Create a process with an empty address space. Fails soft when no
    /// supervisor frame is left for the directory.
    pub fn new(name: &str, pid: u32, ring: Ring) -> Option<Arc<Process>> {
        let page_directory = PageDirectory::new()?;
        Some(Arc::new(Process {
            name: name.to_string(),
            pid,
            ring,
            page_directory,
            regions: Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn page_directory(&self) -> Arc<PageDirectory> {
        Arc::clone(&self.page_directory)
    }

    /// Create an anonymous region, map it, and adopt it.
    pub fn allocate_region(
        &self,
        laddr: LinearAddress,
        size: usize,
        name: &str,
        readable: bool,
        writable: bool,
    ) -> Arc<Region> {
        let region = Region::new_anonymous(laddr, size, name, readable, writable);
        MemoryManager::the().map_region_at_address(&self.page_directory, &region, laddr, true);
        self.regions.lock().push(Arc::clone(&region));
        region
    }

    /// Create a region over the inode's object, map it, and adopt it.
    pub fn allocate_file_backed_region(
        &self,
        laddr: LinearAddress,
        size: usize,
        inode: Arc<dyn Inode>,
        name: &str,
        readable: bool,
        writable: bool,
    ) -> Arc<Region> {
        let region = Region::new_file_backed(laddr, size, inode, name, readable, writable);
        MemoryManager::the().map_region_at_address(&self.page_directory, &region, laddr, true);
        self.regions.lock().push(Arc::clone(&region));
        region
    }

    /// Drop `region` from this process. The mapping goes away when the
    /// last handle does.
    pub fn deallocate_region(&self, region: &Arc<Region>) -> bool {
        let mut regions = self.regions.lock();
        let Some(position) = regions.iter().position(|r| Arc::ptr_eq(r, region)) else {
            return false;
        };
        regions.remove(position);
        true
    }

    /// The region whose range contains `laddr`, if any.
    pub fn region_containing(&self, laddr: LinearAddress) -> Option<Arc<Region>> {
        self.regions
            .lock()
            .iter()
            .find(|region| region.contains(laddr))
            .cloned()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Fork-style address-space clone: every region is cloned per its
    /// sharing policy (COW unless shared or read-only) and mapped into a
    /// fresh directory at the same addresses.
    pub fn clone_address_space(&self, pid: u32, name: &str) -> Option<Arc<Process>> {
        let _disabler = InterruptDisabler::new();
        let child = Process::new(name, pid, self.ring)?;
        let mm = MemoryManager::the();
        for region in self.regions.lock().iter() {
            let clone = region.duplicate();
            mm.map_region_at_address(&child.page_directory, &clone, clone.base(), true);
            child.regions.lock().push(clone);
        }
        Some(child)
    }
}

static CURRENT: Mutex<Option<Arc<Process>>> = Mutex::new(None);

/// The running process, as far as the memory manager is concerned.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.lock().clone()
}

/// Install the running process. Called by the context switch.
pub fn set_current(process: Option<Arc<Process>>) {
    *CURRENT.lock() = process;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::addr::PAGE_SIZE;
    use crate::vm::memory_manager::testing::vm_test_scope;

    #[test]
    fn test_region_bookkeeping() {
        let _scope = vm_test_scope();

        let process = Process::new("bookkeeping", 7, Ring::Ring3).unwrap();
        assert_eq!(process.pid(), 7);
        assert_eq!(process.region_count(), 0);

        let base = LinearAddress::new(0x1000_0000);
        let region = process.allocate_region(base, 2 * PAGE_SIZE, "stack", true, true);
        assert_eq!(process.region_count(), 1);

        let found = process.region_containing(base.offset(0x1234)).unwrap();
        assert!(Arc::ptr_eq(&found, &region));
        assert!(process
            .region_containing(base.offset((2 * PAGE_SIZE) as u32))
            .is_none());

        assert!(process.deallocate_region(&region));
        assert!(!process.deallocate_region(&region));
        assert_eq!(process.region_count(), 0);
    }

    #[test]
    fn test_clone_address_space_maps_child_regions() {
        let _scope = vm_test_scope();
        let mm = MemoryManager::the();

        let parent = Process::new("parent", 1, Ring::Ring3).unwrap();
        set_current(Some(parent.clone()));
        mm.enter_process_paging_scope(&parent);

        let base = LinearAddress::new(0x1000_0000);
        let region = parent.allocate_region(base, PAGE_SIZE, "data", true, true);
        region.commit().unwrap();

        let child = parent.clone_address_space(2, "child").unwrap();
        assert_eq!(child.region_count(), 1);
        let child_region = child.region_containing(base).unwrap();
        assert!(child_region.is_cow_page(0));

        // The child's directory maps the shared frame read-only.
        mm.enter_process_paging_scope(&child);
        assert!(crate::arch::x86::sim::user_probe(base, false));
        assert!(!crate::arch::x86::sim::user_probe(base, true));
        set_current(None);
    }
}
