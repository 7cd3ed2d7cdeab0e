//! VM objects - the backing-store identity of a range of pages.
//!
//! An object owns a dense vector of frame slots, one per page, each either
//! empty (not yet materialized) or holding a frame handle. Variants:
//! - anonymous: slots fill with zeroed frames on first fault
//! - inode-backed: slots fill from the inode on first fault; at most one
//!   object exists per inode
//! - physical wrapper: every slot pre-populated with a fixed frame
//!   (framebuffers, MMIO)
//!
//! Cloning an object copies the slot vector by reference, which is the
//! mechanism that arms copy-on-write in both objects.
//!
//! Slots are only ever assigned inside the memory manager's critical
//! sections.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::arch::InterruptDisabler;
use crate::fs::Inode;
use crate::vm::addr::{page_round_up, PhysicalAddress, PAGE_SIZE};
use crate::vm::memory_manager::{self, MemoryManager};
use crate::vm::physical_page::PhysicalPage;

/// VM object identifier (registry key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u32);

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> VmObjectId {
    VmObjectId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

pub struct VmObject {
    id: VmObjectId,
    name: Mutex<String>,
    anonymous: bool,
    inode: Option<Arc<dyn Inode>>,
    inode_offset: u32,
    size: usize,
    pages: Mutex<Vec<Option<Arc<PhysicalPage>>>>,
}

impl VmObject {
    /// Anonymous object: all slots empty, zero-filled on demand.
    pub fn create_anonymous(size: usize) -> Arc<VmObject> {
        let size = page_round_up(size);
        let vmo = Arc::new(VmObject {
            id: next_id(),
            name: Mutex::new(String::new()),
            anonymous: true,
            inode: None,
            inode_offset: 0,
            size,
            pages: Mutex::new(vec![None; size / PAGE_SIZE]),
        });
        MemoryManager::the().register_vmo(&vmo);
        vmo
    }

    /// Inode-backed object. Idempotent per inode: if the inode already has
    /// an object, that object is returned instead of a new one.
    pub fn create_file_backed(inode: Arc<dyn Inode>, size: usize) -> Arc<VmObject> {
        let _disabler = InterruptDisabler::new();
        if let Some(existing) = inode.vmo_slot().upgrade() {
            return existing;
        }
        let size = page_round_up(size);
        let vmo = Arc::new(VmObject {
            id: next_id(),
            name: Mutex::new(String::new()),
            anonymous: false,
            inode: Some(Arc::clone(&inode)),
            inode_offset: 0,
            size,
            pages: Mutex::new(vec![None; size / PAGE_SIZE]),
        });
        inode.vmo_slot().set(&vmo);
        MemoryManager::the().register_vmo(&vmo);
        vmo
    }

    /// Wrapper around a fixed physical range. Every slot is pre-populated,
    /// so the object never faults.
    pub fn create_physical_wrapper(paddr: PhysicalAddress, size: usize) -> Arc<VmObject> {
        assert!(paddr.is_page_aligned());
        let size = page_round_up(size);
        let pages = (0..size / PAGE_SIZE)
            .map(|i| Some(PhysicalPage::wrapper(paddr.offset((i * PAGE_SIZE) as u32), true)))
            .collect();
        let vmo = Arc::new(VmObject {
            id: next_id(),
            name: Mutex::new(String::new()),
            anonymous: true,
            inode: None,
            inode_offset: 0,
            size,
            pages: Mutex::new(pages),
        });
        MemoryManager::the().register_vmo(&vmo);
        vmo
    }

    /// Reference-copy of the slot vector. Every shared frame gains a
    /// reference; the caller is responsible for arming the COW bits on the
    /// regions involved.
    pub fn duplicate(&self) -> Arc<VmObject> {
        let _disabler = InterruptDisabler::new();
        let pages = self.pages.lock().clone();
        let vmo = Arc::new(VmObject {
            id: next_id(),
            name: Mutex::new(self.name.lock().clone()),
            anonymous: self.anonymous,
            inode: self.inode.clone(),
            inode_offset: self.inode_offset,
            size: self.size,
            pages: Mutex::new(pages),
        });
        MemoryManager::the().register_vmo(&vmo);
        vmo
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Size in bytes, always a whole number of pages.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn inode(&self) -> Option<Arc<dyn Inode>> {
        self.inode.clone()
    }

    /// Byte offset into the inode that slot 0 corresponds to.
    pub fn inode_offset(&self) -> u32 {
        self.inode_offset
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    pub(crate) fn pages(&self) -> &Mutex<Vec<Option<Arc<PhysicalPage>>>> {
        &self.pages
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let _disabler = InterruptDisabler::new();
        if let Some(inode) = &self.inode {
            inode.vmo_slot().clear_if(self);
        }
        if let Some(mm) = memory_manager::try_the() {
            mm.unregister_vmo(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::test_support::StubInode;
    use crate::vm::memory_manager::testing::vm_test_scope;

    #[test]
    fn test_anonymous_rounds_up() {
        let _scope = vm_test_scope();
        let vmo = VmObject::create_anonymous(5000);
        assert_eq!(vmo.size(), 8192);
        assert_eq!(vmo.page_count(), 2);
        assert!(vmo.is_anonymous());
        assert!(vmo.pages().lock().iter().all(Option::is_none));
    }

    #[test]
    fn test_file_backed_is_idempotent_per_inode() {
        let _scope = vm_test_scope();
        let inode = StubInode::new(vec![0u8; 4096]);

        let first = VmObject::create_file_backed(inode.clone(), 4096);
        let second = VmObject::create_file_backed(inode.clone(), 4096);
        assert!(Arc::ptr_eq(&first, &second));

        // Dropping the object clears the back-reference, so a fresh one
        // can be created.
        let id = first.id();
        drop(first);
        drop(second);
        assert!(inode.vmo_slot().upgrade().is_none());
        let third = VmObject::create_file_backed(inode.clone(), 4096);
        assert_ne!(third.id(), id);
    }

    #[test]
    fn test_physical_wrapper_is_fully_populated() {
        let _scope = vm_test_scope();
        let vmo = VmObject::create_physical_wrapper(PhysicalAddress::new(0x10_0000), 8192);
        let pages = vmo.pages().lock();
        assert_eq!(pages.len(), 2);
        let first = pages[0].as_ref().unwrap();
        let second = pages[1].as_ref().unwrap();
        assert_eq!(first.paddr(), PhysicalAddress::new(0x10_0000));
        assert_eq!(second.paddr(), PhysicalAddress::new(0x10_1000));
        assert!(first.is_supervisor());
    }

    #[test]
    fn test_duplicate_shares_frames() {
        let _scope = vm_test_scope();
        let mm = MemoryManager::the();

        let vmo = VmObject::create_anonymous(4096);
        let page = mm.allocate_physical_page().unwrap();
        vmo.pages().lock()[0] = Some(page);

        let clone = vmo.duplicate();
        {
            let original = vmo.pages().lock();
            let cloned = clone.pages().lock();
            let frame = original[0].as_ref().unwrap();
            assert!(Arc::ptr_eq(frame, cloned[0].as_ref().unwrap()));
            assert_eq!(PhysicalPage::retain_count(frame), 2);
        }
        drop(clone);
        assert_eq!(
            PhysicalPage::retain_count(vmo.pages().lock()[0].as_ref().unwrap()),
            1
        );
    }
}
