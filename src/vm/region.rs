//! Regions - named mappings of a VM object slice into one address space.
//!
//! A region pins down where a slice of a [`VmObject`] appears in a
//! process's address space and with what policy: readable, writable,
//! explicitly shared. It also carries the per-page copy-on-write bits;
//! whenever a COW bit is set, the corresponding PTE must not be writable
//! even if the region is.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;
use thiserror::Error;

use crate::arch::InterruptDisabler;
use crate::dbgln;
use crate::vm::addr::{LinearAddress, PAGE_SIZE};
use crate::vm::bitmap::Bitmap;
use crate::vm::memory_manager::{self, MemoryManager, PageInError};
use crate::vm::page_directory::PageDirectory;
use crate::vm::vm_object::VmObject;

/// Region commit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("out of physical pages")]
    OutOfMemory,
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

pub struct Region {
    id: u32,
    base: LinearAddress,
    size: usize,
    offset_in_vmo: usize,
    vmo: Arc<VmObject>,
    name: String,
    readable: bool,
    writable: bool,
    shared: AtomicBool,
    cow_map: Mutex<Bitmap>,
    page_directory: Mutex<Option<Arc<PageDirectory>>>,
}

impl Region {
    /// Region over a fresh anonymous object.
    pub fn new_anonymous(
        base: LinearAddress,
        size: usize,
        name: &str,
        readable: bool,
        writable: bool,
    ) -> Arc<Region> {
        let vmo = VmObject::create_anonymous(size);
        vmo.set_name(name);
        Self::with_vmo(base, size, vmo, 0, name, readable, writable, false)
    }

    /// Region over the (unique) object for `inode`.
    pub fn new_file_backed(
        base: LinearAddress,
        size: usize,
        inode: Arc<dyn crate::fs::Inode>,
        name: &str,
        readable: bool,
        writable: bool,
    ) -> Arc<Region> {
        let vmo = VmObject::create_file_backed(inode, size);
        Self::with_vmo(base, size, vmo, 0, name, readable, writable, false)
    }

    /// Region over an existing object at a byte offset. `cow` seeds every
    /// COW bit, which is how the child side of a fork comes up read-only.
    #[allow(clippy::too_many_arguments)]
    pub fn with_vmo(
        base: LinearAddress,
        size: usize,
        vmo: Arc<VmObject>,
        offset_in_vmo: usize,
        name: &str,
        readable: bool,
        writable: bool,
        cow: bool,
    ) -> Arc<Region> {
        assert!(base.is_page_aligned(), "region base must be page aligned");
        assert!(
            size != 0 && size % PAGE_SIZE == 0,
            "region size must be a whole number of pages"
        );
        assert!(
            offset_in_vmo % PAGE_SIZE == 0,
            "region offset must be page aligned"
        );
        assert!(
            offset_in_vmo + size <= vmo.size(),
            "region extends past its object"
        );
        let cow_map = Bitmap::new(vmo.page_count(), cow);
        let region = Arc::new(Region {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            base,
            size,
            offset_in_vmo,
            vmo,
            name: name.to_string(),
            readable,
            writable,
            shared: AtomicBool::new(false),
            cow_map: Mutex::new(cow_map),
            page_directory: Mutex::new(None),
        });
        MemoryManager::the().register_region(&region);
        region
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub fn base(&self) -> LinearAddress {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vmo(&self) -> &Arc<VmObject> {
        &self.vmo
    }

    pub fn offset_in_vmo(&self) -> usize {
        self.offset_in_vmo
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Mark this region explicitly shared: clones reference the same
    /// object instead of arming COW.
    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Relaxed);
    }

    pub fn contains(&self, laddr: LinearAddress) -> bool {
        laddr.get() >= self.base.get()
            && (laddr.get() as u64) < self.base.get() as u64 + self.size as u64
    }

    /// Index of the page within this region that `laddr` falls in.
    pub fn page_index_from_address(&self, laddr: LinearAddress) -> usize {
        debug_assert!(self.contains(laddr));
        ((laddr.page_base().get() - self.base.get()) as usize) / PAGE_SIZE
    }

    /// Index of this region's first page within its object.
    pub fn first_page_index(&self) -> usize {
        self.offset_in_vmo / PAGE_SIZE
    }

    pub fn last_page_index(&self) -> usize {
        self.first_page_index() + self.page_count() - 1
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// COW state of page `index` (region-relative).
    pub fn is_cow_page(&self, index: usize) -> bool {
        self.cow_map.lock().get(index)
    }

    pub(crate) fn set_cow_page(&self, index: usize, value: bool) {
        self.cow_map.lock().set(index, value);
    }

    pub(crate) fn set_all_cow(&self) {
        self.cow_map.lock().fill(true);
    }

    pub(crate) fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.page_directory.lock().clone()
    }

    pub(crate) fn set_page_directory(&self, page_directory: Arc<PageDirectory>) {
        *self.page_directory.lock() = Some(page_directory);
    }

    pub(crate) fn clear_page_directory(&self) {
        *self.page_directory.lock() = None;
    }

    /// Eagerly allocate backing frames for every still-empty page of this
    /// region's slice, remapping each as it lands. Partial commits are
    /// retained on failure; there is no rollback.
    pub fn commit(&self) -> Result<(), CommitError> {
        let _disabler = InterruptDisabler::new();
        let mm = MemoryManager::the();
        dbgln!(
            "MM: commit {} pages in region '{}' at L{:x}",
            self.page_count(),
            self.name,
            self.base.get()
        );
        for i in 0..self.page_count() {
            let slot = self.first_page_index() + i;
            if self.vmo.pages().lock()[slot].is_some() {
                continue;
            }
            let Some(page) = mm.allocate_physical_page() else {
                crate::println!("MM: commit was unable to allocate a physical page");
                return Err(CommitError::OutOfMemory);
            };
            self.vmo.pages().lock()[slot] = Some(page);
            mm.remap_region_page(self, i, true);
        }
        Ok(())
    }

    /// Clone this region for an address-space fork.
    ///
    /// A shared or read-only region clones by reference: same object, same
    /// offset, no COW. Anything else becomes a COW pair: every page of
    /// this region goes copy-on-write (and its PTEs lose writability), and
    /// the clone is built over a reference-copied object with its own full
    /// COW bitmap.
    pub fn duplicate(&self) -> Arc<Region> {
        let _disabler = InterruptDisabler::new();
        if self.is_shared() || (self.readable && !self.writable) {
            return Region::with_vmo(
                self.base,
                self.size,
                Arc::clone(&self.vmo),
                self.offset_in_vmo,
                &self.name,
                self.readable,
                self.writable,
                false,
            );
        }
        dbgln!("MM: cowing region '{}' (L{:x})", self.name, self.base.get());
        self.set_all_cow();
        if self.page_directory().is_some() {
            MemoryManager::the().remap_region(self);
        }
        Region::with_vmo(
            self.base,
            self.size,
            self.vmo.duplicate(),
            self.offset_in_vmo,
            &self.name,
            self.readable,
            self.writable,
            true,
        )
    }

    /// Pre-fault every page through the inode-backed path (explicit
    /// prefetch).
    pub fn page_in(&self) -> Result<(), PageInError> {
        let _disabler = InterruptDisabler::new();
        let mm = MemoryManager::the();
        assert!(
            self.page_directory().is_some(),
            "page_in on an unmapped region"
        );
        assert!(
            !self.vmo.is_anonymous() && self.vmo.inode().is_some(),
            "page_in on a region with no backing inode"
        );
        dbgln!("MM: page_in {} pages", self.page_count());
        for i in 0..self.page_count() {
            let absent = self.vmo.pages().lock()[self.first_page_index() + i].is_none();
            if absent {
                mm.page_in_from_inode(self, i)?;
            }
            mm.remap_region_page(self, i, true);
        }
        Ok(())
    }

    /// Bytes of this region's slice currently backed by frames.
    pub fn committed(&self) -> usize {
        let pages = self.vmo.pages().lock();
        (0..self.page_count())
            .filter(|&i| pages[self.first_page_index() + i].is_some())
            .count()
            * PAGE_SIZE
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(mm) = memory_manager::try_the() {
            if self.page_directory.lock().is_some() {
                mm.unmap_region(self);
            }
            mm.unregister_region(self.id);
        }
    }
}
