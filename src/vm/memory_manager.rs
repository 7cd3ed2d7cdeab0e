//! The memory manager singleton.
//!
//! There is exactly one MMU, so there is exactly one of these. It owns the
//! kernel page directory, the statically placed page-table-zero, the two
//! free-frame pools, the registries of live regions and VM objects, and
//! the reserved quickmap slot. Every operation that touches a pool, a
//! registry, a directory or a PTE runs with interrupts disabled; the one
//! exception is the inode read inside demand paging, which re-enables
//! interrupts because disk I/O may block.
//!
//! Boot-time physical memory layout assumed:
//! - 0 - 512 KiB: kernel image; kernel page directory at 0x4000, kernel
//!   page-table-zero at 0x6000
//! - 1 MiB - 2 MiB: eternal heap arena
//! - 2 MiB - 3 MiB: ordinary heap arena
//! - 3 MiB - 4 MiB: supervisor frame pool
//! - 4 MiB - 32 MiB: user frame pool; the topmost frame is reserved as the
//!   quickmap slot
//! - 0 - 4 MiB is identity mapped, supervisor only, shared through
//!   directory entry 0 by every address space; page 0 stays not-present so
//!   null dereferences fault.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;
use thiserror::Error;

use crate::arch::{self, InterruptDisabler};
use crate::dbgln;
use crate::process::{self, Process, Ring};
use crate::vm::addr::{LinearAddress, PhysicalAddress, MB, PAGE_SIZE};
use crate::vm::page_directory::PageDirectory;
use crate::vm::page_entry::PageTableEntry;
use crate::vm::physical_page::{FramePools, PhysicalPage};
use crate::vm::region::Region;
use crate::vm::vm_object::{VmObject, VmObjectId};

/// Where boot placed the kernel page directory.
const KERNEL_PAGE_DIRECTORY_ADDR: PhysicalAddress = PhysicalAddress::new(0x4000);
/// Statically placed page table backing directory entry 0.
const PAGE_TABLE_ZERO_ADDR: PhysicalAddress = PhysicalAddress::new(0x6000);
/// Supervisor frame pool.
const SUPERVISOR_POOL: core::ops::Range<u32> = (3 * MB as u32)..(4 * MB as u32);
/// User frame pool.
const USER_POOL: core::ops::Range<u32> = (4 * MB as u32)..(32 * MB as u32);

/// Demand-paging failure. Process-fatal when it reaches the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageInError {
    #[error("out of physical pages")]
    OutOfMemory,
    #[error("inode read failed")]
    Io,
}

/// Fault and allocation counters.
#[derive(Debug, Default)]
pub struct MemoryStats {
    pages_allocated: AtomicU32,
    supervisor_pages_allocated: AtomicU32,
    zero_fill_faults: AtomicU32,
    inode_faults: AtomicU32,
    cow_faults: AtomicU32,
    cow_reclaims: AtomicU32,
}

impl MemoryStats {
    /// Frames handed out from the user pool.
    pub fn pages_allocated(&self) -> u32 {
        self.pages_allocated.load(Ordering::Relaxed)
    }

    /// Frames handed out from the supervisor pool.
    pub fn supervisor_pages_allocated(&self) -> u32 {
        self.supervisor_pages_allocated.load(Ordering::Relaxed)
    }

    pub fn zero_fill_faults(&self) -> u32 {
        self.zero_fill_faults.load(Ordering::Relaxed)
    }

    pub fn inode_faults(&self) -> u32 {
        self.inode_faults.load(Ordering::Relaxed)
    }

    /// COW faults that copied a frame.
    pub fn cow_faults(&self) -> u32 {
        self.cow_faults.load(Ordering::Relaxed)
    }

    /// COW faults resolved by reclaiming write access to an unshared frame.
    pub fn cow_reclaims(&self) -> u32 {
        self.cow_reclaims.load(Ordering::Relaxed)
    }

    fn incr(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MemoryManager {
    kernel_page_directory: Arc<PageDirectory>,
    page_table_zero: PhysicalAddress,
    quickmap_addr: LinearAddress,
    quickmap_busy: AtomicBool,
    pools: Mutex<FramePools>,
    regions: Mutex<BTreeMap<u32, Weak<Region>>>,
    vmos: Mutex<BTreeMap<u32, Weak<VmObject>>>,
    stats: MemoryStats,
}

static MEMORY_MANAGER: Mutex<Option<Arc<MemoryManager>>> = Mutex::new(None);

/// Install the global memory manager and bring paging up.
pub fn init() {
    let mm = Arc::new(MemoryManager::new());
    *MEMORY_MANAGER.lock() = Some(Arc::clone(&mm));
    mm.initialize_paging();
}

pub(crate) fn try_the() -> Option<Arc<MemoryManager>> {
    MEMORY_MANAGER.lock().clone()
}

impl MemoryManager {
    /// The singleton. Panics before [`init`] has run.
    pub fn the() -> Arc<MemoryManager> {
        MEMORY_MANAGER
            .lock()
            .clone()
            .expect("memory manager not initialized")
    }

    fn new() -> Self {
        let _disabler = InterruptDisabler::new();
        let mut pools = FramePools::default();
        pools.seed(SUPERVISOR_POOL, USER_POOL);
        // The topmost user frame never enters circulation; its address
        // doubles as the quickmap linear address.
        let quickmap_paddr = pools.take_last_user().expect("user pool empty at boot");
        Self {
            kernel_page_directory: PageDirectory::at_fixed_address(KERNEL_PAGE_DIRECTORY_ADDR),
            page_table_zero: PAGE_TABLE_ZERO_ADDR,
            quickmap_addr: LinearAddress::new(quickmap_paddr.get()),
            quickmap_busy: AtomicBool::new(false),
            pools: Mutex::new(pools),
            regions: Mutex::new(BTreeMap::new()),
            vmos: Mutex::new(BTreeMap::new()),
            stats: MemoryStats::default(),
        }
    }

    fn initialize_paging(&self) {
        let _disabler = InterruptDisabler::new();
        // Boot hands both frames over uninitialized.
        // SAFETY: fixed boot frames, exclusively ours from here on.
        unsafe {
            core::ptr::write_bytes(arch::phys_ptr(KERNEL_PAGE_DIRECTORY_ADDR), 0, PAGE_SIZE);
            core::ptr::write_bytes(arch::phys_ptr(self.page_table_zero), 0, PAGE_SIZE);
        }
        dbgln!(
            "MM: kernel page directory @ P{:x}",
            self.kernel_page_directory.cr3()
        );
        // Null dereferences must fault.
        self.map_protected(LinearAddress::new(0), PAGE_SIZE);
        // The rest of the bottom 4 MiB is identity mapped, supervisor
        // only, and shared with every process through directory entry 0.
        self.create_identity_mapping(
            &self.kernel_page_directory,
            LinearAddress::new(PAGE_SIZE as u32),
            4 * MB - PAGE_SIZE,
        );
        arch::set_cr3(self.kernel_page_directory.cr3());
        arch::enable_paging();
    }

    pub fn kernel_page_directory(&self) -> &Arc<PageDirectory> {
        &self.kernel_page_directory
    }

    /// The reserved quickmap linear address.
    pub fn quickmap_addr(&self) -> LinearAddress {
        self.quickmap_addr
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    // ========================================================================
    // Physical frame allocation
    // ========================================================================

    /// Pop a frame from the user pool. Fails soft with `None` when the
    /// pool is empty.
    pub fn allocate_physical_page(&self) -> Option<Arc<PhysicalPage>> {
        let _disabler = InterruptDisabler::new();
        let page = self.pools.lock().allocate_user();
        if let Some(page) = &page {
            MemoryStats::incr(&self.stats.pages_allocated);
            dbgln!(
                "MM: allocate_physical_page vending P{:x} ({} remaining)",
                page.paddr().get(),
                self.pools.lock().user_free()
            );
        }
        page
    }

    /// Pop a frame from the supervisor pool. Fails soft with `None`.
    pub fn allocate_supervisor_physical_page(&self) -> Option<Arc<PhysicalPage>> {
        let _disabler = InterruptDisabler::new();
        let page = self.pools.lock().allocate_supervisor();
        if page.is_some() {
            MemoryStats::incr(&self.stats.supervisor_pages_allocated);
        }
        page
    }

    pub(crate) fn return_physical_page(&self, paddr: PhysicalAddress, supervisor: bool) {
        debug_assert!(paddr.is_page_aligned());
        self.pools.lock().give_back(paddr, supervisor);
    }

    pub fn user_pages_free(&self) -> usize {
        self.pools.lock().user_free()
    }

    pub fn supervisor_pages_free(&self) -> usize {
        self.pools.lock().supervisor_free()
    }

    // ========================================================================
    // Directory and table plumbing
    // ========================================================================

    /// Build a directory for a new address space: fresh supervisor frame,
    /// zeroed, with entry 0 shared from the kernel directory.
    pub(crate) fn populate_page_directory(&self) -> Option<Arc<PageDirectory>> {
        let _disabler = InterruptDisabler::new();
        let directory_page = self.allocate_supervisor_physical_page()?;
        // SAFETY: freshly allocated supervisor frame.
        unsafe { core::ptr::write_bytes(arch::phys_ptr(directory_page.paddr()), 0, PAGE_SIZE) };
        let page_directory = PageDirectory::from_directory_page(directory_page);
        page_directory
            .entry(0)
            .set_raw(self.kernel_page_directory.entry(0).raw());
        Some(page_directory)
    }

    /// Guarantee that the page table covering `laddr` exists in
    /// `page_directory` and return a view of the PTE. Idempotent once the
    /// table exists.
    pub(crate) fn ensure_pte(
        &self,
        page_directory: &PageDirectory,
        laddr: LinearAddress,
    ) -> PageTableEntry {
        debug_assert!(arch::interrupts_disabled());
        let directory_index = laddr.directory_index();
        let table_index = laddr.table_index();

        let pde = page_directory.entry(directory_index);
        if !pde.is_present() {
            if directory_index == 0 {
                // Only the kernel directory ever instantiates entry 0;
                // every other directory inherits it at creation.
                assert_eq!(
                    page_directory.cr3(),
                    self.kernel_page_directory.cr3(),
                    "directory entry 0 instantiated outside the kernel directory"
                );
                pde.set_page_table_base(self.page_table_zero);
                pde.set_user_allowed(false);
                pde.set_present(true);
                pde.set_writable(true);
            } else {
                let table = self
                    .allocate_page_table(page_directory, directory_index)
                    .unwrap_or_else(|| {
                        panic!("MM: no supervisor pages left for page table {}", directory_index)
                    });
                dbgln!(
                    "MM: PD P{:x} allocated page table #{} (for L{:x}) at P{:x}",
                    page_directory.cr3(),
                    directory_index,
                    laddr.get(),
                    table.paddr().get()
                );
                pde.set_page_table_base(table.paddr());
                pde.set_user_allowed(true);
                pde.set_present(true);
                pde.set_writable(true);
            }
        }
        let table = arch::phys_ptr(pde.page_table_base()) as *mut u32;
        // SAFETY: table_index < 1024, within the table frame.
        PageTableEntry::at(unsafe { table.add(table_index as usize) })
    }

    fn allocate_page_table(
        &self,
        page_directory: &PageDirectory,
        index: u32,
    ) -> Option<Arc<PhysicalPage>> {
        debug_assert!(!page_directory.has_table_page(index));
        let page = self.allocate_supervisor_physical_page()?;
        // SAFETY: freshly allocated supervisor frame.
        unsafe { core::ptr::write_bytes(arch::phys_ptr(page.paddr()), 0, PAGE_SIZE) };
        page_directory.set_table_page(index, Arc::clone(&page));
        Some(page)
    }

    /// Map a linear range of the kernel directory not-present, so any
    /// access faults (the null page).
    pub(crate) fn map_protected(&self, laddr: LinearAddress, length: usize) {
        let _disabler = InterruptDisabler::new();
        debug_assert!(laddr.is_page_aligned());
        for offset in (0..length).step_by(PAGE_SIZE) {
            let pte_address = laddr.offset(offset as u32);
            let pte = self.ensure_pte(&self.kernel_page_directory, pte_address);
            pte.set_physical_page_base(PhysicalAddress::new(pte_address.get()));
            pte.set_user_allowed(false);
            pte.set_present(false);
            pte.set_writable(false);
            self.flush_tlb(pte_address);
        }
    }

    /// Identity map a linear range, supervisor only.
    pub(crate) fn create_identity_mapping(
        &self,
        page_directory: &PageDirectory,
        laddr: LinearAddress,
        size: usize,
    ) {
        let _disabler = InterruptDisabler::new();
        assert!(laddr.is_page_aligned());
        for offset in (0..size).step_by(PAGE_SIZE) {
            let pte_address = laddr.offset(offset as u32);
            let pte = self.ensure_pte(page_directory, pte_address);
            pte.set_physical_page_base(PhysicalAddress::new(pte_address.get()));
            pte.set_user_allowed(false);
            pte.set_present(true);
            pte.set_writable(true);
            page_directory.flush(pte_address);
        }
    }

    /// Carve a linear range back out of the identity window.
    pub fn remove_identity_mapping(
        &self,
        page_directory: &PageDirectory,
        laddr: LinearAddress,
        size: usize,
    ) {
        let _disabler = InterruptDisabler::new();
        debug_assert!(laddr.is_page_aligned());
        for offset in (0..size).step_by(PAGE_SIZE) {
            let pte_address = laddr.offset(offset as u32);
            let pte = self.ensure_pte(page_directory, pte_address);
            pte.set_physical_page_base(PhysicalAddress::new(0));
            pte.set_user_allowed(false);
            pte.set_present(true);
            pte.set_writable(true);
            self.flush_tlb(pte_address);
        }
    }

    // ========================================================================
    // Quickmap
    // ========================================================================

    /// Map `page` at the reserved quickmap slot of the current address
    /// space and return a pointer to it. Single-slot and non-reentrant;
    /// callers hold interrupts disabled and release via
    /// [`Self::unquickmap_page`] before anything that may yield.
    pub(crate) fn quickmap_page(&self, page: &PhysicalPage) -> *mut u8 {
        debug_assert!(arch::interrupts_disabled());
        assert!(
            !self.quickmap_busy.swap(true, Ordering::SeqCst),
            "quickmap slot already in use"
        );
        let process = process::current().expect("quickmap with no current process");
        let pte = self.ensure_pte(&process.page_directory(), self.quickmap_addr);
        pte.set_physical_page_base(page.paddr());
        pte.set_present(true);
        pte.set_writable(true);
        pte.set_user_allowed(false);
        self.flush_tlb(self.quickmap_addr);
        debug_assert_eq!(pte.physical_page_base(), page.paddr());
        arch::laddr_ptr(self.quickmap_addr)
    }

    /// Release the quickmap slot.
    pub(crate) fn unquickmap_page(&self) {
        debug_assert!(arch::interrupts_disabled());
        debug_assert!(self.quickmap_busy.load(Ordering::SeqCst));
        let process = process::current().expect("unquickmap with no current process");
        let pte = self.ensure_pte(&process.page_directory(), self.quickmap_addr);
        pte.set_physical_page_base(PhysicalAddress::new(0));
        pte.set_present(false);
        pte.set_writable(false);
        self.flush_tlb(self.quickmap_addr);
        self.quickmap_busy.store(false, Ordering::SeqCst);
    }

    // ========================================================================
    // Region mapping
    // ========================================================================

    /// Find the region of `process` containing `laddr`.
    // TODO: ordered lookup once processes carry more than a handful of regions.
    pub fn region_from_laddr(&self, process: &Process, laddr: LinearAddress) -> Option<Arc<Region>> {
        debug_assert!(arch::interrupts_disabled());
        if let Some(region) = process.region_containing(laddr) {
            return Some(region);
        }
        crate::println!(
            "{}({}) Couldn't find region for L{:x} (CR3={:x})",
            process.name(),
            process.pid(),
            laddr.get(),
            process.page_directory().cr3()
        );
        None
    }

    /// Install PTEs for every page of `region` in `page_directory`,
    /// starting at `laddr`. Populated slots map present (writable unless
    /// the page is COW); empty slots map not-present with the writable bit
    /// recording region policy for later materialization.
    pub fn map_region_at_address(
        &self,
        page_directory: &Arc<PageDirectory>,
        region: &Region,
        laddr: LinearAddress,
        user_allowed: bool,
    ) {
        let _disabler = InterruptDisabler::new();
        region.set_page_directory(Arc::clone(page_directory));
        let vmo = region.vmo();
        dbgln!(
            "MM: map_region_at_address will map VMO pages {} - {} (VMO page count: {})",
            region.first_page_index(),
            region.last_page_index(),
            vmo.page_count()
        );
        for i in 0..region.page_count() {
            let page_laddr = laddr.offset((i * PAGE_SIZE) as u32);
            let pte = self.ensure_pte(page_directory, page_laddr);
            let pages = vmo.pages().lock();
            match pages[region.first_page_index() + i].as_ref() {
                Some(page) => {
                    pte.set_physical_page_base(page.paddr());
                    pte.set_present(true);
                    pte.set_writable(!region.is_cow_page(i) && region.is_writable());
                }
                None => {
                    pte.set_physical_page_base(PhysicalAddress::new(0));
                    pte.set_present(false);
                    pte.set_writable(region.is_writable());
                }
            }
            drop(pages);
            pte.set_user_allowed(user_allowed);
            page_directory.flush(page_laddr);
        }
    }

    /// Map `region` into `process` at the region's own base address.
    pub fn map_region(&self, process: &Process, region: &Region) {
        self.map_region_at_address(&process.page_directory(), region, region.base(), true);
    }

    /// Re-install every PTE of an already mapped region (e.g. after its
    /// COW bits changed).
    pub fn remap_region(&self, region: &Region) {
        let _disabler = InterruptDisabler::new();
        let page_directory = region
            .page_directory()
            .expect("remap of region with no directory");
        self.map_region_at_address(&page_directory, region, region.base(), true);
    }

    /// Re-install the PTE for a single region page after its frame or COW
    /// state changed.
    pub fn remap_region_page(&self, region: &Region, page_index_in_region: usize, user_allowed: bool) {
        let page_directory = region
            .page_directory()
            .expect("remap of region with no directory");
        let _disabler = InterruptDisabler::new();
        let page_laddr = region
            .base()
            .offset((page_index_in_region * PAGE_SIZE) as u32);
        let pte = self.ensure_pte(&page_directory, page_laddr);
        let pages = region.vmo().pages().lock();
        let page = pages[region.first_page_index() + page_index_in_region]
            .as_ref()
            .expect("remap of absent page");
        pte.set_physical_page_base(page.paddr());
        pte.set_present(true);
        pte.set_writable(!region.is_cow_page(page_index_in_region) && region.is_writable());
        pte.set_user_allowed(user_allowed);
        drop(pages);
        page_directory.flush(page_laddr);
    }

    /// Clear every PTE of `region` and drop its directory pointer.
    pub fn unmap_region(&self, region: &Region) {
        let page_directory = region
            .page_directory()
            .expect("unmap of region with no directory");
        let _disabler = InterruptDisabler::new();
        for i in 0..region.page_count() {
            let page_laddr = region.base().offset((i * PAGE_SIZE) as u32);
            let pte = self.ensure_pte(&page_directory, page_laddr);
            pte.set_physical_page_base(PhysicalAddress::new(0));
            pte.set_present(false);
            pte.set_writable(false);
            pte.set_user_allowed(false);
            page_directory.flush(page_laddr);
        }
        region.clear_page_directory();
    }

    // ========================================================================
    // Fault services
    // ========================================================================

    /// Demand-zero: materialize a zeroed frame for an anonymous page.
    pub(crate) fn zero_page(
        &self,
        region: &Region,
        page_index_in_region: usize,
    ) -> Result<(), PageInError> {
        debug_assert!(arch::interrupts_disabled());
        let page = self
            .allocate_physical_page()
            .ok_or(PageInError::OutOfMemory)?;
        let dest = self.quickmap_page(&page);
        dbgln!("      >> ZERO P{:x}", page.paddr().get());
        // SAFETY: quickmap just mapped a whole frame at `dest`.
        unsafe { core::ptr::write_bytes(dest, 0, PAGE_SIZE) };
        self.unquickmap_page();
        region.set_cow_page(page_index_in_region, false);
        region.vmo().pages().lock()[region.first_page_index() + page_index_in_region] = Some(page);
        self.remap_region_page(region, page_index_in_region, true);
        MemoryStats::incr(&self.stats.zero_fill_faults);
        Ok(())
    }

    /// Demand-page: materialize a frame for an inode-backed page and fill
    /// it from the inode.
    ///
    /// The destination is the freshly remapped page itself, not quickmap,
    /// so the quickmap slot stays free across the interrupts-enabled read
    /// window.
    pub(crate) fn page_in_from_inode(
        &self,
        region: &Region,
        page_index_in_region: usize,
    ) -> Result<(), PageInError> {
        debug_assert!(arch::interrupts_disabled());
        let vmo = region.vmo();
        assert!(!vmo.is_anonymous());
        let inode = vmo.inode().expect("inode-backed object without inode");
        let slot = region.first_page_index() + page_index_in_region;
        assert!(
            vmo.pages().lock()[slot].is_none(),
            "page_in over an already resident page"
        );
        let Some(page) = self.allocate_physical_page() else {
            crate::println!("MM: page_in_from_inode was unable to allocate a physical page");
            return Err(PageInError::OutOfMemory);
        };
        vmo.pages().lock()[slot] = Some(page);
        self.remap_region_page(region, page_index_in_region, true);
        let page_laddr = region
            .base()
            .offset((page_index_in_region * PAGE_SIZE) as u32);
        // The read may block on the disk; this is the only window in which
        // the memory manager runs with interrupts enabled.
        arch::enable_interrupts();
        // SAFETY: the page was just remapped; ring 0 writes ignore the
        // write-protect bit (CR0.WP is clear).
        let dest = unsafe { core::slice::from_raw_parts_mut(arch::laddr_ptr(page_laddr), PAGE_SIZE) };
        let offset = vmo.inode_offset() + (slot * PAGE_SIZE) as u32;
        let result = inode.read_bytes(offset, PAGE_SIZE, dest);
        arch::disable_interrupts();
        match result {
            Ok(nread) => {
                if nread < PAGE_SIZE {
                    // Zero the tail so a short read can't leak stale frame
                    // contents.
                    dest[nread..].fill(0);
                }
                MemoryStats::incr(&self.stats.inode_faults);
                Ok(())
            }
            Err(error) => {
                crate::println!("MM: page_in_from_inode had error ({}) while reading!", error);
                Err(PageInError::Io)
            }
        }
    }

    /// Copy-on-write: give the faulting region its own writable copy of a
    /// shared page. If nobody shares the frame anymore, just reclaim write
    /// access.
    pub(crate) fn copy_on_write(
        &self,
        region: &Region,
        page_index_in_region: usize,
    ) -> Result<(), PageInError> {
        debug_assert!(arch::interrupts_disabled());
        let vmo = region.vmo();
        let slot = region.first_page_index() + page_index_in_region;
        let source = {
            let pages = vmo.pages().lock();
            let page = pages[slot].as_ref().expect("copy_on_write on absent page");
            if PhysicalPage::retain_count(page) == 1 {
                None
            } else {
                Some(Arc::clone(page))
            }
        };
        let Some(_source) = source else {
            // Every sibling already copied; the last holder owns the frame
            // outright.
            dbgln!("    >> COW page no longer shared, remapping r/w");
            region.set_cow_page(page_index_in_region, false);
            self.remap_region_page(region, page_index_in_region, true);
            MemoryStats::incr(&self.stats.cow_reclaims);
            return Ok(());
        };
        dbgln!("    >> COW page still shared, copying");
        let new_page = self
            .allocate_physical_page()
            .ok_or(PageInError::OutOfMemory)?;
        let dest = self.quickmap_page(&new_page);
        let src = arch::laddr_ptr(
            region
                .base()
                .offset((page_index_in_region * PAGE_SIZE) as u32),
        );
        // SAFETY: `src` is the currently mapped (read-only) page, `dest`
        // the quickmapped fresh frame; both span a full page.
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dest, PAGE_SIZE) };
        self.unquickmap_page();
        // The old handle drops here; the other sharers keep theirs.
        vmo.pages().lock()[slot] = Some(new_page);
        region.set_cow_page(page_index_in_region, false);
        self.remap_region_page(region, page_index_in_region, true);
        MemoryStats::incr(&self.stats.cow_faults);
        Ok(())
    }

    // ========================================================================
    // User pointer validation
    // ========================================================================

    /// Whether a ring-appropriate read of `laddr` by `process` would
    /// succeed. Inspects the tables only; no mutation, no TLB effects.
    pub fn validate_user_read(&self, process: &Process, laddr: LinearAddress) -> bool {
        let page_directory = process.page_directory();
        let pde = page_directory.entry(laddr.directory_index());
        if !pde.is_present() {
            return false;
        }
        let table = arch::phys_ptr(pde.page_table_base()) as *mut u32;
        // SAFETY: table index < 1024, within the table frame.
        let pte = PageTableEntry::at(unsafe { table.add(laddr.table_index() as usize) });
        if !pte.is_present() {
            return false;
        }
        if process.ring() == Ring::Ring3 && !pte.is_user_allowed() {
            return false;
        }
        true
    }

    /// Whether a ring-appropriate write of `laddr` by `process` would
    /// succeed.
    pub fn validate_user_write(&self, process: &Process, laddr: LinearAddress) -> bool {
        let page_directory = process.page_directory();
        let pde = page_directory.entry(laddr.directory_index());
        if !pde.is_present() {
            return false;
        }
        let table = arch::phys_ptr(pde.page_table_base()) as *mut u32;
        // SAFETY: table index < 1024, within the table frame.
        let pte = PageTableEntry::at(unsafe { table.add(laddr.table_index() as usize) });
        if !pte.is_present() {
            return false;
        }
        if process.ring() == Ring::Ring3 && !pte.is_user_allowed() {
            return false;
        }
        if !pte.is_writable() {
            return false;
        }
        true
    }

    // ========================================================================
    // Paging scope and TLB
    // ========================================================================

    /// Load `process`'s directory into CR3.
    pub fn enter_process_paging_scope(&self, process: &Process) {
        let _disabler = InterruptDisabler::new();
        arch::set_cr3(process.page_directory().cr3());
    }

    /// Flush the whole TLB by reloading CR3.
    pub fn flush_entire_tlb(&self) {
        arch::reload_cr3();
    }

    /// Invalidate the TLB entry for `laddr` in the live address space.
    pub fn flush_tlb(&self, laddr: LinearAddress) {
        arch::invlpg(laddr);
    }

    // ========================================================================
    // Registries
    // ========================================================================

    pub(crate) fn register_vmo(&self, vmo: &Arc<VmObject>) {
        let _disabler = InterruptDisabler::new();
        self.vmos.lock().insert(vmo.id().0, Arc::downgrade(vmo));
    }

    pub(crate) fn unregister_vmo(&self, id: VmObjectId) {
        let _disabler = InterruptDisabler::new();
        self.vmos.lock().remove(&id.0);
    }

    pub(crate) fn register_region(&self, region: &Arc<Region>) {
        let _disabler = InterruptDisabler::new();
        self.regions.lock().insert(region.id(), Arc::downgrade(region));
    }

    pub(crate) fn unregister_region(&self, id: u32) {
        let _disabler = InterruptDisabler::new();
        self.regions.lock().remove(&id);
    }

    /// Number of live registered regions.
    pub fn region_count(&self) -> usize {
        self.regions
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of live registered VM objects.
    pub fn vmo_count(&self) -> usize {
        self.vmos
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Serialized test scope: the paging tests share one simulated machine
    /// and one singleton, so they run one at a time against fresh state.
    pub(crate) struct VmTestScope {
        _guard: MutexGuard<'static, ()>,
    }

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn vm_test_scope() -> VmTestScope {
        let guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        // Tear down leftovers from the previous scope against the old
        // manager, then start the world over.
        crate::process::set_current(None);
        crate::arch::x86::sim::reset();
        super::init();
        VmTestScope { _guard: guard }
    }
}
