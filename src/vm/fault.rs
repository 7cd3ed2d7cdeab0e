//! Page fault classification and dispatch.
//!
//! The exception vector hands us a fault record (CR2 plus the hardware
//! error code) with interrupts disabled. We locate the region of the
//! current process containing the faulting address, classify the fault and
//! dispatch:
//!
//! - not-present, inode-backed region: demand-page from the inode
//! - not-present, anonymous region: demand-zero
//! - protection violation on a COW page: copy (or reclaim when unshared)
//! - anything else: the process is toast
//!
//! Either the fault is serviced and the faulting instruction retries, or
//! the caller terminates the offending process. A fault never corrupts
//! another process or the kernel.

use crate::arch;
use crate::dbgln;
use crate::process;
use crate::vm::addr::LinearAddress;
use crate::vm::memory_manager::MemoryManager;

/// x86 #PF error code, bit 0: set for protection violations, clear for
/// not-present faults.
const FLAG_PROTECTION_VIOLATION: u16 = 1 << 0;
/// x86 #PF error code, bit 1: set for writes.
const FLAG_WRITE: u16 = 1 << 1;
/// x86 #PF error code, bit 2: set for ring-3 accesses.
const FLAG_USER: u16 = 1 << 2;

/// Outcome of servicing a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// Serviced; retry the faulting instruction.
    Continue,
    /// Unserviceable; terminate the offending process.
    ShouldCrash,
}

/// A page fault as delivered by the exception vector.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    code: u16,
    laddr: LinearAddress,
}

impl PageFault {
    pub fn new(code: u16, laddr: LinearAddress) -> Self {
        Self { code, laddr }
    }

    /// A fault on a mapping that is not present.
    pub fn not_present(laddr: LinearAddress, write: bool, user: bool) -> Self {
        let mut code = 0;
        if write {
            code |= FLAG_WRITE;
        }
        if user {
            code |= FLAG_USER;
        }
        Self::new(code, laddr)
    }

    /// A fault on a present mapping that denied the access.
    pub fn protection_violation(laddr: LinearAddress, write: bool, user: bool) -> Self {
        let mut fault = Self::not_present(laddr, write, user);
        fault.code |= FLAG_PROTECTION_VIOLATION;
        fault
    }

    pub fn laddr(&self) -> LinearAddress {
        self.laddr
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn is_not_present(&self) -> bool {
        self.code & FLAG_PROTECTION_VIOLATION == 0
    }

    pub fn is_protection_violation(&self) -> bool {
        !self.is_not_present()
    }

    pub fn is_write(&self) -> bool {
        self.code & FLAG_WRITE != 0
    }

    pub fn is_user(&self) -> bool {
        self.code & FLAG_USER != 0
    }
}

/// Entry point from the exception vector. Called with interrupts disabled.
pub fn handle_page_fault(fault: &PageFault) -> PageFaultResponse {
    debug_assert!(arch::interrupts_disabled());
    let mm = MemoryManager::the();
    assert!(
        fault.laddr().page_base() != mm.quickmap_addr(),
        "page fault at the quickmap address"
    );
    let Some(process) = process::current() else {
        crate::println!(
            "Page fault at L{:x} with no current process",
            fault.laddr().get()
        );
        return PageFaultResponse::ShouldCrash;
    };
    let Some(region) = mm.region_from_laddr(&process, fault.laddr()) else {
        crate::println!("NP(error) fault at invalid address L{:x}", fault.laddr().get());
        return PageFaultResponse::ShouldCrash;
    };
    let page_index_in_region = region.page_index_from_address(fault.laddr());
    if fault.is_not_present() {
        if region.vmo().inode().is_some() {
            dbgln!(
                "NP(inode) fault in region '{}' page {}",
                region.name(),
                page_index_in_region
            );
            match mm.page_in_from_inode(&region, page_index_in_region) {
                Ok(()) => PageFaultResponse::Continue,
                Err(_) => PageFaultResponse::ShouldCrash,
            }
        } else {
            dbgln!(
                "NP(zero) fault in region '{}' page {}",
                region.name(),
                page_index_in_region
            );
            match mm.zero_page(&region, page_index_in_region) {
                Ok(()) => PageFaultResponse::Continue,
                Err(_) => PageFaultResponse::ShouldCrash,
            }
        }
    } else if region.is_cow_page(page_index_in_region) {
        dbgln!(
            "PV(cow) fault in region '{}' page {}",
            region.name(),
            page_index_in_region
        );
        match mm.copy_on_write(&region, page_index_in_region) {
            Ok(()) => PageFaultResponse::Continue,
            Err(_) => PageFaultResponse::ShouldCrash,
        }
    } else {
        crate::println!(
            "PV(error) fault in region '{}' page {}",
            region.name(),
            page_index_in_region
        );
        PageFaultResponse::ShouldCrash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::sim;
    use crate::arch::InterruptDisabler;
    use crate::fs::test_support::StubInode;
    use crate::process::{set_current, Process, Ring};
    use crate::vm::addr::PAGE_SIZE;
    use crate::vm::memory_manager::testing::vm_test_scope;
    use alloc::sync::Arc;
    use alloc::vec;

    fn fault(fault: &PageFault) -> PageFaultResponse {
        let _disabler = InterruptDisabler::new();
        handle_page_fault(fault)
    }

    #[test]
    fn test_error_code_bits() {
        let laddr = crate::vm::LinearAddress::new(0x1234);
        let np = PageFault::not_present(laddr, true, true);
        assert!(np.is_not_present());
        assert!(!np.is_protection_violation());
        assert!(np.is_write());
        assert!(np.is_user());

        let pv = PageFault::protection_violation(laddr, false, false);
        assert!(pv.is_protection_violation());
        assert!(!pv.is_write());
        assert!(!pv.is_user());
        assert_eq!(pv.laddr(), laddr);
    }

    #[test]
    fn test_demand_zero() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let process = Process::new("zero", 1, Ring::Ring3).unwrap();
        set_current(Some(process.clone()));
        mm.enter_process_paging_scope(&process);

        let base = crate::vm::LinearAddress::new(0x1000_0000);
        let region = process.allocate_region(base, 8192, "demo", true, true);

        let allocated_before = mm.stats().pages_allocated();
        let response = fault(&PageFault::not_present(base, true, true));
        assert_eq!(response, PageFaultResponse::Continue);

        // One user frame materialized into slot 0.
        assert_eq!(mm.stats().pages_allocated(), allocated_before + 1);
        assert_eq!(mm.stats().zero_fill_faults(), 1);
        assert!(region.vmo().pages().lock()[0].is_some());
        assert!(region.vmo().pages().lock()[1].is_none());

        // PTE present and writable; page contents all zero.
        assert!(mm.validate_user_write(&process, base));
        for offset in [0u32, 1, 0x7ff, 0xfff] {
            assert_eq!(sim::read_byte(base.offset(offset)), 0);
        }
        set_current(None);
    }

    #[test]
    fn test_demand_page_from_inode() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let process = Process::new("pager", 1, Ring::Ring3).unwrap();
        set_current(Some(process.clone()));
        mm.enter_process_paging_scope(&process);

        let inode = StubInode::new(vec![0xab; 3000]);
        let base = crate::vm::LinearAddress::new(0x2000_0000);
        let _region =
            process.allocate_file_backed_region(base, PAGE_SIZE, inode, "file", true, false);

        let response = fault(&PageFault::not_present(base, false, true));
        assert_eq!(response, PageFaultResponse::Continue);
        assert_eq!(mm.stats().inode_faults(), 1);

        // First 3000 bytes from the inode, the short-read tail zeroed.
        for offset in [0u32, 1499, 2999] {
            assert_eq!(sim::read_byte(base.offset(offset)), 0xab);
        }
        for offset in [3000u32, 3500, 4095] {
            assert_eq!(sim::read_byte(base.offset(offset)), 0);
        }
        set_current(None);
    }

    #[test]
    fn test_cow_clone_copies_on_first_write() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let parent = Process::new("parent", 1, Ring::Ring3).unwrap();
        set_current(Some(parent.clone()));
        mm.enter_process_paging_scope(&parent);

        let base = crate::vm::LinearAddress::new(0x1000_0000);
        let parent_region = parent.allocate_region(base, PAGE_SIZE, "heap", true, true);
        assert_eq!(fault(&PageFault::not_present(base, true, true)), PageFaultResponse::Continue);
        sim::write_byte(base, 0x42);

        let child = parent.clone_address_space(2, "child").unwrap();
        let allocated_before = mm.stats().pages_allocated();

        // Both sides demoted to read-only over the same frame.
        assert!(parent_region.is_cow_page(0));
        assert!(!sim::user_probe(base, true));
        assert!(sim::user_probe(base, false));

        // Parent reads its byte back without faulting or allocating.
        assert_eq!(sim::read_byte(base), 0x42);
        assert_eq!(mm.stats().pages_allocated(), allocated_before);

        // First write in the parent copies the page.
        assert_eq!(
            fault(&PageFault::protection_violation(base, true, true)),
            PageFaultResponse::Continue
        );
        assert_eq!(mm.stats().pages_allocated(), allocated_before + 1);
        assert_eq!(mm.stats().cow_faults(), 1);
        assert!(sim::user_probe(base, true));
        sim::write_byte(base, 0x99);
        assert_eq!(sim::read_byte(base), 0x99);

        // The child still sees the original byte.
        mm.enter_process_paging_scope(&child);
        assert_eq!(sim::read_byte(base), 0x42);
        set_current(None);
    }

    #[test]
    fn test_cow_reclaims_unshared_page_without_copying() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let parent = Process::new("parent", 1, Ring::Ring3).unwrap();
        set_current(Some(parent.clone()));
        mm.enter_process_paging_scope(&parent);

        let base = crate::vm::LinearAddress::new(0x1000_0000);
        let parent_region = parent.allocate_region(base, PAGE_SIZE, "heap", true, true);
        assert_eq!(fault(&PageFault::not_present(base, true, true)), PageFaultResponse::Continue);
        sim::write_byte(base, 0x42);

        let child = parent.clone_address_space(2, "child").unwrap();
        drop(child);

        // The child's handles are gone: the parent's write flips the PTE
        // back to writable without allocating anything.
        let allocated_before = mm.stats().pages_allocated();
        assert_eq!(
            fault(&PageFault::protection_violation(base, true, true)),
            PageFaultResponse::Continue
        );
        assert_eq!(mm.stats().pages_allocated(), allocated_before);
        assert_eq!(mm.stats().cow_faults(), 0);
        assert_eq!(mm.stats().cow_reclaims(), 1);
        assert!(!parent_region.is_cow_page(0));
        assert!(sim::user_probe(base, true));
        assert_eq!(sim::read_byte(base), 0x42);
        set_current(None);
    }

    #[test]
    fn test_shared_frames_in_cloned_address_space() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let parent = Process::new("parent", 1, Ring::Ring3).unwrap();
        set_current(Some(parent.clone()));
        mm.enter_process_paging_scope(&parent);

        let base = crate::vm::LinearAddress::new(0x1000_0000);
        let parent_region = parent.allocate_region(base, PAGE_SIZE, "heap", true, true);
        assert_eq!(fault(&PageFault::not_present(base, true, true)), PageFaultResponse::Continue);

        let child = parent.clone_address_space(2, "child").unwrap();
        let child_region = child.region_containing(base).unwrap();

        // Same frame, two object slots holding it.
        let parent_frame = parent_region.vmo().pages().lock()[0].clone().unwrap();
        let child_frame = child_region.vmo().pages().lock()[0].clone().unwrap();
        assert!(Arc::ptr_eq(&parent_frame, &child_frame));
        assert!(!Arc::ptr_eq(parent_region.vmo(), child_region.vmo()));
        set_current(None);
    }

    #[test]
    fn test_null_dereference_crashes() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let process = Process::new("crash", 1, Ring::Ring3).unwrap();
        set_current(Some(process.clone()));
        mm.enter_process_paging_scope(&process);

        let response = fault(&PageFault::not_present(crate::vm::LinearAddress::new(0), false, true));
        assert_eq!(response, PageFaultResponse::ShouldCrash);
        set_current(None);
    }

    #[test]
    fn test_write_to_read_only_region_crashes() {
        let _scope = vm_test_scope();
        let mm = crate::vm::MemoryManager::the();

        let process = Process::new("ro", 1, Ring::Ring3).unwrap();
        set_current(Some(process.clone()));
        mm.enter_process_paging_scope(&process);

        let inode = StubInode::new(vec![0u8; PAGE_SIZE]);
        let base = crate::vm::LinearAddress::new(0x2000_0000);
        let _region =
            process.allocate_file_backed_region(base, PAGE_SIZE, inode, "ro", true, false);
        assert_eq!(fault(&PageFault::not_present(base, false, true)), PageFaultResponse::Continue);

        // Present but not COW and not writable: a write is just an error.
        let response = fault(&PageFault::protection_violation(base, true, true));
        assert_eq!(response, PageFaultResponse::ShouldCrash);
        set_current(None);
    }
}
