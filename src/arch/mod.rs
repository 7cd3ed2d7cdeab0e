//! Architecture support.
//!
//! Everything privileged or target-specific lives under here: interrupt
//! flag control, TLB maintenance, CR3, and the translation of typed
//! addresses into usable pointers.

pub mod x86;

pub use x86::{
    current_cr3, disable_interrupts, enable_interrupts, enable_paging, interrupts_disabled,
    interrupts_enabled, invlpg, laddr_ptr, phys_ptr, reload_cr3, set_cr3, wait_for_interrupt,
    InterruptDisabler,
};
