//! The modeled MIPS-like machine.
//!
//! SableOS targets a single-core, 32-bit, software-managed-TLB machine
//! in the MIPS mold. Rather than a real port, the machine is modeled in
//! process: physical memory is a boxed byte array, the TLB is a 64-entry
//! software array with random replacement, and the interrupt priority
//! level is a plain counter. Everything above this module (paging,
//! swap, processes, syscalls) is real kernel code running against the
//! model; only user-mode instruction execution does not exist, so
//! entering user mode parks the kernel thread once the transition is
//! fully staged.

pub mod interrupts;
pub mod ram;
pub mod tlb;
pub mod trapframe;
pub mod usermode;

use crate::mm::{PhysicalAddress, VirtualAddress};

/// Size of a page / frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE), for address-to-page-number shifts.
pub const PAGE_SHIFT: u32 = 12;

/// Base of the kernel's direct-mapped segment. Physical address `p` is
/// visible to the kernel at virtual address `p + KSEG0_BASE` without a
/// TLB translation.
pub const KSEG0_BASE: u32 = 0x8000_0000;

/// Top of user space, and the initial user stack pointer. The stack
/// grows downward from here.
pub const USERSTACK: VirtualAddress = VirtualAddress::new(0x8000_0000);

/// Translate a physical address into the kernel's direct-mapped window.
pub const fn paddr_to_kvaddr(paddr: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(paddr.as_u32().wrapping_add(KSEG0_BASE))
}

/// Translate a direct-mapped kernel virtual address back to physical.
///
/// Panics if `kvaddr` is not in the direct-mapped segment; passing a
/// user address here is a kernel bug.
pub fn kvaddr_to_paddr(kvaddr: VirtualAddress) -> PhysicalAddress {
    let v = kvaddr.as_u32();
    if v < KSEG0_BASE {
        panic!("kvaddr_to_paddr: 0x{:08x} is not a kseg0 address", v);
    }
    PhysicalAddress::new(v - KSEG0_BASE)
}
