//! TLB-miss / page-fault handling.
//!
//! A fault resolves to a frame in three steps: the address must fall in
//! a region (or the implicit stack window), the page is found, created,
//! or swapped back in, and the mapping is installed in the TLB with
//! random replacement under a raised IPL. The kernel-mediated user copy
//! path shares the resolution logic so a copyout touches pages exactly
//! the way a user access would.

extern crate alloc;

use alloc::sync::Arc;

use super::addrspace::{AddressSpace, PageLocation};
use super::{swap, PhysicalAddress, VirtualAddress};
use crate::error::{KernelError, KernelResult};
use crate::machine::{interrupts, tlb};
use crate::process;

/// Why the MMU trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
    /// Write to a TLB entry without the DIRTY bit.
    ReadOnly,
}

/// Resolve `faultaddress` for the current process and install the TLB
/// entry. EFAULT (as `BadAddress`) when there is no current address
/// space, the address is outside every region and the stack window, or
/// a page cannot be materialized.
pub fn vm_fault(faulttype: FaultType, faultaddress: VirtualAddress) -> KernelResult<()> {
    // Per-region permission enforcement is a planned extension; all
    // three fault types resolve identically for now.
    let _ = faulttype;

    let space = process::current_addrspace().ok_or(KernelError::BadAddress {
        addr: faultaddress.as_u32(),
    })?;

    let paddr = fault_in(&space, faultaddress).map_err(|err| match err {
        // A fault that cannot materialize its page is an address error
        // as far as the trapping instruction is concerned.
        KernelError::OutOfMemory { .. } => KernelError::BadAddress {
            addr: faultaddress.as_u32(),
        },
        other => other,
    })?;

    let _ipl = interrupts::splhigh();
    tlb::tlb_random(
        faultaddress.page_base(),
        paddr,
        tlb::TlbLo::DIRTY | tlb::TlbLo::VALID,
    );
    Ok(())
}

/// Resolve one user address to the frame backing it, creating or
/// swapping the page in as needed. Shared by the fault handler and the
/// kernel-mediated user copy path.
pub(crate) fn fault_in(
    space: &Arc<AddressSpace>,
    addr: VirtualAddress,
) -> KernelResult<PhysicalAddress> {
    let in_region = space.region_containing(addr).is_some();
    if !in_region && !space.in_stack_window(addr) {
        return Err(KernelError::BadAddress { addr: addr.as_u32() });
    }

    let vpn = addr.page_number();
    match space.page_location(vpn) {
        Some(PageLocation::Mapped(paddr)) => Ok(paddr),
        Some(PageLocation::Swapped(slot)) => {
            let paddr = swap::swap_in(slot, space)?;
            space.set_page_mapped(vpn, paddr);
            Ok(paddr)
        }
        None => {
            let paddr = space.page_create(addr.page_base())?;
            if !in_region {
                // First touch of a fresh stack page widens the window.
                space.grow_stack();
            }
            Ok(paddr)
        }
    }
}
