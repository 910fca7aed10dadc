//! Software-managed TLB model.
//!
//! 64 entries, each mapping one virtual page to one physical frame.
//! Replacement is random, as on the real part. Callers must hold a
//! raised IPL across TLB writes; the entry points assert it.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::interrupts;
use crate::mm::{PhysicalAddress, VirtualAddress};

/// Number of TLB entries.
pub const NUM_TLB: usize = 64;

bitflags! {
    /// Entry-lo control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbLo: u32 {
        /// Entry may be written through.
        const DIRTY = 0x0000_0400;
        /// Entry is valid.
        const VALID = 0x0000_0200;
    }
}

/// One TLB slot: virtual page -> physical page plus control bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual page number.
    pub vpage: u32,
    /// Physical page number.
    pub ppage: u32,
    /// Control bits.
    pub flags: TlbLo,
}

static TLB: Mutex<[Option<TlbEntry>; NUM_TLB]> = Mutex::new([None; NUM_TLB]);

/// xorshift state for random replacement.
static RAND_STATE: AtomicU32 = AtomicU32::new(0x9d2c_5681);

fn next_random() -> u32 {
    let mut x = RAND_STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    RAND_STATE.store(x, Ordering::Relaxed);
    x
}

/// Write a mapping into a randomly chosen slot.
pub fn tlb_random(vaddr: VirtualAddress, paddr: PhysicalAddress, flags: TlbLo) {
    debug_assert!(
        interrupts::interrupts_disabled(),
        "TLB write with interrupts enabled"
    );
    let entry = TlbEntry {
        vpage: vaddr.page_number(),
        ppage: paddr.page_number(),
        flags,
    };
    let mut tlb = TLB.lock();
    // Prefer an invalid slot; fall back to random eviction.
    if let Some(slot) = tlb.iter().position(Option::is_none) {
        tlb[slot] = Some(entry);
    } else {
        let slot = (next_random() as usize) % NUM_TLB;
        tlb[slot] = Some(entry);
    }
}

/// Find the slot mapping `vaddr`'s page, if any.
pub fn tlb_probe(vaddr: VirtualAddress) -> Option<usize> {
    let vpage = vaddr.page_number();
    let tlb = TLB.lock();
    tlb.iter()
        .position(|slot| matches!(slot, Some(e) if e.vpage == vpage))
}

/// Invalidate one slot.
pub fn tlb_invalidate_slot(slot: usize) {
    debug_assert!(
        interrupts::interrupts_disabled(),
        "TLB write with interrupts enabled"
    );
    TLB.lock()[slot] = None;
}

/// Invalidate the mapping for `vaddr`'s page if it is resident.
pub fn tlb_invalidate(vaddr: VirtualAddress) {
    let _ipl = interrupts::splhigh();
    if let Some(slot) = tlb_probe(vaddr) {
        tlb_invalidate_slot(slot);
    }
}

/// Invalidate every entry. Used on address-space activation.
pub fn tlb_invalidate_all() {
    debug_assert!(
        interrupts::interrupts_disabled(),
        "TLB flush with interrupts enabled"
    );
    let mut tlb = TLB.lock();
    for slot in tlb.iter_mut() {
        *slot = None;
    }
}

/// Read a slot (diagnostics and tests).
pub fn tlb_read(slot: usize) -> Option<TlbEntry> {
    TLB.lock()[slot]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush() {
        let _ipl = interrupts::splhigh();
        tlb_invalidate_all();
    }

    #[test]
    fn test_tlb_install_and_probe() {
        let _g = crate::test_support::global_guard();
        flush();
        let va = VirtualAddress::new(0x0040_0000);
        let pa = PhysicalAddress::new(0x0009_A000);
        {
            let _ipl = interrupts::splhigh();
            tlb_random(va, pa, TlbLo::DIRTY | TlbLo::VALID);
        }
        let slot = tlb_probe(va).expect("freshly installed mapping should probe");
        let entry = tlb_read(slot).expect("probed slot should hold an entry");
        assert_eq!(entry.vpage, 0x0040_0000 >> 12);
        assert_eq!(entry.ppage, 0x0009_A000 >> 12);
        assert!(entry.flags.contains(TlbLo::VALID));
    }

    #[test]
    fn test_tlb_invalidate_removes_mapping() {
        let _g = crate::test_support::global_guard();
        flush();
        let va = VirtualAddress::new(0x0051_3000);
        {
            let _ipl = interrupts::splhigh();
            tlb_random(va, PhysicalAddress::new(0x0000_3000), TlbLo::VALID);
        }
        assert!(tlb_probe(va).is_some());
        tlb_invalidate(va);
        assert!(tlb_probe(va).is_none());
    }

    #[test]
    fn test_tlb_full_replacement_stays_within_capacity() {
        let _g = crate::test_support::global_guard();
        flush();
        let _ipl = interrupts::splhigh();
        for i in 0..(NUM_TLB as u32 + 8) {
            tlb_random(
                VirtualAddress::new(i * 0x1000),
                PhysicalAddress::new(i * 0x1000),
                TlbLo::VALID,
            );
        }
        let populated = (0..NUM_TLB).filter(|&s| tlb_read(s).is_some()).count();
        assert_eq!(populated, NUM_TLB);
    }
}
