//! Swap subsystem: page eviction to the raw swap disk.
//!
//! When the coremap has no free run, the allocator runs an eviction
//! campaign: a circular scan from a rotating cursor picks in-use,
//! user-owned frames (never kernel ones), writes their contents to free
//! slots on `lhd0raw:`, and hands the frames back. The coremap lock is
//! dropped across the disk write and the victim re-validated after
//! reacquisition. A later fault on an evicted page swaps it back in.
//!
//! Without a swap disk the subsystem sits in NoSwap and allocation
//! failures surface as ENOMEM directly.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::addrspace::{AddressSpace, PageLocation};
use super::{coremap, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::error::KernelResult;
use crate::fs::file::O_RDWR;
use crate::fs::uio::Uio;
use crate::fs::{vfs, Vnode};
use crate::machine::{interrupts, tlb};

/// Name of the raw swap device.
pub const SWAP_DEVICE: &str = "lhd0raw:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapState {
    Uninit,
    NoSwap,
    Ready,
}

/// One backing-store page.
struct SwapSlot {
    used: bool,
    /// Byte offset of the slot within the device.
    offset: u64,
}

struct SwapMap {
    state: SwapState,
    slots: Vec<SwapSlot>,
    vnode: Option<Arc<dyn Vnode>>,
    /// Rotating eviction cursor, spreading victims across the coremap.
    next_victim: u32,
}

static SWAP: Mutex<SwapMap> = Mutex::new(SwapMap {
    state: SwapState::Uninit,
    slots: Vec::new(),
    vnode: None,
    next_victim: 0,
});

/// Probe for the swap device and size the slot table. Called once at
/// boot, after the VFS is up.
pub fn init() {
    let mut sw = SWAP.lock();
    if sw.state != SwapState::Uninit {
        return;
    }
    let vnode = match vfs::open(SWAP_DEVICE, O_RDWR) {
        Ok(v) => v,
        Err(err) => {
            log::warn!("[SWAP] swap disk not found ({}); running without swap", err);
            sw.state = SwapState::NoSwap;
            return;
        }
    };
    let size = match vnode.size() {
        Ok(s) => s,
        Err(_) => {
            log::warn!("[SWAP] stat on swap disk failed; running without swap");
            sw.state = SwapState::NoSwap;
            return;
        }
    };
    let slot_count = (size / PAGE_SIZE as u64).saturating_sub(1);
    sw.slots = (0..slot_count)
        .map(|i| SwapSlot {
            used: false,
            offset: i * PAGE_SIZE as u64,
        })
        .collect();
    sw.vnode = Some(vnode);
    sw.state = SwapState::Ready;
    log::info!("[SWAP] ready, {} slots on {}", slot_count, SWAP_DEVICE);
}

/// Whether eviction is available.
pub fn is_ready() -> bool {
    SWAP.lock().state == SwapState::Ready
}

/// Slots currently in use (diagnostics).
pub fn used_slots() -> usize {
    SWAP.lock().slots.iter().filter(|s| s.used).count()
}

/// Release a slot (page freed or swapped back in).
pub fn free_slot(slot: u32) {
    let mut sw = SWAP.lock();
    if sw.state != SwapState::Ready {
        panic!("swap: freeing slot {} with no swap disk", slot);
    }
    debug_assert!(sw.slots[slot as usize].used, "freeing a free swap slot");
    sw.slots[slot as usize].used = false;
}

/// Claim a free slot. Exhausting the backing store is fatal.
fn alloc_slot_locked(sw: &mut SwapMap) -> u32 {
    for (i, slot) in sw.slots.iter_mut().enumerate() {
        if !slot.used {
            slot.used = true;
            return i as u32;
        }
    }
    panic!("swap: out of swap slots");
}

/// Bring a swapped page back: allocate a frame (which may itself
/// evict), copy the slot into it, and release the slot. The caller
/// flips the page's location.
pub fn swap_in(slot: u32, owner: &Arc<AddressSpace>) -> KernelResult<PhysicalAddress> {
    let paddr = coremap::alloc_user(1, Some(owner))?;

    let (vnode, offset) = {
        let sw = SWAP.lock();
        if sw.state != SwapState::Ready {
            panic!("swap: swap-in with no swap disk");
        }
        (
            Arc::clone(sw.vnode.as_ref().expect("swap vnode in Ready state")),
            sw.slots[slot as usize].offset,
        )
    };

    let mut buf = vec![0u8; PAGE_SIZE];
    let mut uio = Uio::kernel_read(&mut buf, offset);
    if vnode.read(&mut uio).is_err() || uio.resid() != 0 {
        panic!("swap: read of slot {} failed", slot);
    }
    crate::machine::ram::write(paddr, &buf);

    free_slot(slot);
    #[cfg(feature = "swaptrace")]
    log::trace!("[SWAP] in: slot {} -> frame 0x{:08x}", slot, paddr.as_u32());
    Ok(paddr)
}

/// Evict enough user frames to free a run of `npages`.
///
/// `for_space` is the address space the triggering allocation belongs
/// to, if any; its pages with live TLB entries are skipped so a fault
/// does not evict its own working set.
pub fn swap_out_campaign(npages: usize, for_space: Option<&Arc<AddressSpace>>) -> KernelResult<()> {
    let mut sw = SWAP.lock();
    if sw.state != SwapState::Ready {
        panic!("swap: eviction campaign with no swap disk");
    }
    let npages = npages as u32;

    // Bounded restarts: a victim invalidated while the coremap lock was
    // dropped costs one rescan, not an unbounded loop.
    let mut attempts = 0;
    'campaign: loop {
        attempts += 1;
        if attempts > 64 {
            panic!("swap: eviction campaign cannot make progress");
        }
        if attempts > 1 {
            // A stale victim means someone else is mutating the
            // coremap; give them room before rescanning.
            crate::sync::relax();
        }

        // Choose a run under the coremap lock, circularly from the
        // cursor. The scan restarts from scratch after every lock drop;
        // no index survives a suspension point.
        let (start, page_count) = {
            let cm = coremap::lock();
            let page_count = cm.page_count();
            let mut found = None;
            'scan: for i in 0..page_count {
                let start = (sw.next_victim + i) % page_count;
                if start + npages > page_count {
                    continue;
                }
                for idx in start..start + npages {
                    let entry = cm.entry(idx);
                    // Every frame of the run must be a user frame;
                    // kernel frames cannot be evicted.
                    if !entry.is_user_frame() {
                        continue 'scan;
                    }
                    if let Some(fs) = for_space {
                        if entry.owned_by(fs) && frame_has_live_tlb_entry(&cm, idx) {
                            // Working-set page of the faulting space.
                            continue 'scan;
                        }
                    }
                }
                found = Some(start);
                break;
            }
            match found {
                Some(start) => (start, page_count),
                None => panic!("swap: out of pages to swap out"),
            }
        };

        for idx in start..start + npages {
            if !evict_one(&mut sw, idx) {
                // Stale victim. Advance the cursor past it so the
                // rescan does not re-pick the same stuck frame.
                sw.next_victim = (idx + 1) % page_count;
                continue 'campaign;
            }
        }
        sw.next_victim = (start + npages) % page_count;
        return Ok(());
    }
}

/// Whether the page backed by frame `idx` has a live TLB entry.
/// Called under the coremap lock; the owner's page table is probed
/// with try_lock to keep the lock order acyclic.
fn frame_has_live_tlb_entry(cm: &coremap::Coremap, idx: u32) -> bool {
    let entry = cm.entry(idx);
    let Some(owner) = entry.owner() else {
        return false;
    };
    let paddr = cm.entry_paddr(idx);
    let Some(inner) = owner.try_lock_inner() else {
        // Contended page table: treat as live and look elsewhere.
        return true;
    };
    inner
        .pages
        .iter()
        .find(|p| p.loc == PageLocation::Mapped(paddr))
        .is_some_and(|p| tlb::tlb_probe(VirtualAddress::new(p.vpn << 12)).is_some())
}

/// Evict the single frame `idx`: write its page to a slot with the
/// coremap lock dropped, re-validate, and free the frame. Returns false
/// if the victim went stale while the lock was down (the slot is
/// returned and the campaign rescans).
fn evict_one(sw: &mut SwapMap, idx: u32) -> bool {
    let (owner, vpn, paddr, vnode, slot, offset) = {
        let cm = coremap::lock();
        let entry = cm.entry(idx);
        if !entry.is_user_frame() {
            return false;
        }
        let Some(owner) = entry.owner() else {
            return false;
        };
        let paddr = cm.entry_paddr(idx);
        // try_lock: the fault path takes the page-table lock before the
        // coremap lock, and inverting that order here would deadlock.
        let Some(inner) = owner.try_lock_inner() else {
            return false;
        };
        let Some(page) = inner
            .pages
            .iter()
            .find(|p| p.loc == PageLocation::Mapped(paddr))
        else {
            // Freshly allocated frame whose page is still being
            // installed; it is not evictable yet.
            return false;
        };
        let vpn = page.vpn;
        drop(inner);

        // Drop the mapping before the copy leaves the frame.
        {
            let _ipl = interrupts::splhigh();
            if let Some(tlb_slot) = tlb::tlb_probe(VirtualAddress::new(vpn << 12)) {
                tlb::tlb_invalidate_slot(tlb_slot);
            }
        }

        let slot = alloc_slot_locked(sw);
        let offset = sw.slots[slot as usize].offset;
        let vnode = Arc::clone(sw.vnode.as_ref().expect("swap vnode in Ready state"));
        (owner, vpn, paddr, vnode, slot, offset)
    };

    // Disk I/O happens with the coremap unlocked.
    let mut buf = vec![0u8; PAGE_SIZE];
    crate::machine::ram::read(paddr, &mut buf);
    let mut uio = Uio::kernel_write(&buf, offset);
    if vnode.write(&mut uio).is_err() || uio.resid() != 0 {
        panic!("swap: write of slot {} failed", slot);
    }

    // Reacquire and re-validate: the frame may have been freed or
    // retargeted while the lock was down.
    let mut cm = coremap::lock();
    let entry = cm.entry(idx);
    let still_victim = entry.is_user_frame() && entry.owned_by(&owner);
    let committed = still_victim
        && match owner.try_lock_inner() {
            Some(mut inner) => {
                if let Some(page) = inner
                    .pages
                    .iter_mut()
                    .find(|p| p.loc == PageLocation::Mapped(paddr))
                {
                    page.loc = PageLocation::Swapped(slot);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

    if committed {
        cm.release_frame(idx);
        #[cfg(feature = "swaptrace")]
        log::trace!(
            "[SWAP] out: frame 0x{:08x} (vpn 0x{:x}) -> slot {}",
            paddr.as_u32(),
            vpn,
            slot
        );
        true
    } else {
        sw.slots[slot as usize].used = false;
        false
    }
}
