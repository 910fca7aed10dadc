//! Per-process address spaces.
//!
//! An address space is an ordered set of [`Region`]s (uniform-permission
//! virtual ranges) plus a demand-filled page table: pages come into
//! existence the first time they fault, each backed by one coremap
//! frame or, when evicted, one swap slot. The stack has no region; it
//! is an implicit window below `USERSTACK` tracked by a page count.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::{coremap, swap, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::machine::{interrupts, ram, tlb, USERSTACK};

bitflags! {
    /// Region permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        const READ = 0x4;
        const WRITE = 0x2;
        const EXEC = 0x1;
    }
}

/// A contiguous virtual range with uniform permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub vaddr: VirtualAddress,
    pub size: u32,
    pub flags: RegionFlags,
}

impl Region {
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        let a = addr.as_u32();
        let base = self.vaddr.as_u32();
        a >= base && a < base + self.size
    }

    pub fn end(&self) -> VirtualAddress {
        self.vaddr.add(self.size)
    }
}

/// Where a page's contents currently live. The enum makes the
/// frame/slot fields mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    /// Resident in the frame at this physical address.
    Mapped(PhysicalAddress),
    /// Evicted to this swap slot.
    Swapped(u32),
}

/// One virtual page owned by one address space.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Virtual page number.
    pub vpn: u32,
    pub loc: PageLocation,
}

pub(crate) struct AsInner {
    pub(crate) regions: Vec<Region>,
    pub(crate) pages: Vec<Page>,
    /// Pages of implicit stack grown so far.
    pub(crate) stack_pages: u32,
    /// Captured on the first sbrk call.
    pub(crate) heap_base: Option<VirtualAddress>,
    /// Next heap byte; tracks the end of the highest defined region
    /// until sbrk starts moving it.
    pub(crate) heap_cursor: VirtualAddress,
}

static NEXT_AS_ID: AtomicU64 = AtomicU64::new(1);

/// A process's virtual address layout.
pub struct AddressSpace {
    id: u64,
    inner: Mutex<AsInner>,
}

impl AddressSpace {
    /// A fresh, empty address space.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_AS_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(AsInner {
                regions: Vec::new(),
                pages: Vec::new(),
                stack_pages: 0,
                heap_base: None,
                heap_cursor: VirtualAddress::new(0),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, AsInner> {
        self.inner.lock()
    }

    /// Non-blocking inner access for the eviction path, which already
    /// holds the coremap lock and must not invert the lock order.
    pub(crate) fn try_lock_inner(&self) -> Option<MutexGuard<'_, AsInner>> {
        self.inner.try_lock()
    }

    /// Duplicate `old` for fork: same regions, same heap and stack
    /// bookkeeping, and a deep copy of every page's contents.
    pub fn copy(old: &Arc<Self>) -> KernelResult<Arc<Self>> {
        let new = Self::create();

        let (regions, stack_pages, heap_base, heap_cursor, vpns) = {
            let inner = old.lock_inner();
            (
                inner.regions.clone(),
                inner.stack_pages,
                inner.heap_base,
                inner.heap_cursor,
                inner.pages.iter().map(|p| p.vpn).collect::<Vec<_>>(),
            )
        };
        {
            let mut inner = new.lock_inner();
            inner.regions = regions;
            inner.stack_pages = stack_pages;
            inner.heap_base = heap_base;
            inner.heap_cursor = heap_cursor;
        }

        for vpn in vpns {
            let dst = match coremap::alloc_user(1, Some(&new)) {
                Ok(p) => p,
                Err(e) => {
                    new.destroy();
                    return Err(e);
                }
            };
            // The source may be evicted between residency and the copy
            // (the frame touch holds no lock); re-validate and retry
            // until a copy went through from a stable frame.
            loop {
                let src = match ensure_resident(old, vpn) {
                    Ok(p) => p,
                    Err(e) => {
                        coremap::free_by_paddr(dst);
                        new.destroy();
                        return Err(e);
                    }
                };
                ram::copy(dst, src, PAGE_SIZE);
                if old.page_location(vpn) == Some(PageLocation::Mapped(src)) {
                    break;
                }
            }
            new.lock_inner().pages.push(Page {
                vpn,
                loc: PageLocation::Mapped(dst),
            });
        }
        Ok(new)
    }

    /// Release every page and region. Idempotent; also run on drop as a
    /// backstop for error paths.
    pub fn destroy(&self) {
        let pages = {
            let mut inner = self.lock_inner();
            inner.regions.clear();
            core::mem::take(&mut inner.pages)
        };
        for page in pages {
            release_page(&page);
        }
    }

    /// Append a region. Regions are defined before any page exists in
    /// them; the heap cursor advances to the page-rounded end of the
    /// highest region defined so far.
    pub fn define_region(
        &self,
        vaddr: VirtualAddress,
        size: u32,
        flags: RegionFlags,
    ) -> KernelResult<()> {
        if vaddr.as_u32().saturating_add(size) > USERSTACK.as_u32() {
            return Err(KernelError::BadAddress {
                addr: vaddr.as_u32(),
            });
        }
        let mut inner = self.lock_inner();
        let region = Region { vaddr, size, flags };
        if inner.regions.iter().any(|r| {
            r.vaddr.as_u32() < region.end().as_u32() && region.vaddr.as_u32() < r.end().as_u32()
        }) {
            return Err(KernelError::InvalidArgument {
                name: "vaddr",
                value: "region overlaps an existing region",
            });
        }
        inner.regions.push(region);
        inner.heap_cursor = vaddr.add(size).page_round_up();
        Ok(())
    }

    /// Define the user stack: resets the implicit stack window and
    /// returns the initial stack pointer.
    pub fn define_stack(&self) -> VirtualAddress {
        self.lock_inner().stack_pages = 0;
        USERSTACK
    }

    /// Make this address space current on the MMU: flush the TLB.
    pub fn activate(&self) {
        let _ipl = interrupts::splhigh();
        tlb::tlb_invalidate_all();
    }

    /// The region containing `addr`, if any.
    pub fn region_containing(&self, addr: VirtualAddress) -> Option<Region> {
        self.lock_inner()
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .copied()
    }

    /// Location of the page with virtual page number `vpn`.
    pub fn page_location(&self, vpn: u32) -> Option<PageLocation> {
        self.lock_inner()
            .pages
            .iter()
            .find(|p| p.vpn == vpn)
            .map(|p| p.loc)
    }

    /// Allocate and install a zeroed page for the faulting address.
    /// Returns the frame it is mapped into.
    pub fn page_create(
        self: &Arc<Self>,
        faultaddress: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        let vpn = faultaddress.page_number();
        let paddr = coremap::alloc_user(1, Some(self))?;
        let mut inner = self.lock_inner();
        debug_assert!(
            !inner.pages.iter().any(|p| p.vpn == vpn),
            "page_create for an existing page"
        );
        inner.pages.push(Page {
            vpn,
            loc: PageLocation::Mapped(paddr),
        });
        Ok(paddr)
    }

    /// Flip a page to Mapped (after swap-in).
    pub fn set_page_mapped(&self, vpn: u32, paddr: PhysicalAddress) {
        let mut inner = self.lock_inner();
        let page = inner
            .pages
            .iter_mut()
            .find(|p| p.vpn == vpn)
            .unwrap_or_else(|| panic!("no page for vpn 0x{:x} in address space {}", vpn, self.id));
        page.loc = PageLocation::Mapped(paddr);
    }

    /// Number of stack pages grown so far.
    pub fn stack_pages(&self) -> u32 {
        self.lock_inner().stack_pages
    }

    /// Record one more implicit stack page.
    pub fn grow_stack(&self) {
        self.lock_inner().stack_pages += 1;
    }

    /// Whether `addr` falls in the implicit stack window: within
    /// `stack_pages + 1` pages below USERSTACK.
    pub fn in_stack_window(&self, addr: VirtualAddress) -> bool {
        let pages = self.lock_inner().stack_pages;
        let window = (pages as u64 + 1) * PAGE_SIZE as u64;
        let top = USERSTACK.as_u32() as u64;
        (addr.as_u32() as u64) >= top.saturating_sub(window) && (addr.as_u32() as u64) < top
    }

    // -----------------------------------------------------------------
    // Heap bookkeeping (sbrk)
    // -----------------------------------------------------------------

    pub fn heap_cursor(&self) -> VirtualAddress {
        self.lock_inner().heap_cursor
    }

    /// Capture the heap base on the first sbrk call.
    pub fn capture_heap_base(&self) {
        let mut inner = self.lock_inner();
        if inner.heap_base.is_none() {
            inner.heap_base = Some(inner.heap_cursor);
        }
    }

    pub fn heap_base(&self) -> Option<VirtualAddress> {
        self.lock_inner().heap_base
    }

    /// Extend the heap by `delta` bytes (page multiple): a fresh
    /// anonymous read/write region at the cursor. Returns the old
    /// cursor (the base of the new allocation).
    pub fn grow_heap(&self, delta: u32) -> KernelResult<VirtualAddress> {
        let old = self.heap_cursor();
        self.define_region(old, delta, RegionFlags::READ | RegionFlags::WRITE)?;
        Ok(old)
    }

    /// Move the heap cursor down to `new_cursor`, deleting regions
    /// strictly above it, truncating a straddling region, and freeing
    /// every page above the cursor. The TLB is flushed afterward.
    pub fn shrink_heap(&self, new_cursor: VirtualAddress) {
        let first_doomed_vpn = new_cursor.page_round_up().page_number();
        let dead: Vec<Page> = {
            let mut inner = self.lock_inner();
            let cursor = new_cursor.as_u32();
            let stack_base = USERSTACK.as_u32() - inner.stack_pages * PAGE_SIZE as u32;

            inner.regions.retain_mut(|region| {
                // Never touch anything reaching into the stack window.
                if region.vaddr.as_u32() >= stack_base {
                    return true;
                }
                if region.vaddr.as_u32() >= cursor {
                    return false;
                }
                if region.end().as_u32() > cursor {
                    // Straddles the cursor: keep the part below it.
                    region.size = cursor - region.vaddr.as_u32();
                }
                true
            });

            let (dead, live): (Vec<Page>, Vec<Page>) = inner
                .pages
                .drain(..)
                .partition(|p| p.vpn >= first_doomed_vpn && p.vpn < stack_base >> 12);
            inner.pages = live;
            inner.heap_cursor = new_cursor;
            dead
        };
        // Frames and slots are released outside the inner lock; the
        // coremap lock is never taken under it.
        for page in &dead {
            release_page(page);
        }
        let _ipl = interrupts::splhigh();
        tlb::tlb_invalidate_all();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Error paths may drop an address space without an explicit
        // destroy; reclaim whatever is still held.
        self.destroy();
    }
}

/// Free whatever backs a page: its frame (plus any TLB entry) or its
/// swap slot.
fn release_page(page: &Page) {
    match page.loc {
        PageLocation::Mapped(paddr) => {
            tlb::tlb_invalidate(VirtualAddress::new(page.vpn << 12));
            coremap::free_by_paddr(paddr);
        }
        PageLocation::Swapped(slot) => {
            swap::free_slot(slot);
        }
    }
}

/// Frame currently backing `vpn`, swapping the page back in if needed.
/// Used by the fork copy path; the fault handler has its own version
/// that also touches the TLB.
fn ensure_resident(space: &Arc<AddressSpace>, vpn: u32) -> KernelResult<PhysicalAddress> {
    let loc = space
        .page_location(vpn)
        .unwrap_or_else(|| panic!("copy of a page that is not in its address space"));
    match loc {
        PageLocation::Mapped(paddr) => Ok(paddr),
        PageLocation::Swapped(slot) => {
            let paddr = swap::swap_in(slot, space)?;
            space.set_page_mapped(vpn, paddr);
            Ok(paddr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_address_space_is_empty() {
        let space = AddressSpace::create();
        assert!(space.region_containing(VirtualAddress::new(0x1000)).is_none());
        assert_eq!(space.stack_pages(), 0);
        assert!(space.heap_base().is_none());
    }

    #[test]
    fn test_address_space_ids_are_unique() {
        let a = AddressSpace::create();
        let b = AddressSpace::create();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_define_region_advances_heap_cursor() {
        let space = AddressSpace::create();
        space
            .define_region(VirtualAddress::new(0x40_0000), 0x1800, RegionFlags::READ)
            .expect("define");
        // Cursor rounds up to the next page boundary past the region.
        assert_eq!(space.heap_cursor().as_u32(), 0x40_2000);
        let region = space
            .region_containing(VirtualAddress::new(0x40_1000))
            .expect("containing region");
        assert_eq!(region.vaddr.as_u32(), 0x40_0000);
        assert!(space
            .region_containing(VirtualAddress::new(0x40_1800))
            .is_none());
    }

    #[test]
    fn test_regions_may_not_overlap() {
        let space = AddressSpace::create();
        space
            .define_region(VirtualAddress::new(0x40_0000), 0x2000, RegionFlags::READ)
            .expect("first region");
        assert!(space
            .define_region(
                VirtualAddress::new(0x40_1000),
                0x2000,
                RegionFlags::READ | RegionFlags::WRITE
            )
            .is_err());
    }

    #[test]
    fn test_region_may_not_cross_userstack() {
        let space = AddressSpace::create();
        assert!(space
            .define_region(
                VirtualAddress::new(USERSTACK.as_u32() - 0x1000),
                0x2000,
                RegionFlags::READ
            )
            .is_err());
    }

    #[test]
    fn test_define_stack_resets_window() {
        let space = AddressSpace::create();
        let sp = space.define_stack();
        assert_eq!(sp, USERSTACK);
        assert_eq!(space.stack_pages(), 0);
        // One-page grace window below the stack top.
        assert!(space.in_stack_window(VirtualAddress::new(USERSTACK.as_u32() - 1)));
        assert!(!space.in_stack_window(VirtualAddress::new(USERSTACK.as_u32() - 0x2000)));
        space.grow_stack();
        assert!(space.in_stack_window(VirtualAddress::new(USERSTACK.as_u32() - 0x2000)));
    }

    #[test]
    fn test_heap_base_captured_once() {
        let space = AddressSpace::create();
        space
            .define_region(VirtualAddress::new(0x40_0000), 0x1000, RegionFlags::READ)
            .expect("define");
        space.capture_heap_base();
        let base = space.heap_base().expect("captured");
        space
            .define_region(VirtualAddress::new(0x50_0000), 0x1000, RegionFlags::READ)
            .expect("define");
        space.capture_heap_base();
        assert_eq!(space.heap_base(), Some(base));
    }
}
