//! Physical frame allocator (the coremap).
//!
//! One fixed-size entry per physical frame above the kernel image,
//! tracking use/dirty state, the owning address space (none for kernel
//! allocations), and the start of the contiguous chunk the frame was
//! allocated in. Allocation is linear first-fit over free runs; freeing
//! walks a chunk by its recorded start. A single coarse spinlock guards
//! the whole array.
//!
//! The coremap array itself is accounted at the bottom of managed
//! memory: bootstrap reserves its footprint at `first_free` and rounds
//! the first allocatable frame up to the next page boundary.

extern crate alloc;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard, Once};

use super::addrspace::AddressSpace;
use super::{swap, PhysicalAddress};
use crate::error::{KernelError, KernelResult};
use crate::machine::{self, ram, PAGE_SIZE};
use crate::mm::VirtualAddress;

bitflags! {
    /// Per-frame state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const USED = 0x01;
        const DIRTY = 0x02;
    }
}

/// One coremap entry. The physical address of entry `i` is
/// `first_paddr + i * PAGE_SIZE` and is never stored.
pub struct FrameEntry {
    flags: FrameFlags,
    /// Owning address space; `None` while free, and also `None` for
    /// kernel-owned frames while used.
    owner: Option<Weak<AddressSpace>>,
    /// Index of the first frame of the chunk this frame belongs to.
    chunk_start: u32,
}

impl FrameEntry {
    const fn unused() -> Self {
        Self {
            flags: FrameFlags::empty(),
            owner: None,
            chunk_start: 0,
        }
    }

    pub fn is_used(&self) -> bool {
        self.flags.contains(FrameFlags::USED)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(FrameFlags::DIRTY)
    }

    pub fn chunk_start(&self) -> u32 {
        self.chunk_start
    }

    /// The owning address space, if this is a live user frame.
    pub fn owner(&self) -> Option<Arc<AddressSpace>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    /// Whether this frame is owned by the given address space.
    pub fn owned_by(&self, space: &Arc<AddressSpace>) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|w| Weak::ptr_eq(w, &Arc::downgrade(space)))
    }

    /// Whether this is a used frame belonging to some user address
    /// space (swap-eligible; kernel frames are not).
    pub fn is_user_frame(&self) -> bool {
        self.is_used() && self.owner.is_some()
    }
}

/// The coremap proper. Public methods operate on an instance so the
/// allocator logic is testable in isolation; kernel code goes through
/// the module-level functions and the boot singleton.
pub struct Coremap {
    entries: Vec<FrameEntry>,
    first_paddr: PhysicalAddress,
    page_count: u32,
    free_count: u32,
}

impl Coremap {
    /// Lay out a coremap over the physical range `[first_free, last)`.
    ///
    /// The entry array's own footprint is reserved at `first_free`; the
    /// first managed frame starts past it, rounded up to a page
    /// boundary.
    pub fn new(first_free: PhysicalAddress, last: PhysicalAddress) -> Self {
        let mut first = first_free.as_u32();
        let last = last.as_u32();
        let page = PAGE_SIZE as u32;

        let mut page_count = (last - first) / page;
        let map_bytes = (core::mem::size_of::<FrameEntry>() as u32) * page_count;
        if first + map_bytes > last {
            panic!("Unable to allocate space for coremap");
        }
        first += map_bytes;
        if first % page != 0 {
            first += page - (first % page);
        }
        page_count = (last - first) / page;

        let mut entries = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            entries.push(FrameEntry::unused());
        }

        Self {
            entries,
            first_paddr: PhysicalAddress::new(first),
            page_count,
            free_count: page_count,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    /// Physical address of frame `index`.
    pub fn entry_paddr(&self, index: u32) -> PhysicalAddress {
        debug_assert!(index < self.page_count);
        self.first_paddr.add(index * PAGE_SIZE as u32)
    }

    /// Frame index of a managed physical address, if in range.
    pub fn frame_index(&self, paddr: PhysicalAddress) -> Option<u32> {
        let p = paddr.as_u32();
        let base = self.first_paddr.as_u32();
        if p < base {
            return None;
        }
        let index = (p - base) / PAGE_SIZE as u32;
        (index < self.page_count && (p - base) % PAGE_SIZE as u32 == 0).then_some(index)
    }

    pub fn entry(&self, index: u32) -> &FrameEntry {
        &self.entries[index as usize]
    }

    /// First-fit scan for `npages` contiguous free frames.
    pub fn find_run(&self, npages: usize) -> Option<u32> {
        let npages = npages as u32;
        let mut i = 0;
        while i < self.page_count {
            if self.entries[i as usize].is_used() {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < self.page_count && j - i < npages && !self.entries[j as usize].is_used() {
                j += 1;
            }
            if j - i == npages {
                return Some(i);
            }
            i = j + 1;
        }
        None
    }

    /// Mark `[start, start+npages)` allocated to `owner`, dirty, with
    /// `chunk_start = start` on every frame of the run.
    pub fn claim_run(&mut self, start: u32, npages: usize, owner: Option<&Arc<AddressSpace>>) {
        for k in start..start + npages as u32 {
            let entry = &mut self.entries[k as usize];
            debug_assert!(!entry.is_used(), "claiming an in-use frame");
            entry.flags = FrameFlags::USED | FrameFlags::DIRTY;
            entry.owner = owner.map(Arc::downgrade);
            entry.chunk_start = start;
        }
        self.free_count -= npages as u32;
    }

    /// Free the whole chunk starting at frame `start`. Panics unless
    /// `start` is the live start of an allocation. Returns the number
    /// of frames released.
    pub fn release_chunk(&mut self, start: u32) -> u32 {
        let head = &self.entries[start as usize];
        if !head.is_used() || head.chunk_start != start {
            panic!("coremap: freeing 0x{:08x}, not a live allocation start", self.entry_paddr(start).as_u32());
        }
        let mut j = start;
        while j < self.page_count
            && self.entries[j as usize].is_used()
            && self.entries[j as usize].chunk_start == start
        {
            self.release_frame(j);
            j += 1;
        }
        j - start
    }

    /// Free a single frame (the swap eviction path frees frames one at
    /// a time as their contents reach the backing store).
    pub fn release_frame(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        debug_assert!(entry.is_used(), "releasing a free frame");
        entry.flags = FrameFlags::empty();
        entry.owner = None;
        entry.chunk_start = 0;
        self.free_count += 1;
    }

    /// Bytes consumed by allocated frames.
    pub fn used_bytes(&self) -> usize {
        self.entries.iter().filter(|e| e.is_used()).count() * PAGE_SIZE
    }
}

static COREMAP: Once<Mutex<Coremap>> = Once::new();

/// Build the global coremap from the RAM probes. Called once at boot,
/// after the RAM model is up and before any allocation.
pub fn bootstrap() {
    COREMAP.call_once(|| {
        let cm = Coremap::new(ram::getfirstfree(), ram::getsize());
        log::info!(
            "[COREMAP] {} frames managed from 0x{:08x}",
            cm.page_count(),
            cm.entry_paddr(0).as_u32()
        );
        Mutex::new(cm)
    });
}

/// Lock the global coremap. The guard must never be held across disk
/// I/O; the swap path drops it and re-validates after reacquisition.
pub(crate) fn lock() -> MutexGuard<'static, Coremap> {
    COREMAP
        .get()
        .expect("coremap used before bootstrap")
        .lock()
}

/// Allocate `npages` contiguous frames for `owner` (`None` for the
/// kernel). The frames come back zeroed. When no run is free and the
/// swap subsystem is ready, one eviction campaign is run and the scan
/// retried; a second failure is ENOMEM.
pub fn alloc_user(
    npages: usize,
    owner: Option<&Arc<AddressSpace>>,
) -> KernelResult<PhysicalAddress> {
    assert!(npages > 0, "zero-page allocation");
    let mut campaigned = false;
    loop {
        let mut cm = lock();
        if let Some(start) = cm.find_run(npages) {
            cm.claim_run(start, npages, owner);
            let paddr = cm.entry_paddr(start);
            drop(cm);
            ram::zero(paddr, npages * PAGE_SIZE);
            return Ok(paddr);
        }
        drop(cm);

        if campaigned || !swap::is_ready() {
            return Err(KernelError::OutOfMemory {
                requested_pages: npages,
            });
        }
        swap::swap_out_campaign(npages, owner)?;
        campaigned = true;
    }
}

/// Allocate kernel pages, returning a direct-mapped kernel virtual
/// address.
pub fn alloc_kpages(npages: usize) -> KernelResult<VirtualAddress> {
    alloc_user(npages, None).map(machine::paddr_to_kvaddr)
}

/// Free the allocation starting at `paddr`. Fatal if `paddr` was not
/// returned by a live allocation.
pub fn free_by_paddr(paddr: PhysicalAddress) {
    let mut cm = lock();
    let Some(index) = cm.frame_index(paddr) else {
        panic!("coremap: free of unmanaged address 0x{:08x}", paddr.as_u32());
    };
    cm.release_chunk(index);
}

/// Free kernel pages by their direct-mapped virtual address.
pub fn free_kpages(kvaddr: VirtualAddress) {
    free_by_paddr(machine::kvaddr_to_paddr(kvaddr));
}

/// Bytes currently allocated. Under concurrent allocation the value is
/// only guaranteed to have been correct at some instant.
pub fn used_bytes() -> usize {
    lock().used_bytes()
}

/// Frames currently free (diagnostics).
pub fn free_pages() -> u32 {
    lock().free_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> Coremap {
        // 64 KiB managed range starting at 16 KiB: the entry array fits
        // in the first page, leaving 15 managed frames.
        Coremap::new(PhysicalAddress::new(16 * 1024), PhysicalAddress::new(80 * 1024))
    }

    #[test]
    fn test_bootstrap_reserves_map_footprint() {
        let cm = small_map();
        assert!(cm.page_count() < 16);
        assert!(cm.entry_paddr(0).is_page_aligned());
        assert!(cm.entry_paddr(0).as_u32() >= 16 * 1024 + PAGE_SIZE as u32);
        assert_eq!(cm.free_count(), cm.page_count());
    }

    #[test]
    fn test_first_fit_and_chunk_marking() {
        let mut cm = small_map();
        let start = cm.find_run(3).expect("fresh map should fit 3 pages");
        assert_eq!(start, 0);
        cm.claim_run(start, 3, None);
        for i in 0..3 {
            assert!(cm.entry(i).is_used());
            assert!(cm.entry(i).is_dirty());
            assert_eq!(cm.entry(i).chunk_start(), 0);
        }
        assert_eq!(cm.free_count(), cm.page_count() - 3);
        // Next fit lands after the claimed run.
        assert_eq!(cm.find_run(1), Some(3));
    }

    #[test]
    fn test_release_chunk_frees_exactly_the_run() {
        let mut cm = small_map();
        cm.claim_run(0, 2, None);
        cm.claim_run(2, 3, None);
        let freed = cm.release_chunk(0);
        assert_eq!(freed, 2);
        assert!(!cm.entry(0).is_used());
        assert!(!cm.entry(1).is_used());
        // The adjacent chunk is untouched.
        assert!(cm.entry(2).is_used());
        assert!(cm.entry(3).is_used());
        assert!(cm.entry(4).is_used());
        assert_eq!(cm.free_count(), cm.page_count() - 3);
    }

    #[test]
    fn test_adjacent_chunks_free_independently() {
        let mut cm = small_map();
        cm.claim_run(0, 2, None);
        cm.claim_run(2, 2, None);
        // Freeing the second chunk must not walk into the first.
        assert_eq!(cm.release_chunk(2), 2);
        assert!(cm.entry(0).is_used());
        assert!(cm.entry(1).is_used());
    }

    #[test]
    #[should_panic]
    fn test_free_of_chunk_interior_is_fatal() {
        let mut cm = small_map();
        cm.claim_run(0, 3, None);
        // Frame 1 is in the middle of the chunk, not its start.
        cm.release_chunk(1);
    }

    #[test]
    #[should_panic]
    fn test_free_of_unallocated_frame_is_fatal() {
        let mut cm = small_map();
        cm.release_chunk(4);
    }

    #[test]
    fn test_fragmentation_blocks_large_runs() {
        let mut cm = small_map();
        let n = cm.page_count();
        // Claim every other frame.
        for i in (0..n).step_by(2) {
            cm.claim_run(i, 1, None);
        }
        assert!(cm.find_run(2).is_none());
        assert!(cm.find_run(1).is_some());
    }

    #[test]
    fn test_used_bytes_counts_frames() {
        let mut cm = small_map();
        assert_eq!(cm.used_bytes(), 0);
        cm.claim_run(0, 4, None);
        assert_eq!(cm.used_bytes(), 4 * PAGE_SIZE);
        cm.release_chunk(0);
        assert_eq!(cm.used_bytes(), 0);
    }

    #[test]
    fn test_kernel_pages_round_trip_through_kseg0() {
        let _g = crate::test_support::global_guard();
        let kvaddr = alloc_kpages(2).expect("kernel allocation");
        assert!(kvaddr.as_u32() >= machine::KSEG0_BASE);
        assert!(used_bytes() >= 2 * PAGE_SIZE);

        // The direct-mapped window reaches the same frames.
        let paddr = machine::kvaddr_to_paddr(kvaddr);
        ram::write(paddr, b"kseg0");
        let mut buf = [0u8; 5];
        ram::read(paddr, &mut buf);
        assert_eq!(&buf, b"kseg0");

        free_kpages(kvaddr);
    }

    #[test]
    fn test_frame_index_round_trip() {
        let cm = small_map();
        for i in 0..cm.page_count() {
            assert_eq!(cm.frame_index(cm.entry_paddr(i)), Some(i));
        }
        // Unaligned and out-of-range addresses do not resolve.
        assert_eq!(cm.frame_index(cm.entry_paddr(0).add(1)), None);
        assert_eq!(cm.frame_index(PhysicalAddress::new(0)), None);
    }
}
