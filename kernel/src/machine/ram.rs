//! Modeled physical memory.
//!
//! RAM is one boxed byte array behind a leaf lock: no RAM operation
//! acquires any other lock, so any subsystem may touch RAM while holding
//! its own. The kernel image occupies the bottom of RAM; the boot probes
//! report its end as the first free physical address, exactly once, the
//! way `ram_getfirstfree` does.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;

use spin::{Mutex, Once};

use super::PAGE_SIZE;
use crate::mm::PhysicalAddress;

struct Ram {
    bytes: Mutex<Box<[u8]>>,
    size: u32,
    first_free: u32,
}

static RAM: Once<Ram> = Once::new();

/// Install the machine's RAM. Called once from boot.
pub fn init(total_bytes: usize, kernel_image_bytes: usize) {
    assert!(total_bytes % PAGE_SIZE == 0, "RAM size must be page-aligned");
    assert!(kernel_image_bytes < total_bytes, "kernel image exceeds RAM");
    RAM.call_once(|| Ram {
        bytes: Mutex::new(vec![0u8; total_bytes].into_boxed_slice()),
        size: total_bytes as u32,
        first_free: kernel_image_bytes as u32,
    });
    log::info!(
        "[RAM] {} KiB, kernel image ends at 0x{:08x}",
        total_bytes / 1024,
        kernel_image_bytes
    );
}

fn ram() -> &'static Ram {
    RAM.get().expect("RAM accessed before machine::ram::init")
}

/// Last physical address + 1 (the size of RAM).
pub fn getsize() -> PhysicalAddress {
    PhysicalAddress::new(ram().size)
}

/// First physical address not occupied by the kernel image.
pub fn getfirstfree() -> PhysicalAddress {
    PhysicalAddress::new(ram().first_free)
}

fn check_range(paddr: PhysicalAddress, len: usize) -> usize {
    let start = paddr.as_usize();
    let end = start
        .checked_add(len)
        .unwrap_or_else(|| panic!("RAM access wraps at 0x{:08x}+{}", paddr.as_u32(), len));
    if end > ram().size as usize {
        panic!(
            "RAM access out of range: 0x{:08x}+{} (RAM is {} bytes)",
            paddr.as_u32(),
            len,
            ram().size
        );
    }
    start
}

/// Copy bytes out of physical memory.
pub fn read(paddr: PhysicalAddress, buf: &mut [u8]) {
    let start = check_range(paddr, buf.len());
    let bytes = ram().bytes.lock();
    buf.copy_from_slice(&bytes[start..start + buf.len()]);
}

/// Copy bytes into physical memory.
pub fn write(paddr: PhysicalAddress, data: &[u8]) {
    let start = check_range(paddr, data.len());
    let mut bytes = ram().bytes.lock();
    bytes[start..start + data.len()].copy_from_slice(data);
}

/// Zero a range of physical memory.
pub fn zero(paddr: PhysicalAddress, len: usize) {
    let start = check_range(paddr, len);
    let mut bytes = ram().bytes.lock();
    bytes[start..start + len].fill(0);
}

/// Copy a range between two physical locations (may not overlap).
pub fn copy(dst: PhysicalAddress, src: PhysicalAddress, len: usize) {
    let d = check_range(dst, len);
    let s = check_range(src, len);
    let mut bytes = ram().bytes.lock();
    bytes.copy_within(s..s + len, d);
}
