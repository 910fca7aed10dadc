//! SableOS kernel.
//!
//! An educational Unix-like kernel for a modeled MIPS-like single-core
//! machine with a software-managed TLB: a coremap frame allocator with
//! a swap path, demand-paged per-process address spaces, a process
//! table with fork/execv/waitpid/_exit, and a descriptor-based file
//! layer over a small VFS.
//!
//! Kernel code sticks to core/alloc; the `machine` model and the
//! kernel-thread seam are backed by the host, which is also what the
//! test suite runs on.

#![no_std]

extern crate alloc;
// Host backing for the machine model (threads, RAM buffer, console
// capture) and for the test harness.
extern crate std;

use alloc::sync::Arc;

use spin::Once;

pub mod config;
pub mod error;
pub mod fs;
pub mod machine;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::KernelConfig;
pub use error::{Errno, KernelError, KernelResult};

#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

static BOOTED: Once<()> = Once::new();

/// Bring the kernel up on the configured machine. Idempotent; the
/// first caller's configuration wins, exactly once.
pub fn boot(config: KernelConfig) {
    BOOTED.call_once(|| {
        machine::ram::init(config.ram_bytes, config.kernel_image_bytes);
        mm::coremap::bootstrap();
        fs::vfs::init();
        if let Some(pages) = config.swap_disk_pages {
            let disk = Arc::new(fs::devices::BlockDevVnode::new(pages * machine::PAGE_SIZE));
            fs::vfs::mount_device(mm::swap::SWAP_DEVICE, disk);
        }
        mm::swap::init();
        process::bootstrap();
        log::info!(
            "[BOOT] SableOS up: {} KiB RAM, swap {}",
            config.ram_bytes / 1024,
            if config.swap_disk_pages.is_some() {
                "attached"
            } else {
                "absent"
            }
        );
    });
}

/// Whether [`boot`] has completed.
pub fn booted() -> bool {
    BOOTED.get().is_some()
}
