//! Shared fixtures for the hosted test suite.
//!
//! The kernel's singletons (RAM, coremap, swap, VFS, process table)
//! are process-wide, so every test boots the same machine once and
//! tests that depend on exclusive global state (TLB contents, coremap
//! occupancy) serialize on one guard.

use spin::{Mutex, MutexGuard};

use crate::config::KernelConfig;
use crate::machine::PAGE_SIZE;

static GLOBAL: Mutex<()> = Mutex::new(());

/// The test machine: 2 MiB of RAM, a 32-page kernel image, and a
/// 257-page swap disk (256 usable slots).
pub fn boot_for_tests() {
    crate::boot(KernelConfig {
        ram_bytes: 2 * 1024 * 1024,
        kernel_image_bytes: 32 * PAGE_SIZE,
        swap_disk_pages: Some(257),
    });
}

/// Serialize tests that assert on machine-global state.
pub fn global_guard() -> MutexGuard<'static, ()> {
    boot_for_tests();
    GLOBAL.lock()
}
