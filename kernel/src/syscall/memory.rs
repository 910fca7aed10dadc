//! Memory system calls: sbrk.
//!
//! The heap is a chain of anonymous read/write regions growing from the
//! end of the loaded image. Growing appends one region per call;
//! shrinking walks regions back down, freeing the pages above the new
//! break and flushing the TLB.

use crate::error::Errno;
use crate::mm::{VirtualAddress, PAGE_SIZE};
use crate::process::current_addrspace;

/// Largest single sbrk step: 256 MiB either direction.
const SBRK_MAX: i64 = 256 * 1024 * 1024;

/// sbrk(delta): returns the old break. `delta` must be page-aligned and
/// within the step bound; shrinking below the first break is EINVAL.
pub fn sys_sbrk(delta: i32) -> Result<i32, Errno> {
    if delta as i64 % PAGE_SIZE as i64 != 0 {
        return Err(Errno::Einval);
    }
    if (delta as i64).abs() > SBRK_MAX {
        return Err(Errno::Enomem);
    }
    let space = current_addrspace().ok_or(Errno::Efault)?;

    space.capture_heap_base();
    let cursor = space.heap_cursor();

    if delta == 0 {
        return Ok(cursor.as_u32() as i32);
    }

    if delta < 0 {
        let new_cursor = cursor.as_u32() as i64 + delta as i64;
        let base = space
            .heap_base()
            .expect("heap base captured above")
            .as_u32() as i64;
        if new_cursor < base {
            return Err(Errno::Einval);
        }
        space.shrink_heap(VirtualAddress::new(new_cursor as u32));
        return Ok(cursor.as_u32() as i32);
    }

    let old = space.grow_heap(delta as u32).map_err(|e| e.errno())?;
    Ok(old.as_u32() as i32)
}
