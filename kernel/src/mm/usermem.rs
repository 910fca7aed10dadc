//! Kernel-mediated access to user memory.
//!
//! copyin/copyout against an explicit address space, translating page
//! by page through the same resolution path the fault handler uses, so
//! a kernel copy touches (and faults in) pages exactly the way the user
//! access it stands in for would. Addresses at or above `USERSTACK` are
//! kernel space and always EFAULT.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::addrspace::{AddressSpace, PageLocation};
use super::{fault, VirtualAddress, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::machine::{ram, USERSTACK};

fn check_user_range(uaddr: VirtualAddress, len: usize) -> KernelResult<()> {
    let start = uaddr.as_u32() as u64;
    let end = start + len as u64;
    if end > USERSTACK.as_u32() as u64 {
        return Err(KernelError::BadAddress {
            addr: uaddr.as_u32(),
        });
    }
    Ok(())
}

/// Resolve one page and run `op` against its frame, re-validating that
/// the page was not evicted underneath the access. The copy path holds
/// no lock across the frame touch (an eviction campaign may run
/// concurrently), so like the swap path it re-checks and retries
/// instead of trusting a stale translation.
fn with_resident_page(
    space: &Arc<AddressSpace>,
    va: VirtualAddress,
    mut op: impl FnMut(super::PhysicalAddress),
) -> KernelResult<()> {
    loop {
        let frame = fault::fault_in(space, va)?;
        op(frame);
        if space.page_location(va.page_number()) == Some(PageLocation::Mapped(frame)) {
            return Ok(());
        }
    }
}

/// Copy kernel bytes out to user space.
pub fn copyout(space: &Arc<AddressSpace>, src: &[u8], uaddr: VirtualAddress) -> KernelResult<()> {
    check_user_range(uaddr, src.len())?;
    let mut done = 0;
    while done < src.len() {
        let va = uaddr.add(done as u32);
        let in_page = PAGE_SIZE - va.page_offset();
        let n = in_page.min(src.len() - done);
        with_resident_page(space, va, |frame| {
            ram::write(frame.add(va.page_offset() as u32), &src[done..done + n]);
        })?;
        done += n;
    }
    Ok(())
}

/// Copy user bytes into a kernel buffer.
pub fn copyin(space: &Arc<AddressSpace>, uaddr: VirtualAddress, dst: &mut [u8]) -> KernelResult<()> {
    check_user_range(uaddr, dst.len())?;
    let mut done = 0;
    while done < dst.len() {
        let va = uaddr.add(done as u32);
        let in_page = PAGE_SIZE - va.page_offset();
        let n = in_page.min(dst.len() - done);
        let chunk = &mut dst[done..done + n];
        with_resident_page(space, va, |frame| {
            ram::read(frame.add(va.page_offset() as u32), &mut chunk[..]);
        })?;
        done += n;
    }
    Ok(())
}

/// Copy a user pointer-sized word in.
pub fn copyin_u32(space: &Arc<AddressSpace>, uaddr: VirtualAddress) -> KernelResult<u32> {
    let mut buf = [0u8; 4];
    copyin(space, uaddr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Copy a word out to user space.
pub fn copyout_u32(space: &Arc<AddressSpace>, value: u32, uaddr: VirtualAddress) -> KernelResult<()> {
    copyout(space, &value.to_le_bytes(), uaddr)
}

/// Copy a NUL-terminated user string in, bounded by `maxlen` bytes
/// (terminator included). Overlong or non-UTF-8 strings are rejected.
pub fn copyinstr(
    space: &Arc<AddressSpace>,
    uaddr: VirtualAddress,
    maxlen: usize,
) -> KernelResult<String> {
    let mut bytes = Vec::new();
    for i in 0..maxlen {
        let mut byte = [0u8; 1];
        copyin(space, uaddr.add(i as u32), &mut byte)?;
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument {
                name: "string",
                value: "not valid UTF-8",
            });
        }
        bytes.push(byte[0]);
    }
    Err(KernelError::InvalidArgument {
        name: "string",
        value: "missing NUL terminator within bound",
    })
}
