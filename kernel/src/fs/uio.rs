//! Scatter-free uio: one transfer descriptor per I/O.
//!
//! A [`Uio`] names a target (kernel buffer or user-space range in a
//! specific address space), a byte offset into the file object, and a
//! residual count. Vnode implementations move bytes against it; the
//! residual after the call tells the file layer how much actually
//! transferred. User-space targets are reached through the
//! kernel-mediated copy path, so a read(2) lands directly in the user
//! buffer with the user's address space selected.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::mm::addrspace::AddressSpace;
use crate::mm::{usermem, VirtualAddress};

/// Transfer target/source.
pub enum UioSeg<'a> {
    /// File -> kernel buffer.
    KernelRead(&'a mut [u8]),
    /// Kernel buffer -> file.
    KernelWrite(&'a [u8]),
    /// File -> user buffer.
    UserRead {
        space: &'a Arc<AddressSpace>,
        vaddr: VirtualAddress,
    },
    /// User buffer -> file.
    UserWrite {
        space: &'a Arc<AddressSpace>,
        vaddr: VirtualAddress,
    },
}

/// One I/O transfer in progress.
pub struct Uio<'a> {
    seg: UioSeg<'a>,
    offset: u64,
    resid: usize,
    done: usize,
}

impl<'a> Uio<'a> {
    /// File -> kernel buffer, reading at `offset`.
    pub fn kernel_read(buf: &'a mut [u8], offset: u64) -> Self {
        let resid = buf.len();
        Self {
            seg: UioSeg::KernelRead(buf),
            offset,
            resid,
            done: 0,
        }
    }

    /// Kernel buffer -> file, writing at `offset`.
    pub fn kernel_write(data: &'a [u8], offset: u64) -> Self {
        let resid = data.len();
        Self {
            seg: UioSeg::KernelWrite(data),
            offset,
            resid,
            done: 0,
        }
    }

    /// File -> user buffer.
    pub fn user_read(
        space: &'a Arc<AddressSpace>,
        vaddr: VirtualAddress,
        len: usize,
        offset: u64,
    ) -> Self {
        Self {
            seg: UioSeg::UserRead { space, vaddr },
            offset,
            resid: len,
            done: 0,
        }
    }

    /// User buffer -> file.
    pub fn user_write(
        space: &'a Arc<AddressSpace>,
        vaddr: VirtualAddress,
        len: usize,
        offset: u64,
    ) -> Self {
        Self {
            seg: UioSeg::UserWrite { space, vaddr },
            offset,
            resid: len,
            done: 0,
        }
    }

    /// Current file offset (advances with the transfer).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes still to transfer.
    pub fn resid(&self) -> usize {
        self.resid
    }

    /// Bytes transferred so far.
    pub fn transferred(&self) -> usize {
        self.done
    }

    /// Move bytes from the file object into the target. Called by
    /// `Vnode::read` implementations; transfers at most
    /// `min(src.len(), resid)` bytes.
    pub fn move_into_target(&mut self, src: &[u8]) -> KernelResult<usize> {
        let n = src.len().min(self.resid);
        let chunk = &src[..n];
        match &mut self.seg {
            UioSeg::KernelRead(buf) => {
                buf[self.done..self.done + n].copy_from_slice(chunk);
            }
            UioSeg::UserRead { space, vaddr } => {
                usermem::copyout(*space, chunk, vaddr.add(self.done as u32))?;
            }
            UioSeg::KernelWrite(_) | UioSeg::UserWrite { .. } => {
                panic!("uio: read transfer on a write descriptor");
            }
        }
        self.advance(n);
        Ok(n)
    }

    /// Move bytes from the source into `dst`. Called by `Vnode::write`
    /// implementations; transfers at most `min(dst.len(), resid)`.
    pub fn move_from_source(&mut self, dst: &mut [u8]) -> KernelResult<usize> {
        let n = dst.len().min(self.resid);
        match &self.seg {
            UioSeg::KernelWrite(data) => {
                dst[..n].copy_from_slice(&data[self.done..self.done + n]);
            }
            UioSeg::UserWrite { space, vaddr } => {
                usermem::copyin(*space, vaddr.add(self.done as u32), &mut dst[..n])?;
            }
            UioSeg::KernelRead(_) | UioSeg::UserRead { .. } => {
                panic!("uio: write transfer on a read descriptor");
            }
        }
        self.advance(n);
        Ok(n)
    }

    fn advance(&mut self, n: usize) {
        self.resid -= n;
        self.done += n;
        self.offset += n as u64;
    }
}
