//! Growable in-memory files.
//!
//! The stand-in filesystem behind the VFS registry: enough for the
//! syscall layer and tests to open, write, seek, and read real files.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::uio::Uio;
use super::Vnode;
use crate::error::KernelResult;

/// A memory-backed regular file. Writes past the end grow it,
/// zero-filling any gap.
pub struct MemFileVnode {
    data: Mutex<Vec<u8>>,
    ops: Mutex<()>,
}

impl MemFileVnode {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            ops: Mutex::new(()),
        }
    }

    /// Discard contents (O_TRUNC).
    pub fn truncate(&self) {
        self.data.lock().clear();
    }
}

impl Default for MemFileVnode {
    fn default() -> Self {
        Self::new()
    }
}

impl Vnode for MemFileVnode {
    fn read(&self, uio: &mut Uio<'_>) -> KernelResult<()> {
        let data = self.data.lock();
        let off = uio.offset() as usize;
        if off >= data.len() {
            // EOF: leave the residual count untouched.
            return Ok(());
        }
        let n = uio.resid().min(data.len() - off);
        let chunk = data[off..off + n].to_vec();
        drop(data);
        uio.move_into_target(&chunk)?;
        Ok(())
    }

    fn write(&self, uio: &mut Uio<'_>) -> KernelResult<()> {
        let off = uio.offset() as usize;
        let n = uio.resid();
        let mut buf = vec![0u8; n];
        uio.move_from_source(&mut buf)?;
        let mut data = self.data.lock();
        if data.len() < off + n {
            data.resize(off + n, 0);
        }
        data[off..off + n].copy_from_slice(&buf);
        Ok(())
    }

    fn size(&self) -> KernelResult<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn ops_lock(&self) -> &Mutex<()> {
        &self.ops
    }

    fn truncate(&self) -> KernelResult<()> {
        MemFileVnode::truncate(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_back() {
        let file = MemFileVnode::new();
        let mut w = Uio::kernel_write(b"hello", 0);
        file.write(&mut w).expect("write");
        assert_eq!(file.size().expect("size"), 5);

        let mut buf = [0u8; 5];
        let mut r = Uio::kernel_read(&mut buf, 0);
        file.read(&mut r).expect("read");
        assert_eq!(r.transferred(), 5);
        drop(r);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_read_at_eof_transfers_nothing() {
        let file = MemFileVnode::new();
        let mut w = Uio::kernel_write(b"xy", 0);
        file.write(&mut w).expect("write");
        let mut buf = [0u8; 4];
        let mut r = Uio::kernel_read(&mut buf, 2);
        file.read(&mut r).expect("read");
        assert_eq!(r.transferred(), 0);
        assert_eq!(r.resid(), 4);
    }

    #[test]
    fn test_sparse_write_zero_fills() {
        let file = MemFileVnode::new();
        let mut w = Uio::kernel_write(b"z", 8);
        file.write(&mut w).expect("write");
        assert_eq!(file.size().expect("size"), 9);
        let mut buf = [0xffu8; 9];
        let mut r = Uio::kernel_read(&mut buf, 0);
        file.read(&mut r).expect("read");
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(buf[8], b'z');
    }

    #[test]
    fn test_truncate_empties_file() {
        let file = MemFileVnode::new();
        let mut w = Uio::kernel_write(b"content", 0);
        file.write(&mut w).expect("write");
        file.truncate();
        assert_eq!(file.size().expect("size"), 0);
    }
}
