//! File handles and the per-process file table.
//!
//! A [`FileHandle`] is the shared open-file state: vnode, byte offset,
//! and the permission flags it was opened with. Handles are
//! reference-counted; the `Arc` strong count is the refcount, and the
//! last drop closes the vnode. A [`FileTable`] binds a process's file
//! descriptors to handles; after fork or dup2, several descriptors
//! (possibly in different processes) share one handle, and therefore
//! one offset.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::uio::Uio;
use super::{vfs, Vnode};
use crate::error::{KernelError, KernelResult};
use crate::mm::addrspace::AddressSpace;
use crate::mm::VirtualAddress;

/// Open-flag bits (the user-visible ABI values).
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_ACCMODE: u32 = 3;
pub const O_CREAT: u32 = 4;
pub const O_EXCL: u32 = 8;
pub const O_TRUNC: u32 = 16;
pub const O_APPEND: u32 = 32;
pub const O_NOCTTY: u32 = 64;

/// Longest path accepted by open/execv.
pub const FILE_NAME_MAXLEN: usize = 255;

/// lseek anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl SeekWhence {
    pub fn from_raw(raw: i32) -> KernelResult<Self> {
        match raw {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(KernelError::InvalidArgument {
                name: "whence",
                value: "not SEEK_SET/SEEK_CUR/SEEK_END",
            }),
        }
    }
}

/// Shared open-file state.
pub struct FileHandle {
    /// Underlying VFS object.
    pub vnode: Arc<dyn Vnode>,
    /// Current byte offset. Mutated only under the vnode's op-lock.
    pub offset: Mutex<i64>,
    /// The open(2) flags this handle was created with.
    pub permission: u32,
}

impl FileHandle {
    pub fn new(vnode: Arc<dyn Vnode>, permission: u32) -> Arc<Self> {
        Arc::new(Self {
            vnode,
            offset: Mutex::new(0),
            permission,
        })
    }

    /// Whether the handle was opened with read access.
    pub fn can_read(&self) -> bool {
        matches!(self.permission & O_ACCMODE, O_RDONLY | O_RDWR)
    }

    /// Whether the handle was opened with write access.
    pub fn can_write(&self) -> bool {
        matches!(self.permission & O_ACCMODE, O_WRONLY | O_RDWR)
    }

    /// Read from the current offset directly into a user buffer, with
    /// the offset advanced by the bytes actually transferred.
    pub fn read_user(
        &self,
        space: &Arc<AddressSpace>,
        vaddr: VirtualAddress,
        len: usize,
    ) -> KernelResult<usize> {
        let _ops = self.vnode.ops_lock().lock();
        let mut offset = self.offset.lock();
        let mut uio = Uio::user_read(space, vaddr, len, *offset as u64);
        self.vnode.read(&mut uio)?;
        let n = uio.transferred();
        *offset += n as i64;
        Ok(n)
    }

    /// Write a user buffer at the current offset.
    pub fn write_user(
        &self,
        space: &Arc<AddressSpace>,
        vaddr: VirtualAddress,
        len: usize,
    ) -> KernelResult<usize> {
        let _ops = self.vnode.ops_lock().lock();
        let mut offset = self.offset.lock();
        let mut uio = Uio::user_write(space, vaddr, len, *offset as u64);
        self.vnode.write(&mut uio)?;
        let n = uio.transferred();
        *offset += n as i64;
        Ok(n)
    }

    /// Read at the current offset into a kernel buffer.
    pub fn read_kernel(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let _ops = self.vnode.ops_lock().lock();
        let mut offset = self.offset.lock();
        let mut uio = Uio::kernel_read(buf, *offset as u64);
        self.vnode.read(&mut uio)?;
        let n = uio.transferred();
        *offset += n as i64;
        Ok(n)
    }

    /// Write a kernel buffer at the current offset.
    pub fn write_kernel(&self, data: &[u8]) -> KernelResult<usize> {
        let _ops = self.vnode.ops_lock().lock();
        let mut offset = self.offset.lock();
        let mut uio = Uio::kernel_write(data, *offset as u64);
        self.vnode.write(&mut uio)?;
        let n = uio.transferred();
        *offset += n as i64;
        Ok(n)
    }

    /// Reposition the offset. ESPIPE on unseekable vnodes; a negative
    /// resulting offset is EINVAL.
    pub fn seek(&self, pos: i64, whence: SeekWhence) -> KernelResult<i64> {
        if !self.vnode.is_seekable() {
            return Err(KernelError::NotSeekable);
        }
        let _ops = self.vnode.ops_lock().lock();
        let mut offset = self.offset.lock();
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *offset,
            SeekWhence::End => self.vnode.size()? as i64,
        };
        let new_pos = base
            .checked_add(pos)
            .ok_or(KernelError::InvalidArgument {
                name: "pos",
                value: "offset overflow",
            })?;
        if new_pos < 0 {
            return Err(KernelError::InvalidArgument {
                name: "pos",
                value: "negative resulting offset",
            });
        }
        *offset = new_pos;
        Ok(new_pos)
    }

    /// Number of live references to this handle (descriptor bindings).
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // Last reference gone: close the vnode.
        vfs::close(&self.vnode);
    }
}

/// One fd -> handle binding.
#[derive(Clone)]
pub struct FileTableEntry {
    pub fd: i32,
    pub handle: Arc<FileHandle>,
}

/// A process's descriptor table. The owning process serializes access;
/// the table itself carries no lock.
pub struct FileTable {
    entries: Vec<FileTableEntry>,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind `fd` to `handle`.
    pub fn insert(&mut self, fd: i32, handle: Arc<FileHandle>) {
        debug_assert!(self.lookup(fd).is_none(), "duplicate fd {}", fd);
        self.entries.push(FileTableEntry { fd, handle });
    }

    /// The handle bound to `fd`, if any.
    pub fn lookup(&self, fd: i32) -> Option<Arc<FileHandle>> {
        self.entries
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| Arc::clone(&e.handle))
    }

    /// Drop the binding for `fd`, releasing its handle reference.
    pub fn remove(&mut self, fd: i32) -> KernelResult<()> {
        let index = self
            .entries
            .iter()
            .position(|e| e.fd == fd)
            .ok_or(KernelError::BadDescriptor { fd })?;
        self.entries.swap_remove(index);
        Ok(())
    }

    /// dup2: make `new_fd` refer to `old_fd`'s handle. An existing
    /// binding at `new_fd` is released first. The two descriptors then
    /// share offset and permissions.
    pub fn dup2(&mut self, old_fd: i32, new_fd: i32) -> KernelResult<i32> {
        let handle = self
            .lookup(old_fd)
            .ok_or(KernelError::BadDescriptor { fd: old_fd })?;
        if old_fd == new_fd {
            return Ok(new_fd);
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.fd == new_fd) {
            entry.handle = handle;
        } else {
            self.entries.push(FileTableEntry {
                fd: new_fd,
                handle,
            });
        }
        Ok(new_fd)
    }

    /// Share every entry with a forked child: same descriptors, same
    /// handles (reference-bumped), same offsets.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }

    /// Release every binding.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::MemFileVnode;

    fn mem_handle(permission: u32) -> Arc<FileHandle> {
        FileHandle::new(Arc::new(MemFileVnode::new()), permission)
    }

    #[test]
    fn test_permission_is_semantic_accmode() {
        assert!(mem_handle(O_RDONLY).can_read());
        assert!(!mem_handle(O_RDONLY).can_write());
        assert!(mem_handle(O_WRONLY).can_write());
        assert!(!mem_handle(O_WRONLY).can_read());
        let rw = mem_handle(O_RDWR | O_CREAT);
        assert!(rw.can_read() && rw.can_write());
    }

    #[test]
    fn test_kernel_write_read_moves_offset() {
        let h = mem_handle(O_RDWR);
        assert_eq!(h.write_kernel(b"hello").expect("write"), 5);
        assert_eq!(*h.offset.lock(), 5);
        h.seek(0, SeekWhence::Set).expect("seek");
        let mut buf = [0u8; 5];
        assert_eq!(h.read_kernel(&mut buf).expect("read"), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_seek_variants() {
        let h = mem_handle(O_RDWR);
        h.write_kernel(b"0123456789").expect("write");
        assert_eq!(h.seek(4, SeekWhence::Set).expect("seek"), 4);
        assert_eq!(h.seek(2, SeekWhence::Cur).expect("seek"), 6);
        assert_eq!(h.seek(-3, SeekWhence::End).expect("seek"), 7);
        // SEEK_CUR of zero is idempotent and reports the offset.
        assert_eq!(h.seek(0, SeekWhence::Cur).expect("seek"), 7);
        assert_eq!(h.seek(0, SeekWhence::Cur).expect("seek"), 7);
    }

    #[test]
    fn test_seek_rejects_negative_offsets() {
        let h = mem_handle(O_RDWR);
        assert!(matches!(
            h.seek(-1, SeekWhence::Set),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_whence_decoding() {
        assert_eq!(SeekWhence::from_raw(0).expect("SET"), SeekWhence::Set);
        assert_eq!(SeekWhence::from_raw(2).expect("END"), SeekWhence::End);
        assert!(SeekWhence::from_raw(3).is_err());
    }

    #[test]
    fn test_table_insert_lookup_remove() {
        let mut table = FileTable::new();
        table.insert(3, mem_handle(O_RDONLY));
        assert!(table.lookup(3).is_some());
        assert!(table.lookup(4).is_none());
        table.remove(3).expect("remove");
        assert!(table.lookup(3).is_none());
        assert!(matches!(
            table.remove(3),
            Err(KernelError::BadDescriptor { fd: 3 })
        ));
    }

    #[test]
    fn test_dup2_shares_handle_and_offset() {
        let mut table = FileTable::new();
        let h = mem_handle(O_RDWR);
        table.insert(1, Arc::clone(&h));
        assert_eq!(table.dup2(1, 7).expect("dup2"), 7);

        let a = table.lookup(1).expect("fd 1");
        let b = table.lookup(7).expect("fd 7");
        assert!(Arc::ptr_eq(&a, &b));

        a.write_kernel(b"xy").expect("write");
        assert_eq!(*b.offset.lock(), 2);
    }

    #[test]
    fn test_dup2_onto_live_fd_releases_old_handle() {
        let mut table = FileTable::new();
        let first = mem_handle(O_RDONLY);
        let second = mem_handle(O_RDONLY);
        table.insert(1, Arc::clone(&first));
        table.insert(2, Arc::clone(&second));
        table.dup2(1, 2).expect("dup2");
        // fd 2's old handle lost its table reference.
        assert_eq!(Arc::strong_count(&second), 1);
        assert!(Arc::ptr_eq(&table.lookup(2).expect("fd 2"), &first));
    }

    #[test]
    fn test_dup2_of_missing_fd_is_ebadf() {
        let mut table = FileTable::new();
        assert!(matches!(
            table.dup2(9, 1),
            Err(KernelError::BadDescriptor { fd: 9 })
        ));
    }

    #[test]
    fn test_refcount_tracks_entry_bindings() {
        let mut parent = FileTable::new();
        let h = mem_handle(O_RDWR);
        parent.insert(0, Arc::clone(&h));
        // Local `h` plus the table entry.
        assert_eq!(Arc::strong_count(&h), 2);
        let child = parent.clone_for_fork();
        assert_eq!(Arc::strong_count(&h), 3);
        drop(child);
        assert_eq!(Arc::strong_count(&h), 2);
        parent.clear();
        assert_eq!(Arc::strong_count(&h), 1);
    }
}
