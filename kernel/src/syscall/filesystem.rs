//! File system calls: open, read, write, close, lseek, dup2.
//!
//! Each wrapper copies user arguments in, resolves the descriptor in
//! the current process's file table, enforces the handle's semantic
//! permission, and performs the transfer directly against the user
//! buffer under the vnode's op-lock.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::{Errno, KernelResult};
use crate::fs::file::{
    FileHandle, SeekWhence, FILE_NAME_MAXLEN, O_CREAT, O_EXCL,
};
use crate::fs::vfs;
use crate::mm::addrspace::AddressSpace;
use crate::mm::{usermem, VirtualAddress};
use crate::process::{current, Process};

fn current_proc() -> Result<Arc<Process>, Errno> {
    current().ok_or(Errno::Efault)
}

fn current_space(proc: &Arc<Process>) -> Result<Arc<AddressSpace>, Errno> {
    proc.addrspace().ok_or(Errno::Efault)
}

fn lookup(proc: &Arc<Process>, fd: i32) -> Result<Arc<FileHandle>, Errno> {
    proc.files.lock().lookup(fd).ok_or(Errno::Ebadf)
}

/// Open `path` (copied in from user space) with `flags`. The mode
/// argument is accepted and ignored, as the VFS has no permission
/// model.
pub fn sys_open(upath: VirtualAddress, flags: u32, _mode: u32) -> Result<i32, Errno> {
    if flags > 128 {
        return Err(Errno::Einval);
    }
    if flags & O_EXCL != 0 && flags & O_CREAT == 0 {
        return Err(Errno::Einval);
    }
    let proc = current_proc()?;
    let space = current_space(&proc)?;
    let path = usermem::copyinstr(&space, upath, FILE_NAME_MAXLEN).map_err(|e| e.errno())?;

    k_open(&proc, &path, flags).map_err(|e| e.errno())
}

/// Kernel-level open: no user copies, shared with boot-time setup and
/// tests.
pub fn k_open(proc: &Arc<Process>, path: &str, flags: u32) -> KernelResult<i32> {
    let vnode = vfs::open(path, flags)?;
    let handle = FileHandle::new(vnode, flags);
    let fd = proc.next_fd();
    proc.files.lock().insert(fd, handle);
    Ok(fd)
}

/// Read up to `len` bytes into the user buffer. Requires a handle
/// opened with read access.
pub fn sys_read(fd: i32, ubuf: VirtualAddress, len: usize) -> Result<i32, Errno> {
    let proc = current_proc()?;
    let space = current_space(&proc)?;
    let handle = lookup(&proc, fd)?;
    if !handle.can_read() {
        return Err(Errno::Ebadf);
    }
    let n = handle
        .read_user(&space, ubuf, len)
        .map_err(|e| e.errno())?;
    Ok(n as i32)
}

/// Write `len` bytes from the user buffer. Requires write access.
pub fn sys_write(fd: i32, ubuf: VirtualAddress, len: usize) -> Result<i32, Errno> {
    let proc = current_proc()?;
    let space = current_space(&proc)?;
    let handle = lookup(&proc, fd)?;
    if !handle.can_write() {
        return Err(Errno::Ebadf);
    }
    let n = handle
        .write_user(&space, ubuf, len)
        .map_err(|e| e.errno())?;
    Ok(n as i32)
}

/// Close a descriptor. The handle goes when its last binding does.
pub fn sys_close(fd: i32) -> Result<(), Errno> {
    let proc = current_proc()?;
    let result = proc.files.lock().remove(fd).map_err(|e| e.errno());
    result
}

/// Reposition a descriptor's offset.
pub fn sys_lseek(fd: i32, pos: i64, whence_raw: i32) -> Result<i64, Errno> {
    let proc = current_proc()?;
    let handle = lookup(&proc, fd)?;
    let whence = SeekWhence::from_raw(whence_raw).map_err(|e| e.errno())?;
    handle.seek(pos, whence).map_err(|e| e.errno())
}

/// lseek as dispatched from the trap frame: the whence argument is
/// spilled to the user stack by the calling convention.
pub fn sys_lseek_from_stack(
    fd: i32,
    pos: i64,
    whence_uaddr: VirtualAddress,
) -> Result<i64, Errno> {
    let proc = current_proc()?;
    let space = current_space(&proc)?;
    let whence_raw =
        usermem::copyin_u32(&space, whence_uaddr).map_err(|e| e.errno())? as i32;
    drop(proc);
    sys_lseek(fd, pos, whence_raw)
}

/// Make `new_fd` another name for `old_fd`'s handle.
pub fn sys_dup2(old_fd: i32, new_fd: i32) -> Result<i32, Errno> {
    if new_fd < 0 || old_fd < 0 {
        return Err(Errno::Ebadf);
    }
    let proc = current_proc()?;
    let result = proc.files.lock().dup2(old_fd, new_fd);
    result.map_err(|e| e.errno())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::{O_RDONLY, O_RDWR, O_WRONLY};
    use crate::process::set_current;
    use crate::test_support;

    #[test]
    fn test_open_validates_flags() {
        test_support::boot_for_tests();
        let proc = Process::create_runprogram("flagcheck").expect("proc");
        let old = set_current(Some(Arc::clone(&proc)));
        // Flag bits above 128 are rejected before any copyin.
        assert_eq!(
            sys_open(VirtualAddress::new(0), 129, 0).unwrap_err(),
            Errno::Einval
        );
        // O_EXCL without O_CREAT is malformed.
        assert_eq!(
            sys_open(VirtualAddress::new(0), O_EXCL | O_RDWR, 0).unwrap_err(),
            Errno::Einval
        );
        set_current(old);
        crate::process::table::remove(proc.pid());
        proc.destroy();
    }

    #[test]
    fn test_k_open_allocates_monotonic_fds() {
        test_support::boot_for_tests();
        let proc = Process::create_runprogram("opener").expect("proc");
        let fd = k_open(&proc, "/k-open-a", O_RDWR | O_CREAT).expect("open");
        assert_eq!(fd, 3);
        let fd2 = k_open(&proc, "/k-open-b", O_RDWR | O_CREAT).expect("open");
        assert_eq!(fd2, 4);
        // Closing the newest fd does not rewind the counter.
        proc.files.lock().remove(fd2).expect("close");
        let fd3 = k_open(&proc, "/k-open-c", O_RDWR | O_CREAT).expect("open");
        assert_eq!(fd3, 5);
        crate::process::table::remove(proc.pid());
        proc.destroy();
        for p in ["/k-open-a", "/k-open-b", "/k-open-c"] {
            vfs::unlink(p).expect("unlink");
        }
    }

    #[test]
    fn test_read_and_write_enforce_semantic_permission() {
        use crate::mm::addrspace::{AddressSpace, RegionFlags};
        use crate::mm::PAGE_SIZE;

        test_support::boot_for_tests();
        let proc = Process::create_runprogram("perm").expect("proc");
        let space = AddressSpace::create();
        space
            .define_region(
                VirtualAddress::new(0x0040_0000),
                PAGE_SIZE as u32,
                RegionFlags::READ | RegionFlags::WRITE,
            )
            .expect("region");
        proc.set_addrspace(Some(space));

        let wr = k_open(&proc, "/perm-file", O_WRONLY | O_CREAT).expect("open write-only");
        let rd = k_open(&proc, "/perm-file", O_RDONLY).expect("open read-only");
        let old = set_current(Some(Arc::clone(&proc)));
        let buf = VirtualAddress::new(0x0040_0000);
        // Reading a write-only fd and writing a read-only fd are both
        // descriptor errors, regardless of the literal flag bits.
        assert_eq!(sys_read(wr, buf, 4).unwrap_err(), Errno::Ebadf);
        assert_eq!(sys_write(rd, buf, 4).unwrap_err(), Errno::Ebadf);
        // The permitted directions work.
        assert_eq!(sys_write(wr, buf, 4).expect("write"), 4);
        assert_eq!(sys_read(rd, buf, 4).expect("read"), 4);
        set_current(old);
        crate::process::table::remove(proc.pid());
        proc.destroy();
        vfs::unlink("/perm-file").expect("unlink");
    }

    #[test]
    fn test_close_of_unknown_fd_is_ebadf() {
        test_support::boot_for_tests();
        let proc = Process::create_runprogram("closer").expect("proc");
        let old = set_current(Some(Arc::clone(&proc)));
        assert_eq!(sys_close(99).unwrap_err(), Errno::Ebadf);
        set_current(old);
        crate::process::table::remove(proc.pid());
        proc.destroy();
    }

    #[test]
    fn test_lseek_on_console_is_espipe() {
        test_support::boot_for_tests();
        let proc = Process::create_runprogram("seeker").expect("proc");
        let old = set_current(Some(Arc::clone(&proc)));
        // fd 1 is the console.
        assert_eq!(sys_lseek(1, 0, 0).unwrap_err(), Errno::Espipe);
        set_current(old);
        crate::process::table::remove(proc.pid());
        proc.destroy();
    }

    #[test]
    fn test_dup2_rejects_negative_descriptors() {
        test_support::boot_for_tests();
        let proc = Process::create_runprogram("duper").expect("proc");
        let old = set_current(Some(Arc::clone(&proc)));
        assert_eq!(sys_dup2(-1, 3).unwrap_err(), Errno::Ebadf);
        assert_eq!(sys_dup2(1, -3).unwrap_err(), Errno::Ebadf);
        set_current(old);
        crate::process::table::remove(proc.pid());
        proc.destroy();
    }
}
