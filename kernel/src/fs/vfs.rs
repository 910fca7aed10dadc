//! VFS name registry.
//!
//! A flat namespace mapping paths and device names to vnodes. Devices
//! (`con:`, `lhd0raw:`) are mounted at boot; regular paths resolve to
//! memory files, created on demand under O_CREAT.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use super::devices;
use super::file::{O_CREAT, O_EXCL, O_TRUNC};
use super::ramfs::MemFileVnode;
use super::Vnode;
use crate::error::{KernelError, KernelResult};

lazy_static! {
    static ref REGISTRY: Mutex<BTreeMap<String, Arc<dyn Vnode>>> = Mutex::new(BTreeMap::new());
}

/// Mount the console device. Called once at boot; the swap device is
/// mounted separately when the machine has one.
pub fn init() {
    mount_device("con:", devices::console());
    log::info!("[VFS] console mounted at con:");
}

/// Bind a device vnode to a name.
pub fn mount_device(name: &str, vnode: Arc<dyn Vnode>) {
    REGISTRY.lock().insert(name.to_string(), vnode);
}

/// Resolve `path` to a vnode, honoring O_CREAT / O_EXCL / O_TRUNC.
pub fn open(path: &str, flags: u32) -> KernelResult<Arc<dyn Vnode>> {
    if path.is_empty() {
        return Err(KernelError::InvalidArgument {
            name: "path",
            value: "empty",
        });
    }

    let mut registry = REGISTRY.lock();
    if let Some(vnode) = registry.get(path) {
        if flags & O_CREAT != 0 && flags & O_EXCL != 0 {
            return Err(KernelError::InvalidArgument {
                name: "flags",
                value: "O_EXCL but the path already exists",
            });
        }
        let vnode = Arc::clone(vnode);
        drop(registry);
        if flags & O_TRUNC != 0 {
            vnode.truncate()?;
        }
        return Ok(vnode);
    }

    if flags & O_CREAT != 0 {
        let vnode: Arc<dyn Vnode> = Arc::new(MemFileVnode::new());
        registry.insert(path.to_string(), Arc::clone(&vnode));
        return Ok(vnode);
    }

    Err(KernelError::NotFound)
}

/// Release a vnode reference obtained from [`open`]. Dropping the last
/// `Arc` releases the object; device vnodes persist in the registry.
pub fn close(_vnode: &Arc<dyn Vnode>) {}

/// Remove a path binding (test support and future unlink).
pub fn unlink(path: &str) -> KernelResult<()> {
    REGISTRY
        .lock()
        .remove(path)
        .map(|_| ())
        .ok_or(KernelError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::{O_RDONLY, O_RDWR};
    use crate::fs::uio::Uio;

    #[test]
    fn test_open_missing_path_without_creat_fails() {
        assert_eq!(
            open("/vfs-test-missing", O_RDONLY).err(),
            Some(KernelError::NotFound)
        );
    }

    #[test]
    fn test_creat_then_reopen_same_vnode() {
        let a = open("/vfs-test-a", O_RDWR | O_CREAT).expect("create");
        let mut w = Uio::kernel_write(b"persisted", 0);
        a.write(&mut w).expect("write");

        let b = open("/vfs-test-a", O_RDONLY).expect("reopen");
        let mut buf = [0u8; 9];
        let mut r = Uio::kernel_read(&mut buf, 0);
        b.read(&mut r).expect("read");
        assert_eq!(&buf, b"persisted");
        unlink("/vfs-test-a").expect("unlink");
    }

    #[test]
    fn test_excl_on_existing_path_fails() {
        let _ = open("/vfs-test-excl", O_RDWR | O_CREAT).expect("create");
        assert!(open("/vfs-test-excl", O_RDWR | O_CREAT | O_EXCL).is_err());
        unlink("/vfs-test-excl").expect("unlink");
    }

    #[test]
    fn test_trunc_discards_contents() {
        let v = open("/vfs-test-trunc", O_RDWR | O_CREAT).expect("create");
        let mut w = Uio::kernel_write(b"old data", 0);
        v.write(&mut w).expect("write");
        let again = open("/vfs-test-trunc", O_RDWR | O_TRUNC).expect("reopen");
        assert_eq!(again.size().expect("size"), 0);
        unlink("/vfs-test-trunc").expect("unlink");
    }

    #[test]
    fn test_empty_path_is_invalid() {
        assert!(matches!(
            open("", O_RDONLY),
            Err(KernelError::InvalidArgument { .. })
        ));
    }
}
