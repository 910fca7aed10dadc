//! The VFS collaborator boundary.
//!
//! The core kernel consumes the [`Vnode`] contract; the in-tree
//! implementations are just enough to run the machine: a console
//! device, growable memory files, and the raw block device backing the
//! swap disk. A real on-disk filesystem would slot in behind the same
//! trait.

pub mod devices;
pub mod file;
pub mod ramfs;
pub mod uio;
pub mod vfs;

use spin::Mutex;

use crate::error::KernelResult;
use uio::Uio;

/// An open file-system object.
///
/// Every vnode carries an operations lock (`ops_lock`); the file layer
/// serializes read/write/lseek on a handle by holding it, and the
/// handle's offset is only mutated under it.
pub trait Vnode: Send + Sync {
    /// Transfer bytes from the object at `uio.offset()` into the uio
    /// target. A short transfer (EOF) leaves residual count behind.
    fn read(&self, uio: &mut Uio<'_>) -> KernelResult<()>;

    /// Transfer bytes from the uio source into the object at
    /// `uio.offset()`.
    fn write(&self, uio: &mut Uio<'_>) -> KernelResult<()>;

    /// Current size in bytes (stat).
    fn size(&self) -> KernelResult<u64>;

    /// Whether the object has seekable positions (devices like the
    /// console do not).
    fn is_seekable(&self) -> bool;

    /// The per-vnode operations lock.
    fn ops_lock(&self) -> &Mutex<()>;

    /// Discard contents (O_TRUNC). Objects without contents to discard
    /// ignore it.
    fn truncate(&self) -> KernelResult<()> {
        Ok(())
    }
}
