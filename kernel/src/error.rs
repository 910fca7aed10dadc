//! Kernel error types.
//!
//! Subsystems report failures as [`KernelError`]; the syscall layer maps
//! them onto the user-visible [`Errno`] codes before returning to user
//! mode.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested_pages: usize,
    },
    /// A user-supplied address was outside the process's address space
    BadAddress {
        addr: u32,
    },
    /// File descriptor not present in the process's file table
    BadDescriptor {
        fd: i32,
    },
    /// Seek on a non-seekable object
    NotSeekable,
    /// waitpid target is not a child of the caller
    NoChild {
        pid: i32,
    },
    /// No process with that PID exists
    NoSuchProcess {
        pid: i32,
    },
    /// Generic invalid argument
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// Device or filesystem I/O failure
    IoError {
        device: &'static str,
    },
    /// Path lookup failed
    NotFound,
    /// Feature is part of the design but not built yet
    NotImplemented {
        feature: &'static str,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested_pages } => {
                write!(f, "Out of memory: requested {} pages", requested_pages)
            }
            Self::BadAddress { addr } => write!(f, "Bad user address: 0x{:x}", addr),
            Self::BadDescriptor { fd } => write!(f, "Bad file descriptor: {}", fd),
            Self::NotSeekable => write!(f, "Object does not support seeking"),
            Self::NoChild { pid } => write!(f, "Process {} is not a child of the caller", pid),
            Self::NoSuchProcess { pid } => write!(f, "No process with pid {}", pid),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::IoError { device } => write!(f, "I/O error on {}", device),
            Self::NotFound => write!(f, "No such file or device"),
            Self::NotImplemented { feature } => write!(f, "Not implemented: {}", feature),
        }
    }
}

/// User-visible error numbers.
///
/// Values follow the conventional Unix numbering so user code compiled
/// against a stock `errno.h` agrees with the kernel.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// No such process
    Esrch = 3,
    /// I/O error
    Eio = 5,
    /// No child processes
    Echild = 10,
    /// Out of memory
    Enomem = 12,
    /// Bad user-space address
    Efault = 14,
    /// Bad file descriptor
    Ebadf = 9,
    /// Invalid argument
    Einval = 22,
    /// Illegal seek
    Espipe = 29,
    /// Function not implemented
    Enosys = 38,
}

impl Errno {
    /// Raw errno value handed back through the syscall ABI.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl KernelError {
    /// Map a kernel error onto the errno surfaced to user code.
    pub fn errno(&self) -> Errno {
        match self {
            Self::OutOfMemory { .. } => Errno::Enomem,
            Self::BadAddress { .. } => Errno::Efault,
            Self::BadDescriptor { .. } => Errno::Ebadf,
            Self::NotSeekable => Errno::Espipe,
            Self::NoChild { .. } => Errno::Echild,
            Self::NoSuchProcess { .. } => Errno::Esrch,
            Self::InvalidArgument { .. } => Errno::Einval,
            Self::IoError { .. } => Errno::Eio,
            // Opening a path that does not exist (and was not O_CREAT)
            // surfaces as an I/O failure; the errno set has no ENOENT.
            Self::NotFound => Errno::Eio,
            Self::NotImplemented { .. } => Errno::Enosys,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Esrch => "ESRCH",
            Self::Eio => "EIO",
            Self::Echild => "ECHILD",
            Self::Enomem => "ENOMEM",
            Self::Efault => "EFAULT",
            Self::Einval => "EINVAL",
            Self::Ebadf => "EBADF",
            Self::Espipe => "ESPIPE",
            Self::Enosys => "ENOSYS",
        };
        write!(f, "{}", name)
    }
}
