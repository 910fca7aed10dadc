//! Device vnodes: the console and the raw block device.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use super::uio::Uio;
use super::Vnode;
use crate::error::{KernelError, KernelResult};

/// The console device (`con:`). Writes append to a capture buffer and
/// go to the kernel log; reads drain whatever input has been queued.
/// Not seekable.
pub struct ConsoleVnode {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    ops: Mutex<()>,
}

impl ConsoleVnode {
    pub fn new() -> Self {
        Self {
            output: Mutex::new(Vec::new()),
            input: Mutex::new(VecDeque::new()),
            ops: Mutex::new(()),
        }
    }

    /// Queue bytes for subsequent console reads.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Drain and return everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock())
    }
}

impl Default for ConsoleVnode {
    fn default() -> Self {
        Self::new()
    }
}

impl Vnode for ConsoleVnode {
    fn read(&self, uio: &mut Uio<'_>) -> KernelResult<()> {
        let mut input = self.input.lock();
        let n = uio.resid().min(input.len());
        if n == 0 {
            return Ok(());
        }
        let chunk: Vec<u8> = input.drain(..n).collect();
        drop(input);
        uio.move_into_target(&chunk)?;
        Ok(())
    }

    fn write(&self, uio: &mut Uio<'_>) -> KernelResult<()> {
        let mut buf = vec![0u8; uio.resid()];
        let n = uio.move_from_source(&mut buf)?;
        buf.truncate(n);
        if let Ok(text) = core::str::from_utf8(&buf) {
            log::debug!("[CONSOLE] {}", text.trim_end_matches('\n'));
        }
        self.output.lock().extend_from_slice(&buf);
        Ok(())
    }

    fn size(&self) -> KernelResult<u64> {
        Ok(self.output.lock().len() as u64)
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn ops_lock(&self) -> &Mutex<()> {
        &self.ops
    }
}

lazy_static! {
    /// The machine has one console; every process's standard
    /// descriptors share it.
    static ref CONSOLE: Arc<ConsoleVnode> = Arc::new(ConsoleVnode::new());
}

/// The console singleton.
pub fn console() -> Arc<ConsoleVnode> {
    Arc::clone(&CONSOLE)
}

/// A raw, fixed-size block device. Reads and writes must stay inside
/// the device; there is no growing. Backs the swap disk (`lhd0raw:`).
pub struct BlockDevVnode {
    data: Mutex<Box<[u8]>>,
    ops: Mutex<()>,
}

impl BlockDevVnode {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size_bytes].into_boxed_slice()),
            ops: Mutex::new(()),
        }
    }
}

impl Vnode for BlockDevVnode {
    fn read(&self, uio: &mut Uio<'_>) -> KernelResult<()> {
        let data = self.data.lock();
        let off = uio.offset() as usize;
        let n = uio.resid();
        if off + n > data.len() {
            return Err(KernelError::IoError { device: "lhd0raw:" });
        }
        let chunk = data[off..off + n].to_vec();
        drop(data);
        uio.move_into_target(&chunk)?;
        Ok(())
    }

    fn write(&self, uio: &mut Uio<'_>) -> KernelResult<()> {
        let off = uio.offset() as usize;
        let n = uio.resid();
        {
            let data = self.data.lock();
            if off + n > data.len() {
                return Err(KernelError::IoError { device: "lhd0raw:" });
            }
        }
        let mut buf = vec![0u8; n];
        uio.move_from_source(&mut buf)?;
        let mut data = self.data.lock();
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
}
