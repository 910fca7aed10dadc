//! Transition to user mode.
//!
//! The modeled machine has no user instruction stream: once a transition
//! is fully staged (address space active, stack marshalled, entry point
//! or trap frame resolved), the kernel thread that would warp into user
//! mode parks instead. Every kernel-visible effect of launching or
//! forking a program is real; only the user instructions never run.

use super::trapframe::Trapframe;
use crate::mm::VirtualAddress;

/// Warp to user mode at a fresh program's entry point. Never returns.
pub fn enter_new_process(
    argc: usize,
    uargv: VirtualAddress,
    stackptr: VirtualAddress,
    entry: VirtualAddress,
) -> ! {
    log::info!(
        "[USER] entering user mode: entry=0x{:08x} sp=0x{:08x} argc={} argv=0x{:08x}",
        entry.as_u32(),
        stackptr.as_u32(),
        argc,
        uargv.as_u32()
    );
    park_in_usermode()
}

/// Resume a forked child in user mode with its copied trap frame.
/// Never returns.
pub fn enter_forked_process(mut tf: Trapframe) -> ! {
    tf.fork_child_return();
    log::info!(
        "[USER] forked child resuming at epc=0x{:08x} sp=0x{:08x}",
        tf.tf_epc,
        tf.tf_sp
    );
    park_in_usermode()
}

fn park_in_usermode() -> ! {
    loop {
        std::thread::park();
    }
}
