//! Synchronization primitives.
//!
//! Spinlocks come straight from the `spin` crate; this module adds the
//! condition variable the wait/exit rendezvous needs and the busy-wait
//! relax hint it is built on.

mod condvar;

pub use condvar::Condvar;

/// Back off inside a busy-wait loop. On the hosted machine model this
/// also yields the OS thread so a waiting "CPU" does not starve the one
/// it is waiting on.
pub fn relax() {
    core::hint::spin_loop();
    std::thread::yield_now();
}
