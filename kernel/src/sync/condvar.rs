//! Condition variable over a spin mutex.
//!
//! `wait` atomically snapshots the wakeup generation while still holding
//! the lock, releases it, and spins until a broadcast advances the
//! generation; it reacquires the lock before returning. Because every
//! caller re-checks its predicate in a loop, a stale wakeup is harmless
//! and a broadcast between snapshot and sleep cannot be lost.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use super::relax;

/// A condition variable paired with some `spin::Mutex` chosen by the
/// caller. Broadcasters must hold that same mutex.
#[derive(Debug, Default)]
pub struct Condvar {
    generation: AtomicU64,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Release `guard`, sleep until the next broadcast, reacquire the
    /// lock. Callers loop: `while !predicate { guard = cv.wait(lock, guard) }`.
    pub fn wait<'a, T>(&self, lock: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let ticket = self.generation.load(Ordering::Acquire);
        drop(guard);
        while self.generation.load(Ordering::Acquire) == ticket {
            relax();
        }
        lock.lock()
    }

    /// Wake every waiter. Must be called with the paired lock held.
    pub fn broadcast(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::*;

    #[test]
    fn test_wait_observes_broadcast() {
        struct Shared {
            lock: Mutex<bool>,
            cv: Condvar,
        }
        let shared = Arc::new(Shared {
            lock: Mutex::new(false),
            cv: Condvar::new(),
        });

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut done = shared.lock.lock();
                while !*done {
                    done = shared.cv.wait(&shared.lock, done);
                }
            })
        };

        {
            let mut done = shared.lock.lock();
            *done = true;
            shared.cv.broadcast();
        }
        waiter.join().expect("waiter thread should finish");
    }

    #[test]
    fn test_broadcast_wakes_all_waiters() {
        struct Shared {
            lock: Mutex<u32>,
            cv: Condvar,
        }
        let shared = Arc::new(Shared {
            lock: Mutex::new(0),
            cv: Condvar::new(),
        });

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let mut state = shared.lock.lock();
                    while *state == 0 {
                        state = shared.cv.wait(&shared.lock, state);
                    }
                    *state
                })
            })
            .collect();

        {
            let mut state = shared.lock.lock();
            *state = 7;
            shared.cv.broadcast();
        }
        for w in waiters {
            assert_eq!(w.join().expect("waiter should finish"), 7);
        }
    }
}
