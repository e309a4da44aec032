use super::{futex, mutex::RawMutexGuard};
use std::sync::atomic::{AtomicU32, Ordering};

/// Condition variable over a 32 bit sequence counter.
///
/// Every `signal`/`broadcast` bumps the counter; a waiter sleeps only while the
/// counter still has the value it saw before releasing the mutex. Callers must
/// re-check their predicate in a loop.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Condvar {
    seq: AtomicU32,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar { seq: AtomicU32::new(0) }
    }

    /// Releases the guarded mutex, sleeps until signaled and locks it again.
    pub fn wait(&self, guard: &RawMutexGuard<'_>) {
        let seq = self.seq.load(Ordering::Relaxed);
        guard.mutex.unlock_raw();
        futex::wait(&self.seq, seq);
        guard.mutex.lock_raw();
    }

    pub fn signal(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex::wake_one(&self.seq);
    }

    pub fn broadcast(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex::wake_all(&self.seq);
    }
}
