use super::futex;
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Mutex over a single 32 bit slot.
///
/// `0` is unlocked, `1` locked without waiters, `2` locked with possible
/// waiters. Only the `2` state pays for a wake-up on unlock. Not fair.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RawMutex {
    state: AtomicU32,
}

impl RawMutex {
    pub const fn new() -> RawMutex {
        RawMutex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> RawMutexGuard<'_> {
        self.lock_raw();
        RawMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<RawMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RawMutexGuard { mutex: self })
    }

    pub(super) fn lock_raw(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex::wait(&self.state, CONTENDED);
        }
    }

    pub(super) fn unlock_raw(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex::wake_one(&self.state);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

/// Releases the mutex when dropped.
pub struct RawMutexGuard<'a> {
    pub(super) mutex: &'a RawMutex,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_raw();
    }
}
