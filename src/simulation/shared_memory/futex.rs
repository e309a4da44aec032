use parking_lot_core::{park, unpark_all, unpark_one, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::sync::atomic::{AtomicU32, Ordering};

fn key(atom: &AtomicU32) -> usize {
    atom as *const AtomicU32 as usize
}

/// Blocks the calling thread as long as `atom` still holds `expected`.
///
/// The comparison happens while the parking bucket is locked, so a concurrent
/// store followed by `wake_*` can never be missed. May return spuriously.
pub fn wait(atom: &AtomicU32, expected: u32) {
    // SAFETY: the key is the address of a live atomic and none of the callbacks
    // call back into the parking lot.
    unsafe {
        let _ = park(
            key(atom),
            || atom.load(Ordering::SeqCst) == expected,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            None,
        );
    }
}

pub fn wake_one(atom: &AtomicU32) {
    // SAFETY: see `wait`.
    unsafe {
        let _ = unpark_one(key(atom), |_| DEFAULT_UNPARK_TOKEN);
    }
}

pub fn wake_all(atom: &AtomicU32) {
    // SAFETY: see `wait`.
    unsafe {
        let _ = unpark_all(key(atom), DEFAULT_UNPARK_TOKEN);
    }
}
