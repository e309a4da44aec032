use super::{condvar::Condvar, mutex::RawMutex};
use std::sync::atomic::{AtomicU32, Ordering};

/// `parties`-way rendezvous.
///
/// Arrivals increment `count` under the barrier's own mutex. The last one resets
/// it to zero, advances `generation` and broadcasts; everyone else waits until
/// the generation moves.
#[repr(C)]
#[derive(Debug)]
pub struct Barrier {
    lock: RawMutex,
    cond: Condvar,
    count: AtomicU32,
    generation: AtomicU32,
    parties: u32,
}

impl Barrier {
    pub fn new(parties: u32) -> Barrier {
        assert!(parties > 0, "a barrier needs at least one party");
        Barrier {
            lock: RawMutex::new(),
            cond: Condvar::new(),
            count: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            parties,
        }
    }

    /// Returns `true` for exactly one participant per round, the one that
    /// released the others.
    pub fn wait(&self) -> bool {
        let guard = self.lock.lock();
        let generation = self.generation.load(Ordering::Relaxed);
        let arrived = self.count.load(Ordering::Relaxed) + 1;

        if arrived == self.parties {
            self.count.store(0, Ordering::Relaxed);
            self.generation.store(generation.wrapping_add(1), Ordering::Relaxed);
            self.cond.broadcast();
            return true;
        }

        self.count.store(arrived, Ordering::Relaxed);
        while self.generation.load(Ordering::Relaxed) == generation {
            self.cond.wait(&guard);
        }
        false
    }

    /// Arrivals in the current round.
    pub fn arrived(&self) -> u32 {
        let _guard = self.lock.lock();
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn nobody_passes_before_everybody_arrived() {
        const N: usize = 6;
        const ROUNDS: usize = 50;

        let barrier = Barrier::new(N as u32);
        let counter = AtomicUsize::new(0);
        let leaders = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..N {
                s.spawn(|| {
                    for round in 0..ROUNDS {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        // everyone of this round has incremented
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * N);
                        barrier.wait();
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), N * ROUNDS);
        assert_eq!(leaders.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(barrier.arrived(), 0);
    }

    #[test]
    fn single_party_never_blocks() {
        let barrier = Barrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
        assert_eq!(barrier.arrived(), 0);
    }
}
