use super::{barrier::Barrier, condvar::Condvar, mutex::RawMutex, mutex::RawMutexGuard};
use crate::{floating_type_mod::FT, kernels::JacobiParams};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const OP_NONE: u32 = 0;
const OP_INIT: u32 = 1;
const OP_JACOBI: u32 = 2;
const OP_QUIT: u32 = 3;

/// What the workers are asked to do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerCommand {
    Init,
    Jacobi(JacobiParams),
    Quit,
}

/// Fixed-layout command channel between the main thread and the workers.
///
/// Every worker is counted in exactly one of `waiting`, `waking` and `running`.
/// All counters and the command slots are only touched while `lock` is held,
/// so they use relaxed atomics; the mutex provides the ordering.
#[repr(C)]
#[derive(Debug)]
pub struct ControlBlock {
    lock: RawMutex,
    worker_wait: Condvar,
    main_wait: Condvar,
    barrier: Barrier,

    waiting: AtomicU32,
    waking: AtomicU32,
    running: AtomicU32,

    command: AtomicU32,
    epoch: AtomicU32,

    jacobi_a: AtomicU64,
    jacobi_inv_b: AtomicU64,
    jacobi_iterations: AtomicU32,
}

impl ControlBlock {
    /// Workers start out as `running`; each registers as waiting on its first
    /// call to [`ControlBlock::wait_for_command`].
    pub fn new(workers: u32) -> ControlBlock {
        ControlBlock {
            lock: RawMutex::new(),
            worker_wait: Condvar::new(),
            main_wait: Condvar::new(),
            barrier: Barrier::new(workers),
            waiting: AtomicU32::new(0),
            waking: AtomicU32::new(0),
            running: AtomicU32::new(workers),
            command: AtomicU32::new(OP_NONE),
            epoch: AtomicU32::new(0),
            jacobi_a: AtomicU64::new(0),
            jacobi_inv_b: AtomicU64::new(0),
            jacobi_iterations: AtomicU32::new(0),
        }
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// `(waiting, waking, running)`
    pub fn counts(&self) -> (u32, u32, u32) {
        let _guard = self.lock.lock();
        (
            self.waiting.load(Ordering::Relaxed),
            self.waking.load(Ordering::Relaxed),
            self.running.load(Ordering::Relaxed),
        )
    }

    /// Blocks until no worker is waking or running.
    fn fence(&self, guard: &RawMutexGuard<'_>) {
        while self.running.load(Ordering::Relaxed) > 0 || self.waking.load(Ordering::Relaxed) > 0 {
            self.main_wait.wait(guard);
        }
    }

    /// Publishes `command` to all workers and returns once every one of them
    /// has finished it and is idle again (or, for `Quit`, has exited).
    pub fn send_command(&self, command: WorkerCommand) {
        let guard = self.lock.lock();
        self.fence(&guard);

        let waiting = self.waiting.load(Ordering::Relaxed);
        if waiting == 0 {
            log::warn!("fence entered without any registered worker, {:?} is dropped", command);
        }

        let opcode = match command {
            WorkerCommand::Init => OP_INIT,
            WorkerCommand::Jacobi(params) => {
                self.jacobi_a.store((params.a as f64).to_bits(), Ordering::Relaxed);
                self.jacobi_inv_b.store((params.inv_b as f64).to_bits(), Ordering::Relaxed);
                self.jacobi_iterations.store(params.iterations, Ordering::Relaxed);
                OP_JACOBI
            }
            WorkerCommand::Quit => OP_QUIT,
        };
        log::trace!("dispatching {:?} to {} workers", command, waiting);

        self.command.store(opcode, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Relaxed);
        self.waking.store(waiting, Ordering::Relaxed);
        self.waiting.store(0, Ordering::Relaxed);
        self.worker_wait.broadcast();

        self.fence(&guard);
    }

    fn decode(&self) -> WorkerCommand {
        match self.command.load(Ordering::Relaxed) {
            OP_INIT => WorkerCommand::Init,
            OP_JACOBI => WorkerCommand::Jacobi(JacobiParams {
                a: f64::from_bits(self.jacobi_a.load(Ordering::Relaxed)) as FT,
                inv_b: f64::from_bits(self.jacobi_inv_b.load(Ordering::Relaxed)) as FT,
                iterations: self.jacobi_iterations.load(Ordering::Relaxed),
            }),
            OP_QUIT => WorkerCommand::Quit,
            other => panic!("invalid opcode {} in control block", other),
        }
    }

    fn leave_running(&self) {
        let running = self.running.load(Ordering::Relaxed) - 1;
        self.running.store(running, Ordering::Relaxed);
        if running == 0 && self.waking.load(Ordering::Relaxed) == 0 {
            self.main_wait.signal();
        }
    }

    /// Worker side: reports the previous command as done, then blocks until a
    /// command newer than `epoch` is published.
    pub fn wait_for_command(&self, epoch: &mut u32) -> WorkerCommand {
        let guard = self.lock.lock();
        self.leave_running();
        self.waiting.fetch_add(1, Ordering::Relaxed);

        while self.epoch.load(Ordering::Relaxed) == *epoch {
            self.worker_wait.wait(&guard);
        }

        self.waking.fetch_sub(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
        *epoch = self.epoch.load(Ordering::Relaxed);
        self.decode()
    }

    /// Forgets `missing` workers that were counted as running but never
    /// started, so fences only wait for the ones that exist.
    pub fn withdraw(&self, missing: u32) {
        let _guard = self.lock.lock();
        for _ in 0..missing {
            self.leave_running();
        }
    }

    /// Worker side: leaves the pool for good after a `Quit`.
    pub fn worker_exit(&self) {
        let _guard = self.lock.lock();
        self.leave_running();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn send_command_waits_for_all_workers() {
        const WORKERS: u32 = 4;
        let block = ControlBlock::new(WORKERS);
        let done = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..WORKERS {
                s.spawn(|| {
                    let mut epoch = 0;
                    loop {
                        match block.wait_for_command(&mut epoch) {
                            WorkerCommand::Quit => {
                                block.worker_exit();
                                break;
                            }
                            WorkerCommand::Init => {}
                            WorkerCommand::Jacobi(_) => {
                                std::thread::sleep(Duration::from_millis(5));
                                done.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                });
            }

            let params = JacobiParams::new(1., 0.25, 2).unwrap();
            for round in 1..=5 {
                block.send_command(WorkerCommand::Jacobi(params));
                assert_eq!(done.load(Ordering::SeqCst), round * WORKERS as usize);
                let (waiting, waking, running) = block.counts();
                assert_eq!((waiting, waking, running), (WORKERS, 0, 0));
            }

            block.send_command(WorkerCommand::Quit);
            assert_eq!(block.counts(), (0, 0, 0));
        });
    }

    #[test]
    fn jacobi_arguments_survive_the_control_block() {
        let block = ControlBlock::new(1);
        let params = JacobiParams::new(-1., 0.25, 30).unwrap();

        std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let mut epoch = 0;
                let received = block.wait_for_command(&mut epoch);
                let quit = block.wait_for_command(&mut epoch);
                block.worker_exit();
                (received, quit)
            });

            block.send_command(WorkerCommand::Jacobi(params));
            block.send_command(WorkerCommand::Quit);

            let (received, quit) = worker.join().unwrap();
            assert_eq!(received, WorkerCommand::Jacobi(params));
            assert_eq!(quit, WorkerCommand::Quit);
        });
    }

    #[test]
    fn withdrawn_workers_are_not_awaited() {
        let block = ControlBlock::new(4);

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let mut epoch = 0;
                    while block.wait_for_command(&mut epoch) != WorkerCommand::Quit {}
                    block.worker_exit();
                });
            }

            block.withdraw(2);
            block.send_command(WorkerCommand::Init);
            assert_eq!(block.counts(), (2, 0, 0));

            block.send_command(WorkerCommand::Quit);
            assert_eq!(block.counts(), (0, 0, 0));
        });
    }
}
