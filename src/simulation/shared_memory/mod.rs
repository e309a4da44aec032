//! Synchronization substrate of the shared-memory backend.
//!
//! Everything in here lives inside one region that is shared by the main
//! thread and all workers. The primitives only use atomics plus address-keyed
//! parking, so they work on any memory both sides can see.

mod barrier;
mod condvar;
mod control_block;
mod futex;
mod mutex;
mod shared_grid;

pub use barrier::Barrier;
pub use condvar::Condvar;
pub use control_block::{ControlBlock, WorkerCommand};
pub use mutex::{RawMutex, RawMutexGuard};
pub use shared_grid::{SharedGrid, SharedGridView};
