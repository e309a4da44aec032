/*!
Stable-fluids solver on a toroidal grid.

The same numerical pipeline runs on three interchangeable execution backends:
in-process, a message-passing worker pool and a shared-memory worker pool that
is synchronized with its own mutex/condition-variable/barrier primitives.
*/

mod platform;
mod simulation;

pub use simulation::*;

pub use platform::start;
