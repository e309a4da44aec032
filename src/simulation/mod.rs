pub mod backend;
pub mod error;
pub mod fluid;
pub mod grid;
pub mod kernels;
pub mod perturbation;
pub mod shared_memory;
pub mod sharding;
pub mod simulation_parameters;
pub mod statistics;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
}

use floating_type_mod::FT;

use nalgebra::SVector;

#[allow(dead_code)]
pub type V<FT, const D: usize> = SVector<FT, D>;

pub type V2 = V<FT, 2>;

#[allow(dead_code)]
pub type V2I = V<i32, 2>;

pub fn vec2f(x: FT, y: FT) -> V<FT, 2> {
    [x, y].into()
}

pub fn vec2i(x: i32, y: i32) -> V<i32, 2> {
    [x, y].into()
}

pub use backend::{BackendConfig, BackendMode, ExecutionBackend, ExecutionBackendTrait};
pub use error::{SolverError, SolverResult};
pub use fluid::{BufferId, FieldName, FluidSimulation, GridArena};
pub use grid::{Field, FieldMut, Grid};
pub use kernels::{JacobiParams, Rect};
pub use sharding::TorusShardingPolicy;
pub use simulation_parameters::SimulationParams;
pub use statistics::{write_statistics, PerformanceCounters};
