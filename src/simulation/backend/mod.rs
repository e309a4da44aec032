//! Execution backends.
//!
//! The fluid pipeline only talks to [`ExecutionBackend`]; which variant runs
//! the kernels is decided once, from [`BackendConfig::mode`]. Every call blocks
//! until the operation is complete, so the caller never has two operations on
//! the same buffers in flight.

use crate::{
    error::{ensure_power_of_two, SolverResult},
    fluid::{BufferId, GridArena},
    floating_type_mod::FT,
    kernels::{self, JacobiParams},
    sharding::TorusShardingPolicy,
    statistics::PerformanceCounters,
};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

mod local;
mod rpc;
mod shared;

pub use local::LocalBackend;
pub use rpc::RpcBackend;
pub use shared::SharedBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Local,
    Worker,
    Shared,
}

impl BackendMode {
    pub const ALL: [BackendMode; 3] = [BackendMode::Local, BackendMode::Worker, BackendMode::Shared];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::Local => "local",
            BackendMode::Worker => "worker",
            BackendMode::Shared => "shared",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = crate::error::SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| crate::error::invalid_parameter("backend", format!("unknown mode `{}`", s)))
    }
}

/// Everything a backend needs to be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    pub width: usize,
    pub height: usize,
    pub shards: usize,
    pub mode: BackendMode,
}

impl BackendConfig {
    pub fn validate(&self) -> SolverResult<()> {
        // horizon does not matter for the shape checks
        TorusShardingPolicy::new(self.width, self.height, 1, self.shards).map(|_| ())
    }
}

/// Operations of the fluid step. Buffers are addressed by [`BufferId`] inside
/// the caller's [`GridArena`]; a backend may take buffers out of the arena for
/// the duration of a call but always puts them back before returning `Ok`.
///
/// Calling anything after [`ExecutionBackendTrait::shutdown`] panics.
#[enum_dispatch]
pub trait ExecutionBackendTrait {
    fn mode(&self) -> BackendMode;

    fn is_alive(&self) -> bool;

    fn init(&mut self, arena: &mut GridArena) -> SolverResult<()>;

    /// Makes `(u, v)` the velocity field used by `advect` and `calc_div`.
    fn update_velocity(&mut self, arena: &GridArena, u: BufferId, v: BufferId) -> SolverResult<()>;

    fn advect(&mut self, arena: &mut GridArena, inp: BufferId, out: BufferId, scale: FT) -> SolverResult<()>;

    fn calc_div(&mut self, arena: &mut GridArena, div: BufferId, scale: FT) -> SolverResult<()>;

    fn subtract_pressure(
        &mut self,
        arena: &mut GridArena,
        p: BufferId,
        u: BufferId,
        v: BufferId,
        scale: FT,
    ) -> SolverResult<()>;

    fn jacobi(&mut self, arena: &mut GridArena, inp: BufferId, out: BufferId, params: JacobiParams)
        -> SolverResult<()>;

    fn zero(&mut self, arena: &mut GridArena, buf: BufferId) -> SolverResult<()>;

    /// Stops all workers. Requests still in flight are abandoned.
    fn shutdown(&mut self) -> SolverResult<()>;

    /// Backend specific timings, if the backend records any.
    fn pcounters(&self) -> Option<&PerformanceCounters> {
        None
    }
}

#[enum_dispatch(ExecutionBackendTrait)]
pub enum ExecutionBackend {
    LocalBackend,
    RpcBackend,
    SharedBackend,
}

impl ExecutionBackend {
    pub fn new(config: BackendConfig, counters_enabled: bool) -> SolverResult<ExecutionBackend> {
        ensure_power_of_two("grid width", config.width)?;
        ensure_power_of_two("grid height", config.height)?;
        config.validate()?;

        let backend: ExecutionBackend = match config.mode {
            BackendMode::Local => LocalBackend::new(config).into(),
            BackendMode::Worker => RpcBackend::new(config, counters_enabled)?.into(),
            BackendMode::Shared => SharedBackend::new(config)?.into(),
        };
        log::info!(
            "created {} backend for a {}x{} grid with {} shards",
            config.mode,
            config.width,
            config.height,
            config.shards
        );
        Ok(backend)
    }
}

pub(crate) fn assert_alive(alive: bool, operation: &str) {
    assert!(alive, "`{}` called on a backend after shutdown", operation);
}

pub(crate) fn velocity_view(velocity: Option<(BufferId, BufferId)>, operation: &str) -> (BufferId, BufferId) {
    velocity.unwrap_or_else(|| panic!("`{}` needs a velocity field, call `update_velocity` first", operation))
}

/// Kernels every backend runs on the calling thread.
pub(crate) fn calc_div_in_place(arena: &mut GridArena, velocity: (BufferId, BufferId), div: BufferId, scale: FT) {
    let (u, v) = velocity;
    assert!(div != u && div != v, "divergence must not overwrite the velocity field");
    let mut div_grid = arena.take(div);
    kernels::calc_div(arena.get(u), arena.get(v), &mut div_grid, scale);
    arena.restore(div, div_grid);
}

pub(crate) fn subtract_pressure_in_place(arena: &mut GridArena, p: BufferId, u: BufferId, v: BufferId, scale: FT) {
    assert!(p != u && p != v && u != v, "pressure and velocity buffers must be distinct");
    let mut u_grid = arena.take(u);
    let mut v_grid = arena.take(v);
    kernels::subtract_pressure(arena.get(p), &mut u_grid, &mut v_grid, scale);
    arena.restore(u, u_grid);
    arena.restore(v, v_grid);
}

pub(crate) fn zero_in_place(arena: &mut GridArena, buf: BufferId) {
    kernels::zero(arena.get_mut(buf));
}

pub(crate) fn advect_in_place(
    arena: &mut GridArena,
    velocity: (BufferId, BufferId),
    inp: BufferId,
    out: BufferId,
    scale: FT,
) {
    let (u, v) = velocity;
    assert!(inp != out, "advect input and output must be different buffers");
    assert!(out != u && out != v, "advect must not overwrite the velocity field");
    let mut out_grid = arena.take(out);
    kernels::advect(arena.get(inp), &mut out_grid, arena.get(u), arena.get(v), scale);
    arena.restore(out, out_grid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_and_print() {
        for mode in BackendMode::ALL {
            assert_eq!(mode.to_string().parse::<BackendMode>().unwrap(), mode);
        }
        assert!("remote".parse::<BackendMode>().is_err());
    }

    #[test]
    fn construction_validates_the_shape() {
        let config = BackendConfig {
            width: 48,
            height: 64,
            shards: 1,
            mode: BackendMode::Local,
        };
        assert!(ExecutionBackend::new(config, false).is_err());

        let config = BackendConfig {
            width: 64,
            height: 64,
            shards: 3,
            mode: BackendMode::Shared,
        };
        assert!(ExecutionBackend::new(config, false).is_err());
    }
}
