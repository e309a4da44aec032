//! Error taxonomy for configuration, transport and config-file failures.
//!
//! Numeric kernels never fail. Contract violations (using a backend after
//! `shutdown`, aliasing the input and output of `advect`) are programmer errors
//! and panic instead of showing up here.

use thiserror::Error;

pub type SolverResult<T> = Result<T, SolverError>;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("{what} must be a power of two, got {value}")]
    NotPowerOfTwo { what: &'static str, value: usize },

    #[error("{shards} shards cannot evenly divide a {width}x{height} grid")]
    ShardsExceedGrid { shards: usize, width: usize, height: usize },

    #[error("jacobi needs an even iteration count >= 2, got {iterations}")]
    OddIterations { iterations: u32 },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("worker {worker} disconnected")]
    WorkerDisconnected { worker: usize },

    #[error("failed to spawn worker {worker}")]
    WorkerSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed reading config file")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed parsing config file")]
    ConfigParse(#[from] serde_yaml::Error),
}

pub fn ensure_power_of_two(what: &'static str, value: usize) -> SolverResult<()> {
    if value == 0 || !value.is_power_of_two() {
        return Err(SolverError::NotPowerOfTwo { what, value });
    }
    Ok(())
}

pub fn invalid_parameter(name: impl Into<String>, reason: impl std::fmt::Display) -> SolverError {
    SolverError::InvalidParameter {
        name: name.into(),
        reason: reason.to_string(),
    }
}
