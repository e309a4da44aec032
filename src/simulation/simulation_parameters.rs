use crate::{
    backend::{BackendConfig, BackendMode},
    error::{ensure_power_of_two, invalid_parameter, SolverResult},
    floating_type_mod::FT,
    kernels::validate_iterations,
    sharding::TorusShardingPolicy,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub width: usize,
    pub height: usize,
    pub shards: usize,
    pub backend: BackendMode,

    pub diffuse: FT,
    // fraction of velocity lost per unit of (scaled) time
    pub drag: FT,

    // every incoming dt is multiplied by this before the step
    pub dt_scale: FT,
    // frame loop clamps dt to [0, max_dt] before scaling
    pub max_dt: FT,
    // world size of one cell
    pub dx: FT,

    pub diffusion_iterations: u32,
    pub pressure_iterations: u32,

    pub initial_splats: usize,
    // one random splat per simulated second
    pub auto_splat: bool,
    pub seed: Option<u64>,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            width: 256,
            height: 256,
            shards: 4,
            backend: BackendMode::Local,
            diffuse: 0.000002,
            drag: 0.,
            dt_scale: 10.,
            max_dt: 0.25,
            dx: 1. / 256.,
            diffusion_iterations: 30,
            pressure_iterations: 30,
            initial_splats: 10,
            auto_splat: true,
            seed: None,
        }
    }
}

impl SimulationParams {
    /// Rejects every configuration the solver cannot run, before anything is
    /// allocated.
    pub fn validate(&self) -> SolverResult<()> {
        ensure_power_of_two("grid width", self.width)?;
        ensure_power_of_two("grid height", self.height)?;
        validate_iterations(self.diffusion_iterations)?;
        validate_iterations(self.pressure_iterations)?;

        // also checks the shard count against the grid
        let horizon = self.diffusion_iterations.max(self.pressure_iterations) as usize - 1;
        TorusShardingPolicy::new(self.width, self.height, horizon, self.shards)?;

        if !self.diffuse.is_finite() || self.diffuse < 0. {
            return Err(invalid_parameter("diffuse", format!("{} is not a finite non-negative number", self.diffuse)));
        }
        if !(0. ..1.).contains(&self.drag) {
            return Err(invalid_parameter("drag", format!("{} is not in [0, 1)", self.drag)));
        }
        if !(self.dt_scale > 0.) {
            return Err(invalid_parameter("dt_scale", "must be positive"));
        }
        if !(self.max_dt >= 0.) {
            return Err(invalid_parameter("max_dt", "must not be negative"));
        }
        if !(self.dx > 0.) {
            return Err(invalid_parameter("dx", "must be positive"));
        }
        Ok(())
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            width: self.width,
            height: self.height,
            shards: self.shards,
            mode: self.backend,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> SolverResult<SimulationParams> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> SolverResult<SimulationParams> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Loads `path` and replaces its top-level keys with the ones found in
    /// `overwrite_path`. Keys the base file does not know are rejected.
    pub fn from_yaml_file_with_overwrite(
        path: impl AsRef<Path>,
        overwrite_path: Option<impl AsRef<Path>>,
    ) -> SolverResult<SimulationParams> {
        let yaml = std::fs::read_to_string(path)?;
        let overwrite = match overwrite_path {
            Some(p) => Some(std::fs::read_to_string(p)?),
            None => None,
        };
        Self::from_yaml_str_with_overwrite(&yaml, overwrite.as_deref())
    }

    pub fn from_yaml_str_with_overwrite(yaml: &str, overwrite: Option<&str>) -> SolverResult<SimulationParams> {
        // start from the serialized defaults so that a sparse base file can
        // still be overwritten key by key
        let mut simulation_params_serde = serde_yaml::to_value(SimulationParams::default())?;
        let base: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(yaml)?;
        let overwrite: HashMap<String, serde_yaml::Value> = match overwrite {
            Some(overwrite) => serde_yaml::from_str(overwrite)?,
            None => HashMap::new(),
        };

        let mapping = simulation_params_serde
            .as_mapping_mut()
            .ok_or_else(|| invalid_parameter("config", "simulation parameters are not a mapping"))?;
        for (k, v) in base.into_iter().chain(overwrite.into_iter()) {
            let slot = mapping
                .get_mut(&serde_yaml::Value::String(k.clone()))
                .ok_or_else(|| invalid_parameter(k.clone(), "unknown attribute"))?;
            *slot = v;
        }

        Ok(serde_yaml::from_value(simulation_params_serde)?)
    }

    pub fn to_yaml_string(&self) -> SolverResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SolverError;

    #[test]
    fn defaults_are_valid() {
        let params = SimulationParams::default();
        params.validate().unwrap();
        assert_eq!(params.backend_config().mode, BackendMode::Local);
    }

    #[test]
    fn validation_rejects_bad_configurations() {
        let params = SimulationParams {
            width: 200,
            ..SimulationParams::default()
        };
        assert!(matches!(params.validate(), Err(SolverError::NotPowerOfTwo { .. })));

        let params = SimulationParams {
            shards: 6,
            ..SimulationParams::default()
        };
        assert!(matches!(params.validate(), Err(SolverError::NotPowerOfTwo { .. })));

        let params = SimulationParams {
            width: 4,
            height: 4,
            shards: 32,
            ..SimulationParams::default()
        };
        assert!(matches!(params.validate(), Err(SolverError::ShardsExceedGrid { .. })));

        let params = SimulationParams {
            pressure_iterations: 31,
            ..SimulationParams::default()
        };
        assert!(matches!(params.validate(), Err(SolverError::OddIterations { iterations: 31 })));

        let params = SimulationParams {
            drag: 1.,
            ..SimulationParams::default()
        };
        assert!(matches!(params.validate(), Err(SolverError::InvalidParameter { .. })));

        let params = SimulationParams {
            diffuse: -1.,
            ..SimulationParams::default()
        };
        assert!(matches!(params.validate(), Err(SolverError::InvalidParameter { .. })));
    }

    #[test]
    fn overwrite_replaces_top_level_keys() {
        let base = "width: 64\nheight: 32\nbackend: worker\n";
        let overwrite = "shards: 2\nbackend: shared\n";
        let params = SimulationParams::from_yaml_str_with_overwrite(base, Some(overwrite)).unwrap();
        assert_eq!(params.width, 64);
        assert_eq!(params.height, 32);
        assert_eq!(params.shards, 2);
        assert_eq!(params.backend, BackendMode::Shared);
        assert_eq!(params.pressure_iterations, 30);
    }

    #[test]
    fn overwrite_rejects_unknown_keys() {
        let result = SimulationParams::from_yaml_str_with_overwrite("width: 64\n", Some("viscosity: 2\n"));
        assert!(matches!(result, Err(SolverError::InvalidParameter { .. })));
    }

    #[test]
    fn yaml_round_trip_keeps_values() {
        let params = SimulationParams {
            seed: Some(9),
            backend: BackendMode::Worker,
            ..SimulationParams::default()
        };
        let yaml = params.to_yaml_string().unwrap();
        assert!(yaml.contains("backend: worker"));
        assert_eq!(SimulationParams::from_yaml_str(&yaml).unwrap(), params);
    }
}
