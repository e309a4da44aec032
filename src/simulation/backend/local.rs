use super::{
    advect_in_place, assert_alive, calc_div_in_place, subtract_pressure_in_place, velocity_view, zero_in_place,
    BackendConfig, BackendMode, ExecutionBackendTrait,
};
use crate::{
    error::SolverResult,
    fluid::{BufferId, GridArena},
    floating_type_mod::FT,
    grid::Grid,
    kernels::{self, JacobiParams},
};

/// Runs every kernel directly on the calling thread.
pub struct LocalBackend {
    width: usize,
    height: usize,
    fb: Option<Grid>,
    velocity: Option<(BufferId, BufferId)>,
    alive: bool,
}

impl LocalBackend {
    pub fn new(config: BackendConfig) -> LocalBackend {
        LocalBackend {
            width: config.width,
            height: config.height,
            fb: None,
            velocity: None,
            alive: true,
        }
    }
}

impl ExecutionBackendTrait for LocalBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Local
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn init(&mut self, _arena: &mut GridArena) -> SolverResult<()> {
        assert_alive(self.alive, "init");
        self.fb = Some(Grid::new(self.width, self.height));
        Ok(())
    }

    fn update_velocity(&mut self, _arena: &GridArena, u: BufferId, v: BufferId) -> SolverResult<()> {
        assert_alive(self.alive, "update_velocity");
        self.velocity = Some((u, v));
        Ok(())
    }

    fn advect(&mut self, arena: &mut GridArena, inp: BufferId, out: BufferId, scale: FT) -> SolverResult<()> {
        assert_alive(self.alive, "advect");
        advect_in_place(arena, velocity_view(self.velocity, "advect"), inp, out, scale);
        Ok(())
    }

    fn calc_div(&mut self, arena: &mut GridArena, div: BufferId, scale: FT) -> SolverResult<()> {
        assert_alive(self.alive, "calc_div");
        calc_div_in_place(arena, velocity_view(self.velocity, "calc_div"), div, scale);
        Ok(())
    }

    fn subtract_pressure(
        &mut self,
        arena: &mut GridArena,
        p: BufferId,
        u: BufferId,
        v: BufferId,
        scale: FT,
    ) -> SolverResult<()> {
        assert_alive(self.alive, "subtract_pressure");
        subtract_pressure_in_place(arena, p, u, v, scale);
        Ok(())
    }

    fn jacobi(
        &mut self,
        arena: &mut GridArena,
        inp: BufferId,
        out: BufferId,
        params: JacobiParams,
    ) -> SolverResult<()> {
        assert_alive(self.alive, "jacobi");
        assert!(inp != out, "jacobi input and output must be different buffers");

        let (width, height) = (self.width, self.height);
        let fb = self.fb.get_or_insert_with(|| Grid::new(width, height));
        let mut out_grid = arena.take(out);
        kernels::jacobi(arena.get(inp), fb, &mut out_grid, params);
        arena.restore(out, out_grid);
        Ok(())
    }

    fn zero(&mut self, arena: &mut GridArena, buf: BufferId) -> SolverResult<()> {
        assert_alive(self.alive, "zero");
        zero_in_place(arena, buf);
        Ok(())
    }

    fn shutdown(&mut self) -> SolverResult<()> {
        assert_alive(self.alive, "shutdown");
        self.alive = false;
        self.fb = None;
        log::info!("local backend shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fluid::FieldName, grid::FieldMut};

    fn backend() -> LocalBackend {
        LocalBackend::new(BackendConfig {
            width: 4,
            height: 4,
            shards: 1,
            mode: BackendMode::Local,
        })
    }

    #[test]
    fn jacobi_on_the_arena_matches_the_kernel() {
        let mut arena = GridArena::new(4, 4);
        arena.field_mut(FieldName::Div).set(1, 1, 1.);
        arena.field_mut(FieldName::Div).set(1, 3, -1.);

        let mut local = backend();
        local.init(&mut arena).unwrap();
        let params = JacobiParams::new(10., 0.1, 30).unwrap();
        let (div, p) = (arena.id(FieldName::Div), arena.id(FieldName::P));
        local.jacobi(&mut arena, div, p, params).unwrap();

        let mut expected = Grid::new(4, 4);
        kernels::jacobi(arena.field(FieldName::Div), &mut Grid::new(4, 4), &mut expected, params);
        assert_eq!(arena.field(FieldName::P), &expected);
    }

    #[test]
    #[should_panic(expected = "after shutdown")]
    fn use_after_shutdown_panics() {
        let mut arena = GridArena::new(4, 4);
        let mut local = backend();
        local.init(&mut arena).unwrap();
        local.shutdown().unwrap();
        let p = arena.id(FieldName::P);
        let _ = local.zero(&mut arena, p);
    }
}
