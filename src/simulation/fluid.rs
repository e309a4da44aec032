//! Simulation state and the fluid step.

use crate::{
    backend::{BackendMode, ExecutionBackend, ExecutionBackendTrait},
    error::SolverResult,
    floating_type_mod::FT,
    grid::{Field, Grid},
    kernels::JacobiParams,
    perturbation::{self, Splat},
    simulation_parameters::SimulationParams,
    statistics::PerformanceCounters,
    V2,
};
use rand::{rngs::StdRng, SeedableRng};

/// Named slots of the simulation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    R,
    G,
    B,
    U,
    V,
    P,
    Div,
    Temp0,
    Temp1,
}

impl FieldName {
    pub const COUNT: usize = 9;

    pub const ALL: [FieldName; FieldName::COUNT] = [
        FieldName::R,
        FieldName::G,
        FieldName::B,
        FieldName::U,
        FieldName::V,
        FieldName::P,
        FieldName::Div,
        FieldName::Temp0,
        FieldName::Temp1,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Index of a buffer inside a [`GridArena`]. Stays valid across slot swaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Owns all grids of one simulation.
///
/// Named slots point at buffers; swapping two slots exchanges indices and
/// never copies grid data. A buffer can be taken out while an operation owns
/// it, e.g. while it travels to a worker, and must be restored afterwards.
/// Touching a buffer that is out is a bug and panics.
#[derive(Debug, Clone)]
pub struct GridArena {
    width: usize,
    height: usize,
    buffers: Vec<Option<Grid>>,
    slots: [BufferId; FieldName::COUNT],
}

impl GridArena {
    pub fn new(width: usize, height: usize) -> GridArena {
        let mut slots = [BufferId(0); FieldName::COUNT];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = BufferId(i);
        }
        GridArena {
            width,
            height,
            buffers: (0..FieldName::COUNT).map(|_| Some(Grid::new(width, height))).collect(),
            slots,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn id(&self, name: FieldName) -> BufferId {
        self.slots[name.slot()]
    }

    pub fn get(&self, id: BufferId) -> &Grid {
        match &self.buffers[id.0] {
            Some(grid) => grid,
            None => panic!("buffer {:?} is in flight", id),
        }
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut Grid {
        match &mut self.buffers[id.0] {
            Some(grid) => grid,
            None => panic!("buffer {:?} is in flight", id),
        }
    }

    pub fn field(&self, name: FieldName) -> &Grid {
        self.get(self.id(name))
    }

    pub fn field_mut(&mut self, name: FieldName) -> &mut Grid {
        self.get_mut(self.id(name))
    }

    /// Takes ownership of a buffer until [`GridArena::restore`] is called.
    pub fn take(&mut self, id: BufferId) -> Grid {
        match self.buffers[id.0].take() {
            Some(grid) => grid,
            None => panic!("buffer {:?} is already in flight", id),
        }
    }

    pub fn restore(&mut self, id: BufferId, grid: Grid) {
        assert!(self.buffers[id.0].is_none(), "buffer {:?} was never taken", id);
        assert_eq!(
            (grid.width(), grid.height()),
            (self.width, self.height),
            "restored buffer has the wrong size"
        );
        self.buffers[id.0] = Some(grid);
    }

    pub fn is_in_flight(&self, id: BufferId) -> bool {
        self.buffers[id.0].is_none()
    }

    pub fn swap(&mut self, a: FieldName, b: FieldName) {
        self.slots.swap(a.slot(), b.slot());
    }
}

/// One fluid on one backend.
pub struct FluidSimulation {
    params: SimulationParams,
    arena: GridArena,
    backend: ExecutionBackend,
    rng: StdRng,
    splat_phase: FT,
    steps: usize,
    pcounters: PerformanceCounters,
}

impl FluidSimulation {
    pub fn new(params: SimulationParams, counters_enabled: bool) -> SolverResult<FluidSimulation> {
        params.validate()?;

        let mut arena = GridArena::new(params.width, params.height);
        let mut backend = ExecutionBackend::new(params.backend_config(), counters_enabled)?;
        backend.init(&mut arena)?;

        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut fluid_simulation = FluidSimulation {
            params,
            arena,
            backend,
            rng,
            splat_phase: 0.,
            steps: 0,
            pcounters: PerformanceCounters::new(counters_enabled),
        };
        fluid_simulation.init_state()?;
        Ok(fluid_simulation)
    }

    /// Uniform grey, still fluid, then `initial_splats` random splats.
    fn init_state(&mut self) -> SolverResult<()> {
        for name in [FieldName::R, FieldName::G, FieldName::B] {
            self.arena.field_mut(name).fill(0.5);
        }
        for _ in 0..self.params.initial_splats {
            self.splat();
        }
        self.update_velocity()
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn arena(&self) -> &GridArena {
        &self.arena
    }

    pub fn field(&self, name: FieldName) -> &Grid {
        self.arena.field(name)
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.backend.mode()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Frame loop entry: clamps `dt` (seconds), drops in random splats and
    /// advances the fluid.
    pub fn frame(&mut self, dt: FT) -> SolverResult<()> {
        let dt = dt.max(0.).min(self.params.max_dt);
        if self.params.auto_splat {
            self.auto_splat(dt);
        }
        self.step(dt)
    }

    /// One splat per whole second of accumulated time.
    pub fn auto_splat(&mut self, dt: FT) {
        self.splat_phase += dt;
        while self.splat_phase >= 1. {
            self.splat();
            self.splat_phase -= 1.;
        }
    }

    pub fn splat(&mut self) {
        let splat = Splat::random(&mut self.rng, self.params.width, self.params.height);
        self.apply_splat(&splat);
    }

    pub fn apply_splat(&mut self, splat: &Splat) {
        let (r, g, b) = (FieldName::R, FieldName::G, FieldName::B);
        let mut r_grid = self.arena.take(self.arena.id(r));
        let mut g_grid = self.arena.take(self.arena.id(g));
        splat.apply(&mut r_grid, &mut g_grid, self.arena.field_mut(b));
        self.arena.restore(self.arena.id(r), r_grid);
        self.arena.restore(self.arena.id(g), g_grid);
    }

    /// Drag from `from` to `to` (in cells) over `dt` seconds.
    pub fn stroke(&mut self, from: V2, to: V2, dt: FT) -> SolverResult<()> {
        let u = self.arena.id(FieldName::U);
        let mut u_grid = self.arena.take(u);
        perturbation::stroke(&mut u_grid, self.arena.field_mut(FieldName::V), from, to, dt, self.params.dx);
        self.arena.restore(u, u_grid);
        self.update_velocity()
    }

    pub fn step(&mut self, dt: FT) -> SolverResult<()> {
        if dt == 0. {
            return Ok(());
        }
        let dt = dt * self.params.dt_scale;

        self.pcounters.begin("simulation-step");

        self.advect_color(dt)?;

        if self.params.diffuse != 0. {
            self.pcounters.begin("jacobi");
            self.diffuse(FieldName::U, FieldName::Temp0, dt)?;
            self.diffuse(FieldName::V, FieldName::Temp1, dt)?;
            self.pcounters.end("jacobi");

            self.swap_velocity()?;
            self.project()?;
        }

        self.pcounters.begin("advect");
        let (u, v) = (self.arena.id(FieldName::U), self.arena.id(FieldName::V));
        let (t0, t1) = (self.arena.id(FieldName::Temp0), self.arena.id(FieldName::Temp1));
        self.backend.advect(&mut self.arena, u, t0, dt)?;
        self.backend.advect(&mut self.arena, v, t1, dt)?;
        self.pcounters.end("advect");

        self.swap_velocity()?;
        self.project()?;

        self.pcounters.end("simulation-step");
        self.steps += 1;
        Ok(())
    }

    fn advect_color(&mut self, dt: FT) -> SolverResult<()> {
        self.pcounters.begin("advect");
        for name in [FieldName::R, FieldName::G, FieldName::B] {
            let (inp, out) = (self.arena.id(name), self.arena.id(FieldName::Temp0));
            self.backend.advect(&mut self.arena, inp, out, dt)?;
            self.arena.swap(name, FieldName::Temp0);
        }
        self.pcounters.end("advect");
        Ok(())
    }

    fn diffuse(&mut self, inp: FieldName, out: FieldName, dt: FT) -> SolverResult<()> {
        let dx = self.params.dx;
        let a = dx * dx / (dt * self.params.diffuse);
        let retained = (1. - self.params.drag).powf(dt);
        let params = JacobiParams::new(a, retained / (4. + a), self.params.diffusion_iterations)?;

        let (inp, out) = (self.arena.id(inp), self.arena.id(out));
        self.backend.jacobi(&mut self.arena, inp, out, params)
    }

    /// Makes the freshly written temporaries the velocity field.
    fn swap_velocity(&mut self) -> SolverResult<()> {
        self.arena.swap(FieldName::U, FieldName::Temp0);
        self.arena.swap(FieldName::V, FieldName::Temp1);
        self.update_velocity()
    }

    fn update_velocity(&mut self) -> SolverResult<()> {
        self.pcounters.begin("copy");
        let (u, v) = (self.arena.id(FieldName::U), self.arena.id(FieldName::V));
        self.backend.update_velocity(&self.arena, u, v)?;
        self.pcounters.end("copy");
        Ok(())
    }

    /// Removes the divergent part of the velocity field.
    fn project(&mut self) -> SolverResult<()> {
        let scale = 0.5;
        let (div, p) = (self.arena.id(FieldName::Div), self.arena.id(FieldName::P));
        let (u, v) = (self.arena.id(FieldName::U), self.arena.id(FieldName::V));

        self.backend.calc_div(&mut self.arena, div, scale)?;
        self.backend.zero(&mut self.arena, p)?;

        self.pcounters.begin("jacobi");
        let params = JacobiParams::new(-1., 0.25, self.params.pressure_iterations)?;
        self.backend.jacobi(&mut self.arena, div, p, params)?;
        self.pcounters.end("jacobi");

        self.backend.subtract_pressure(&mut self.arena, p, u, v, scale)?;
        self.update_velocity()
    }

    /// Drops the current state and backend and starts over with `params`.
    pub fn reconfigure(&mut self, params: SimulationParams) -> SolverResult<()> {
        let next = FluidSimulation::new(params, self.pcounters.enabled())?;
        if self.backend.is_alive() {
            self.backend.shutdown()?;
        }
        *self = next;
        Ok(())
    }

    pub fn shutdown(&mut self) -> SolverResult<()> {
        self.backend.shutdown()
    }

    /// Pipeline timings together with whatever the backend recorded.
    pub fn pcounters(&self) -> PerformanceCounters {
        let mut pcounters = self.pcounters.clone();
        if let Some(backend_counters) = self.backend.pcounters() {
            pcounters.merge(backend_counters);
        }
        pcounters
    }

    /// Largest absolute cell difference per field, e.g. between two backends.
    pub fn max_difference(&self, other: &FluidSimulation, names: &[FieldName]) -> Vec<(FieldName, FT)> {
        names
            .iter()
            .map(|name| (*name, self.field(*name).max_abs_diff(other.field(*name))))
            .collect()
    }

    /// Sum over all cells of a field.
    pub fn total(&self, name: FieldName) -> f64 {
        self.field(name).data().iter().map(|v| *v as f64).sum()
    }
}
