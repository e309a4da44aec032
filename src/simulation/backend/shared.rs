//! Shared-memory backend.
//!
//! The Jacobi buffers live in one region that the main thread and all workers
//! can see. A solve costs one command round trip; the rounds inside it are
//! synchronized worker to worker through the barrier.

use super::{
    advect_in_place, assert_alive, calc_div_in_place, subtract_pressure_in_place, velocity_view, zero_in_place,
    BackendConfig, BackendMode, ExecutionBackendTrait,
};
use crate::{
    error::{SolverError, SolverResult},
    fluid::{BufferId, GridArena},
    floating_type_mod::FT,
    grid::FieldMut,
    kernels::{jacobi_region_with, JacobiParams},
    shared_memory::{ControlBlock, SharedGrid, WorkerCommand},
    sharding::TorusShardingPolicy,
};
use std::{sync::Arc, thread::JoinHandle};

struct SharedRegion {
    control: ControlBlock,
    source: SharedGrid,
    feedback: SharedGrid,
    result: SharedGrid,
    // horizon 0: shards exchange data through the shared grids every round
    policy: TorusShardingPolicy,
}

fn worker_main(index: usize, region: Arc<SharedRegion>) {
    log::debug!("shared worker {} started", index);
    let rect = region.policy.shard_rect(index);
    let mut epoch = 0;

    loop {
        match region.control.wait_for_command(&mut epoch) {
            WorkerCommand::Init => {
                // SAFETY: each worker only writes its own shard
                let (mut fb, mut out) = unsafe { (region.feedback.view(), region.result.view()) };
                for j in rect.y..rect.y + rect.h as i32 {
                    for i in rect.x..rect.x + rect.w as i32 {
                        fb.set(i, j, 0.);
                        out.set(i, j, 0.);
                    }
                }
            }
            WorkerCommand::Jacobi(params) => {
                // SAFETY: `source` is read only while the command runs. Each round
                // writes only this worker's shard of one buffer and reads the
                // other one, and the barrier separates consecutive rounds.
                let (source, mut fb, mut out) =
                    unsafe { (region.source.view(), region.feedback.view(), region.result.view()) };
                jacobi_region_with(&source, &mut fb, &mut out, params, rect, || {
                    region.control.barrier().wait();
                });
            }
            WorkerCommand::Quit => {
                region.control.worker_exit();
                break;
            }
        }
    }

    log::debug!("shared worker {} stopped", index);
}

pub struct SharedBackend {
    shards: usize,
    region: Arc<SharedRegion>,
    workers: Vec<JoinHandle<()>>,
    velocity: Option<(BufferId, BufferId)>,
    alive: bool,
}

impl SharedBackend {
    pub fn new(config: BackendConfig) -> SolverResult<SharedBackend> {
        SharedBackend::with_spawner(config, |index, region| {
            std::thread::Builder::new()
                .name(format!("shared-worker-{}", index))
                .spawn(move || worker_main(index, region))
        })
    }

    fn with_spawner(
        config: BackendConfig,
        mut spawn: impl FnMut(usize, Arc<SharedRegion>) -> std::io::Result<JoinHandle<()>>,
    ) -> SolverResult<SharedBackend> {
        let policy = TorusShardingPolicy::new(config.width, config.height, 0, config.shards)?;
        let region = Arc::new(SharedRegion {
            control: ControlBlock::new(config.shards as u32),
            source: SharedGrid::new(config.width, config.height),
            feedback: SharedGrid::new(config.width, config.height),
            result: SharedGrid::new(config.width, config.height),
            policy,
        });

        let mut workers = Vec::with_capacity(config.shards);
        for index in 0..config.shards {
            match spawn(index, region.clone()) {
                Ok(thread) => workers.push(thread),
                Err(source) => {
                    log::error!("could not spawn shared worker {}, stopping {} started workers", index, workers.len());
                    region.control.withdraw((config.shards - workers.len()) as u32);
                    region.control.send_command(WorkerCommand::Quit);
                    for thread in workers {
                        if thread.join().is_err() {
                            log::error!("shared worker panicked");
                        }
                    }
                    return Err(SolverError::WorkerSpawn { worker: index, source });
                }
            }
        }

        Ok(SharedBackend {
            shards: config.shards,
            region,
            workers,
            velocity: None,
            alive: true,
        })
    }
}

impl ExecutionBackendTrait for SharedBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Shared
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn init(&mut self, _arena: &mut GridArena) -> SolverResult<()> {
        assert_alive(self.alive, "init");
        self.region.control.send_command(WorkerCommand::Init);
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

        // SAFETY: outside of `send_command` all workers are parked in the fence
        unsafe { self.region.source.load_from(arena.get(inp)) };
        self.region.control.send_command(WorkerCommand::Jacobi(params));
        unsafe { self.region.result.store_into(arena.get_mut(out)) };
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

        self.region.control.send_command(WorkerCommand::Quit);
        for (index, thread) in self.workers.drain(..).enumerate() {
            if thread.join().is_err() {
                log::error!("shared worker {} panicked", index);
            }
        }

        log::info!("shared backend with {} workers shut down", self.shards);
        Ok(())
    }
}

impl Drop for SharedBackend {
    fn drop(&mut self) {
        if self.alive {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fluid::FieldName, grid::Grid, kernels::jacobi};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn config(shards: usize) -> BackendConfig {
        BackendConfig {
            width: 32,
            height: 32,
            shards,
            mode: BackendMode::Shared,
        }
    }

    #[test]
    fn jacobi_matches_single_threaded_solve() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut arena = GridArena::new(32, 32);
        for value in arena.field_mut(FieldName::Div).data_mut() {
            *value = rng.gen_range(-1.0..1.0) as FT;
        }
        let params = JacobiParams::new(-1., 0.25, 30).unwrap();

        let mut expected = Grid::new(32, 32);
        jacobi(arena.field(FieldName::Div), &mut Grid::new(32, 32), &mut expected, params);

        for shards in [1, 2, 4, 8] {
            let mut shared = SharedBackend::new(config(shards)).unwrap();
            shared.init(&mut arena).unwrap();
            let (div, p) = (arena.id(FieldName::Div), arena.id(FieldName::P));
            for _ in 0..3 {
                shared.jacobi(&mut arena, div, p, params).unwrap();
                assert_eq!(arena.field(FieldName::P), &expected, "shards={}", shards);
            }
            shared.shutdown().unwrap();
            assert_eq!(shared.region.control.counts(), (0, 0, 0));
        }
    }

    #[test]
    #[should_panic(expected = "after shutdown")]
    fn double_shutdown_panics() {
        let mut shared = SharedBackend::new(config(2)).unwrap();
        shared.shutdown().unwrap();
        let _ = shared.shutdown();
    }

    #[test]
    fn failed_spawn_stops_started_workers() {
        let mut region_handle = None;
        let result = SharedBackend::with_spawner(config(4), |index, region| {
            region_handle.get_or_insert_with(|| Arc::downgrade(&region));
            if index == 2 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads left"));
            }
            Ok(std::thread::spawn(move || worker_main(index, region)))
        });

        assert!(matches!(result, Err(SolverError::WorkerSpawn { worker: 2, .. })));
        // every started worker quit and released the region
        assert!(region_handle.unwrap().upgrade().is_none());
    }
}
