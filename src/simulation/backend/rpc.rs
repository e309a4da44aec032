//! Message passing backend: one worker thread per shard.
//!
//! Grids travel inside the messages. While a request is in flight its buffers
//! are owned by the worker and are missing from the caller's arena; the reply
//! hands them back.

use super::{
    assert_alive, calc_div_in_place, subtract_pressure_in_place, velocity_view, zero_in_place, BackendConfig,
    BackendMode, ExecutionBackendTrait,
};
use crate::{
    error::{SolverError, SolverResult},
    fluid::{BufferId, GridArena},
    floating_type_mod::FT,
    grid::{Field, Grid},
    kernels::{advect, jacobi, jacobi_region, JacobiParams, Rect},
    sharding::TorusShardingPolicy,
    statistics::PerformanceCounters,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use std::{
    collections::HashMap,
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// uid 0 marks requests without a reply.
const NO_REPLY: u64 = 0;

/// How long to block on replies before checking that the awaited workers still run.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

enum Request {
    Init { uid: u64, width: usize, height: usize },
    UpdateVelocity { u: Grid, v: Grid },
    Advect { uid: u64, inp: Grid, out: Grid, scale: FT },
    Jacobi { uid: u64, inp: Grid, out: Grid, params: JacobiParams },
    ShardedJacobi { uid: u64, inp: Grid, out: Grid, params: JacobiParams, rect: Rect },
    Quit,
}

struct Reply {
    worker: usize,
    uid: u64,
    // compute time on the worker
    elapsed: Duration,
    buffers: Option<(Grid, Grid)>,
}

enum Pending {
    Init,
    Buffers { inp: BufferId, out: BufferId },
    Shard { shard: usize, out: BufferId, sent: Instant },
}

struct WorkerHandle {
    sender: Sender<Request>,
    pending: HashMap<u64, Pending>,
    thread: Option<JoinHandle<()>>,
}

fn scratch_like<'a>(slot: &'a mut Option<Grid>, like: &Grid) -> &'a mut Grid {
    if slot
        .as_ref()
        .map_or(false, |g| g.width() != like.width() || g.height() != like.height())
    {
        *slot = None;
    }
    slot.get_or_insert_with(|| Grid::new(like.width(), like.height()))
}

fn worker_main(index: usize, requests: Receiver<Request>, replies: Sender<Reply>) {
    log::debug!("rpc worker {} started", index);

    let mut velocity: Option<(Grid, Grid)> = None;
    let mut fb: Option<Grid> = None;

    for request in requests.iter() {
        let start = Instant::now();
        let (uid, buffers) = match request {
            Request::Init { uid, width, height } => {
                fb = Some(Grid::new(width, height));
                (uid, None)
            }
            Request::UpdateVelocity { u, v } => {
                velocity = Some((u, v));
                continue;
            }
            Request::Advect { uid, inp, mut out, scale } => match &velocity {
                Some((u, v)) => {
                    advect(&inp, &mut out, u, v, scale);
                    (uid, Some((inp, out)))
                }
                None => {
                    log::error!("rpc worker {} got advect request {} without a velocity field", index, uid);
                    (uid, Some((inp, out)))
                }
            },
            Request::Jacobi { uid, inp, mut out, params } => {
                jacobi(&inp, scratch_like(&mut fb, &inp), &mut out, params);
                (uid, Some((inp, out)))
            }
            Request::ShardedJacobi {
                uid,
                inp,
                mut out,
                params,
                rect,
            } => {
                jacobi_region(&inp, scratch_like(&mut fb, &inp), &mut out, params, rect);
                (uid, Some((inp, out)))
            }
            Request::Quit => break,
        };

        let reply = Reply {
            worker: index,
            uid,
            elapsed: start.elapsed(),
            buffers,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }

    log::debug!("rpc worker {} stopped", index);
}

pub struct RpcBackend {
    width: usize,
    height: usize,
    shards: usize,
    workers: Vec<WorkerHandle>,
    replies: Receiver<Reply>,
    next_uid: u64,
    policy: Option<TorusShardingPolicy>,
    // per shard (input, output) scratch, reused across solves
    shard_buffers: Vec<Option<(Grid, Grid)>>,
    velocity: Option<(BufferId, BufferId)>,
    pcounters: PerformanceCounters,
    alive: bool,
}

impl RpcBackend {
    pub fn new(config: BackendConfig, counters_enabled: bool) -> SolverResult<RpcBackend> {
        let (reply_sender, replies) = unbounded();
        RpcBackend::with_reply_channel(config, counters_enabled, reply_sender, replies)
    }

    /// Workers answer through `reply_sender`, which is dropped once all of
    /// them hold a clone.
    fn with_reply_channel(
        config: BackendConfig,
        counters_enabled: bool,
        reply_sender: Sender<Reply>,
        replies: Receiver<Reply>,
    ) -> SolverResult<RpcBackend> {
        let mut workers = Vec::with_capacity(config.shards);
        for index in 0..config.shards {
            let (sender, requests) = unbounded();
            let worker_replies = reply_sender.clone();
            let thread = std::thread::Builder::new()
                .name(format!("rpc-worker-{}", index))
                .spawn(move || worker_main(index, requests, worker_replies))
                .map_err(|source| SolverError::WorkerSpawn { worker: index, source })?;
            workers.push(WorkerHandle {
                sender,
                pending: HashMap::new(),
                thread: Some(thread),
            });
        }

        drop(reply_sender);

        Ok(RpcBackend {
            width: config.width,
            height: config.height,
            shards: config.shards,
            workers,
            replies,
            next_uid: NO_REPLY,
            policy: None,
            shard_buffers: (0..config.shards).map(|_| None).collect(),
            velocity: None,
            pcounters: PerformanceCounters::new(counters_enabled),
            alive: true,
        })
    }

    /// Sends `build(uid)` to `worker`. With `pending == None` no reply is
    /// expected and the uid is 0. If the worker is gone the pending entry is
    /// retired again and the undelivered request comes back.
    fn send(
        &mut self,
        worker: usize,
        pending: Option<Pending>,
        build: impl FnOnce(u64) -> Request,
    ) -> Result<(), Box<Request>> {
        let uid = match pending {
            Some(pending) => {
                self.next_uid += 1;
                self.workers[worker].pending.insert(self.next_uid, pending);
                self.next_uid
            }
            None => NO_REPLY,
        };
        match self.workers[worker].sender.send(build(uid)) {
            Ok(()) => Ok(()),
            Err(SendError(request)) => {
                self.workers[worker].pending.remove(&uid);
                Err(Box::new(request))
            }
        }
    }

    /// Sends a request that carries `inp` and `out` and waits for them to come
    /// back. Undelivered grids go straight back into the arena.
    fn round_trip(
        &mut self,
        arena: &mut GridArena,
        inp: BufferId,
        out: BufferId,
        build: impl FnOnce(u64, Grid, Grid) -> Request,
    ) -> SolverResult<()> {
        let inp_grid = arena.take(inp);
        let out_grid = arena.take(out);
        let sent = self.send(0, Some(Pending::Buffers { inp, out }), |uid| build(uid, inp_grid, out_grid));
        if let Err(request) = sent {
            if let Request::Advect {
                inp: inp_grid,
                out: out_grid,
                ..
            }
            | Request::Jacobi {
                inp: inp_grid,
                out: out_grid,
                ..
            } = *request
            {
                arena.restore(inp, inp_grid);
                arena.restore(out, out_grid);
            }
            return Err(SolverError::WorkerDisconnected { worker: 0 });
        }
        self.drain(arena)
    }

    fn in_flight(&self) -> usize {
        self.workers.iter().map(|w| w.pending.len()).sum()
    }

    /// First worker that still owes a reply but is no longer running.
    fn lost_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| !w.pending.is_empty() && w.thread.as_ref().map_or(true, |t| t.is_finished()))
    }

    /// Next reply that belongs to a pending request. Replies nobody waits for
    /// are logged and dropped.
    fn receive(&mut self) -> SolverResult<(Pending, Reply)> {
        loop {
            let reply = match self.replies.recv_timeout(LIVENESS_POLL) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => match self.lost_worker() {
                    Some(worker) => return Err(SolverError::WorkerDisconnected { worker }),
                    None => continue,
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SolverError::WorkerDisconnected {
                        worker: self.lost_worker().unwrap_or(0),
                    })
                }
            };

            let pending = self
                .workers
                .get_mut(reply.worker)
                .and_then(|w| w.pending.remove(&reply.uid));
            match pending {
                Some(pending) => return Ok((pending, reply)),
                None => log::error!(
                    "dropping reply from worker {} for unknown request {}",
                    reply.worker,
                    reply.uid
                ),
            }
        }
    }

    /// Forgets every in-flight request after a transport failure. Buffers that
    /// went down with a lost request come back zeroed so the arena stays usable.
    fn abandon_pending(&mut self, arena: &mut GridArena) {
        for (index, worker) in self.workers.iter_mut().enumerate() {
            for (uid, pending) in worker.pending.drain() {
                log::warn!("abandoning request {} on rpc worker {}", uid, index);
                if let Pending::Buffers { inp, out } = pending {
                    for id in [inp, out] {
                        if arena.is_in_flight(id) {
                            arena.restore(id, Grid::new(arena.width(), arena.height()));
                        }
                    }
                }
            }
        }
    }

    /// Blocks until every in-flight request is answered and its buffers are
    /// back where they belong.
    fn drain(&mut self, arena: &mut GridArena) -> SolverResult<()> {
        while self.in_flight() > 0 {
            let (pending, reply) = match self.receive() {
                Ok(received) => received,
                Err(err) => {
                    self.abandon_pending(arena);
                    return Err(err);
                }
            };
            match (pending, reply.buffers) {
                (Pending::Init, _) => {}
                (Pending::Buffers { inp, out }, Some((inp_grid, out_grid))) => {
                    arena.restore(inp, inp_grid);
                    arena.restore(out, out_grid);
                }
                (Pending::Shard { shard, out, sent }, Some((inp_grid, out_grid))) => {
                    self.pcounters.add_duration("shard-jacobi-outside", sent.elapsed());
                    self.pcounters.add_duration("shard-jacobi-inside", reply.elapsed);
                    if let Some(policy) = &self.policy {
                        policy.gather_shard_output(shard, &out_grid, arena.get_mut(out));
                    }
                    self.shard_buffers[shard] = Some((inp_grid, out_grid));
                }
                (_, None) => log::error!(
                    "worker {} answered request {} without returning its buffers",
                    reply.worker,
                    reply.uid
                ),
            }
        }
        Ok(())
    }

    /// The halo depends on the iteration count, so the policy follows it.
    fn policy_for(&mut self, params: JacobiParams) -> SolverResult<TorusShardingPolicy> {
        let horizon = params.horizon();
        if let Some(policy) = self.policy.as_ref().filter(|p| p.horizon == horizon) {
            return Ok(policy.clone());
        }

        let policy = TorusShardingPolicy::new(self.width, self.height, horizon, self.shards)?;
        log::debug!(
            "sharding {}x{} into {}x{} shards of {}x{} (buffer {}x{}), compute ratio {:.3}",
            self.width,
            self.height,
            policy.grid_w,
            policy.grid_h,
            policy.shard_w,
            policy.shard_h,
            policy.buffer_w,
            policy.buffer_h,
            policy.compute_ratio
        );
        self.shard_buffers.iter_mut().for_each(|b| *b = None);
        self.policy = Some(policy.clone());
        Ok(policy)
    }

    fn sharded_jacobi(
        &mut self,
        arena: &mut GridArena,
        inp: BufferId,
        out: BufferId,
        params: JacobiParams,
    ) -> SolverResult<()> {
        let policy = self.policy_for(params)?;
        self.pcounters.add_value("compute-ratio", policy.compute_ratio as FT);

        for shard in 0..policy.shards {
            let (mut shard_inp, shard_out) = match self.shard_buffers[shard].take() {
                Some(buffers) if policy.fits_scratch(&buffers.0) => buffers,
                _ => (policy.scratch_grid(), policy.scratch_grid()),
            };
            policy.scatter_shard_input(shard, arena.get(inp), &mut shard_inp);

            let rect = policy.buffer_rect(shard);
            let pending = Pending::Shard {
                shard,
                out,
                sent: Instant::now(),
            };
            let sent = self.send(shard, Some(pending), |uid| Request::ShardedJacobi {
                uid,
                inp: shard_inp,
                out: shard_out,
                params,
                rect,
            });
            if let Err(request) = sent {
                // shards already out are not gathered; their late replies are dropped
                self.abandon_pending(arena);
                if let Request::ShardedJacobi { inp, out, .. } = *request {
                    self.shard_buffers[shard] = Some((inp, out));
                }
                return Err(SolverError::WorkerDisconnected { worker: shard });
            }
        }

        self.drain(arena)
    }
}

impl ExecutionBackendTrait for RpcBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Worker
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn init(&mut self, arena: &mut GridArena) -> SolverResult<()> {
        assert_alive(self.alive, "init");
        let (width, height) = (self.width, self.height);
        for worker in 0..self.workers.len() {
            if self
                .send(worker, Some(Pending::Init), |uid| Request::Init { uid, width, height })
                .is_err()
            {
                self.abandon_pending(arena);
                return Err(SolverError::WorkerDisconnected { worker });
            }
        }
        self.drain(arena)
    }

    fn update_velocity(&mut self, arena: &GridArena, u: BufferId, v: BufferId) -> SolverResult<()> {
        assert_alive(self.alive, "update_velocity");
        self.velocity = Some((u, v));
        // only worker 0 advects
        let (u, v) = (arena.get(u).clone(), arena.get(v).clone());
        self.send(0, None, |_| Request::UpdateVelocity { u, v })
            .map_err(|_| SolverError::WorkerDisconnected { worker: 0 })
    }

    fn advect(&mut self, arena: &mut GridArena, inp: BufferId, out: BufferId, scale: FT) -> SolverResult<()> {
        assert_alive(self.alive, "advect");
        velocity_view(self.velocity, "advect");
        assert!(inp != out, "advect input and output must be different buffers");

        self.round_trip(arena, inp, out, |uid, inp, out| Request::Advect { uid, inp, out, scale })
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

        if self.shards > 1 {
            return self.sharded_jacobi(arena, inp, out, params);
        }

        self.round_trip(arena, inp, out, |uid, inp, out| Request::Jacobi { uid, inp, out, params })
    }

    fn zero(&mut self, arena: &mut GridArena, buf: BufferId) -> SolverResult<()> {
        assert_alive(self.alive, "zero");
        zero_in_place(arena, buf);
        Ok(())
    }

    fn shutdown(&mut self) -> SolverResult<()> {
        assert_alive(self.alive, "shutdown");
        self.alive = false;

        let abandoned = self.in_flight();
        if abandoned > 0 {
            log::warn!("abandoning {} in-flight requests", abandoned);
        }

        for (index, worker) in self.workers.iter_mut().enumerate() {
            worker.pending.clear();
            if worker.sender.send(Request::Quit).is_err() {
                log::warn!("rpc worker {} was already gone", index);
            }
        }
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("rpc worker {} panicked", index);
                }
            }
        }

        log::info!("worker backend with {} workers shut down", self.workers.len());
        Ok(())
    }

    fn pcounters(&self) -> Option<&PerformanceCounters> {
        Some(&self.pcounters)
    }
}

impl Drop for RpcBackend {
    fn drop(&mut self) {
        if self.alive {
            let _ = self.shutdown();
        }
    }
}
