/*

Notes:
    Stam 2003 "Real-Time Fluid Dynamics for Games" (GDC03) for the solver layout.
    dt is scaled by SimulationParams::dt_scale before every step, the frame loop clamps it first.

    Shared backend: one JACOBI command per solve, workers meet at the barrier between rounds.
    RPC backend: halo = iterations - 1, shard scratch buffers are power-of-two sized and
    addressed in global coordinates.

*/

fn main() {
    torus_fluid::start();
}
