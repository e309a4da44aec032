use torus_fluid::{
    statistics::assert_ft_approx_eq, vec2f, BackendConfig, BackendMode, ExecutionBackend, ExecutionBackendTrait,
    FieldName, FluidSimulation, GridArena, JacobiParams, SimulationParams,
};

fn scenario(mode: BackendMode) -> FluidSimulation {
    let params = SimulationParams {
        width: 64,
        height: 32,
        shards: 4,
        backend: mode,
        initial_splats: 4,
        seed: Some(42),
        ..SimulationParams::default()
    };
    let mut fluid_simulation = FluidSimulation::new(params, false).unwrap();
    fluid_simulation
        .stroke(vec2f(10., 10.), vec2f(30., 20.), 0.05)
        .unwrap();
    for _ in 0..4 {
        fluid_simulation.frame(0.02).unwrap();
    }
    fluid_simulation
}

#[test]
fn all_backends_produce_the_same_fluid() {
    let local = scenario(BackendMode::Local);
    assert!(local.field(FieldName::U).data().iter().any(|u| *u != 0.));

    for mode in [BackendMode::Worker, BackendMode::Shared] {
        let other = scenario(mode);
        assert_eq!(other.backend_mode(), mode);
        for name in [FieldName::R, FieldName::G, FieldName::B, FieldName::U, FieldName::V, FieldName::P] {
            for (a, b) in local.field(name).data().iter().zip(other.field(name).data()) {
                assert_ft_approx_eq(*a, *b, 1e-5, || format!("{:?} on {}", name, mode));
            }
        }
    }
}

#[test]
fn backends_agree_with_a_single_shard() {
    let build = |mode| {
        let params = SimulationParams {
            width: 32,
            height: 32,
            shards: 1,
            backend: mode,
            seed: Some(7),
            ..SimulationParams::default()
        };
        let mut fluid_simulation = FluidSimulation::new(params, false).unwrap();
        fluid_simulation.frame(0.05).unwrap();
        fluid_simulation
    };

    let local = build(BackendMode::Local);
    for mode in [BackendMode::Worker, BackendMode::Shared] {
        let other = build(mode);
        for (name, difference) in other.max_difference(&local, &[FieldName::R, FieldName::U, FieldName::V]) {
            assert!(difference <= 1e-5, "{:?} differs by {} on {}", name, difference, mode);
        }
    }
}

fn backend(mode: BackendMode) -> (ExecutionBackend, GridArena) {
    let config = BackendConfig {
        width: 16,
        height: 16,
        shards: 2,
        mode,
    };
    let mut arena = GridArena::new(16, 16);
    let mut backend = ExecutionBackend::new(config, false).unwrap();
    backend.init(&mut arena).unwrap();
    (backend, arena)
}

#[test]
#[should_panic(expected = "after shutdown")]
fn local_use_after_shutdown_panics() {
    let (mut backend, mut arena) = backend(BackendMode::Local);
    backend.shutdown().unwrap();
    let (div, p) = (arena.id(FieldName::Div), arena.id(FieldName::P));
    let _ = backend.jacobi(&mut arena, div, p, JacobiParams::new(-1., 0.25, 2).unwrap());
}

#[test]
#[should_panic(expected = "after shutdown")]
fn worker_use_after_shutdown_panics() {
    let (mut backend, mut arena) = backend(BackendMode::Worker);
    backend.shutdown().unwrap();
    let p = arena.id(FieldName::P);
    let _ = backend.zero(&mut arena, p);
}

#[test]
#[should_panic(expected = "after shutdown")]
fn shared_use_after_shutdown_panics() {
    let (mut backend, mut arena) = backend(BackendMode::Shared);
    backend.shutdown().unwrap();
    let div = arena.id(FieldName::Div);
    let _ = backend.calc_div(&mut arena, div, 0.5);
}

#[test]
#[should_panic(expected = "after shutdown")]
fn simulation_after_shutdown_panics() {
    let mut fluid_simulation = FluidSimulation::new(
        SimulationParams {
            width: 32,
            height: 32,
            shards: 2,
            backend: BackendMode::Shared,
            seed: Some(1),
            ..SimulationParams::default()
        },
        false,
    )
    .unwrap();
    fluid_simulation.shutdown().unwrap();
    let _ = fluid_simulation.frame(0.02);
}
