use std::{error::Error, path::Path, time::Instant};

use clap::{value_t, App, AppSettings, Arg, ArgMatches, SubCommand};

use crate::{
    floating_type_mod::FT, write_statistics, BackendMode, FieldName, FluidSimulation, SimulationParams,
};

const CARGO_PKG_AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &'static str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &'static str = env!("CARGO_PKG_DESCRIPTION");

const COMPARED_FIELDS: [FieldName; 5] = [FieldName::R, FieldName::G, FieldName::B, FieldName::U, FieldName::V];

type CliResult = Result<(), Box<dyn Error>>;

pub fn start() {
    let simulation_config_arg = Arg::with_name("SIMULATION_CONFIG")
        .help("Sets the simulation paramaters")
        .required(true)
        .index(1);
    let ticks_arg = Arg::with_name("TICKS")
        .long("ticks")
        .short("n")
        .takes_value(true)
        .default_value("100")
        .help("Number of frames to simulate");
    let dt_arg = Arg::with_name("DT")
        .long("dt")
        .takes_value(true)
        .default_value("0.016666")
        .help("Frame time in seconds (clamped to max_dt)");
    let overwrite_arg = Arg::with_name("OVERWRITE_CONFIG_FILE")
        .long("overwrite-config-file")
        .short("c")
        .required(false)
        .takes_value(true)
        .help("Overwrite config");

    let matches = App::new("Torus Fluid")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(simulation_config_arg.clone())
                .arg(ticks_arg.clone())
                .arg(dt_arg.clone())
                .arg(overwrite_arg.clone())
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .subcommand(
            SubCommand::with_name("compare")
                .about("Run the same seeded scenario on every backend and report the differences")
                .arg(simulation_config_arg)
                .arg(ticks_arg)
                .arg(dt_arg)
                .arg(overwrite_arg),
        )
        .subcommand(
            SubCommand::with_name("write-config")
                .about("Write the default simulation config")
                .arg(
                    Arg::with_name("OUTPUT_YAML")
                        .help("YAML file where the config is written to")
                        .default_value("./fluid.yaml")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .get_matches();

    init_logging(matches.occurrences_of("v"));

    let result = if let Some(run_matches) = matches.subcommand_matches("run") {
        run(run_matches)
    } else if let Some(compare_matches) = matches.subcommand_matches("compare") {
        compare(compare_matches)
    } else if let Some(subcmd_matches) = matches.subcommand_matches("write-config") {
        write_config(subcmd_matches)
    } else {
        unreachable!()
    };

    if let Err(err) = result {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(&format!(": {}", cause));
            source = cause.source();
        }
        log::error!("{}", message);
        eprintln!("error: {}", message);
        std::process::exit(1);
    }
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_params(matches: &ArgMatches) -> Result<SimulationParams, Box<dyn Error>> {
    let parameter_file = matches
        .value_of("SIMULATION_CONFIG")
        .ok_or("missing simulation config")?;
    let simulation_params =
        SimulationParams::from_yaml_file_with_overwrite(parameter_file, matches.value_of("OVERWRITE_CONFIG_FILE"))?;
    simulation_params.validate()?;
    log::info!("{:?}", simulation_params);
    Ok(simulation_params)
}

fn run(matches: &ArgMatches) -> CliResult {
    let simulation_params = load_params(matches)?;
    let ticks = value_t!(matches, "TICKS", usize)?;
    let dt = value_t!(matches, "DT", FT)?;
    let counters_enabled = matches.is_present("STATISTICS_ENABLED");

    let mut fluid_simulation = FluidSimulation::new(simulation_params, counters_enabled)?;

    let start = Instant::now();
    for tick in 0..ticks {
        let tick_start = Instant::now();
        fluid_simulation.frame(dt)?;
        log::info!(
            "tick {} took {:.2}ms, color mass r={:.3} g={:.3} b={:.3}",
            tick,
            tick_start.elapsed().as_secs_f64() * 1000.,
            fluid_simulation.total(FieldName::R),
            fluid_simulation.total(FieldName::G),
            fluid_simulation.total(FieldName::B),
        );
    }
    println!(
        "{} ticks on the {} backend in {:.2}s",
        ticks,
        fluid_simulation.backend_mode(),
        start.elapsed().as_secs_f64()
    );

    if counters_enabled {
        let s = write_statistics(&fluid_simulation.pcounters());
        print!("{}", s);
        if let Some(statistics_path) = matches.value_of("STATISTICS_PATH") {
            std::fs::write(statistics_path, s)?;
        }
    }

    fluid_simulation.shutdown()?;
    Ok(())
}

fn compare(matches: &ArgMatches) -> CliResult {
    let base_params = load_params(matches)?;
    let ticks = value_t!(matches, "TICKS", usize)?;
    let dt = value_t!(matches, "DT", FT)?;

    let mut simulations = Vec::new();
    for mode in BackendMode::ALL {
        let params = SimulationParams {
            backend: mode,
            seed: Some(base_params.seed.unwrap_or(0)),
            ..base_params
        };
        let mut fluid_simulation = FluidSimulation::new(params, false)?;
        let start = Instant::now();
        for _ in 0..ticks {
            fluid_simulation.frame(dt)?;
        }
        println!("{:>6}: {:.2}s", mode, start.elapsed().as_secs_f64());
        fluid_simulation.shutdown()?;
        simulations.push(fluid_simulation);
    }

    let (reference, others) = simulations.split_at(1);
    for other in others {
        for (name, difference) in other.max_difference(&reference[0], &COMPARED_FIELDS) {
            println!(
                "{:>6} vs {}: max |{:?}| difference {:e}",
                other.backend_mode(),
                reference[0].backend_mode(),
                name,
                difference
            );
        }
    }
    Ok(())
}

fn write_config(matches: &ArgMatches) -> CliResult {
    let yaml_path = matches.value_of("OUTPUT_YAML").ok_or("missing output path")?;
    let yaml = SimulationParams::default().to_yaml_string()?;
    println!("Writing to file `{}`...", yaml_path);
    std::fs::write(Path::new(yaml_path), yaml)?;
    Ok(())
}
