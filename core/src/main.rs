use clap::Parser;
use log::{LevelFilter, error, info};
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mcl::config::SimulationConfig;
use mcl::{MapQuery, UpdateMode};
use mcl::sim::{build_map, run_simulation};

const LONG_ABOUT: &str = "MCL-SIM: A Monte Carlo Localization simulation tool for a car with a single forward range sensor.

This program drives a simulated car around a floor plan and localizes it with a particle filter. Each cycle the car reads the distance to the obstacle ahead, turns away when it gets too close, drives forward, and the particle filter moves, weighs and resamples its population accordingly.

The floor plan is either loaded from a plain-text file ('#' for an occupied cell, '.' or ' ' for a free one, ';' for comments) or generated as an empty bordered room. All settings can be provided through a JSON, YAML or TOML configuration file (the format is chosen by extension); command line flags override the file.

The output is a CSV file with one row per cycle: true pose, sensor reading, barycenter estimate, position error, relevance score, localization flag and effective number of particles.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = LONG_ABOUT)]
struct Cli {
    /// Plain-text map file (an empty bordered room is used when omitted)
    #[arg(short, long, value_parser)]
    map: Option<PathBuf>,
    /// Configuration file (.json, .yaml, .yml or .toml)
    #[arg(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: Option<PathBuf>,
    /// Number of particles
    #[arg(short = 'n', long)]
    particles: Option<usize>,
    /// Number of simulation cycles
    #[arg(long)]
    steps: Option<usize>,
    /// Weight update mode
    #[arg(long, value_enum)]
    mode: Option<UpdateMode>,
    /// Fraction of random particles injected on each resample, within [0, 1]
    #[arg(long)]
    randomness: Option<f64>,
    /// RNG seed (applies to both the car and the filter)
    #[arg(long)]
    seed: Option<u64>,
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
    /// Log file path (if not specified, logs to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Write the effective configuration to this file and exit
    #[arg(long, value_parser)]
    write_config: Option<PathBuf>,
}

impl Cli {
    /// Apply command line overrides on top of a configuration.
    fn apply(&self, config: &mut SimulationConfig) {
        if let Some(map) = &self.map {
            config.map.path = Some(map.clone());
        }
        if let Some(particles) = self.particles {
            config.filter.num_particles = particles;
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        if let Some(mode) = self.mode {
            config.filter.mode = mode;
        }
        if let Some(randomness) = self.randomness {
            config.filter.randomness = randomness;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
            config.filter.seed = Some(seed);
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.to_string_lossy().into_owned());
        }
    }
}

/// Route log records to stderr, or append them to `log_file`, with local timestamps.
///
/// An unknown level falls back to `info`.
fn init_logger(level: &str, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter = level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{level}', using 'info'");
        LevelFilter::Info
    });
    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter).format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SimulationConfig::from_file(path)?,
        None => SimulationConfig::default(),
    };
    cli.apply(&mut config);

    if let Some(path) = &cli.write_config {
        config.validate()?;
        config.to_file(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.as_str().to_string());
    let log_file = config.logging.file.as_ref().map(PathBuf::from);
    init_logger(&level, log_file.as_deref())?;

    let map = match build_map(&config.map) {
        Ok(map) => Rc::new(map),
        Err(e) => {
            error!("Failed to build map: {e}");
            return Err(Box::new(e));
        }
    };
    info!(
        "Map is {}x{} cells, {} free",
        map.width(),
        map.height(),
        map.free_cell_count()
    );

    let result = run_simulation(&config, map)?;
    if let Some(last) = result.last() {
        info!(
            "Final estimate ({:.1}, {:.1}) for true position ({:.1}, {:.1}), error {:.1} mm, relevance {:.2}",
            last.estimate_x, last.estimate_y, last.true_x, last.true_y, last.error_mm, last.relevance
        );
    }
    info!(
        "Localized during {:.1} % of the cycles",
        100.0 * result.localized_fraction()
    );
    if let Some(mean) = result.mean_localized_error() {
        info!("Mean error while localized: {mean:.1} mm");
    }

    match &cli.output {
        Some(path) => {
            result.to_csv(path)?;
            info!("Results written to {}", path.display());
        }
        None => info!("No output file given, results discarded"),
    }
    Ok(())
}
