//! Configuration of the filter and of offline simulations.
//!
//! Every structure can be partially specified in a file; missing fields take the defaults of the reference car
//! setup. Files are read and written as JSON, YAML or TOML depending on their extension.
//!
//! ## Example
//!
//! ```
//! use mcl::config::{FilterConfig, SimulationConfig};
//! use mcl::UpdateMode;
//!
//! let cfg = SimulationConfig {
//!     filter: FilterConfig {
//!         num_particles: 500,
//!         mode: UpdateMode::Markov,
//!         randomness: 0.05,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::particle::UpdateMode;
use crate::robot::{RobotConfig, RobotState};

fn default_num_particles() -> usize {
    100
}
fn default_seed() -> u64 {
    42
}

/// Particle filter settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Population size `N`
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    /// Heading (radians) given to particles on (re)population
    #[serde(default)]
    pub initial_heading: f64,
    /// Weight update mode of the sensing step
    #[serde(default)]
    pub mode: UpdateMode,
    /// Fraction in [0, 1] of the population replaced by random particles on each resample
    #[serde(default)]
    pub randomness: f64,
    /// Seed of the filter's random number generator. Random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: default_num_particles(),
            initial_heading: 0.0,
            mode: UpdateMode::default(),
            randomness: 0.0,
            seed: None,
        }
    }
}
impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfig(
                "the filter needs at least one particle".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.randomness) {
            return Err(FilterError::InvalidConfig(format!(
                "randomness must be within [0, 1], got {}",
                self.randomness
            )));
        }
        if !self.initial_heading.is_finite() {
            return Err(FilterError::InvalidConfig(
                "initial heading must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_pixels_per_mm() -> f64 {
    1.0
}

/// Where the floor plan comes from and how it relates to the physical world
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Plain-text map file. A bordered empty room is generated when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Size of the generated room (cells) when no file is given
    #[serde(default = "default_room_size")]
    pub width: usize,
    #[serde(default = "default_room_size")]
    pub height: usize,
    /// Spatial units per millimeter
    #[serde(default = "default_pixels_per_mm")]
    pub pixels_per_mm: f64,
    /// North angle of the map (degrees)
    #[serde(default)]
    pub north_angle_deg: f64,
}
fn default_room_size() -> usize {
    500
}
impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            path: None,
            width: default_room_size(),
            height: default_room_size(),
            pixels_per_mm: default_pixels_per_mm(),
            north_angle_deg: 0.0,
        }
    }
}

/// Log verbosity, mirroring `log::LevelFilter`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}
impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Log file; logs go to stderr when absent
    #[serde(default)]
    pub file: Option<String>,
}

fn default_steps() -> usize {
    300
}
fn default_step_distance() -> f64 {
    20.0
}
fn default_resample_every() -> usize {
    1
}
fn default_danger_distance() -> f64 {
    300.0
}
fn default_turn_angle() -> f64 {
    90.0
}

/// Closed-loop simulation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of motion/sensing cycles
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Distance driven per cycle (mm)
    #[serde(default = "default_step_distance")]
    pub step_distance_mm: f64,
    /// Resample every this many cycles (the weights are normalized on the others)
    #[serde(default = "default_resample_every")]
    pub resample_every: usize,
    /// Below this sensor reading (mm) the car turns away from the obstacle
    #[serde(default = "default_danger_distance")]
    pub danger_distance_mm: f64,
    /// Angle (degrees) the car turns by when in danger
    #[serde(default = "default_turn_angle")]
    pub turn_angle_deg: f64,
    /// Start pose of the car (map units and radians); random free cell when absent
    #[serde(default)]
    pub start: Option<(f64, f64, f64)>,
    /// Seed of the simulated car's noise
    #[serde(default = "default_seed")]
    pub seed: u64,
    // Tables last so that the TOML form stays valid.
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub robot: RobotConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            map: MapConfig::default(),
            robot: RobotConfig::default(),
            filter: FilterConfig::default(),
            steps: default_steps(),
            step_distance_mm: default_step_distance(),
            resample_every: default_resample_every(),
            danger_distance_mm: default_danger_distance(),
            turn_angle_deg: default_turn_angle(),
            start: None,
            seed: default_seed(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.robot.validate()?;
        if self.resample_every == 0 {
            return Err(FilterError::InvalidConfig(
                "resample_every must be at least 1".to_string(),
            ));
        }
        if !(self.map.pixels_per_mm > 0.0) {
            return Err(FilterError::InvalidConfig(format!(
                "map scale must be positive, got {}",
                self.map.pixels_per_mm
            )));
        }
        Ok(())
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(serialization_error)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(serialization_error)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let s = serde_yaml::to_string(self).map_err(serialization_error)?;
        write_string(path, &s)
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(serialization_error)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let s = toml::to_string(self).map_err(serialization_error)?;
        write_string(path, &s)
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        from_toml_file(path)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
}

fn serialization_error<E: std::fmt::Display>(e: E) -> FilterError {
    FilterError::Serialization(e.to_string())
}
fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
fn unsupported_extension(path: &Path) -> FilterError {
    FilterError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported file extension: {}", path.display()),
    ))
}
fn write_string<P: AsRef<Path>>(path: P, s: &str) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(s.as_bytes())?;
    Ok(())
}
fn from_toml_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let mut s = String::new();
    let mut file = File::open(path)?;
    file.read_to_string(&mut s)?;
    toml::from_str(&s).map_err(serialization_error)
}
