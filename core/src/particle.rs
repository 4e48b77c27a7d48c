//! Particle filter (Monte Carlo localization) engine
//!
//! The filter keeps a fixed-size population of [`Particle`]s, each one a guess of the car's pose together with an
//! importance weight. A localization cycle, driven from outside the filter, looks like:
//!
//! 1. [`ParticleFilter::set_heading`] when the car's orientation changes (commanded or measured),
//! 2. [`ParticleFilter::move_particles`] after each displacement (odometry with displacement noise),
//! 3. [`ParticleFilter::sense`] after each range reading (Gaussian likelihood of the reading),
//! 4. [`ParticleFilter::normalize`] and, periodically, [`ParticleFilter::resample`].
//!
//! Resampling uses the resampling wheel and replaces a configurable fraction of the population with fresh random
//! particles so that the filter can recover when it converged on the wrong pose. After each resample the filter
//! scores how tightly the population agrees on a position ([`ParticleFilter::relevance`]).
//!
//! # Example
//!
//! ```rust
//! use std::rc::Rc;
//! use mcl::config::FilterConfig;
//! use mcl::{GridMap, ParticleFilter, RobotConfig};
//!
//! let map = Rc::new(GridMap::new(200, 200, 1.0, 0.0).unwrap().with_border());
//! let mut pf = ParticleFilter::new_with_seed(map, RobotConfig::default(), &FilterConfig::default(), 7).unwrap();
//!
//! pf.set_heading(0.0);
//! pf.move_particles(20.0);
//! pf.sense(Some(150.0), 0.0);
//! pf.normalize();
//! pf.resample();
//! assert_eq!(pf.particles().len(), 100);
//! assert!((0.0..=1.0).contains(&pf.relevance()));
//! ```
use std::fmt::{self, Debug, Display};
use std::rc::Rc;

use log::{debug, info, warn};
use nalgebra::{Point2, distance};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::map::{MapQuery, free_cells};
use crate::robot::RobotState;
use crate::{gaussian, wrap_to_2pi, wrap_to_pi};

/// Relevance from which the localization is considered trustworthy.
pub const DECENT_RELEVANCE: f64 = 0.75;

/// How a sensing event updates particle weights
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// The weight is replaced by the likelihood of the latest reading.
    #[default]
    Simple,
    /// The weight is multiplied by the likelihood of the latest reading, accumulating evidence across cycles.
    ///
    /// Weights decay towards zero with every reading. Callers must normalize or resample periodically to keep
    /// them from underflowing.
    Markov,
}

/// One hypothesis of the car's pose
///
/// Position is in map units, heading in radians and `weight` is the (unnormalized) importance weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[x = {} y = {} angle = {} degree | proba = {}]",
            self.x,
            self.y,
            self.heading.to_degrees() as i64,
            self.weight
        )
    }
}
impl Particle {
    pub fn new(x: f64, y: f64, heading: f64, weight: f64) -> Particle {
        Particle {
            x,
            y,
            heading,
            weight,
        }
    }
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Move the particle `distance` physical units along its heading.
    ///
    /// The displacement is converted to map units with the map's scale factor and the result is snapped onto
    /// the map's grid.
    pub fn apply_displacement<M: MapQuery + ?Sized>(&mut self, distance: f64, map: &M) {
        let delta = map.displacement(distance, self.heading);
        let (x, y) = map.snap(self.x + delta.x, self.y + delta.y);
        self.x = x;
        self.y = y;
    }
    /// Euclidean distance (map units) between two particle positions.
    pub fn distance_to(&self, other: &Particle) -> f64 {
        distance(&self.position(), &other.position())
    }
    /// Rotate the particle by `delta` radians, keeping the heading in $(-\pi, \pi]$.
    pub fn turn(&mut self, delta: f64) {
        self.heading = wrap_to_pi(self.heading + delta);
    }
}

/// Zero-mean Gaussian sample; a zero or invalid deviation yields no noise.
fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    Normal::new(0.0, std_dev.abs()).map_or(0.0, |normal| normal.sample(rng))
}

/// Monte Carlo localization filter
///
/// Bound to a map (shared with whoever drives the car) and to a read-only [`RobotState`] providing the noise
/// magnitudes. The filter is single threaded and every operation runs to completion; callers serialize the
/// motion, sensing and resampling steps of a cycle.
pub struct ParticleFilter<M: MapQuery, R: RobotState> {
    particles: Vec<Particle>,
    map: Rc<M>,
    robot: R,
    num_particles: usize,
    initial_heading: f64,
    mode: UpdateMode,
    randomness: f64,
    width: usize,
    height: usize,
    /// Free cells of the bound map, used to draw random particles.
    free_cells: Vec<(usize, usize)>,
    barycenter: Option<Point2<f64>>,
    relevance: f64,
    rng: StdRng,
}
impl<M: MapQuery, R: RobotState> Debug for ParticleFilter<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleFilter")
            .field("num_particles", &self.particles.len())
            .field("mode", &self.mode)
            .field("randomness", &self.randomness)
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("barycenter", &self.barycenter.map(|b| (b.x, b.y)))
            .field("relevance", &self.relevance)
            .finish()
    }
}
impl<M: MapQuery, R: RobotState> ParticleFilter<M, R> {
    /// Create a filter bound to `map` and populate it.
    ///
    /// Uses `config.seed` when present, a random seed otherwise.
    ///
    /// # Errors
    /// [`FilterError::InvalidConfig`] for an unusable configuration or robot, [`FilterError::NoFreeCell`] when the map
    /// has nowhere to put particles.
    pub fn new(map: Rc<M>, robot: R, config: &FilterConfig) -> Result<Self> {
        let seed = config.seed.unwrap_or_else(rand::random);
        Self::new_with_seed(map, robot, config, seed)
    }
    /// Create a filter with a specific random seed. Useful for reproducible runs.
    pub fn new_with_seed(map: Rc<M>, robot: R, config: &FilterConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        robot.validate()?;
        let mut filter = ParticleFilter {
            particles: Vec::with_capacity(config.num_particles),
            width: map.width(),
            height: map.height(),
            map,
            robot,
            num_particles: config.num_particles,
            initial_heading: config.initial_heading,
            mode: config.mode,
            randomness: config.randomness,
            free_cells: Vec::new(),
            barycenter: None,
            relevance: 0.0,
            rng: StdRng::seed_from_u64(seed),
        };
        let map = Rc::clone(&filter.map);
        filter.set_map(map)?;
        Ok(filter)
    }
    /// Bind a new map, then repopulate the filter uniformly over its free cells.
    ///
    /// The previous map stays bound if the new one has no free cell.
    pub fn set_map(&mut self, map: Rc<M>) -> Result<()> {
        let (width, height) = (map.width(), map.height());
        let free_cells = free_cells(map.as_ref());
        if free_cells.is_empty() {
            return Err(FilterError::NoFreeCell { width, height });
        }
        info!(
            "Binding {}x{} map ({} free cells) to a filter of {} particles",
            width,
            height,
            free_cells.len(),
            self.num_particles
        );
        self.map = map;
        self.width = width;
        self.height = height;
        self.free_cells = free_cells;
        self.particles.clear();
        self.populate(
            self.num_particles,
            self.initial_heading,
            1.0 / self.num_particles as f64,
        );
        self.check_relevance();
        Ok(())
    }
    /// Discard every particle and repopulate from scratch, e.g. when localization is lost.
    pub fn reset(&mut self) {
        info!("Resetting particle filter");
        self.particles.clear();
        self.relevance = 0.0;
        self.barycenter = None;
        self.populate(
            self.num_particles,
            self.initial_heading,
            1.0 / self.num_particles as f64,
        );
        self.check_relevance();
    }
    /// Add `count` particles on uniformly drawn free cells, all with the given heading and weight.
    pub fn populate(&mut self, count: usize, heading: f64, weight: f64) {
        // `set_map` guarantees at least one free cell
        for _ in 0..count {
            let (x, y) = self.free_cells[self.rng.random_range(0..self.free_cells.len())];
            self.particles
                .push(Particle::new(x as f64, y as f64, heading, weight));
        }
    }
    /// Weight every particle by the likelihood of a range reading.
    ///
    /// For each particle the expected reading is the map's ray distance from the particle's position along
    /// `angle`. A missing reading (measured or expected) is replaced by the sum of the map's width and height,
    /// i.e. "no obstacle in sight". The likelihood is a Gaussian centered on the expected reading with the
    /// robot's sensor noise as standard deviation. Weights are not normalized here.
    ///
    /// # Arguments
    /// * `measured` - Distance reported by the sensor (mm), `None` if the sensor saw nothing
    /// * `angle` - Direction of the sensor (radians)
    pub fn sense(&mut self, measured: Option<f64>, angle: f64) {
        let fallback = (self.width + self.height) as f64;
        let measured = measured.unwrap_or(fallback);
        let sigma = self.robot.sensor_noise();
        for particle in &mut self.particles {
            let expected = self
                .map
                .ray_distance(particle.x, particle.y, angle)
                .unwrap_or(fallback);
            let likelihood = gaussian(expected, sigma, measured);
            match self.mode {
                UpdateMode::Simple => particle.weight = likelihood,
                UpdateMode::Markov => particle.weight *= likelihood,
            }
        }
    }
    /// Turn every particle to `angle` plus rotation noise.
    pub fn set_heading(&mut self, angle: f64) {
        let std_dev = self.robot.rotation_noise();
        for particle in &mut self.particles {
            particle.heading = wrap_to_2pi(angle + gaussian_noise(&mut self.rng, std_dev));
        }
    }
    /// Move every particle `distance` physical units along its own heading, with displacement noise.
    ///
    /// Particles leaving the map are pinned to its border so that the population size never changes.
    pub fn move_particles(&mut self, distance: f64) {
        let std_dev = distance * self.robot.displacement_noise_percent() / 100.0;
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        for particle in &mut self.particles {
            let noisy_distance = distance + gaussian_noise(&mut self.rng, std_dev);
            particle.apply_displacement(noisy_distance, self.map.as_ref());
            particle.x = particle.x.clamp(0.0, max_x);
            particle.y = particle.y.clamp(0.0, max_y);
        }
    }
    /// Scale the weights so that they sum to one.
    ///
    /// A population whose weights sum to zero (every particle rejected by the last reading) is left unchanged.
    pub fn normalize(&mut self) {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum == 0.0 {
            warn!(
                "Degenerate population: all {} weights are zero, skipping normalization",
                self.particles.len()
            );
            return;
        }
        for particle in &mut self.particles {
            particle.weight /= sum;
        }
    }
    /// Draw the next generation with the resampling wheel.
    ///
    /// `floor(N * (1 - randomness))` particles are drawn proportionally to their weight (duplicates expected),
    /// the relevance is scored on those survivors, and the population is then topped up to `N` with random
    /// particles carrying the previous mean weight and the heading of the last survivor. Weights are normalized
    /// at the end.
    pub fn resample(&mut self) {
        let n = self.num_particles;
        if self.particles.is_empty() {
            warn!("Resampling an empty population, repopulating");
            self.populate(n, self.initial_heading, 1.0 / n as f64);
            self.normalize();
            return;
        }
        let len = self.particles.len();
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mean_weight = self.particles.iter().map(|p| p.weight).sum::<f64>() / n as f64;
        let kept = ((n as f64 * (1.0 - self.randomness)).floor() as usize).min(n);

        let mut survivors = Vec::with_capacity(n);
        let mut index = self.rng.random_range(0..len);
        let mut offset = 0.0;
        for _ in 0..kept {
            offset += self.rng.random::<f64>() * 2.0 * max_weight;
            while self.particles[index].weight < offset {
                offset -= self.particles[index].weight;
                index = (index + 1) % len;
            }
            survivors.push(self.particles[index]);
        }
        let heading = survivors
            .last()
            .map_or(self.initial_heading, |p: &Particle| p.heading);
        self.particles = survivors;
        if !self.particles.is_empty() {
            self.check_relevance();
        }
        self.populate(n - kept, heading, mean_weight);
        self.normalize();
        debug!(
            "Resampled {} particles ({} injected), relevance {:.3}",
            n,
            n - kept,
            self.relevance
        );
    }
    /// Score how tightly the population agrees on a position.
    ///
    /// The barycenter is the unweighted mean of the particle positions. The mean distance of the particles to
    /// it is converted to physical units and compared to the car length:
    /// `relevance = clamp(1 - scatter / length, 0, 1)`.
    ///
    /// Must not be called on an empty population; doing so logs a warning and keeps the previous score.
    pub fn check_relevance(&mut self) -> f64 {
        if self.particles.is_empty() {
            warn!("Relevance requested for an empty population");
            return self.relevance;
        }
        let n = self.particles.len() as f64;
        let sum = self
            .particles
            .iter()
            .fold(Point2::origin(), |acc: Point2<f64>, p| {
                Point2::new(acc.x + p.x, acc.y + p.y)
            });
        let barycenter = Point2::new(sum.x / n, sum.y / n);
        let scatter = self
            .particles
            .iter()
            .map(|p| distance(&p.position(), &barycenter))
            .sum::<f64>()
            / n;
        let scatter_mm = scatter / self.map.scale_factor();
        self.barycenter = Some(barycenter);
        self.relevance = (1.0 - scatter_mm / self.robot.physical_length()).clamp(0.0, 1.0);
        self.relevance
    }
    /// Effective number of particles, `1 / sum(w^2)`. Zero when every weight is zero.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
    /// Whether the last relevance score reaches [`DECENT_RELEVANCE`].
    pub fn is_localized(&self) -> bool {
        self.relevance >= DECENT_RELEVANCE
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    /// Mutable access to the particles. The population size cannot change through it.
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    /// Mean position of the population at the last relevance check.
    pub fn barycenter(&self) -> Option<Point2<f64>> {
        self.barycenter
    }
    pub fn relevance(&self) -> f64 {
        self.relevance
    }
    pub fn num_particles(&self) -> usize {
        self.num_particles
    }
    pub fn mode(&self) -> UpdateMode {
        self.mode
    }
    pub fn set_mode(&mut self, mode: UpdateMode) {
        self.mode = mode;
    }
    pub fn randomness(&self) -> f64 {
        self.randomness
    }
    /// Set the fraction of the population replaced by random particles on each resample.
    pub fn set_randomness(&mut self, randomness: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&randomness) {
            return Err(FilterError::InvalidConfig(format!(
                "randomness must be within [0, 1], got {randomness}"
            )));
        }
        self.randomness = randomness;
        Ok(())
    }
    pub fn map(&self) -> &Rc<M> {
        &self.map
    }
    pub fn robot(&self) -> &R {
        &self.robot
    }
    /// Replace the robot parameters, e.g. after the noise model was retuned.
    ///
    /// The current parameters stay in place when the new ones are rejected.
    pub fn set_robot(&mut self, robot: R) -> Result<()> {
        robot.validate()?;
        self.robot = robot;
        Ok(())
    }
}
