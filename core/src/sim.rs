//! Closed-loop localization simulation and CSV export of its results.
//!
//! This module provides:
//! - A simulated car ([`Car`]) that drives around a map and reads a noisy distance ahead of it
//! - [`run_simulation`], which drives a [`ParticleFilter`] with the car's odometry and readings
//! - [`LocalizationResult`] for storing, summarizing and exporting the per-cycle estimates
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, warn};
use nalgebra::{Point2, distance};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{MapConfig, SimulationConfig};
use crate::error::{FilterError, Result};
use crate::map::{GridMap, MapQuery, free_cells};
use crate::particle::ParticleFilter;
use crate::wrap_to_2pi;

/// Ground-truth car driven by the simulation
///
/// Moves with the same displacement convention as the particles but without snapping or odometry noise. The
/// range sensor looks along the car's heading and adds Gaussian noise to the map's ray distance.
#[derive(Debug)]
pub struct Car<M: MapQuery> {
    pub x: f64,
    pub y: f64,
    /// Heading in radians, within [0, 2π)
    pub heading: f64,
    map: Rc<M>,
    sensor_noise: f64,
    rng: StdRng,
}

impl<M: MapQuery> Car<M> {
    pub fn new(map: Rc<M>, x: f64, y: f64, heading: f64, sensor_noise: f64, seed: u64) -> Self {
        Car {
            x,
            y,
            heading: wrap_to_2pi(heading),
            map,
            sensor_noise,
            rng: StdRng::seed_from_u64(seed),
        }
    }
    /// Drive `distance` mm along the current heading.
    ///
    /// Returns `false`, leaving the car in place, when the destination is outside the map or occupied.
    pub fn move_by(&mut self, distance: f64) -> bool {
        let delta = self.map.displacement(distance, self.heading);
        let (x, y) = (self.x + delta.x, self.y + delta.y);
        let inside = x >= 0.0
            && y >= 0.0
            && x <= (self.map.width() - 1) as f64
            && y <= (self.map.height() - 1) as f64;
        if !inside || self.map.is_obstacle(x as usize, y as usize) {
            return false;
        }
        self.x = x;
        self.y = y;
        true
    }
    pub fn turn(&mut self, delta: f64) {
        self.heading = wrap_to_2pi(self.heading + delta);
    }
    /// Noisy distance (mm) to the obstacle ahead, `None` when nothing is in sight.
    pub fn read_distance(&mut self) -> Option<f64> {
        let truth = self.map.ray_distance(self.x, self.y, self.heading)?;
        let noise = Normal::new(0.0, self.sensor_noise).map_or(0.0, |n| n.sample(&mut self.rng));
        Some((truth + noise).max(0.0))
    }
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// Estimate of one simulation cycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalizationRecord {
    pub step: usize,
    pub true_x: f64,
    pub true_y: f64,
    pub true_heading_deg: f64,
    /// Sensor reading after the move (mm), empty when nothing was in sight
    pub reading_mm: Option<f64>,
    pub estimate_x: f64,
    pub estimate_y: f64,
    /// Distance between the barycenter and the true position (mm)
    pub error_mm: f64,
    pub relevance: f64,
    pub localized: bool,
    pub effective_particles: f64,
}

/// Sequence of per-cycle estimates of a simulation run
#[derive(Clone, Debug, Default)]
pub struct LocalizationResult {
    pub records: Vec<LocalizationRecord>,
}

impl LocalizationResult {
    /// Write the records to a CSV file with a header row.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Read records previously written by [`LocalizationResult::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<std::result::Result<Vec<LocalizationRecord>, csv::Error>>()?;
        Ok(LocalizationResult { records })
    }
    pub fn last(&self) -> Option<&LocalizationRecord> {
        self.records.last()
    }
    /// Fraction of the cycles flagged as localized.
    pub fn localized_fraction(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().filter(|r| r.localized).count() as f64 / self.records.len() as f64
    }
    /// Mean position error (mm) over the cycles flagged as localized.
    pub fn mean_localized_error(&self) -> Option<f64> {
        let errors: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.localized)
            .map(|r| r.error_mm)
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(errors.iter().sum::<f64>() / errors.len() as f64)
        }
    }
}

/// Build the map described by `config`: the plain-text file when given, a bordered empty room otherwise.
pub fn build_map(config: &MapConfig) -> Result<GridMap> {
    match &config.path {
        Some(path) => GridMap::from_file(path, config.pixels_per_mm, config.north_angle_deg),
        None => Ok(GridMap::new(
            config.width,
            config.height,
            config.pixels_per_mm,
            config.north_angle_deg,
        )?
        .with_border()),
    }
}

fn random_free_pose<M: MapQuery>(map: &M, rng: &mut StdRng) -> Result<(f64, f64, f64)> {
    let free = free_cells(map);
    if free.is_empty() {
        return Err(FilterError::NoFreeCell {
            width: map.width(),
            height: map.height(),
        });
    }
    let (x, y) = free[rng.random_range(0..free.len())];
    let heading = rng.random::<f64>() * 2.0 * std::f64::consts::PI;
    Ok((x as f64, y as f64, heading))
}

/// Run a closed-loop localization simulation.
///
/// Each cycle the car turns away from close obstacles, the particles take the car's heading, the car drives
/// `step_distance_mm` (particles follow only if the car actually moved), the particles are weighted against the
/// new reading, normalized, and resampled every `resample_every` cycles.
pub fn run_simulation<M: MapQuery>(config: &SimulationConfig, map: Rc<M>) -> Result<LocalizationResult> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (x, y, heading) = match config.start {
        Some(start) => start,
        None => random_free_pose(map.as_ref(), &mut rng)?,
    };
    let mut car = Car::new(
        Rc::clone(&map),
        x,
        y,
        heading,
        config.robot.sensor_noise_mm,
        rng.random(),
    );
    let mut filter = ParticleFilter::new(Rc::clone(&map), config.robot.clone(), &config.filter)?;
    info!(
        "Simulating {} steps with {} particles, car starting at ({:.1}, {:.1})",
        config.steps,
        filter.num_particles(),
        car.x,
        car.y
    );

    let turn = config.turn_angle_deg.to_radians();
    let mut result = LocalizationResult::default();
    let mut was_localized = false;
    for step in 0..config.steps {
        if car
            .read_distance()
            .is_some_and(|d| d < config.danger_distance_mm)
        {
            car.turn(turn);
        }
        filter.set_heading(car.heading);
        if car.move_by(config.step_distance_mm) {
            filter.move_particles(config.step_distance_mm);
        } else {
            debug!("Step {step}: car blocked at ({:.1}, {:.1})", car.x, car.y);
            car.turn(turn);
        }
        let reading = car.read_distance();
        filter.sense(reading, car.heading);
        filter.normalize();
        if (step + 1) % config.resample_every == 0 {
            filter.resample();
        }

        let estimate = filter.barycenter().unwrap_or_else(Point2::origin);
        let error_mm = distance(&estimate, &car.position()) / map.scale_factor();
        let localized = filter.is_localized();
        if localized != was_localized {
            if localized {
                info!("Step {step}: localized with error {error_mm:.1} mm");
            } else {
                warn!("Step {step}: localization lost");
            }
            was_localized = localized;
        }
        result.records.push(LocalizationRecord {
            step,
            true_x: car.x,
            true_y: car.y,
            true_heading_deg: car.heading.to_degrees(),
            reading_mm: reading,
            estimate_x: estimate.x,
            estimate_y: estimate.y,
            error_mm,
            relevance: filter.relevance(),
            localized,
            effective_particles: filter.effective_sample_size(),
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn room() -> Rc<GridMap> {
        Rc::new(GridMap::new(100, 100, 1.0, 0.0).unwrap().with_border())
    }

    #[test]
    fn test_car_moves_and_turns() {
        let mut car = Car::new(room(), 50.0, 50.0, 0.0, 0.0, 1);
        assert!(car.move_by(10.0));
        assert_approx_eq!(car.y, 40.0, 1e-12);
        car.turn(-PI / 2.0);
        assert_approx_eq!(car.heading, 3.0 * PI / 2.0, 1e-12);
        // heading 270 degrees points towards increasing x
        assert!(car.move_by(10.0));
        assert_approx_eq!(car.x, 60.0, 1e-9);
    }
    #[test]
    fn test_car_blocked_by_wall() {
        let mut car = Car::new(room(), 50.0, 3.0, 0.0, 0.0, 1);
        assert!(!car.move_by(10.0));
        assert_eq!((car.x, car.y), (50.0, 3.0));
    }
    #[test]
    fn test_car_reading_without_noise() {
        let mut car = Car::new(room(), 50.0, 50.0, 0.0, 0.0, 1);
        assert_approx_eq!(car.read_distance().unwrap(), 50.0, 1e-9);
    }
    #[test]
    fn test_build_map_default_room() {
        let map = build_map(&MapConfig::default()).unwrap();
        assert_eq!(map.width(), 500);
        assert!(map.is_obstacle(0, 0));
        assert!(!map.is_obstacle(250, 250));
    }
    #[test]
    fn test_run_simulation_records_every_step() {
        let config = SimulationConfig {
            steps: 25,
            start: Some((50.0, 80.0, 0.0)),
            filter: FilterConfig {
                num_particles: 50,
                randomness: 0.1,
                seed: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = run_simulation(&config, room()).unwrap();
        assert_eq!(result.records.len(), 25);
        for (i, record) in result.records.iter().enumerate() {
            assert_eq!(record.step, i);
            assert!((0.0..=1.0).contains(&record.relevance));
            assert!(record.true_x > 0.0 && record.true_x < 99.0);
            assert!(record.true_y > 0.0 && record.true_y < 99.0);
        }
    }
    #[test]
    fn test_run_simulation_rejects_invalid_config() {
        let config = SimulationConfig {
            resample_every: 0,
            ..Default::default()
        };
        assert!(run_simulation(&config, room()).is_err());
    }
    #[test]
    fn test_result_csv_round_trip() {
        let result = LocalizationResult {
            records: vec![
                LocalizationRecord {
                    step: 0,
                    true_x: 1.0,
                    true_y: 2.0,
                    true_heading_deg: 90.0,
                    reading_mm: None,
                    estimate_x: 3.0,
                    estimate_y: 4.0,
                    error_mm: 2.5,
                    relevance: 0.25,
                    localized: false,
                    effective_particles: 10.0,
                },
                LocalizationRecord {
                    step: 1,
                    true_x: 1.5,
                    true_y: 2.5,
                    true_heading_deg: 90.0,
                    reading_mm: Some(120.5),
                    estimate_x: 1.5,
                    estimate_y: 2.0,
                    error_mm: 0.5,
                    relevance: 0.9,
                    localized: true,
                    effective_particles: 42.0,
                },
            ],
        };
        let path = std::env::temp_dir().join(format!("mcl_result_{}.csv", std::process::id()));
        result.to_csv(&path).unwrap();
        let loaded = LocalizationResult::from_csv(&path).unwrap();
        assert_eq!(loaded.records, result.records);
        assert_approx_eq!(loaded.localized_fraction(), 0.5, 1e-12);
        assert_eq!(loaded.mean_localized_error(), Some(0.5));
        std::fs::remove_file(&path).ok();
    }
}
