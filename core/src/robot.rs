//! Robot state consumed by the particle filter.
//!
//! The filter never owns or mutates the car. It only needs a handful of read-only quantities: how noisy the
//! distance sensor is, how much the odometry and the heading drift, and how long the car is (the latter makes the
//! relevance score independent of map resolution). [`RobotState`] abstracts those so that the filter can be
//! driven by a live car model, a configuration snapshot, or fabricated values in tests.
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// Read-only noise and geometry parameters of the car
pub trait RobotState {
    /// Standard deviation of the distance sensor (mm).
    fn sensor_noise(&self) -> f64;
    /// Standard deviation of a displacement as a percentage (0-100) of the distance travelled.
    fn displacement_noise_percent(&self) -> f64;
    /// Standard deviation of the heading (radians).
    fn rotation_noise(&self) -> f64;
    /// Physical length of the car (mm).
    fn physical_length(&self) -> f64;
    /// Check that the parameters describe a usable noise model.
    ///
    /// The sensor noise and the car length divide the likelihood and the relevance score, so both must be
    /// positive and finite.
    fn validate(&self) -> Result<()> {
        let sensor_noise = self.sensor_noise();
        if !(sensor_noise > 0.0 && sensor_noise.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "sensor noise must be positive, got {sensor_noise}"
            )));
        }
        let displacement = self.displacement_noise_percent();
        if !(0.0..=100.0).contains(&displacement) {
            return Err(FilterError::InvalidConfig(format!(
                "displacement noise must be within 0-100 %, got {displacement}"
            )));
        }
        let rotation = self.rotation_noise();
        if !(rotation >= 0.0 && rotation.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "rotation noise must be non-negative, got {rotation}"
            )));
        }
        let length = self.physical_length();
        if !(length > 0.0 && length.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "car length must be positive, got {length}"
            )));
        }
        Ok(())
    }
}

impl<R: RobotState + ?Sized> RobotState for &R {
    fn sensor_noise(&self) -> f64 {
        (**self).sensor_noise()
    }
    fn displacement_noise_percent(&self) -> f64 {
        (**self).displacement_noise_percent()
    }
    fn rotation_noise(&self) -> f64 {
        (**self).rotation_noise()
    }
    fn physical_length(&self) -> f64 {
        (**self).physical_length()
    }
    fn validate(&self) -> Result<()> {
        (**self).validate()
    }
}

fn default_sensor_noise() -> f64 {
    100.0
}
fn default_displacement_noise() -> f64 {
    10.0
}
fn default_rotation_noise() -> f64 {
    2.0
}
fn default_length() -> f64 {
    100.0
}
fn default_width() -> f64 {
    50.0
}

/// Configuration snapshot of the car
///
/// Defaults are empirically tuned values for the reference car: a 100 mm sensor noise, 10 % displacement
/// noise, 2 degrees of rotation noise and a 50 x 100 mm footprint. The rotation noise is stored in degrees to
/// keep configuration files readable and reported in radians through [`RobotState::rotation_noise`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Distance sensor standard deviation (mm)
    #[serde(default = "default_sensor_noise")]
    pub sensor_noise_mm: f64,
    /// Displacement noise in percent (0-100) of the travelled distance
    #[serde(default = "default_displacement_noise")]
    pub displacement_noise_percent: f64,
    /// Heading noise in degrees
    #[serde(default = "default_rotation_noise")]
    pub rotation_noise_deg: f64,
    /// Car length (mm)
    #[serde(default = "default_length")]
    pub length_mm: f64,
    /// Car width (mm)
    #[serde(default = "default_width")]
    pub width_mm: f64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        RobotConfig {
            sensor_noise_mm: default_sensor_noise(),
            displacement_noise_percent: default_displacement_noise(),
            rotation_noise_deg: default_rotation_noise(),
            length_mm: default_length(),
            width_mm: default_width(),
        }
    }
}

impl RobotState for RobotConfig {
    fn sensor_noise(&self) -> f64 {
        self.sensor_noise_mm
    }
    fn displacement_noise_percent(&self) -> f64 {
        self.displacement_noise_percent
    }
    fn rotation_noise(&self) -> f64 {
        self.rotation_noise_deg.to_radians()
    }
    fn physical_length(&self) -> f64 {
        self.length_mm
    }
}
