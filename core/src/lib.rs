//! Monte Carlo localization toolbox for a range-sensing car
//!
//! This crate estimates the pose of a small mobile robot (the "car") whose true position is unknown. The car
//! carries a single distance sensor and moves around a known, static floor plan. Pose is estimated with a
//! particle filter: a population of weighted pose hypotheses that is moved along with the car's odometry,
//! re-weighted against each distance reading, and periodically resampled. A scalar relevance score summarizes
//! how tightly the population agrees on a single pose.
//!
//! The filter is deliberately passive. An external driver (a simulation loop, a UI, or a connection to the
//! real car) calls [`particle::ParticleFilter::move_particles`] after every displacement,
//! [`particle::ParticleFilter::sense`] after every range reading, and [`particle::ParticleFilter::resample`]
//! whenever it sees fit. The [`sim`] module provides such a driver for offline experiments.
//!
//! Primarily built off of the following crate dependencies:
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides
//!   random number generation for population, motion noise and resampling.
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the point types used for barycenters and
//!   distances.
//! - [`serde`](https://crates.io/crates/serde): Configuration files and simulation output.
//!
//! ## Crate overview
//!
//! - [config]: Filter, map and simulation configuration with JSON/YAML/TOML file support.
//! - [error]: The error type shared by the fallible operations of the crate.
//! - [map]: The [`map::MapQuery`] interface the filter consumes and an occupancy-grid implementation.
//! - [particle]: Particles and the particle filter engine.
//! - [robot]: The [`robot::RobotState`] interface (noise magnitudes and geometry of the car).
//! - [sim]: A simulated car, the closed-loop simulation driver and CSV export of its results.
//!
//! ## Coordinate conventions
//!
//! Positions are expressed in map ("spatial") units, typically pixels or grid cells, with the origin in the
//! top-left corner of the map and `y` growing downwards. Distances reported by the sensor, noise magnitudes
//! and the car geometry are expressed in physical units (millimeters). The map's scale factor converts
//! physical to spatial units (`pixels = mm * scale`).
//!
//! Headings are in radians. A heading of zero points along the map's reference axis corrected by the map's
//! north angle, so a displacement $d$ at heading $\psi$ moves a pose by:
//!
//! $$
//! \Delta x = -d \cdot s \cdot \sin(\psi - \psi_N), \qquad \Delta y = -d \cdot s \cdot \cos(\psi - \psi_N)
//! $$
//!
//! where $s$ is the scale factor and $\psi_N$ the north offset.
pub mod config;
pub mod error;
pub mod map;
pub mod particle;
pub mod robot;
pub mod sim;

pub use error::{FilterError, Result};
pub use map::{GridMap, MapQuery};
pub use particle::{DECENT_RELEVANCE, Particle, ParticleFilter, UpdateMode};
pub use robot::{RobotConfig, RobotState};

use std::f64::consts::PI;

/// Probability density of `x` under a one dimensional Gaussian with mean `mu` and standard deviation `sigma`
///
/// $$
/// p(x) = \frac{1}{\sqrt{2 \pi \sigma^2}} \exp\left(-\frac{(\mu - x)^2}{2 \sigma^2}\right)
/// $$
///
/// # Example
/// ```rust
/// use mcl::gaussian;
/// let peak = gaussian(200.0, 100.0, 200.0);
/// assert!((peak - 0.003989).abs() < 1e-6);
/// ```
pub fn gaussian(mu: f64, sigma: f64, x: f64) -> f64 {
    let variance = sigma * sigma;
    (-((mu - x).powi(2)) / variance / 2.0).exp() / (2.0 * PI * variance).sqrt()
}
/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// # Example
/// ```rust
/// use mcl::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped_angle = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > PI {
        wrapped -= 2.0 * PI;
    }
    while wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}
/// Wrap an angle to the range $[0, 2\pi)$ radians
///
/// # Example
/// ```rust
/// use mcl::wrap_to_2pi;
/// use std::f64::consts::PI;
/// let wrapped_angle = wrap_to_2pi(5.0 * PI);
/// assert!((wrapped_angle - PI).abs() < 1e-12);
/// ```
pub fn wrap_to_2pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped >= 2.0 * PI {
        wrapped -= 2.0 * PI;
    }
    while wrapped < 0.0 {
        wrapped += 2.0 * PI;
    }
    wrapped
}
