//! Map queries consumed by the particle filter
//!
//! The filter treats the floor plan as an external collaborator: it only needs to know how far the nearest
//! obstacle is along a ray, whether a given cell is occupied, how large the navigable area is and how spatial
//! units relate to physical ones. [`MapQuery`] captures exactly that. [`GridMap`] is an occupancy-grid
//! implementation used by the simulation and the tests; it can be built programmatically or loaded from a
//! plain-text drawing where `#` marks an occupied cell.
use std::fs;
use std::path::Path;

use log::debug;
use nalgebra::Vector2;

use crate::error::{FilterError, Result};

/// Distance (in cells) between two samples of a ray.
pub const RAY_STEP: f64 = 1.0;

/// Unit vector of a heading in map coordinates.
///
/// Heading zero points towards decreasing `y` (up on screen) once corrected by the north offset; headings grow
/// counter-clockwise.
pub fn heading_vector(heading: f64, north_offset: f64) -> Vector2<f64> {
    let angle = heading - north_offset;
    Vector2::new(-angle.sin(), -angle.cos())
}

/// Static obstacle geometry as seen by the particle filter
pub trait MapQuery {
    /// Distance (mm) from `(x, y)` to the nearest obstacle along `heading`, or `None` when the ray leaves the
    /// map without hitting anything.
    fn ray_distance(&self, x: f64, y: f64, heading: f64) -> Option<f64>;
    /// Whether the cell at `(x, y)` is occupied. Cells outside the map are occupied.
    fn is_obstacle(&self, x: usize, y: usize) -> bool;
    /// Width of the navigable area (spatial units).
    fn width(&self) -> usize;
    /// Height of the navigable area (spatial units).
    fn height(&self) -> usize;
    /// Spatial units per physical unit (e.g. pixels per mm).
    fn scale_factor(&self) -> f64;
    /// Angular correction (radians) between the car's frame and the map's frame.
    fn north_offset(&self) -> f64;
    /// Snap a position onto the map's discretization. Continuous maps keep positions untouched.
    fn snap(&self, x: f64, y: f64) -> (f64, f64) {
        (x, y)
    }
    /// Displacement in spatial units of moving `distance` physical units along `heading`.
    fn displacement(&self, distance: f64, heading: f64) -> Vector2<f64> {
        heading_vector(heading, self.north_offset()) * (distance * self.scale_factor())
    }
}

/// Every free cell of `map`, row by row.
pub fn free_cells<M: MapQuery + ?Sized>(map: &M) -> Vec<(usize, usize)> {
    let width = map.width();
    (0..map.height())
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .filter(|&(x, y)| !map.is_obstacle(x, y))
        .collect()
}

/// Occupancy-grid map
///
/// Cells are one spatial unit wide. Positions are snapped to the grid by truncation, the same way the car's
/// display coordinates are integer pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct GridMap {
    width: usize,
    height: usize,
    cells: Vec<bool>,
    pixels_per_mm: f64,
    north_angle_deg: f64,
}

impl GridMap {
    /// Create an obstacle-free map.
    ///
    /// # Arguments
    /// * `width`, `height` - Size of the grid in cells
    /// * `pixels_per_mm` - Scale factor between physical and spatial units
    /// * `north_angle_deg` - North angle of the map in degrees
    pub fn new(width: usize, height: usize, pixels_per_mm: f64, north_angle_deg: f64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FilterError::InvalidConfig(format!(
                "map must have a non-zero size, got {width}x{height}"
            )));
        }
        if !(pixels_per_mm > 0.0 && pixels_per_mm.is_finite()) {
            return Err(FilterError::InvalidConfig(format!(
                "map scale must be positive, got {pixels_per_mm}"
            )));
        }
        Ok(GridMap {
            width,
            height,
            cells: vec![false; width * height],
            pixels_per_mm,
            north_angle_deg,
        })
    }
    /// Parse a plain-text drawing of the map.
    ///
    /// Every non-empty line is a row; `#` is occupied, `.` and spaces are free. All rows must have the same
    /// length. Lines starting with `;` are comments.
    pub fn from_text(text: &str, pixels_per_mm: f64, north_angle_deg: f64) -> Result<Self> {
        let mut rows: Vec<Vec<bool>> = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with(';') {
                continue;
            }
            let mut row = Vec::with_capacity(line.len());
            for c in line.chars() {
                match c {
                    '#' => row.push(true),
                    '.' | ' ' => row.push(false),
                    other => {
                        return Err(FilterError::MapParse {
                            line: i + 1,
                            message: format!("unexpected character '{other}'"),
                        });
                    }
                }
            }
            if let Some(first) = rows.first()
                && first.len() != row.len()
            {
                return Err(FilterError::MapParse {
                    line: i + 1,
                    message: format!("row has {} cells, expected {}", row.len(), first.len()),
                });
            }
            rows.push(row);
        }
        let height = rows.len();
        let width = rows.first().map_or(0, |r| r.len());
        let mut map = GridMap::new(width, height, pixels_per_mm, north_angle_deg)?;
        map.cells = rows.into_iter().flatten().collect();
        debug!(
            "Parsed {}x{} map with {} free cells",
            width,
            height,
            map.free_cell_count()
        );
        Ok(map)
    }
    /// Read a plain-text map from disk. See [`GridMap::from_text`] for the format.
    pub fn from_file<P: AsRef<Path>>(path: P, pixels_per_mm: f64, north_angle_deg: f64) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_text(&text, pixels_per_mm, north_angle_deg)
    }
    /// Mark a cell as occupied or free. Out-of-range cells are ignored.
    pub fn set_obstacle(&mut self, x: usize, y: usize, occupied: bool) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = occupied;
        }
    }
    /// Occupy every cell of the inclusive rectangle `[x0, x1] x [y0, y1]`.
    pub fn fill_rect(&mut self, x0: usize, y0: usize, x1: usize, y1: usize) {
        for y in y0..=y1.min(self.height - 1) {
            for x in x0..=x1.min(self.width - 1) {
                self.cells[y * self.width + x] = true;
            }
        }
    }
    /// Occupy the outermost ring of cells.
    pub fn with_border(mut self) -> Self {
        let (w, h) = (self.width - 1, self.height - 1);
        self.fill_rect(0, 0, w, 0);
        self.fill_rect(0, h, w, h);
        self.fill_rect(0, 0, 0, h);
        self.fill_rect(w, 0, w, h);
        self
    }
    pub fn free_cell_count(&self) -> usize {
        self.cells.iter().filter(|&&c| !c).count()
    }
    pub fn north_angle_deg(&self) -> f64 {
        self.north_angle_deg
    }
}

impl MapQuery for GridMap {
    fn ray_distance(&self, x: f64, y: f64, heading: f64) -> Option<f64> {
        let direction = heading_vector(heading, self.north_offset()) * RAY_STEP;
        // Any ray leaves the grid within width + height cells.
        let max_steps = ((self.width + self.height) as f64 / RAY_STEP).ceil() as usize + 1;
        for step in 0..=max_steps {
            let px = x + direction.x * step as f64;
            let py = y + direction.y * step as f64;
            if px < 0.0 || py < 0.0 || px >= self.width as f64 || py >= self.height as f64 {
                return None;
            }
            if self.cells[py as usize * self.width + px as usize] {
                return Some(step as f64 * RAY_STEP / self.pixels_per_mm);
            }
        }
        None
    }
    fn is_obstacle(&self, x: usize, y: usize) -> bool {
        if x >= self.width || y >= self.height {
            return true;
        }
        self.cells[y * self.width + x]
    }
    fn width(&self) -> usize {
        self.width
    }
    fn height(&self) -> usize {
        self.height
    }
    fn scale_factor(&self) -> f64 {
        self.pixels_per_mm
    }
    fn north_offset(&self) -> f64 {
        self.north_angle_deg.to_radians()
    }
    fn snap(&self, x: f64, y: f64) -> (f64, f64) {
        (x.trunc(), y.trunc())
    }
}
