//! Error type shared by the fallible operations of the crate.
//!
//! Numeric edge cases of the filter itself (a zero weight sum, a zero maximum weight, a ray that never hits an
//! obstacle) are not errors; they have well-defined outcomes documented on the operations. Errors are reserved
//! for configuration problems and for I/O around maps, configuration files and simulation output.
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Error)]
pub enum FilterError {
    /// The bound map has no free cell to place particles on.
    #[error("map of {width}x{height} cells has no free cell to populate particles")]
    NoFreeCell { width: usize, height: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A plain-text map could not be parsed.
    #[error("map parse error on line {line}: {message}")]
    MapParse { line: usize, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}
