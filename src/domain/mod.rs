//! Domain models - density sample wire types
//!
//! This module contains the canonical data types flowing through the system:
//! - `LiveDensitySample` - per-frame crowd measurement from the Density Stage
//! - `ForecastSample` - short-horizon projection from the Forecast Stage
//! - `DensityRecord` - tagged wire envelope distinguishing the two

pub mod sample;

// Re-export commonly used types at module level
pub use sample::{epoch_secs, DensityRecord, ForecastSample, LiveDensitySample};
