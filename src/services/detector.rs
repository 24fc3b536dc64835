//! Detector seam - the perception model invoked by the Density Stage
//!
//! The detector is a black box with bounded latency: encoded frame bytes in,
//! zone/count/density out. A real deployment plugs a person-detection model
//! in here; the shipped implementation is a deterministic stand-in good
//! enough to drive the pipeline and the demo feed.

use anyhow::{bail, Result};

/// Nominal frame dimensions used for the persons-per-pixel density
const FRAME_AREA: f64 = 1280.0 * 720.0;

/// Brightness threshold separating "occupied" bytes from background
const BRIGHT_THRESHOLD: u8 = 0xC8;

/// Result of one detector invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub zone_id: String,
    pub person_count: u32,
    pub density: f64,
}

/// Black-box perception model consumed by the Density Stage.
///
/// Implementations must not block indefinitely; the stage invokes them
/// synchronously, one frame at a time.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &[u8]) -> Result<Detection>;
}

/// Deterministic stand-in for a real person-detection model.
///
/// Treats the payload as raw luminance data and derives a pseudo person
/// count from the share of bright bytes, so the synthetic feed's crowd wave
/// shows up downstream. Single zone in current scope.
pub struct SyntheticDetector {
    zone_id: String,
}

impl SyntheticDetector {
    pub fn new(zone_id: &str) -> Self {
        Self { zone_id: zone_id.to_string() }
    }
}

impl Detector for SyntheticDetector {
    fn detect(&self, frame: &[u8]) -> Result<Detection> {
        if frame.is_empty() {
            bail!("empty frame payload");
        }

        let bright = frame.iter().filter(|&&b| b >= BRIGHT_THRESHOLD).count();
        let person_count = (bright / 64) as u32;
        let density = f64::from(person_count) / FRAME_AREA;

        Ok(Detection { zone_id: self.zone_id.clone(), person_count, density })
    }
}
