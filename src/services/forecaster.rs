//! Forecaster seam - the prediction model invoked by the Forecast Stage
//!
//! Like the detector, this is a black box: live sample in, projected sample
//! out. The shipped implementation is the placeholder trend model carried
//! over from the original prediction engine; its accuracy is explicitly not
//! a contract of the pipeline.

use crate::domain::sample::{ForecastSample, LiveDensitySample};
use anyhow::Result;
use rand::Rng;

/// Black-box prediction model consumed by the Forecast Stage.
///
/// The returned sample's timestamp must strictly exceed the source sample's
/// timestamp; the stage drops forecasts that violate this.
pub trait Forecaster: Send + Sync {
    fn forecast(&self, sample: &LiveDensitySample) -> Result<ForecastSample>;
}

/// Placeholder trend model: scales the live density by 1.5 with a bounded
/// random perturbation and projects a fixed horizon ahead.
pub struct TrendForecaster {
    horizon_secs: u64,
}

impl TrendForecaster {
    /// The horizon is clamped to at least one second so the projected
    /// timestamp always moves forward.
    pub fn new(horizon_secs: u64) -> Self {
        Self { horizon_secs: horizon_secs.max(1) }
    }
}

impl Forecaster for TrendForecaster {
    fn forecast(&self, sample: &LiveDensitySample) -> Result<ForecastSample> {
        let multiplier = 1.5 + rand::rng().random_range(-0.2..=0.2);
        let predicted_density = (sample.density * multiplier).max(0.0);

        Ok(ForecastSample {
            zone_id: sample.zone_id.clone(),
            predicted_density,
            timestamp: sample.timestamp + self.horizon_secs as f64,
        })
    }
}
