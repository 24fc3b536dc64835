//! Forecast Stage - live samples in, forecast samples out
//!
//! Runs on a fixed cycle that is intentionally coarser than the frame rate:
//! the forecast approximates a trend, not per-frame noise. Each cycle drains
//! whatever accumulated on the live channel and forecasts only the newest
//! payload (latest-wins); everything older in that window is discarded
//! without processing. Payloads that are not live-tagged are filtered, not
//! treated as faults.

use crate::domain::sample::DensityRecord;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::bus::{Bus, BusSubscription, SubscriptionClosed};
use crate::services::forecaster::Forecaster;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct ForecastStage {
    sub: Box<dyn BusSubscription>,
    bus: Arc<dyn Bus>,
    forecaster: Arc<dyn Forecaster>,
    predicted_channel: String,
    cycle: Duration,
    metrics: Arc<Metrics>,
}

impl ForecastStage {
    /// Subscribe to the live channel and build the stage
    pub async fn start(
        bus: Arc<dyn Bus>,
        forecaster: Arc<dyn Forecaster>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let sub = bus.subscribe(config.live_channel()).await?;
        info!(
            live_channel = %config.live_channel(),
            predicted_channel = %config.predicted_channel(),
            cycle_ms = %config.forecast_cycle_ms(),
            "forecast_stage_started"
        );

        Ok(Self {
            sub,
            bus,
            forecaster,
            predicted_channel: config.predicted_channel().to_string(),
            cycle: Duration::from_millis(config.forecast_cycle_ms().max(1)),
            metrics,
        })
    }

    /// Run the cycle loop until shutdown or the input channel terminates
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("forecast_stage_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle() {
                        warn!(error = %e, "forecast_stage_input_closed");
                        return;
                    }
                }
            }
        }
    }

    /// One forecast cycle: drain the window, keep the newest payload,
    /// forecast it. At most one forecast is emitted per cycle.
    fn run_cycle(&mut self) -> Result<(), SubscriptionClosed> {
        let mut latest: Option<Bytes> = None;
        let mut discarded = 0u64;

        loop {
            match self.sub.try_next() {
                Ok(Some(payload)) => {
                    if latest.replace(payload).is_some() {
                        discarded += 1;
                    }
                }
                Ok(None) => break,
                Err(closed) => return Err(closed),
            }
        }

        if discarded > 0 {
            self.metrics.record_forecast_discarded(discarded);
            debug!(discarded = %discarded, "forecast_latest_wins_discard");
        }

        if let Some(payload) = latest {
            self.process_sample(&payload);
        }
        Ok(())
    }

    fn process_sample(&self, payload: &[u8]) {
        // Defensive filtering: only live-tagged records are forecast; a
        // predicted record looping back or a malformed payload is dropped
        // silently.
        let record: DensityRecord = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "forecast_input_unparsed");
                self.metrics.record_forecast_filtered();
                return;
            }
        };
        let DensityRecord::Live(sample) = record else {
            self.metrics.record_forecast_filtered();
            return;
        };

        let forecast = match self.forecaster.forecast(&sample) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, zone_id = %sample.zone_id, "forecast_failed");
                self.metrics.record_forecast_failure();
                return;
            }
        };

        // The horizon must be positive; a misbehaving model does not get to
        // publish a forecast that is not in the future.
        if forecast.timestamp <= sample.timestamp {
            warn!(
                zone_id = %forecast.zone_id,
                forecast_ts = %forecast.timestamp,
                source_ts = %sample.timestamp,
                "forecast_horizon_not_positive"
            );
            self.metrics.record_forecast_failure();
            return;
        }

        match serde_json::to_string(&DensityRecord::Predicted(forecast)) {
            Ok(json) => {
                self.bus.publish(&self.predicted_channel, Bytes::from(json));
                self.metrics.record_forecast_published();
            }
            Err(e) => error!(error = %e, "forecast_sample_encode_failed"),
        }
    }
}
