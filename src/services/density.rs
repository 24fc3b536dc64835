//! Density Stage - frames channel in, live density samples out
//!
//! A single sequential loop: poll the frames channel with a bounded timeout,
//! invoke the detector once per frame, stamp the result and publish it as a
//! tagged JSON payload. The stage never drops frames itself; when the
//! detector falls behind, frames queue at the bus. A detector failure skips
//! that frame only.

use crate::domain::sample::{epoch_secs, DensityRecord, LiveDensitySample};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::bus::{Bus, BusSubscription};
use crate::services::detector::Detector;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct DensityStage {
    sub: Box<dyn BusSubscription>,
    bus: Arc<dyn Bus>,
    detector: Arc<dyn Detector>,
    live_channel: String,
    poll_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl DensityStage {
    /// Subscribe to the frames channel and build the stage
    pub async fn start(
        bus: Arc<dyn Bus>,
        detector: Arc<dyn Detector>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let sub = bus.subscribe(config.frames_channel()).await?;
        info!(
            frames_channel = %config.frames_channel(),
            live_channel = %config.live_channel(),
            "density_stage_started"
        );

        Ok(Self {
            sub,
            bus,
            detector,
            live_channel: config.live_channel().to_string(),
            poll_timeout: Duration::from_millis(config.density_poll_timeout_ms()),
            metrics,
        })
    }

    /// Run the consume loop until shutdown or the input channel terminates.
    ///
    /// Strictly sequential: the next frame is not read before the current
    /// detector invocation finished. The poll timeout doubles as the idle
    /// delay, so an empty channel costs no CPU beyond one wakeup per timeout.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("density_stage_shutdown");
                        return;
                    }
                }
                polled = self.sub.poll(self.poll_timeout) => {
                    match polled {
                        Ok(Some(frame)) => self.process_frame(&frame),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "density_stage_input_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn process_frame(&self, frame: &[u8]) {
        self.metrics.record_frame_received();

        let detection = match self.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, frame_bytes = %frame.len(), "detect_failed");
                self.metrics.record_detect_failure();
                return;
            }
        };

        let sample = LiveDensitySample {
            zone_id: detection.zone_id,
            person_count: detection.person_count,
            density: detection.density.max(0.0),
            timestamp: epoch_secs(),
        };

        match serde_json::to_string(&DensityRecord::Live(sample)) {
            Ok(json) => {
                self.bus.publish(&self.live_channel, Bytes::from(json));
                self.metrics.record_live_published();
            }
            Err(e) => error!(error = %e, "live_sample_encode_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::detector::Detection;
    use crate::services::testsupport::MemoryBus;
    use anyhow::bail;

    /// Detector returning a fixed result, failing on frames that start with 0x00
    struct ScriptedDetector {
        count: u32,
        density: f64,
    }

    impl Detector for ScriptedDetector {
        fn detect(&self, frame: &[u8]) -> anyhow::Result<Detection> {
            if frame.first() == Some(&0x00) {
                bail!("simulated detection failure");
            }
            Ok(Detection {
                zone_id: "Zone-1".to_string(),
                person_count: self.count,
                density: self.density,
            })
        }
    }

    async fn spawn_stage(
        bus: Arc<MemoryBus>,
        detector: ScriptedDetector,
        metrics: Arc<Metrics>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let config = Config::default();
        let stage = DensityStage::start(bus, Arc::new(detector), &config, metrics)
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(stage.run(shutdown_rx));
        (shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_one_frame_yields_one_sample_with_detector_count() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let mut live_sub = bus.subscribe("density/live").await.unwrap();

        let detector = ScriptedDetector { count: 7, density: 0.003 };
        let (shutdown_tx, handle) = spawn_stage(bus.clone(), detector, metrics.clone()).await;

        let before = epoch_secs();
        bus.publish("cctv/frames", Bytes::from_static(b"\xff\xd8frame-1"));

        let payload = live_sub
            .poll(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("expected a live sample");
        let record: DensityRecord = serde_json::from_slice(&payload).unwrap();
        match record {
            DensityRecord::Live(sample) => {
                assert_eq!(sample.zone_id, "Zone-1");
                assert_eq!(sample.person_count, 7);
                assert!(sample.density >= 0.0);
                assert!(sample.timestamp >= before);
            }
            other => panic!("expected live record, got {:?}", other),
        }

        // Exactly one sample for one frame
        assert!(live_sub.poll(Duration::from_millis(100)).await.unwrap().is_none());
        assert_eq!(metrics.report().live_published, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_detector_failure_skips_frame_and_continues() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let mut live_sub = bus.subscribe("density/live").await.unwrap();

        let detector = ScriptedDetector { count: 3, density: 0.001 };
        let (shutdown_tx, handle) = spawn_stage(bus.clone(), detector, metrics.clone()).await;

        // First frame trips the detector; second one is fine
        bus.publish("cctv/frames", Bytes::from_static(b"\x00bad"));
        bus.publish("cctv/frames", Bytes::from_static(b"\xff\xd8good"));

        let payload = live_sub
            .poll(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("stage should survive the failed frame");
        let record: DensityRecord = serde_json::from_slice(&payload).unwrap();
        match record {
            DensityRecord::Live(sample) => assert_eq!(sample.person_count, 3),
            other => panic!("expected live record, got {:?}", other),
        }

        let summary = metrics.report();
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.detect_failures, 1);
        assert_eq!(summary.live_published, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_ends_when_input_channel_closes() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());

        let detector = ScriptedDetector { count: 1, density: 0.001 };
        let (_shutdown_tx, handle) = spawn_stage(bus.clone(), detector, metrics).await;

        bus.close_channel("cctv/frames");

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("stage should end once its input is gone")
            .unwrap();
    }
}
