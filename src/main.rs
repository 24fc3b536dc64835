//! Crowdgate - real-time crowd-density pipeline and stream multiplexer
//!
//! Streams crowd-density measurements and short-horizon forecasts from a
//! perception source to live WebSocket clients over an embedded MQTT bus.
//!
//! Module structure:
//! - `domain/` - Density sample wire types
//! - `io/` - External interfaces (Channel Bus, Prometheus endpoint)
//! - `services/` - Pipeline stages and the stream gateway
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use crowdgate::infra::{Config, Metrics};
use crowdgate::io::{Bus, MqttBus};
use crowdgate::services::{DensityStage, ForecastStage, SyntheticDetector, TrendForecaster};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Crowdgate - crowd density streaming gateway
#[derive(Parser, Debug)]
#[command(name = "crowdgate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("crowdgate starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    // Start embedded MQTT broker with config
    crowdgate::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        bus_host = %config.bus_host(),
        bus_port = %config.bus_port(),
        frames_channel = %config.frames_channel(),
        live_channel = %config.live_channel(),
        predicted_channel = %config.predicted_channel(),
        gateway_port = %config.gateway_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(Metrics::new());
    let bus: Arc<dyn Bus> = Arc::new(MqttBus::connect(&config));

    // Start Density Stage
    let detector = Arc::new(SyntheticDetector::new(config.zone_id()));
    let density_stage =
        DensityStage::start(bus.clone(), detector, &config, metrics.clone()).await?;
    let density_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        density_stage.run(density_shutdown).await;
    });

    // Start Forecast Stage
    let forecaster = Arc::new(TrendForecaster::new(config.forecast_horizon_secs()));
    let forecast_stage =
        ForecastStage::start(bus.clone(), forecaster, &config, metrics.clone()).await?;
    let forecast_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        forecast_stage.run(forecast_shutdown).await;
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = crowdgate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run the gateway in the foreground - accepts clients until shutdown
    crowdgate::services::gateway::start_gateway(&config, bus, metrics, shutdown_rx).await?;

    info!("crowdgate shutdown complete");
    Ok(())
}
