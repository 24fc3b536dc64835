//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "expo-hall", "station-west")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "crowdgate".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { bind_address: default_broker_bind_address(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_bus_host() -> String {
    "localhost".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { host: default_bus_host(), port: default_broker_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_frames_channel")]
    pub frames: String,
    #[serde(default = "default_live_channel")]
    pub live: String,
    #[serde(default = "default_predicted_channel")]
    pub predicted: String,
}

fn default_frames_channel() -> String {
    "cctv/frames".to_string()
}

fn default_live_channel() -> String {
    "density/live".to_string()
}

fn default_predicted_channel() -> String {
    "density/predicted".to_string()
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            frames: default_frames_channel(),
            live: default_live_channel(),
            predicted: default_predicted_channel(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DensityConfig {
    /// Zone reported by the shipped detector (single zone in current scope)
    #[serde(default = "default_zone_id")]
    pub zone_id: String,
    /// Frame poll timeout; doubles as the idle delay when no frames arrive
    #[serde(default = "default_density_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_zone_id() -> String {
    "Zone-1".to_string()
}

fn default_density_poll_timeout_ms() -> u64 {
    250
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self { zone_id: default_zone_id(), poll_timeout_ms: default_density_poll_timeout_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Forecast cycle period; intentionally coarser than the frame rate
    #[serde(default = "default_forecast_cycle_ms")]
    pub cycle_ms: u64,
    /// How far ahead the shipped forecaster projects
    #[serde(default = "default_forecast_horizon_secs")]
    pub horizon_secs: u64,
}

fn default_forecast_cycle_ms() -> u64 {
    1000
}

fn default_forecast_horizon_secs() -> u64 {
    1800
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self { cycle_ms: default_forecast_cycle_ms(), horizon_secs: default_forecast_horizon_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Bounded wait per relay poll; upper-bounds cancellation latency
    #[serde(default = "default_relay_poll_timeout_ms")]
    pub relay_poll_timeout_ms: u64,
}

fn default_gateway_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    8765
}

fn default_relay_poll_timeout_ms() -> u64 {
    1000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_gateway_bind_address(),
            port: default_gateway_port(),
            relay_poll_timeout_ms: default_relay_poll_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub density: DensityConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    broker_bind_address: String,
    broker_port: u16,
    bus_host: String,
    bus_port: u16,
    frames_channel: String,
    live_channel: String,
    predicted_channel: String,
    zone_id: String,
    density_poll_timeout_ms: u64,
    forecast_cycle_ms: u64,
    forecast_horizon_secs: u64,
    gateway_bind_address: String,
    gateway_port: u16,
    relay_poll_timeout_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, source: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            bus_host: toml_config.bus.host,
            bus_port: toml_config.bus.port,
            frames_channel: toml_config.channels.frames,
            live_channel: toml_config.channels.live,
            predicted_channel: toml_config.channels.predicted,
            zone_id: toml_config.density.zone_id,
            density_poll_timeout_ms: toml_config.density.poll_timeout_ms,
            forecast_cycle_ms: toml_config.forecast.cycle_ms,
            forecast_horizon_secs: toml_config.forecast.horizon_secs,
            gateway_bind_address: toml_config.gateway.bind_address,
            gateway_port: toml_config.gateway.port,
            relay_poll_timeout_ms: toml_config.gateway.relay_poll_timeout_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: source.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        // Default to dev.toml
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration from a path - falls back to defaults if unreadable
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn bus_host(&self) -> &str {
        &self.bus_host
    }

    pub fn bus_port(&self) -> u16 {
        self.bus_port
    }

    pub fn frames_channel(&self) -> &str {
        &self.frames_channel
    }

    pub fn live_channel(&self) -> &str {
        &self.live_channel
    }

    pub fn predicted_channel(&self) -> &str {
        &self.predicted_channel
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn density_poll_timeout_ms(&self) -> u64 {
        self.density_poll_timeout_ms
    }

    pub fn forecast_cycle_ms(&self) -> u64 {
        self.forecast_cycle_ms
    }

    pub fn forecast_horizon_secs(&self) -> u64 {
        self.forecast_horizon_secs
    }

    pub fn gateway_bind_address(&self) -> &str {
        &self.gateway_bind_address
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway_port
    }

    pub fn relay_poll_timeout_ms(&self) -> u64 {
        self.relay_poll_timeout_ms
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the forecast cycle
    #[cfg(test)]
    pub fn with_forecast_cycle_ms(mut self, ms: u64) -> Self {
        self.forecast_cycle_ms = ms;
        self
    }

    /// Builder method for tests to shorten the relay poll timeout
    #[cfg(test)]
    pub fn with_relay_poll_timeout_ms(mut self, ms: u64) -> Self {
        self.relay_poll_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "crowdgate");
        assert_eq!(config.bus_host(), "localhost");
        assert_eq!(config.bus_port(), 1883);
        assert_eq!(config.frames_channel(), "cctv/frames");
        assert_eq!(config.live_channel(), "density/live");
        assert_eq!(config.predicted_channel(), "density/predicted");
        assert_eq!(config.zone_id(), "Zone-1");
        assert_eq!(config.forecast_cycle_ms(), 1000);
        assert_eq!(config.forecast_horizon_secs(), 1800);
        assert_eq!(config.gateway_port(), 8765);
        assert_eq!(config.relay_poll_timeout_ms(), 1000);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["crowdgate".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "crowdgate".to_string(),
            "--config".to_string(),
            "config/expo.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/expo.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["crowdgate".to_string(), "--config=config/station.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/station.toml");
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [gateway]
            port = 9000
            "#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline");

        assert_eq!(config.gateway_port(), 9000);
        // Untouched sections fall back to their defaults
        assert_eq!(config.relay_poll_timeout_ms(), 1000);
        assert_eq!(config.live_channel(), "density/live");
    }
}
