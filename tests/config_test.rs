//! Integration tests for configuration loading

use crowdgate::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "expo-hall"

[broker]
bind_address = "127.0.0.1"
port = 1884

[bus]
host = "127.0.0.1"
port = 1884

[channels]
frames = "cam/raw"
live = "crowd/live"
predicted = "crowd/predicted"

[density]
zone_id = "Hall-A"
poll_timeout_ms = 100

[forecast]
cycle_ms = 2000
horizon_secs = 600

[gateway]
bind_address = "127.0.0.1"
port = 9100
relay_poll_timeout_ms = 500

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "expo-hall");
    assert_eq!(config.bus_host(), "127.0.0.1");
    assert_eq!(config.bus_port(), 1884);
    assert_eq!(config.frames_channel(), "cam/raw");
    assert_eq!(config.live_channel(), "crowd/live");
    assert_eq!(config.predicted_channel(), "crowd/predicted");
    assert_eq!(config.zone_id(), "Hall-A");
    assert_eq!(config.forecast_cycle_ms(), 2000);
    assert_eq!(config.forecast_horizon_secs(), 600);
    assert_eq!(config.gateway_port(), 9100);
    assert_eq!(config.relay_poll_timeout_ms(), 500);
    assert_eq!(config.prometheus_port(), 9091);
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.bus_host(), "localhost");
    assert_eq!(config.bus_port(), 1883);
    assert_eq!(config.live_channel(), "density/live");
    assert_eq!(config.gateway_port(), 8765);
}
