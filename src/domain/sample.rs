//! Wire types for the live and predicted density channels
//!
//! Both channels carry UTF-8 JSON with a `type` discriminator so consumers
//! can tell live measurements from forecasts without looking at the channel
//! name. The frame channel carries raw encoded-image bytes and has no type
//! here.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch time as fractional seconds
#[inline]
pub fn epoch_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Crowd measurement produced by the Density Stage, one per processed frame.
///
/// Invariant: `person_count` and `density` are never negative. The count is
/// unsigned by construction; density is clamped at the producing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveDensitySample {
    pub zone_id: String,
    pub person_count: u32,
    pub density: f64,
    /// Seconds since epoch, stamped when the detector result was obtained
    pub timestamp: f64,
}

/// Projected future measurement produced by the Forecast Stage.
///
/// Invariant: `timestamp` strictly exceeds the timestamp of the live sample
/// it was derived from (the forecast horizon is positive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSample {
    pub zone_id: String,
    pub predicted_density: f64,
    pub timestamp: f64,
}

/// Tagged envelope for payloads on the live and predicted channels.
///
/// The Forecast Stage parses incoming payloads through this type and only
/// acts on `Live` records; anything else is filtered, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DensityRecord {
    #[serde(rename = "live")]
    Live(LiveDensitySample),
    #[serde(rename = "predicted")]
    Predicted(ForecastSample),
}

impl DensityRecord {
    pub fn as_str(&self) -> &'static str {
        match self {
            DensityRecord::Live(_) => "live",
            DensityRecord::Predicted(_) => "predicted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_sample_wire_format() {
        let sample = LiveDensitySample {
            zone_id: "Zone-1".to_string(),
            person_count: 5,
            density: 0.002,
            timestamp: 1000.0,
        };
        let json = serde_json::to_string(&DensityRecord::Live(sample)).unwrap();

        assert!(json.contains("\"type\":\"live\""));
        assert!(json.contains("\"zone_id\":\"Zone-1\""));
        assert!(json.contains("\"person_count\":5"));
    }

    #[test]
    fn test_forecast_sample_wire_format() {
        let sample = ForecastSample {
            zone_id: "Zone-1".to_string(),
            predicted_density: 0.003,
            timestamp: 2800.0,
        };
        let json = serde_json::to_string(&DensityRecord::Predicted(sample)).unwrap();

        assert!(json.contains("\"type\":\"predicted\""));
        assert!(json.contains("\"predicted_density\":0.003"));
    }

    #[test]
    fn test_parse_live_record() {
        let json = r#"{"type":"live","zone_id":"Zone-1","person_count":12,"density":0.004,"timestamp":1700000000.5}"#;
        let record: DensityRecord = serde_json::from_str(json).unwrap();

        match record {
            DensityRecord::Live(s) => {
                assert_eq!(s.zone_id, "Zone-1");
                assert_eq!(s.person_count, 12);
            }
            other => panic!("expected live record, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let json = r#"{"type":"app_data","user_id":"user_1","lat":23.26}"#;
        assert!(serde_json::from_str::<DensityRecord>(json).is_err());
    }

    #[test]
    fn test_negative_count_is_rejected() {
        // person_count is u32 on the wire; a negative value must not parse
        let json = r#"{"type":"live","zone_id":"Zone-1","person_count":-3,"density":0.1,"timestamp":1.0}"#;
        assert!(serde_json::from_str::<DensityRecord>(json).is_err());
    }

    #[test]
    fn test_epoch_secs_monotonic_enough() {
        let a = epoch_secs();
        let b = epoch_secs();
        assert!(a > 1_000_000_000.0);
        assert!(b >= a);
    }
}
