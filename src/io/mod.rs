//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `bus` - Channel Bus contract and its MQTT realization
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod bus;
pub mod prometheus;

// Re-export commonly used types
pub use bus::{Bus, BusSubscription, MqttBus, SubscriptionClosed};
