//! Configuration for the sync channel, the position sampler and the relay.
//!
//! Every struct deserializes with `#[serde(default)]`, so a config file
//! only needs the keys it wants to override.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid broker URL '{0}': expected ws:// or wss://")]
    InvalidBrokerUrl(String),
    #[error("Invalid destination '{0}': must start with '/'")]
    InvalidDestination(String),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("Heartbeat timeout factor must be at least 1.0, got {0}")]
    HeartbeatFactor(f64),
    #[error("Sampling thresholds must be finite and non-negative")]
    InvalidSampling,
}

/// Sync channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket endpoint of the STOMP broker
    pub broker_url: String,
    /// Destination local positions are sent to
    pub publish_destination: String,
    /// Broadcast topic every peer subscribes to
    pub subscribe_topic: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Interval we promise to send heartbeats at (0 = never)
    pub heartbeat_outgoing_ms: u64,
    /// Interval we ask the broker to send heartbeats at (0 = never)
    pub heartbeat_incoming_ms: u64,
    /// Silence tolerated on the wire, as a multiple of the negotiated
    /// incoming heartbeat interval, before the link is considered dead
    pub heartbeat_timeout_factor: f64,
    /// Bound on transport connect plus STOMP handshake
    pub connect_timeout_ms: u64,
    /// Whether outbound messages carry the sample timestamp
    pub include_timestamp: bool,
    /// Optional `host` header for the CONNECT frame
    pub stomp_host: Option<String>,
    /// Frames buffered between publishers and the socket writer
    pub outbound_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080/ws".to_string(),
            publish_destination: "/app/update-location".to_string(),
            subscribe_topic: "/topic/locations".to_string(),
            reconnect_delay_ms: 5000,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            heartbeat_timeout_factor: 2.0,
            connect_timeout_ms: 10_000,
            include_timestamp: true,
            stomp_host: None,
            outbound_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Config pointing at the given broker, defaults elsewhere.
    pub fn with_broker(url: impl Into<String>) -> Self {
        Self {
            broker_url: url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.broker_url.starts_with("ws://") && !self.broker_url.starts_with("wss://") {
            return Err(ConfigError::InvalidBrokerUrl(self.broker_url.clone()));
        }
        for destination in [&self.publish_destination, &self.subscribe_topic] {
            if !destination.starts_with('/') {
                return Err(ConfigError::InvalidDestination(destination.clone()));
            }
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::ZeroValue("reconnect_delay_ms"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("connect_timeout_ms"));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::ZeroValue("outbound_buffer"));
        }
        if !self.heartbeat_timeout_factor.is_finite() || self.heartbeat_timeout_factor < 1.0 {
            return Err(ConfigError::HeartbeatFactor(self.heartbeat_timeout_factor));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Producer-side throttling thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Minimum movement between admitted samples, metres
    pub min_distance_m: f64,
    /// Minimum time between admitted samples
    pub min_interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 5.0,
            min_interval_ms: 3000,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_distance_m.is_finite() || self.min_distance_m < 0.0 {
            return Err(ConfigError::InvalidSampling);
        }
        Ok(())
    }
}

/// Development relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages buffered per topic subscriber before it starts lagging
    pub topic_capacity: usize,
    /// Heartbeat interval the relay offers and expects (0 = disabled)
    pub heartbeat_ms: u64,
    /// Application destination → broadcast topic
    pub routes: BTreeMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut routes = BTreeMap::new();
        routes.insert("/app/update-location".to_string(), "/topic/locations".to_string());
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            topic_capacity: 256,
            heartbeat_ms: 4000,
            routes,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_capacity == 0 {
            return Err(ConfigError::ZeroValue("topic_capacity"));
        }
        for (app, topic) in &self.routes {
            for destination in [app, topic] {
                if !destination.starts_with('/') {
                    return Err(ConfigError::InvalidDestination(destination.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_prototypes() {
        let config = SyncConfig::default();
        assert_eq!(config.reconnect_delay(), Duration::from_millis(5000));
        assert_eq!(config.heartbeat_outgoing_ms, 4000);
        assert_eq!(config.heartbeat_incoming_ms, 4000);
        assert_eq!(config.publish_destination, "/app/update-location");
        assert_eq!(config.subscribe_topic, "/topic/locations");
        assert!(config.include_timestamp);
        assert!(config.validate().is_ok());

        let sampling = SamplingConfig::default();
        assert_eq!(sampling.min_distance_m, 5.0);
        assert_eq!(sampling.min_interval_ms, 3000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig::with_broker("http://example.com/ws");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBrokerUrl(_))));

        let config = SyncConfig {
            reconnect_delay_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("reconnect_delay_ms")));

        let config = SyncConfig {
            subscribe_topic: "topic/locations".to_string(),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDestination(_))));

        let config = SyncConfig {
            heartbeat_timeout_factor: 0.5,
            ..SyncConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::HeartbeatFactor(0.5)));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"broker_url":"ws://10.0.0.2:8080/ws","reconnect_delay_ms":2500}"#)
                .unwrap();
        assert_eq!(config.broker_url, "ws://10.0.0.2:8080/ws");
        assert_eq!(config.reconnect_delay_ms, 2500);
        assert_eq!(config.heartbeat_outgoing_ms, 4000);
    }

    #[test]
    fn test_relay_default_route() {
        let relay = RelayConfig::default();
        assert_eq!(
            relay.routes.get("/app/update-location").map(String::as_str),
            Some("/topic/locations")
        );
        assert!(relay.validate().is_ok());
    }
}
