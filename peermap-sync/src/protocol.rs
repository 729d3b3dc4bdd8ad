//! JSON body of location updates.
//!
//! Wire format (STOMP frame body, UTF-8 JSON):
//! ```text
//! {"userId":"ios_42","latitude":-12.05,"longitude":-77.04,"timestamp":1000}
//! ```
//!
//! The same shape flows both ways: peers SEND it to the application
//! destination and receive it as MESSAGE bodies on the broadcast topic.
//! `timestamp` is optional on receive, since not every client version sends it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PeerId;
use crate::position::{Position, PositionError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid position: {0}")]
    InvalidPosition(#[from] PositionError),
}

/// One peer's position broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdateMessage {
    #[serde(rename = "userId")]
    pub peer_id: PeerId,
    pub latitude: f64,
    pub longitude: f64,
    /// Sample time, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl LocationUpdateMessage {
    /// Build an outbound update for `peer_id` at `position`.
    pub fn from_position(peer_id: &PeerId, position: &Position, include_timestamp: bool) -> Self {
        Self {
            peer_id: peer_id.clone(),
            latitude: position.latitude(),
            longitude: position.longitude(),
            timestamp: include_timestamp.then(|| position.timestamp()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse and validate an inbound body.
    ///
    /// Missing fields, wrong types, an empty `userId` or coordinates outside
    /// the valid ranges are all rejected.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let msg: Self =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Position::new(msg.latitude, msg.longitude, msg.timestamp.unwrap_or_default())?;
        Ok(msg)
    }

    /// Split into the registry key and value. `received_at` stamps updates
    /// that arrived without a timestamp.
    pub fn into_entry(self, received_at: i64) -> Result<(PeerId, Position), ProtocolError> {
        let position = Position::new(
            self.latitude,
            self.longitude,
            self.timestamp.unwrap_or(received_at),
        )?;
        Ok((self.peer_id, position))
    }
}
