//! Geographic positions and producer-side sample gating.
//!
//! A [`Position`] is always valid once constructed: latitude lies in
//! [-90, 90], longitude in [-180, 180], both finite. Inbound wire data and
//! local GPS samples go through the same constructor.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::SamplingConfig;

/// Mean earth radius (IUGG), in metres.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("Latitude out of range: {0}")]
    LatitudeOutOfRange(f64),
    #[error("Longitude out of range: {0}")]
    LongitudeOutOfRange(f64),
    #[error("Accuracy must be a non-negative finite number: {0}")]
    InvalidAccuracy(f64),
}

/// A validated geographic fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPosition")]
pub struct Position {
    latitude: f64,
    longitude: f64,
    /// Epoch milliseconds.
    timestamp: i64,
    /// Horizontal accuracy radius in metres, when the producer reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
}

#[derive(Deserialize)]
struct RawPosition {
    latitude: f64,
    longitude: f64,
    timestamp: i64,
    #[serde(default)]
    accuracy: Option<f64>,
}

impl TryFrom<RawPosition> for Position {
    type Error = PositionError;

    fn try_from(raw: RawPosition) -> Result<Self, Self::Error> {
        let position = Position::new(raw.latitude, raw.longitude, raw.timestamp)?;
        match raw.accuracy {
            Some(accuracy) => position.with_accuracy(accuracy),
            None => Ok(position),
        }
    }
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Result<Self, PositionError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(PositionError::LatitudeOutOfRange(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(PositionError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
            timestamp,
            accuracy: None,
        })
    }

    /// Create a position stamped with the current wall-clock time.
    pub fn now(latitude: f64, longitude: f64) -> Result<Self, PositionError> {
        Self::new(latitude, longitude, epoch_millis())
    }

    /// Attach accuracy metadata.
    pub fn with_accuracy(mut self, accuracy: f64) -> Result<Self, PositionError> {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(PositionError::InvalidAccuracy(accuracy));
        }
        self.accuracy = Some(accuracy);
        Ok(self)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.accuracy
    }

    /// `(latitude, longitude)` pair, the shape the map layer consumes.
    pub fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }

    /// Great-circle distance to `other` in metres (haversine).
    pub fn distance_m(&self, other: &Position) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Producer-side movement/interval gate.
///
/// The first sample always passes. Later samples pass only when at least
/// `min_interval_ms` has elapsed (by sample timestamp) and the fix moved at
/// least `min_distance_m` from the last admitted one. A sample stamped
/// earlier than the last admitted one (wall clock stepped back) counts as
/// having waited long enough. The sync channel does no de-duplication of
/// its own, so this is the single place thresholds live.
#[derive(Debug, Clone)]
pub struct SampleGate {
    min_distance_m: f64,
    min_interval_ms: i64,
    last: Option<Position>,
}

impl SampleGate {
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            min_distance_m: config.min_distance_m,
            min_interval_ms: i64::try_from(config.min_interval_ms).unwrap_or(i64::MAX),
            last: None,
        }
    }

    /// Decide whether `sample` should be handed to the publisher.
    pub fn admit(&mut self, sample: &Position) -> bool {
        if let Some(last) = &self.last {
            let elapsed = sample.timestamp().saturating_sub(last.timestamp());
            if (0..self.min_interval_ms).contains(&elapsed) {
                return false;
            }
            if last.distance_m(sample) < self.min_distance_m {
                return false;
            }
        }
        self.last = Some(*sample);
        true
    }

    /// The last admitted sample.
    pub fn last(&self) -> Option<&Position> {
        self.last.as_ref()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_bounds() {
        assert!(Position::new(90.0, 180.0, 0).is_ok());
        assert!(Position::new(-90.0, -180.0, 0).is_ok());
        assert_eq!(
            Position::new(90.5, 0.0, 0),
            Err(PositionError::LatitudeOutOfRange(90.5))
        );
        assert_eq!(
            Position::new(0.0, -180.1, 0),
            Err(PositionError::LongitudeOutOfRange(-180.1))
        );
        assert!(Position::new(f64::NAN, 0.0, 0).is_err());
        assert!(Position::new(0.0, f64::INFINITY, 0).is_err());
    }

    #[test]
    fn test_accuracy_validation() {
        let p = Position::new(1.0, 2.0, 3).unwrap();
        assert_eq!(p.with_accuracy(4.5).unwrap().accuracy(), Some(4.5));
        assert!(p.with_accuracy(-1.0).is_err());
        assert!(p.accuracy().is_none());
    }

    #[test]
    fn test_distance_known_values() {
        let a = Position::new(0.0, 0.0, 0).unwrap();
        let b = Position::new(0.0, 1.0, 0).unwrap();
        // One degree of longitude at the equator is ~111.2 km.
        let d = a.distance_m(&b);
        assert!((d - 111_195.0).abs() < 100.0, "distance was {d}");
        assert_eq!(a.distance_m(&a), 0.0);
    }

    #[test]
    fn test_deserialize_rejects_out_of_range() {
        let ok: Position =
            serde_json::from_str(r#"{"latitude":-12.05,"longitude":-77.04,"timestamp":1000}"#).unwrap();
        assert_eq!(ok.coordinates(), (-12.05, -77.04));

        let bad = serde_json::from_str::<Position>(r#"{"latitude":120.0,"longitude":0.0,"timestamp":1}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_gate_first_sample_passes() {
        let mut gate = SampleGate::new(&SamplingConfig::default());
        let p = Position::new(-12.0464, -77.0428, 0).unwrap();
        assert!(gate.admit(&p));
        assert_eq!(gate.last(), Some(&p));
    }

    #[test]
    fn test_gate_interval_and_distance() {
        let mut gate = SampleGate::new(&SamplingConfig {
            min_distance_m: 5.0,
            min_interval_ms: 3000,
        });
        let start = Position::new(-12.0464, -77.0428, 0).unwrap();
        // ~11 m north of start.
        let moved = Position::new(-12.0463, -77.0428, 1000).unwrap();
        let moved_later = Position::new(-12.0463, -77.0428, 3500).unwrap();
        let still = Position::new(-12.0463, -77.0428, 9000).unwrap();

        assert!(gate.admit(&start));
        assert!(!gate.admit(&moved), "too soon");
        assert!(gate.admit(&moved_later));
        assert!(!gate.admit(&still), "did not move");

        gate.reset();
        assert!(gate.admit(&still));
    }

    #[test]
    fn test_gate_after_clock_steps_back() {
        let mut gate = SampleGate::new(&SamplingConfig {
            min_distance_m: 5.0,
            min_interval_ms: 3000,
        });
        assert!(gate.admit(&Position::new(-12.0464, -77.0428, 3_600_000).unwrap()));

        // Clock corrected back by almost an hour; the peer keeps moving.
        let admitted = (1..=300)
            .filter(|i| {
                let sample = Position::new(-12.0464 + *i as f64 * 0.01, -77.0428, *i * 10_000).unwrap();
                gate.admit(&sample)
            })
            .count();
        assert_eq!(admitted, 300);
    }

    #[test]
    fn test_gate_extreme_timestamps() {
        let mut gate = SampleGate::new(&SamplingConfig::default());
        assert!(gate.admit(&Position::new(0.0, 0.0, i64::MIN).unwrap()));
        assert!(gate.admit(&Position::new(1.0, 0.0, i64::MAX).unwrap()));
        assert!(gate.admit(&Position::new(2.0, 0.0, i64::MIN).unwrap()));
        assert!(!gate.admit(&Position::new(3.0, 0.0, i64::MIN + 1).unwrap()), "too soon");
    }

    #[test]
    fn test_gate_huge_interval() {
        let mut gate = SampleGate::new(&SamplingConfig {
            min_distance_m: 0.0,
            min_interval_ms: u64::MAX,
        });
        assert!(gate.admit(&Position::new(0.0, 0.0, 0).unwrap()));
        assert!(!gate.admit(&Position::new(1.0, 0.0, 1_000_000).unwrap()));
    }
}
