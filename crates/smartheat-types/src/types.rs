//! Core types for thermostat telemetry.

use core::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// Reference to a configured thermostat.
///
/// The MAC is kept as received from configuration; it is only parsed when a
/// device address is needed, so one malformed entry never poisons the list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThermostatRef {
    /// Colon-separated hex MAC address.
    pub mac: String,
}

impl ThermostatRef {
    /// Create a reference from a MAC string.
    pub fn new(mac: impl Into<String>) -> Self {
        Self { mac: mac.into() }
    }
}

impl fmt::Display for ThermostatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mac)
    }
}

/// Kind of telemetry captured from a thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TelemetryKind {
    /// Room temperature in degrees Celsius (`/sensors/temperature`).
    Temperature,
    /// Radio signal strength from the heartbeat (`/debug/heartbeat`).
    Rssi,
}

impl TelemetryKind {
    /// Every kind, in the order the gateway polls and uploads them.
    pub const ALL: [TelemetryKind; 2] = [TelemetryKind::Temperature, TelemetryKind::Rssi];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Temperature => "temperature",
            TelemetryKind::Rssi => "rssi",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TelemetryKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(TelemetryKind::Temperature),
            "rssi" | "meta" => Ok(TelemetryKind::Rssi),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Upload status of a stored telemetry record.
///
/// `Sent` and `Error` are terminal: once a record reaches either state it is
/// never uploaded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum RecordStatus {
    /// Waiting to be uploaded.
    New = 0,
    /// Accepted by the server.
    Sent = 1,
    /// Gave up after too many rejected uploads.
    Error = 2,
}

impl RecordStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::New)
    }
}

impl TryFrom<i64> for RecordStatus {
    type Error = ParseError;

    fn try_from(value: i64) -> Result<Self, ParseError> {
        match value {
            0 => Ok(RecordStatus::New),
            1 => Ok(RecordStatus::Sent),
            2 => Ok(RecordStatus::Error),
            other => Err(ParseError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::New => write!(f, "new"),
            RecordStatus::Sent => write!(f, "sent"),
            RecordStatus::Error => write!(f, "error"),
        }
    }
}

/// Natural key of a telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Thermostat MAC address.
    pub mac: String,
    /// Capture time.
    pub timestamp: OffsetDateTime,
    /// Telemetry kind.
    pub kind: TelemetryKind,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}", self.kind, self.mac, self.timestamp)
    }
}

/// A single telemetry measurement and its upload bookkeeping.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TelemetryRecord {
    /// Thermostat MAC address.
    pub mac: String,
    /// When the measurement was captured by the gateway.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Measured value (degrees Celsius or dBm).
    pub value: f32,
    /// What was measured.
    pub kind: TelemetryKind,
    /// Upload status.
    pub status: RecordStatus,
    /// Number of upload attempts made so far.
    pub attempts: u32,
    /// Attempts the server refused. Only these count toward giving up.
    #[cfg_attr(feature = "serde", serde(default))]
    pub rejections: u32,
}

impl TelemetryRecord {
    /// Create a fresh, not yet uploaded record.
    pub fn new(
        mac: impl Into<String>,
        timestamp: OffsetDateTime,
        kind: TelemetryKind,
        value: f32,
    ) -> Self {
        Self {
            mac: mac.into(),
            timestamp,
            value,
            kind,
            status: RecordStatus::New,
            attempts: 0,
            rejections: 0,
        }
    }

    /// Convenience constructor for a temperature reading.
    pub fn temperature(mac: impl Into<String>, timestamp: OffsetDateTime, celsius: f32) -> Self {
        Self::new(mac, timestamp, TelemetryKind::Temperature, celsius)
    }

    /// Convenience constructor for a signal strength reading.
    pub fn rssi(mac: impl Into<String>, timestamp: OffsetDateTime, dbm: f32) -> Self {
        Self::new(mac, timestamp, TelemetryKind::Rssi, dbm)
    }

    /// The `(mac, timestamp, kind)` key identifying this record.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            mac: self.mac.clone(),
            timestamp: self.timestamp,
            kind: self.kind,
        }
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} mac:{} at:{} value:{} status:{} attempts:{}>",
            self.kind, self.mac, self.timestamp, self.value, self.status, self.attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_new_record_defaults() {
        let record = TelemetryRecord::temperature("2e:ff:ff:00:22:8b", datetime!(2024-01-02 09:00 UTC), 21.5);
        assert_eq!(record.status, RecordStatus::New);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.rejections, 0);
        assert_eq!(record.kind, TelemetryKind::Temperature);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RecordStatus::try_from(0), Ok(RecordStatus::New));
        assert_eq!(RecordStatus::try_from(1), Ok(RecordStatus::Sent));
        assert_eq!(RecordStatus::try_from(2), Ok(RecordStatus::Error));
        assert_eq!(RecordStatus::try_from(7), Err(ParseError::UnknownStatus(7)));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RecordStatus::New.is_terminal());
        assert!(RecordStatus::Sent.is_terminal());
        assert!(RecordStatus::Error.is_terminal());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("Temperature".parse::<TelemetryKind>(), Ok(TelemetryKind::Temperature));
        assert_eq!("meta".parse::<TelemetryKind>(), Ok(TelemetryKind::Rssi));
        assert!("humidity".parse::<TelemetryKind>().is_err());
    }

    #[test]
    fn test_record_key() {
        let ts = datetime!(2024-01-02 09:00 UTC);
        let record = TelemetryRecord::rssi("aa:bb:cc:dd:ee:ff", ts, -71.0);
        let key = record.key();
        assert_eq!(key.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(key.timestamp, ts);
        assert_eq!(key.kind, TelemetryKind::Rssi);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_record_serialization() {
        let record = TelemetryRecord::rssi("aa:bb:cc:dd:ee:ff", datetime!(2024-01-02 09:00 UTC), -71.0);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"rssi\""));
        assert!(json.contains("2024-01-02T09:00:00Z"));
    }
}
