//! Error types for smartheat-types.

use thiserror::Error;

/// Errors that can occur when parsing stored or received thermostat data.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A value could not be interpreted.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Unknown record status code.
    #[error("Unknown record status: {0}")]
    UnknownStatus(i64),

    /// Unknown telemetry kind.
    #[error("Unknown telemetry kind: {0}")]
    UnknownKind(String),
}

/// A MAC address that cannot be mapped to a device address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid MAC address '{mac}': {reason}")]
pub struct AddressError {
    /// The offending input.
    pub mac: String,
    /// Why it was rejected.
    pub reason: String,
}

impl AddressError {
    pub(crate) fn new(mac: &str, reason: impl Into<String>) -> Self {
        Self {
            mac: mac.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by heating table validation and schedule resolution.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The heating table has no entries, so nothing is scheduled.
    #[error("Heating table is empty")]
    Empty,

    /// An entry refers to a day outside 0 (Monday) to 6 (Sunday).
    #[error("Invalid day {0}: expected 0 (Monday) to 6 (Sunday)")]
    InvalidDay(u8),

    /// An entry carries a temperature that is not a finite number.
    #[error("Invalid temperature {0}")]
    InvalidTemperature(f32),
}
