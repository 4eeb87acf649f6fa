//! Platform-agnostic types for smart heating thermostat gateways.
//!
//! This crate provides the shared data model used by the device client
//! (smartheat-core), the local queue (smartheat-store) and the gateway
//! service (smartheat-gateway).
//!
//! # Features
//!
//! - Telemetry records and their upload status state machine
//! - Link addressing: deterministic MAC to IPv6 mapping
//! - Weekly heating tables and schedule resolution
//! - Error types for parsing and validation
//!
//! # Example
//!
//! ```
//! use smartheat_types::{DeviceAddress, TelemetryKind, TelemetryRecord, RecordStatus};
//! use time::OffsetDateTime;
//!
//! let address = DeviceAddress::from_mac("2e:ff:ff:00:22:8b")?;
//! let record = TelemetryRecord::new("2e:ff:ff:00:22:8b", OffsetDateTime::now_utc(), TelemetryKind::Temperature, 21.5);
//! assert_eq!(record.status, RecordStatus::New);
//! # Ok::<(), smartheat_types::AddressError>(())
//! ```

pub mod address;
pub mod error;
pub mod schedule;
pub mod types;

pub use address::{DEFAULT_COAP_PORT, DEFAULT_LINK_PREFIX, DeviceAddress, LinkPrefix};
pub use error::{AddressError, ParseError, ScheduleError};
pub use schedule::{HeatingTable, HeatingTableEntry, resolve};
pub use types::{RecordKey, RecordStatus, TelemetryKind, TelemetryRecord, ThermostatRef};
