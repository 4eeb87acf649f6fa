//! Sync gateway for smart heating thermostats.
//!
//! This crate keeps a set of low-power thermostats in line with the heating
//! schedules published by the server:
//! - Polls every configured thermostat for temperature and signal strength
//! - Buffers readings in the local store until the server accepts them
//! - Switches thermostats to the scheduled mode and target temperature
//! - Refreshes the thermostat list and heating tables from the server
//!
//! # Configuration
//!
//! The gateway reads `~/.config/smartheat/gateway.toml`; every field has a
//! default:
//!
//! ```toml
//! thermostats_path = "~/.local/share/smartheat/thermostats.json"
//!
//! [storage]
//! path = "~/.local/share/smartheat/heating.db"
//!
//! [server]
//! url = "http://localhost:8000/"
//! timeout_secs = 10
//!
//! [gateway]
//! mac = "b8:27:eb:12:34:56"
//!
//! [devices]
//! prefix = "fdfd::221"
//! pacing_ms = 3000
//! target_mode = "radio target"
//!
//! [cycle]
//! interval_secs = 300
//! deadline_secs = 240
//! ```

pub mod config;
pub mod directory;
pub mod mock;
pub mod orchestrator;
pub mod server;
pub mod thermostats;
pub mod uploader;

pub use config::{
    Config, ConfigError, CycleConfig, DevicesConfig, GatewayIdentity, ServerConfig,
    StorageConfig, ValidationError,
};
pub use directory::{RefreshError, RefreshReport, refresh};
pub use orchestrator::{
    CycleReport, CycleSettings, DeviceReport, PollResult, Sample, StepOutcome, SyncOrchestrator,
};
pub use server::{Directory, HttpServer, LinkedThermostat, ServerError, UploadError, Uploader};
pub use thermostats::{
    FileThermostatConfig, MemoryThermostatConfig, ThermostatConfig, ThermostatsError,
};
pub use uploader::{MAX_UPLOAD_ATTEMPTS, SyncReport, UploadSynchronizer};
