//! Durable local telemetry queue for smart heating gateways.
//!
//! Readings polled from thermostats are appended here before anything tries
//! to upload them, and only leave the `New` state once the server accepted
//! them or the upload was given up on. Records are never deleted.
//!
//! # Example
//!
//! ```
//! use smartheat_store::Store;
//! use smartheat_types::{TelemetryKind, TelemetryRecord};
//! use time::OffsetDateTime;
//!
//! let store = Store::open_in_memory()?;
//! let record = TelemetryRecord::temperature("2e:ff:ff:00:22:8b", OffsetDateTime::now_utc(), 21.5);
//! store.append(&record)?;
//!
//! for pending in store.pending(TelemetryKind::Temperature)? {
//!     store.mark_sent(&pending.key())?;
//! }
//! # Ok::<(), smartheat_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::KindStats;
pub use queries::RecordQuery;
pub use schema::SCHEMA_VERSION;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/smartheat/heating.db`
/// - macOS: `~/Library/Application Support/smartheat/heating.db`
/// - Windows: `C:\Users\<user>\AppData\Local\smartheat\heating.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("smartheat")
        .join("heating.db")
}
