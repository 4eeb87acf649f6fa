//! Aggregate views of the stored queue.

use core::fmt;

use serde::Serialize;

use smartheat_types::TelemetryKind;

/// Record counts by upload status for one telemetry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindStats {
    /// Telemetry kind.
    pub kind: TelemetryKind,
    /// Records waiting for upload.
    pub new: u64,
    /// Records accepted by the server.
    pub sent: u64,
    /// Records given up on.
    pub error: u64,
    /// Highest attempt count among records still waiting.
    pub max_pending_attempts: u32,
}

impl KindStats {
    /// Total number of records.
    pub fn total(&self) -> u64 {
        self.new + self.sent + self.error
    }
}

impl fmt::Display for KindStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} new, {} sent, {} error (max pending attempts {})",
            self.kind, self.new, self.sent, self.error, self.max_pending_attempts
        )
    }
}
