//! Query builder for stored telemetry.
//!
//! # Example
//!
//! ```
//! use smartheat_store::{RecordQuery, Store};
//! use smartheat_types::{RecordStatus, TelemetryKind};
//!
//! let store = Store::open_in_memory()?;
//!
//! // The ten most recent failed uploads for one thermostat.
//! let query = RecordQuery::new(TelemetryKind::Temperature)
//!     .mac("2e:ff:ff:00:22:8b")
//!     .status(RecordStatus::Error)
//!     .limit(10);
//! let records = store.query(&query)?;
//! # Ok::<(), smartheat_store::Error>(())
//! ```

use smartheat_types::{RecordStatus, TelemetryKind};

use rusqlite::types::Value;

use crate::schema;

/// Selects stored records for [`Store::query`](crate::Store::query).
///
/// Without filters every record of the kind is returned, newest first.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    /// Telemetry kind (selects the table).
    pub kind: TelemetryKind,
    /// Filter by thermostat MAC.
    pub mac: Option<String>,
    /// Filter by upload status.
    pub status: Option<RecordStatus>,
    /// Row cap.
    pub limit: Option<u32>,
    /// Most recently inserted first.
    pub newest_first: bool,
}

impl RecordQuery {
    /// Create a query over records of `kind`.
    pub fn new(kind: TelemetryKind) -> Self {
        Self {
            kind,
            mac: None,
            status: None,
            limit: None,
            newest_first: true,
        }
    }

    /// Filter by thermostat MAC.
    pub fn mac(mut self, mac: &str) -> Self {
        self.mac = Some(mac.to_string());
        self
    }

    /// Filter by upload status.
    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Return at most `limit` records.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return records in insertion order.
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// SQL text and positional parameters for this query.
    pub(crate) fn build(&self) -> (String, Vec<Value>) {
        let (table, column) = schema::table(self.kind);
        let mut sql = format!("SELECT mac, timestamp, {column}, status, attempts, rejections FROM {table}");
        let mut params = Vec::new();

        let filters = [
            ("mac", self.mac.clone().map(Value::Text)),
            ("status", self.status.map(|s| Value::Integer(s as i64))),
        ];
        for (column, value) in filters {
            let Some(value) = value else { continue };
            let keyword = if params.is_empty() { "WHERE" } else { "AND" };
            params.push(value);
            sql += &format!(" {keyword} {column} = ?{}", params.len());
        }

        sql += if self.newest_first {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id ASC"
        };
        if let Some(limit) = self.limit {
            sql += &format!(" LIMIT {limit}");
        }

        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfiltered_lists_newest_first() {
        let (sql, params) = RecordQuery::new(TelemetryKind::Rssi).build();
        assert!(sql.contains("FROM heating_rssi"));
        assert!(sql.contains("rssi"));
        assert!(sql.ends_with("ORDER BY id DESC"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_status_only() {
        let (sql, params) = RecordQuery::new(TelemetryKind::Temperature)
            .status(RecordStatus::Error)
            .build();
        assert!(sql.contains("WHERE status = ?1 ORDER BY"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_filters_are_numbered_in_order() {
        let (sql, params) = RecordQuery::new(TelemetryKind::Temperature)
            .mac("aa:bb:cc:dd:ee:ff")
            .status(RecordStatus::New)
            .limit(5)
            .oldest_first()
            .build();
        assert!(sql.contains("WHERE mac = ?1 AND status = ?2"));
        assert!(sql.contains("ORDER BY id ASC LIMIT 5"));
        assert_eq!(
            params,
            vec![
                Value::Text("aa:bb:cc:dd:ee:ff".to_string()),
                Value::Integer(RecordStatus::New as i64),
            ]
        );
    }
}
