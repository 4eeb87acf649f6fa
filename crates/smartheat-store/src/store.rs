//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use smartheat_types::{RecordKey, RecordStatus, TelemetryKind, TelemetryRecord};

use crate::error::{Error, Result};
use crate::models::KindStats;
use crate::queries::RecordQuery;
use crate::schema;

/// SQLite-backed telemetry queue.
///
/// Every mutation is a single statement (or a single transaction for
/// batches) on a `synchronous = FULL` connection, so it is on disk once the
/// call returns and readers never see half of it.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // === Appending ===

    /// Append a record as `New` with zero attempts.
    ///
    /// The record's own status and attempts are ignored. A second record with
    /// the same `(mac, timestamp, kind)` fails with [`Error::Duplicate`].
    pub fn append(&self, record: &TelemetryRecord) -> Result<()> {
        insert(&self.conn, record)?;
        debug!("Appended {}", record.key());
        Ok(())
    }

    /// Append several records in one transaction.
    ///
    /// Either every record is stored or, on the first failure, none are.
    pub fn append_batch(&self, records: &[TelemetryRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        for record in records {
            insert(&tx, record)?;
        }
        tx.commit()?;

        debug!("Appended {} records", records.len());
        Ok(records.len())
    }

    // === Reading ===

    /// Records of `kind` still waiting for upload, in insertion order.
    pub fn pending(&self, kind: TelemetryKind) -> Result<Vec<TelemetryRecord>> {
        let (table, column) = schema::table(kind);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT mac, timestamp, {column}, status, attempts, rejections FROM {table}
             WHERE status = ?1 ORDER BY id"
        ))?;

        let records = stmt
            .query_map([RecordStatus::New as i64], |row| row_to_record(row, kind))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Look a record up by its key.
    pub fn get(&self, key: &RecordKey) -> Result<Option<TelemetryRecord>> {
        let (table, column) = schema::table(key.kind);
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT mac, timestamp, {column}, status, attempts, rejections FROM {table}
                     WHERE mac = ?1 AND timestamp = ?2"
                ),
                rusqlite::params![key.mac, to_micros(key.timestamp)],
                |row| row_to_record(row, key.kind),
            )
            .optional()?;

        Ok(record)
    }

    /// Query records with filters.
    pub fn query(&self, query: &RecordQuery) -> Result<Vec<TelemetryRecord>> {
        let (sql, params) = query.build();
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                row_to_record(row, query.kind)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Record counts by status for one kind.
    pub fn stats(&self, kind: TelemetryKind) -> Result<KindStats> {
        let (table, _) = schema::table(kind);
        let (new, sent, error, max_pending_attempts): (i64, i64, i64, i64) = self.conn.query_row(
            &format!(
                "SELECT
                    COALESCE(SUM(status = 0), 0),
                    COALESCE(SUM(status = 1), 0),
                    COALESCE(SUM(status = 2), 0),
                    COALESCE(MAX(CASE WHEN status = 0 THEN attempts END), 0)
                 FROM {table}"
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(KindStats {
            kind,
            new: new as u64,
            sent: sent as u64,
            error: error as u64,
            max_pending_attempts: max_pending_attempts as u32,
        })
    }

    // === Status transitions ===

    /// Mark a pending record as accepted by the server.
    ///
    /// Returns the record's attempt count after this upload.
    pub fn mark_sent(&self, key: &RecordKey) -> Result<u32> {
        self.transition(key, RecordStatus::Sent, false)
            .map(|(attempts, _)| attempts)
    }

    /// Count an upload that could not reach the server; the record stays
    /// pending. Returns the attempt count.
    pub fn mark_retry(&self, key: &RecordKey) -> Result<u32> {
        self.transition(key, RecordStatus::New, false)
            .map(|(attempts, _)| attempts)
    }

    /// Count an upload the server refused; the record stays pending.
    ///
    /// Returns the number of refusals so far.
    pub fn mark_rejected(&self, key: &RecordKey) -> Result<u32> {
        self.transition(key, RecordStatus::New, true)
            .map(|(_, rejections)| rejections)
    }

    /// Count a refused upload and give up on the record. Returns the attempt
    /// count.
    pub fn mark_permanent_error(&self, key: &RecordKey) -> Result<u32> {
        self.transition(key, RecordStatus::Error, true)
            .map(|(attempts, _)| attempts)
    }

    /// Move a `New` record to `status`, counting one attempt and, when
    /// `rejected`, one refusal. Returns both counters after the update.
    fn transition(&self, key: &RecordKey, status: RecordStatus, rejected: bool) -> Result<(u32, u32)> {
        let (table, _) = schema::table(key.kind);
        let now = to_micros(OffsetDateTime::now_utc());

        let counters: Option<(i64, i64)> = self
            .conn
            .query_row(
                &format!(
                    "UPDATE {table}
                     SET status = ?1, attempts = attempts + 1,
                         rejections = rejections + ?2, updated_at = ?3
                     WHERE mac = ?4 AND timestamp = ?5 AND status = ?6
                     RETURNING attempts, rejections"
                ),
                rusqlite::params![
                    status as i64,
                    i64::from(rejected),
                    now,
                    key.mac,
                    to_micros(key.timestamp),
                    RecordStatus::New as i64
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match counters {
            Some((attempts, rejections)) => {
                debug!(
                    "{} -> {} (attempts {}, rejections {})",
                    key, status, attempts, rejections
                );
                Ok((attempts as u32, rejections as u32))
            }
            None => match self.get(key)? {
                Some(record) => Err(Error::NotPending {
                    key: key.to_string(),
                    status: record.status,
                }),
                None => Err(Error::RecordNotFound(key.to_string())),
            },
        }
    }
}

fn insert(conn: &Connection, record: &TelemetryRecord) -> Result<()> {
    let (table, column) = schema::table(record.kind);
    let result = conn.execute(
        &format!(
            "INSERT INTO {table} (mac, timestamp, {column}, status, attempts)
             VALUES (?1, ?2, ?3, ?4, 0)"
        ),
        rusqlite::params![
            record.mac,
            to_micros(record.timestamp),
            f64::from(record.value),
            RecordStatus::New as i64
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(Error::Duplicate(record.key().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn row_to_record(row: &Row<'_>, kind: TelemetryKind) -> rusqlite::Result<TelemetryRecord> {
    let micros: i64 = row.get(1)?;
    let value: f64 = row.get(2)?;
    let status: i64 = row.get(3)?;
    let attempts: i64 = row.get(4)?;
    let rejections: i64 = row.get(5)?;

    let timestamp = from_micros(micros).map_err(|e| conversion_failure(1, e))?;
    let status = RecordStatus::try_from(status).map_err(|e| conversion_failure(3, e))?;

    Ok(TelemetryRecord {
        mac: row.get(0)?,
        timestamp,
        value: value as f32,
        kind,
        status,
        attempts: attempts as u32,
        rejections: rejections as u32,
    })
}

fn conversion_failure<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Integer, Box::new(err))
}

/// Timestamps are stored as unix microseconds.
fn to_micros(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000) as i64
}

fn from_micros(micros: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| Error::InvalidTimestamp(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const MAC: &str = "2e:ff:ff:00:22:8b";

    fn temperature(minute: u8, value: f32) -> TelemetryRecord {
        let ts = datetime!(2024-03-04 09:00 UTC) + time::Duration::minutes(i64::from(minute));
        TelemetryRecord::temperature(MAC, ts, value)
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.pending(TelemetryKind::Temperature).unwrap().is_empty());
        assert!(store.pending(TelemetryKind::Rssi).unwrap().is_empty());
    }

    #[test]
    fn test_append_then_pending() {
        let store = Store::open_in_memory().unwrap();
        let record = temperature(0, 21.5);
        store.append(&record).unwrap();

        let pending = store.pending(TelemetryKind::Temperature).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mac, MAC);
        assert_eq!(pending[0].timestamp, record.timestamp);
        assert_eq!(pending[0].value, 21.5);
        assert_eq!(pending[0].status, RecordStatus::New);
        assert_eq!(pending[0].attempts, 0);

        // Kinds live in separate tables.
        assert!(store.pending(TelemetryKind::Rssi).unwrap().is_empty());
    }

    #[test]
    fn test_append_ignores_caller_status() {
        let store = Store::open_in_memory().unwrap();
        let mut record = temperature(0, 20.0);
        record.status = RecordStatus::Sent;
        record.attempts = 4;
        store.append(&record).unwrap();

        let stored = store.get(&record.key()).unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::New);
        assert_eq!(stored.attempts, 0);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.append(&temperature(0, 21.0)).unwrap();

        let err = store.append(&temperature(0, 22.0)).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.pending(TelemetryKind::Temperature).unwrap().len(), 1);

        // Same instant, other kind: not a duplicate.
        let rssi = TelemetryRecord::rssi(MAC, temperature(0, 0.0).timestamp, -70.0);
        store.append(&rssi).unwrap();
    }

    #[test]
    fn test_pending_is_insertion_ordered() {
        let store = Store::open_in_memory().unwrap();
        // Inserted out of timestamp order.
        store.append(&temperature(5, 1.0)).unwrap();
        store.append(&temperature(1, 2.0)).unwrap();
        store.append(&temperature(3, 3.0)).unwrap();

        let values: Vec<f32> = store
            .pending(TelemetryKind::Temperature)
            .unwrap()
            .into_iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_append_batch_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        store.append(&temperature(2, 0.0)).unwrap();

        let batch = vec![temperature(1, 1.0), temperature(2, 2.0), temperature(3, 3.0)];
        let err = store.append_batch(&batch).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.pending(TelemetryKind::Temperature).unwrap().len(), 1);

        let batch = vec![temperature(4, 4.0), temperature(5, 5.0)];
        assert_eq!(store.append_batch(&batch).unwrap(), 2);
        assert_eq!(store.pending(TelemetryKind::Temperature).unwrap().len(), 3);
        assert_eq!(store.append_batch(&[]).unwrap(), 0);
    }

    #[test]
    fn test_mark_retry_keeps_record_pending() {
        let store = Store::open_in_memory().unwrap();
        let record = temperature(0, 21.0);
        store.append(&record).unwrap();

        for expected in 1..=3 {
            assert_eq!(store.mark_retry(&record.key()).unwrap(), expected);
        }

        let pending = store.pending(TelemetryKind::Temperature).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 3);
        assert_eq!(pending[0].status, RecordStatus::New);
    }

    #[test]
    fn test_mark_permanent_error_leaves_pending() {
        let store = Store::open_in_memory().unwrap();
        let record = temperature(0, 21.0);
        store.append(&record).unwrap();

        for _ in 0..4 {
            store.mark_retry(&record.key()).unwrap();
        }
        assert_eq!(store.mark_permanent_error(&record.key()).unwrap(), 5);

        assert!(store.pending(TelemetryKind::Temperature).unwrap().is_empty());
        let stored = store.get(&record.key()).unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Error);
        assert_eq!(stored.attempts, 5);
    }

    #[test]
    fn test_rejections_counted_apart_from_attempts() {
        let store = Store::open_in_memory().unwrap();
        let record = temperature(0, 21.0);
        store.append(&record).unwrap();

        store.mark_retry(&record.key()).unwrap();
        store.mark_retry(&record.key()).unwrap();
        assert_eq!(store.mark_rejected(&record.key()).unwrap(), 1);
        assert_eq!(store.mark_rejected(&record.key()).unwrap(), 2);

        let pending = store.pending(TelemetryKind::Temperature).unwrap();
        assert_eq!(pending[0].status, RecordStatus::New);
        assert_eq!(pending[0].attempts, 4);
        assert_eq!(pending[0].rejections, 2);

        store.mark_permanent_error(&record.key()).unwrap();
        let stored = store.get(&record.key()).unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Error);
        assert_eq!((stored.attempts, stored.rejections), (5, 3));
    }

    #[test]
    fn test_non_finite_value_is_not_a_duplicate() {
        let store = Store::open_in_memory().unwrap();
        let ts = datetime!(2024-03-04 09:00 UTC);

        let err = store
            .append(&TelemetryRecord::rssi(MAC, ts, f32::NAN))
            .unwrap_err();
        assert!(!err.is_duplicate());
        assert!(matches!(err, Error::Database(_)));
        assert!(store.pending(TelemetryKind::Rssi).unwrap().is_empty());

        store.append(&TelemetryRecord::rssi(MAC, ts, -70.0)).unwrap();
    }

    #[test]
    fn test_mark_sent_is_terminal() {
        let store = Store::open_in_memory().unwrap();
        let record = temperature(0, 21.0);
        store.append(&record).unwrap();

        assert_eq!(store.mark_sent(&record.key()).unwrap(), 1);
        assert!(store.pending(TelemetryKind::Temperature).unwrap().is_empty());

        match store.mark_retry(&record.key()) {
            Err(Error::NotPending { status, .. }) => assert_eq!(status, RecordStatus::Sent),
            other => panic!("expected NotPending, got {:?}", other),
        }
        assert_eq!(store.get(&record.key()).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn test_transition_unknown_record() {
        let store = Store::open_in_memory().unwrap();
        let err = store.mark_sent(&temperature(0, 0.0).key()).unwrap_err();
        assert!(matches!(err, Error::RecordNotFound(_)));
    }

    #[test]
    fn test_query_and_stats() {
        let store = Store::open_in_memory().unwrap();
        let records: Vec<_> = (0..4).map(|i| temperature(i, f32::from(i))).collect();
        store.append_batch(&records).unwrap();
        store
            .append(&TelemetryRecord::temperature(
                "aa:bb:cc:dd:ee:ff",
                records[0].timestamp,
                18.0,
            ))
            .unwrap();

        store.mark_sent(&records[0].key()).unwrap();
        store.mark_permanent_error(&records[1].key()).unwrap();
        store.mark_retry(&records[2].key()).unwrap();
        store.mark_retry(&records[2].key()).unwrap();

        let stats = store.stats(TelemetryKind::Temperature).unwrap();
        assert_eq!(stats.new, 3);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.total(), 5);
        assert_eq!(stats.max_pending_attempts, 2);

        let mine = store
            .query(&RecordQuery::new(TelemetryKind::Temperature).mac(MAC))
            .unwrap();
        assert_eq!(mine.len(), 4);
        assert_eq!(mine[0].value, 3.0);

        let failed = store
            .query(&RecordQuery::new(TelemetryKind::Temperature).status(RecordStatus::Error))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].value, 1.0);

        let oldest = store
            .query(&RecordQuery::new(TelemetryKind::Temperature).oldest_first().limit(1))
            .unwrap();
        assert_eq!(oldest[0].value, 0.0);

        let empty = store.stats(TelemetryKind::Rssi).unwrap();
        assert_eq!(empty.total(), 0);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("heating.db");
        let record = temperature(0, 19.5);

        {
            let store = Store::open(&path).unwrap();
            store.append(&record).unwrap();
            store.mark_retry(&record.key()).unwrap();
        }

        let store = Store::open(&path).unwrap();
        let pending = store.pending(TelemetryKind::Temperature).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
    }
}
