//! Table layout and forward migrations.
//!
//! Each telemetry kind has its own table. Timestamps are unix microseconds
//! and the row id gives the insertion order. Migrations are applied in order,
//! each in its own transaction together with the version bump, so an
//! interrupted upgrade resumes from the last completed step.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use smartheat_types::TelemetryKind;

use crate::error::Result;

/// Schema version written by this build.
pub const SCHEMA_VERSION: i32 = 3;

/// Table and value column holding records of `kind`.
pub(crate) fn table(kind: TelemetryKind) -> (&'static str, &'static str) {
    match kind {
        TelemetryKind::Temperature => ("heating_temperature", "temperature"),
        TelemetryKind::Rssi => ("heating_rssi", "rssi"),
    }
}

type Migration = fn(&Connection) -> Result<()>;

/// `MIGRATIONS[n]` upgrades a database from version `n` to `n + 1`.
const MIGRATIONS: [Migration; SCHEMA_VERSION as usize] =
    [create_tables, track_status_changes, count_rejections];

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );",
    )?;

    let current = schema_version(conn)?;
    if current > 0 && current < SCHEMA_VERSION {
        info!("Upgrading telemetry store from v{} to v{}", current, SCHEMA_VERSION);
    }

    for (from, migration) in MIGRATIONS.iter().enumerate().skip(current.max(0) as usize) {
        let tx = conn.unchecked_transaction()?;
        migration(&tx)?;
        tx.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            [from as i32 + 1],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Version recorded in the database; 0 for a fresh one.
fn schema_version(conn: &Connection) -> Result<i32> {
    let version = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// v1: one queue table per kind, unique per `(mac, timestamp)`.
fn create_tables(conn: &Connection) -> Result<()> {
    for kind in TelemetryKind::ALL {
        let (table, column) = table(kind);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mac TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                {column} REAL NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                UNIQUE(mac, timestamp)
            );"
        ))?;
    }
    Ok(())
}

/// v2: record when a row last changed status, and index the pending scan.
fn track_status_changes(conn: &Connection) -> Result<()> {
    for kind in TelemetryKind::ALL {
        let (table, _) = table(kind);
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN updated_at INTEGER;
             CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status, id);"
        ))?;
    }
    Ok(())
}

/// v3: refused uploads are counted apart from connectivity failures.
fn count_rejections(conn: &Connection) -> Result<()> {
    for kind in TelemetryKind::ALL {
        let (table, _) = table(kind);
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN rejections INTEGER NOT NULL DEFAULT 0;"
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        conn.prepare(&format!("PRAGMA table_info({})", table))
            .unwrap()
            .query_map([], |row| row.get(1))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        for kind in TelemetryKind::ALL {
            let (table, column) = table(kind);
            let columns = columns(&conn, table);
            assert!(columns.contains(&column.to_string()));
            assert!(columns.contains(&"updated_at".to_string()));
            assert!(columns.contains(&"rejections".to_string()));
        }
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL);
             INSERT INTO schema_version (id, version) VALUES (1, 1);",
        )
        .unwrap();
        create_tables(&conn).unwrap();
        conn.execute(
            "INSERT INTO heating_temperature (mac, timestamp, temperature) VALUES ('aa', 1, 20.0)",
            [],
        )
        .unwrap();

        initialize(&conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(columns(&conn, "heating_temperature").contains(&"updated_at".to_string()));
        let (count, rejections): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(rejections) FROM heating_temperature",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((count, rejections), (1, 0));
    }
}
