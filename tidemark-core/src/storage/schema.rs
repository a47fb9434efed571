//! Schema migrations tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Highest schema version this build knows how to open.
pub const SCHEMA_VERSION: i64 = 1;

pub fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the control-plane tables up to [`SCHEMA_VERSION`].
pub fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current < 1 {
        conn.execute_batch(include_str!("../../migrations/0001_control_plane.sql"))?;
        conn.execute("PRAGMA user_version = 1", [])?;
        info!(version = 1, "Applied control-plane schema migration");
    }

    Ok(())
}
