//! Dirty-partition tracker.
//!
//! A key moves `dirty -> rebuilding -> clean`, or back to `dirty` when a
//! rebuild fails. Partial unique indexes keep at most one `dirty` and one
//! `rebuilding` row per (entity, partition_key); `clean` rows are history.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::storage::{Storage, collect_rows, parse_column, ts_column};
use crate::types::{DirtyPartition, DirtyStatus, format_ts};

const SELECT_DIRTY: &str = "SELECT entity, partition_key, status, reason,
        first_seen_at, last_seen_at, claimed_by
    FROM dirty_partitions";

fn dirty_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirtyPartition> {
    Ok(DirtyPartition {
        entity: row.get(0)?,
        partition_key: row.get(1)?,
        status: parse_column(row, 2)?,
        reason: row.get(3)?,
        first_seen_at: ts_column(row, 4)?,
        last_seen_at: ts_column(row, 5)?,
        claimed_by: row.get(6)?,
    })
}

fn active_row(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
    status: DirtyStatus,
) -> std::result::Result<Option<DirtyPartition>, StorageError> {
    let sql = format!("{SELECT_DIRTY} WHERE entity = ?1 AND partition_key = ?2 AND status = ?3");
    Ok(conn
        .query_row(
            &sql,
            params![entity, partition_key, status.as_str()],
            dirty_from_row,
        )
        .optional()?)
}

/// Mark a key dirty. Returns `true` when a new dirty row was created and
/// `false` when an existing one was refreshed.
pub(crate) fn mark_dirty_in(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
    reason: &str,
    now: &DateTime<Utc>,
) -> std::result::Result<bool, StorageError> {
    let ts = format_ts(now);
    let refreshed = conn.execute(
        "UPDATE dirty_partitions SET last_seen_at = ?3, reason = ?4
         WHERE entity = ?1 AND partition_key = ?2 AND status = 'dirty'",
        params![entity, partition_key, ts, reason],
    )?;
    if refreshed > 0 {
        debug!(entity, partition_key, "Refreshed dirty partition");
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO dirty_partitions
            (entity, partition_key, status, reason, first_seen_at, last_seen_at, claimed_by)
         VALUES (?1, ?2, 'dirty', ?3, ?4, ?4, NULL)",
        params![entity, partition_key, reason, ts],
    )?;
    debug!(entity, partition_key, reason, "Marked partition dirty");
    Ok(true)
}

/// Whether the key has a `dirty` or `rebuilding` row.
pub(crate) fn is_active_in(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
) -> std::result::Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dirty_partitions
         WHERE entity = ?1 AND partition_key = ?2 AND status IN ('dirty', 'rebuilding')",
        params![entity, partition_key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Claim a dirty key for `run_id` (dirty -> rebuilding).
pub(crate) fn claim_in(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
    run_id: &str,
) -> std::result::Result<DirtyPartition, StorageError> {
    if let Some(current) = active_row(conn, entity, partition_key, DirtyStatus::Rebuilding)? {
        let holder = current.claimed_by.unwrap_or_else(|| "unknown".to_string());
        return Err(StorageError::conflict(
            entity,
            partition_key,
            format!("already being rebuilt by run {holder}"),
        ));
    }
    let claimed = conn.execute(
        "UPDATE dirty_partitions SET status = 'rebuilding', claimed_by = ?3
         WHERE entity = ?1 AND partition_key = ?2 AND status = 'dirty'",
        params![entity, partition_key, run_id],
    )?;
    if claimed == 0 {
        return Err(StorageError::NotDirty {
            entity: entity.to_string(),
            partition_key: partition_key.to_string(),
        });
    }
    active_row(conn, entity, partition_key, DirtyStatus::Rebuilding)?.ok_or_else(|| {
        StorageError::conflict(entity, partition_key, "claim vanished after update")
    })
}

/// Revert `run_id`'s claim to dirty. Returns `false` if the run held no claim.
///
/// If new input re-dirtied the key while it was rebuilding, the claim is
/// folded into that dirty row.
pub(crate) fn release_in(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
    run_id: &str,
    reason: &str,
    now: &DateTime<Utc>,
) -> std::result::Result<bool, StorageError> {
    let Some(claim) = active_row(conn, entity, partition_key, DirtyStatus::Rebuilding)? else {
        return Ok(false);
    };
    if claim.claimed_by.as_deref() != Some(run_id) {
        return Ok(false);
    }

    let ts = format_ts(now);
    if active_row(conn, entity, partition_key, DirtyStatus::Dirty)?.is_some() {
        conn.execute(
            "DELETE FROM dirty_partitions
             WHERE entity = ?1 AND partition_key = ?2 AND status = 'rebuilding'",
            params![entity, partition_key],
        )?;
        conn.execute(
            "UPDATE dirty_partitions SET reason = ?3, last_seen_at = ?4
             WHERE entity = ?1 AND partition_key = ?2 AND status = 'dirty'",
            params![entity, partition_key, reason, ts],
        )?;
    } else {
        conn.execute(
            "UPDATE dirty_partitions
             SET status = 'dirty', claimed_by = NULL, reason = ?3, last_seen_at = ?4
             WHERE entity = ?1 AND partition_key = ?2 AND status = 'rebuilding'",
            params![entity, partition_key, reason, ts],
        )?;
    }
    Ok(true)
}

/// Finish `run_id`'s claim (rebuilding -> clean).
///
/// No claim at all is a no-op returning `false`; a claim held by another run
/// is a conflict.
pub(crate) fn mark_clean_in(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
    run_id: &str,
    now: &DateTime<Utc>,
) -> std::result::Result<bool, StorageError> {
    let Some(claim) = active_row(conn, entity, partition_key, DirtyStatus::Rebuilding)? else {
        return Ok(false);
    };
    match claim.claimed_by.as_deref() {
        Some(holder) if holder == run_id => {
            conn.execute(
                "UPDATE dirty_partitions SET status = 'clean', last_seen_at = ?3
                 WHERE entity = ?1 AND partition_key = ?2 AND status = 'rebuilding'",
                params![entity, partition_key, format_ts(now)],
            )?;
            Ok(true)
        }
        holder => Err(StorageError::conflict(
            entity,
            partition_key,
            format!(
                "claim held by run {}, not {run_id}",
                holder.unwrap_or("unknown")
            ),
        )),
    }
}

pub(crate) fn list_in(
    conn: &Connection,
    status: Option<DirtyStatus>,
) -> std::result::Result<Vec<DirtyPartition>, StorageError> {
    let order = "ORDER BY last_seen_at, entity, partition_key, id";
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!("{SELECT_DIRTY} WHERE status = ?1 {order}"))?;
            let rows = stmt.query_map([status.as_str()], dirty_from_row)?;
            collect_rows(rows)
        }
        None => {
            let mut stmt = conn.prepare(&format!("{SELECT_DIRTY} {order}"))?;
            let rows = stmt.query_map([], dirty_from_row)?;
            collect_rows(rows)
        }
    }
}

/// Dirty-partition operations over a [`Storage`].
pub struct DirtyTracker<'a> {
    storage: &'a Storage,
}

impl<'a> DirtyTracker<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub fn mark_dirty(&self, entity: &str, partition_key: &str, reason: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .storage
            .transaction(|conn| mark_dirty_in(conn, entity, partition_key, reason, &now))?)
    }

    /// Claim a dirty partition for a rebuild run.
    ///
    /// Fails with `Conflict` if another run is already rebuilding it and
    /// with `NotDirty` if there is nothing to claim.
    pub fn claim(&self, entity: &str, partition_key: &str, run_id: &str) -> Result<DirtyPartition> {
        let claimed = self
            .storage
            .transaction(|conn| claim_in(conn, entity, partition_key, run_id))?;
        info!(entity, partition_key, run_id, "Claimed partition for rebuild");
        Ok(claimed)
    }

    pub fn release(
        &self,
        entity: &str,
        partition_key: &str,
        run_id: &str,
        reason: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let released = self.storage.transaction(|conn| {
            release_in(conn, entity, partition_key, run_id, reason, &now)
        })?;
        if released {
            info!(entity, partition_key, run_id, reason, "Released claim back to dirty");
        }
        Ok(released)
    }

    pub fn mark_clean(&self, entity: &str, partition_key: &str, run_id: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .storage
            .transaction(|conn| mark_clean_in(conn, entity, partition_key, run_id, &now))?)
    }

    /// Rows with the given status (all rows when `None`), in planning order.
    pub fn list(&self, status: Option<DirtyStatus>) -> Result<Vec<DirtyPartition>> {
        Ok(self.storage.read(|conn| list_in(conn, status))?)
    }

    /// Current `dirty` or `rebuilding` rows for one key.
    pub fn active(&self, entity: &str, partition_key: &str) -> Result<Vec<DirtyPartition>> {
        let rows = self.storage.read(|conn| {
            let mut out = Vec::new();
            for status in [DirtyStatus::Dirty, DirtyStatus::Rebuilding] {
                out.extend(active_row(conn, entity, partition_key, status)?);
            }
            Ok::<_, StorageError>(out)
        })?;
        Ok(rows)
    }
}
