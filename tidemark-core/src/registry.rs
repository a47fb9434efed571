//! Content registry: every discovered version of every landed file.
//!
//! Identity is `(file_path, content_hash)`. Rows are never deleted; a new
//! version of a path supersedes the older usable version instead, so at
//! most one `pending`/`processed` row exists per path.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::scanner::ScannedFile;
use crate::storage::{
    Storage, collect_rows, opt_ts_column, parse_column, parse_opt_column, ts_column,
};
use crate::types::{FileRecord, FileStatus, format_ts};

const SELECT_FILE: &str = "SELECT source_id, file_path, content_hash, file_size,
        coverage_start, coverage_end, grain, discovered_at, processed_at,
        status, run_id, notes
    FROM ingest_manifest";

/// Outcome of one registration batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    /// New `pending` versions.
    pub inserted: usize,
    /// Identities already registered, left untouched.
    pub unchanged: usize,
    /// Older versions moved to `superseded` by this batch.
    pub superseded: usize,
    /// Superseded versions brought back because the file reverted to them.
    pub revived: usize,
    /// New `failed` rows.
    pub failed: usize,
    /// `(file_path, content_hash)` of every newly inserted or revived version.
    pub new_versions: Vec<(String, String)>,
}

impl RegistrationResult {
    pub fn changed(&self) -> bool {
        self.inserted + self.superseded + self.revived + self.failed > 0
    }
}

pub(crate) fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let file_size: i64 = row.get(3)?;
    Ok(FileRecord {
        source_id: row.get(0)?,
        file_path: row.get(1)?,
        content_hash: row.get(2)?,
        file_size: u64::try_from(file_size).unwrap_or(0),
        coverage_start: row.get(4)?,
        coverage_end: row.get(5)?,
        grain: parse_opt_column(row, 6)?,
        discovered_at: ts_column(row, 7)?,
        processed_at: opt_ts_column(row, 8)?,
        status: parse_column(row, 9)?,
        run_id: row.get(10)?,
        notes: row.get(11)?,
    })
}

pub(crate) fn get_file(
    conn: &Connection,
    file_path: &str,
    content_hash: &str,
) -> std::result::Result<Option<FileRecord>, StorageError> {
    let sql = format!("{SELECT_FILE} WHERE file_path = ?1 AND content_hash = ?2");
    Ok(conn
        .query_row(&sql, params![file_path, content_hash], file_from_row)
        .optional()?)
}

fn insert_file(
    conn: &Connection,
    file: &ScannedFile,
    status: FileStatus,
    now: &DateTime<Utc>,
) -> std::result::Result<(), StorageError> {
    conn.execute(
        "INSERT INTO ingest_manifest (
            source_id, file_path, content_hash, file_size, coverage_start,
            coverage_end, grain, discovered_at, processed_at, status, run_id, notes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, NULL, ?10)",
        params![
            file.source_id,
            file.file_path,
            file.content_hash,
            i64::try_from(file.file_size).unwrap_or(i64::MAX),
            file.coverage_start,
            file.coverage_end,
            file.grain.map(|g| g.as_str()),
            format_ts(now),
            status.as_str(),
            file.error,
        ],
    )?;
    Ok(())
}

/// Supersede every usable version of `file_path` other than `keep_hash`.
fn supersede_others(
    conn: &Connection,
    file_path: &str,
    keep_hash: &str,
) -> std::result::Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE ingest_manifest SET status = 'superseded'
         WHERE file_path = ?1 AND content_hash <> ?2
           AND status IN ('pending', 'processed')",
        params![file_path, keep_hash],
    )?)
}

/// Apply a scanned batch inside the caller's transaction.
pub(crate) fn register_in(
    conn: &Connection,
    files: &[ScannedFile],
    now: &DateTime<Utc>,
) -> std::result::Result<RegistrationResult, StorageError> {
    let mut result = RegistrationResult::default();

    for file in files {
        let existing = get_file(conn, &file.file_path, &file.content_hash)?;

        if let Some(reason) = &file.error {
            match existing {
                Some(_) => result.unchanged += 1,
                None => {
                    insert_file(conn, file, FileStatus::Failed, now)?;
                    result.failed += 1;
                    warn!(path = %file.file_path, reason = %reason, "Registered failed file");
                }
            }
            continue;
        }

        match existing {
            Some(record) if record.status == FileStatus::Superseded => {
                conn.execute(
                    "UPDATE ingest_manifest
                     SET status = 'pending', discovered_at = ?3, processed_at = NULL,
                         run_id = NULL, notes = 'revived'
                     WHERE file_path = ?1 AND content_hash = ?2",
                    params![file.file_path, file.content_hash, format_ts(now)],
                )?;
                result.superseded += supersede_others(conn, &file.file_path, &file.content_hash)?;
                result.revived += 1;
                result
                    .new_versions
                    .push((file.file_path.clone(), file.content_hash.clone()));
                debug!(path = %file.file_path, hash = %file.content_hash, "Revived file version");
            }
            Some(_) => result.unchanged += 1,
            None => {
                insert_file(conn, file, FileStatus::Pending, now)?;
                result.superseded += supersede_others(conn, &file.file_path, &file.content_hash)?;
                result.inserted += 1;
                result
                    .new_versions
                    .push((file.file_path.clone(), file.content_hash.clone()));
                debug!(path = %file.file_path, hash = %file.content_hash, "Registered new file version");
            }
        }
    }

    Ok(result)
}

/// Latest usable version per path whose status is still `pending`.
pub(crate) fn latest_pending(
    conn: &Connection,
) -> std::result::Result<Vec<FileRecord>, StorageError> {
    let sql = "SELECT source_id, file_path, content_hash, file_size,
            coverage_start, coverage_end, grain, discovered_at, processed_at,
            status, run_id, notes
        FROM (
            SELECT m.*, ROW_NUMBER() OVER (
                PARTITION BY file_path ORDER BY discovered_at DESC, rowid DESC
            ) AS rn
            FROM ingest_manifest m
            WHERE status IN ('pending', 'processed')
        )
        WHERE rn = 1 AND status = 'pending'
        ORDER BY file_path";
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], file_from_row)?;
    collect_rows(rows)
}

pub(crate) fn mark_failed(
    conn: &Connection,
    file_path: &str,
    content_hash: &str,
    reason: &str,
) -> std::result::Result<(), StorageError> {
    conn.execute(
        "UPDATE ingest_manifest SET status = 'failed', notes = ?3
         WHERE file_path = ?1 AND content_hash = ?2",
        params![file_path, content_hash, reason],
    )?;
    Ok(())
}

/// Mark a pending version processed by `run_id`. Returns whether it changed.
pub(crate) fn mark_processed(
    conn: &Connection,
    file_path: &str,
    content_hash: &str,
    run_id: &str,
    now: &DateTime<Utc>,
) -> std::result::Result<bool, StorageError> {
    let changed = conn.execute(
        "UPDATE ingest_manifest SET status = 'processed', processed_at = ?4, run_id = ?3
         WHERE file_path = ?1 AND content_hash = ?2 AND status = 'pending'",
        params![file_path, content_hash, run_id, format_ts(now)],
    )?;
    Ok(changed > 0)
}

/// Registry operations over a [`Storage`].
pub struct Registry<'a> {
    storage: &'a Storage,
}

impl<'a> Registry<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Register a scanned batch in a single transaction.
    ///
    /// Repeating an identical batch is a no-op. Any storage failure rolls the
    /// entire batch back.
    pub fn register_scan(&self, files: &[ScannedFile]) -> Result<RegistrationResult> {
        let now = Utc::now();
        let result = self
            .storage
            .transaction(|conn| register_in(conn, files, &now))?;
        info!(
            files = files.len(),
            inserted = result.inserted,
            unchanged = result.unchanged,
            superseded = result.superseded,
            revived = result.revived,
            failed = result.failed,
            "Registered scan batch"
        );
        Ok(result)
    }

    pub fn get(&self, file_path: &str, content_hash: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .storage
            .read(|conn| get_file(conn, file_path, content_hash))?)
    }

    /// Every registered version of a path, oldest first.
    pub fn versions(&self, file_path: &str) -> Result<Vec<FileRecord>> {
        let records = self.storage.read(|conn| {
            let sql = format!("{SELECT_FILE} WHERE file_path = ?1 ORDER BY discovered_at, rowid");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([file_path], file_from_row)?;
            collect_rows(rows)
        })?;
        Ok(records)
    }

    pub fn by_status(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        let records = self.storage.read(|conn| {
            let sql = format!("{SELECT_FILE} WHERE status = ?1 ORDER BY file_path, discovered_at");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([status.as_str()], file_from_row)?;
            collect_rows(rows)
        })?;
        Ok(records)
    }

    pub fn latest_pending(&self) -> Result<Vec<FileRecord>> {
        Ok(self.storage.read(latest_pending)?)
    }
}
