//! Fundamental types shared across the control plane.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A published or staged row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Technical column holding the row fingerprint.
pub const ROW_HASH_COLUMN: &str = "_row_hash";
/// Technical column holding the run that published the row.
pub const RUN_ID_COLUMN: &str = "_run_id";
/// Technical column holding the partition key in entity tables.
pub const PARTITION_KEY_COLUMN: &str = "_partition_key";

/// Partitioning granularity of an entity's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grain {
    Year,
    Month,
}

impl Grain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grain::Year => "year",
            Grain::Month => "month",
        }
    }
}

impl fmt::Display for Grain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(Grain::Year),
            "month" => Ok(Grain::Month),
            other => Err(format!("unknown grain '{other}' (expected 'year' or 'month')")),
        }
    }
}

/// Lifecycle status of a registered file version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Processed,
    Failed,
    Superseded,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processed => "processed",
            FileStatus::Failed => "failed",
            FileStatus::Superseded => "superseded",
        }
    }

    /// Pending and processed versions are the ones a rebuild may read.
    pub fn is_usable(&self) -> bool {
        matches!(self, FileStatus::Pending | FileStatus::Processed)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "processed" => Ok(FileStatus::Processed),
            "failed" => Ok(FileStatus::Failed),
            "superseded" => Ok(FileStatus::Superseded),
            other => Err(format!("unknown file status '{other}'")),
        }
    }
}

/// Rebuild status of an (entity, partition_key) target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyStatus {
    Dirty,
    Rebuilding,
    Clean,
}

impl DirtyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyStatus::Dirty => "dirty",
            DirtyStatus::Rebuilding => "rebuilding",
            DirtyStatus::Clean => "clean",
        }
    }

    /// Still owes a rebuild.
    pub fn is_active(&self) -> bool {
        !matches!(self, DirtyStatus::Clean)
    }
}

impl fmt::Display for DirtyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirtyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dirty" => Ok(DirtyStatus::Dirty),
            "rebuilding" => Ok(DirtyStatus::Rebuilding),
            "clean" => Ok(DirtyStatus::Clean),
            other => Err(format!("unknown dirty status '{other}'")),
        }
    }
}

/// One registered version of a discovered file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub source_id: String,
    pub file_path: String,
    pub content_hash: String,
    pub file_size: u64,
    pub coverage_start: Option<String>,
    pub coverage_end: Option<String>,
    pub grain: Option<Grain>,
    pub discovered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: FileStatus,
    pub run_id: Option<String>,
    pub notes: Option<String>,
}

/// Append-only link from a file version to one partition of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionLink {
    pub file_path: String,
    pub content_hash: String,
    pub entity: String,
    pub partition_key: String,
    pub route_id: String,
}

/// Rebuild bookkeeping for one (entity, partition_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirtyPartition {
    pub entity: String,
    pub partition_key: String,
    pub status: DirtyStatus,
    pub reason: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Run holding the `rebuilding` claim, if any.
    pub claimed_by: Option<String>,
}

/// Render a timestamp the way it is stored: RFC 3339, UTC, microseconds.
///
/// The fixed width keeps lexicographic order equal to chronological order,
/// which the planner and the commit log rely on.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
