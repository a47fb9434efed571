//! Error types for the Tidemark control plane.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering registration, routing, reconciliation, quality gates, storage and
//! configuration. Per-file and per-rule failures are usually carried as data
//! (see [`crate::registry::RegistrationResult`] and
//! [`crate::router::RoutingOutcome`]); the variants here are what propagates.

use std::path::PathBuf;

use crate::quality::QualityReport;

/// Top-level error type for the Tidemark core library.
#[derive(Debug, thiserror::Error)]
pub enum TidemarkError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Quality gate failed: {0}")]
    QualityGate(#[from] QualityGateFailure),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TidemarkError {
    /// Whether the failed operation can be retried as-is.
    ///
    /// Busy/locked storage is a retryable abort; a transaction that observed
    /// it has already been rolled back.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TidemarkError::Storage(e) if e.is_retryable())
    }

    /// Whether the error is a conflict with a concurrent publisher.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TidemarkError::Storage(StorageError::Conflict { .. }))
    }
}

impl From<rusqlite::Error> for TidemarkError {
    fn from(err: rusqlite::Error) -> Self {
        TidemarkError::Storage(StorageError::from(err))
    }
}

/// Errors while fingerprinting or registering a single scanned file.
///
/// These never abort a batch; the scanner records them as `failed` rows.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Failed to read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("Unrecognized coverage token in file name: {name}")]
    UnrecognizedCoverage { name: String },

    #[error("Path is not valid UTF-8: {path}")]
    NonUtf8Path { path: PathBuf },
}

/// Errors while expanding a file into partition links.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("file has no coverage bounds")]
    MissingCoverage,

    #[error("unparsable coverage token '{token}' for {grain} grain")]
    UnparsableBound { token: String, grain: String },

    #[error("coverage start {start} is after end {end}")]
    InvertedRange { start: String, end: String },
}

/// Errors from the change-detection engine. Always fatal for the attempt.
#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("{side} row {index} is missing required column '{column}'")]
    MissingColumn {
        side: &'static str,
        index: usize,
        column: String,
    },

    #[error("Primary key is empty")]
    EmptyPrimaryKey,

    #[error("Duplicate primary key {key} in {side} rows")]
    DuplicateKey { side: &'static str, key: String },
}

/// A quality gate rejected the staged rows. Carries the full report.
#[derive(Debug, thiserror::Error)]
#[error(
    "{entity}/{partition_key}: {} of {} checks failed ({})",
    .report.failed_checks().len(),
    .report.checks.len(),
    .report.failed_names().join(", ")
)]
pub struct QualityGateFailure {
    pub entity: String,
    pub partition_key: String,
    pub report: QualityReport,
}

/// Errors from the storage backend and its transactional brackets.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Database is busy or locked: {message}")]
    Busy { message: String },

    #[error("Conflict on {entity}/{partition_key}: {reason}")]
    Conflict {
        entity: String,
        partition_key: String,
        reason: String,
    },

    #[error("Partition {entity}/{partition_key} is not dirty")]
    NotDirty {
        entity: String,
        partition_key: String,
    },

    #[error("Corrupt value in column {column}: {message}")]
    Corrupt { column: String, message: String },

    #[error("Unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    #[error("Cannot create database directory {path}: {message}")]
    DatabaseDir { path: PathBuf, message: String },
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Busy { .. })
    }

    pub fn conflict(
        entity: impl Into<String>,
        partition_key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StorageError::Conflict {
            entity: entity.into(),
            partition_key: partition_key.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(column: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Corrupt {
            column: column.into(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StorageError::Busy {
                    message: err.to_string(),
                }
            }
            _ => StorageError::Sqlite(err),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid route rule '{route_id}': {reason}")]
    InvalidRule { route_id: String, reason: String },

    #[error("Duplicate route_id: {route_id}")]
    DuplicateRoute { route_id: String },
}

/// Errors raised while loading or validating an entity contract.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("Contract parse error: {message}")]
    Parse { message: String },

    #[error("Contract for '{entity}' has no columns")]
    NoColumns { entity: String },

    #[error("Contract for '{entity}' declares column '{column}' twice")]
    DuplicateColumn { entity: String, column: String },

    #[error("Contract for '{entity}' has an empty primary key")]
    EmptyPrimaryKey { entity: String },

    #[error("Contract for '{entity}' references unknown column '{column}' in {section}")]
    UnknownColumn {
        entity: String,
        column: String,
        section: String,
    },

    #[error("Contract for '{entity}' uses reserved column name '{column}'")]
    ReservedColumn { entity: String, column: String },

    #[error("Invalid entity name '{entity}'")]
    InvalidEntity { entity: String },
}

/// Errors surfaced by an external transformation stage.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Transform for {entity}/{partition_key} failed: {message}")]
    Failed {
        entity: String,
        partition_key: String,
        message: String,
    },

    #[error("No contract registered for entity '{entity}'")]
    MissingContract { entity: String },
}

/// A type alias for results using the top-level `TidemarkError`.
pub type Result<T> = std::result::Result<T, TidemarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_routing() {
        let err = TidemarkError::Routing(RoutingError::InvertedRange {
            start: "2021".into(),
            end: "2019".into(),
        });
        assert_eq!(
            err.to_string(),
            "Routing error: coverage start 2021 is after end 2019"
        );
    }

    #[test]
    fn test_error_display_conflict() {
        let err = TidemarkError::Storage(StorageError::conflict("E", "2020", "claimed by run-1"));
        assert_eq!(
            err.to_string(),
            "Storage error: Conflict on E/2020: claimed by run-1"
        );
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = TidemarkError::Storage(StorageError::Busy {
            message: "database is locked".into(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TidemarkError = io_err.into();
        assert!(matches!(err, TidemarkError::Io(_)));
    }

    #[test]
    fn test_contract_error_display() {
        let err = ContractError::UnknownColumn {
            entity: "displacement".into(),
            column: "year".into(),
            section: "primary_key".into(),
        };
        assert_eq!(
            err.to_string(),
            "Contract for 'displacement' references unknown column 'year' in primary_key"
        );
    }
}
