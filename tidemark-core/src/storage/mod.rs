//! Embedded SQLite storage backend.
//!
//! [`Storage`] owns a single connection and every transactional bracket in the
//! control plane. Components never hold a connection of their own; they take a
//! `&Storage` (or a `&Connection` when called from inside a bracket).

pub mod schema;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use rusqlite::{Connection, TransactionBehavior, params_from_iter};
use serde_json::Value;
use tracing::{debug, warn};

use crate::contract::{ColumnType, Contract};
use crate::error::StorageError;
use crate::fingerprint::canonical_json;
use crate::types::{PARTITION_KEY_COLUMN, ROW_HASH_COLUMN, RUN_ID_COLUMN, Row, parse_ts};

pub use schema::SCHEMA_VERSION;

/// Default wait on a locked database before surfacing `StorageError::Busy`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Handle to the control-plane database.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open (creating if needed) a database file and apply migrations.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::DatabaseDir {
                    path: parent.to_path_buf(),
                    message: e.to_string(),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves no open transaction behind:
        // the Transaction guard rolls back on drop during unwinding.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        schema::schema_version(&self.lock())
    }

    /// Run read-only work against the connection outside a transaction.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls the whole bracket back
    /// before it propagates.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StorageError> + std::fmt::Display,
    {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(StorageError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                warn!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Map a JSON value to the SQLite value it is stored as, guided by the
/// contract type.
///
/// Float columns always bind REAL and json columns always bind their
/// canonical text, so a value reads back in the form it was fingerprinted in.
pub fn to_sql_value(value: &Value, dtype: Option<ColumnType>) -> SqlValue {
    match (value, dtype) {
        (Value::Null, _) => SqlValue::Null,
        (_, Some(ColumnType::Json)) => SqlValue::Text(canonical_json(value)),
        (Value::Number(n), Some(ColumnType::Float)) => {
            SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
        }
        (Value::Bool(b), _) => SqlValue::Integer(i64::from(*b)),
        (Value::Number(n), _) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(s), _) => SqlValue::Text(s.clone()),
        (Value::Array(_) | Value::Object(_), _) => SqlValue::Text(canonical_json(value)),
    }
}

/// Map a stored SQLite value back to JSON, guided by the contract type.
pub fn from_sql_value(
    column: &str,
    value: ValueRef<'_>,
    dtype: Option<ColumnType>,
) -> Result<Value, StorageError> {
    let json = match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if dtype == Some(ColumnType::Boolean) => Value::Bool(i != 0),
        ValueRef::Integer(i) if dtype == Some(ColumnType::Float) => float_value(i as f64),
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => float_value(f),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| StorageError::corrupt(column, e.to_string()))?;
            if dtype == Some(ColumnType::Json) {
                serde_json::from_str(text)
                    .map_err(|e| StorageError::corrupt(column, e.to_string()))?
            } else {
                Value::String(text.to_string())
            }
        }
        ValueRef::Blob(_) => {
            return Err(StorageError::corrupt(column, "unexpected BLOB value"));
        }
    };
    Ok(json)
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Create the entity table and its partition index if they do not exist.
pub fn ensure_entity_table(conn: &Connection, contract: &Contract) -> Result<(), StorageError> {
    let table = quote_ident(&contract.entity);
    let mut columns = vec![format!("{} TEXT NOT NULL", quote_ident(PARTITION_KEY_COLUMN))];
    for col in &contract.columns {
        columns.push(format!("{} {}", quote_ident(&col.name), col.dtype.sql_type()));
    }
    columns.push(format!("{} TEXT NOT NULL", quote_ident(RUN_ID_COLUMN)));
    columns.push(format!("{} TEXT NOT NULL", quote_ident(ROW_HASH_COLUMN)));

    let index = quote_ident(&format!("ix_{}_partition", contract.entity));
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} ({});
         CREATE INDEX IF NOT EXISTS {index} ON {table} ({});",
        columns.join(", "),
        quote_ident(PARTITION_KEY_COLUMN),
    );
    conn.execute_batch(&ddl)?;
    Ok(())
}

/// Column order of an entity table, technical columns included.
fn stored_columns(contract: &Contract) -> Vec<String> {
    let mut cols = contract.column_names();
    cols.push(RUN_ID_COLUMN.to_string());
    cols.push(ROW_HASH_COLUMN.to_string());
    cols
}

/// Read the published rows of one partition, in insertion order.
///
/// Rows carry the contract columns plus `_run_id` and `_row_hash`.
pub fn read_partition(
    conn: &Connection,
    contract: &Contract,
    partition_key: &str,
) -> Result<Vec<Row>, StorageError> {
    let columns = stored_columns(contract);
    let select = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {select} FROM {} WHERE {} = ?1 ORDER BY rowid",
        quote_ident(&contract.entity),
        quote_ident(PARTITION_KEY_COLUMN),
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([partition_key])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (i, name) in columns.iter().enumerate() {
            let dtype = contract.column(name).map(|c| c.dtype);
            record.insert(name.clone(), from_sql_value(name, row.get_ref(i)?, dtype)?);
        }
        out.push(record);
    }
    Ok(out)
}

/// Replace every row of a partition with `rows`. Returns the number inserted.
///
/// Rows must already carry `_run_id` and `_row_hash`; absent contract
/// columns are stored as NULL.
pub fn replace_partition(
    conn: &Connection,
    contract: &Contract,
    partition_key: &str,
    rows: &[Row],
) -> Result<usize, StorageError> {
    let table = quote_ident(&contract.entity);
    let deleted = conn.execute(
        &format!(
            "DELETE FROM {table} WHERE {} = ?1",
            quote_ident(PARTITION_KEY_COLUMN)
        ),
        [partition_key],
    )?;

    let columns = stored_columns(contract);
    let names = std::iter::once(PARTITION_KEY_COLUMN.to_string())
        .chain(columns.iter().cloned())
        .map(|c| quote_ident(&c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len() + 1)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {table} ({names}) VALUES ({placeholders})"
    ))?;

    for row in rows {
        let values = std::iter::once(SqlValue::Text(partition_key.to_string())).chain(
            columns.iter().map(|c| {
                let dtype = contract.column(c).map(|spec| spec.dtype);
                row.get(c)
                    .map(|v| to_sql_value(v, dtype))
                    .unwrap_or(SqlValue::Null)
            }),
        );
        stmt.execute(params_from_iter(values))?;
    }

    debug!(
        entity = %contract.entity,
        partition_key,
        deleted,
        inserted = rows.len(),
        "Swapped partition rows"
    );
    Ok(rows.len())
}

/// Number of published rows in a partition. Zero when the table does not exist.
pub fn count_partition(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
) -> Result<usize, StorageError> {
    if !table_exists(conn, entity)? {
        return Ok(0);
    }
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            quote_ident(entity),
            quote_ident(PARTITION_KEY_COLUMN)
        ),
        [partition_key],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Read a TEXT column through `FromStr`.
pub(crate) fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: T::Err| conversion_error(idx, e.to_string()))
}

pub(crate) fn parse_opt_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        r.parse()
            .map_err(|e: T::Err| conversion_error(idx, e.to_string()))
    })
    .transpose()
}

pub(crate) fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

pub(crate) fn opt_ts_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(&r).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

/// Read a JSON TEXT column into a typed value.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

/// Collect a mapped query, converting errors into `StorageError`.
pub(crate) fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
