//! Lineage events: append-only facts about discovery, transforms and publishes.
//!
//! Events are written inside the transaction of the operation they describe,
//! so an event exists if and only if that operation committed. After commit
//! the publisher also logs each event as JSON under the `tidemark::lineage`
//! tracing target.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::commit::CommitRecord;
use crate::contract::Contract;
use crate::error::{Result, StorageError};
use crate::planner::BuildPlan;
use crate::registry::RegistrationResult;
use crate::router::RoutingOutcome;
use crate::storage::{Storage, collect_rows, json_column};
use crate::types::{Grain, format_ts};

pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Tracing target used for post-commit lineage logs.
pub const LINEAGE_TARGET: &str = "tidemark::lineage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Discover,
    TransformRun,
    PartitionPublished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Discover => "discover",
            EventType::TransformRun => "transform_run",
            EventType::PartitionPublished => "partition_published",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinates of a dataset or one of its partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub layer: String,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain: Option<Grain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl DatasetRef {
    pub fn new(layer: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            entity: entity.into(),
            grain: None,
            partition_key: None,
        }
    }

    pub fn partition(mut self, grain: Grain, partition_key: impl Into<String>) -> Self {
        self.grain = Some(grain);
        self.partition_key = Some(partition_key.into());
        self
    }

    /// The raw landing zone, where discovered files live.
    pub fn landing() -> Self {
        Self::new("bronze", "_files")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    pub run_id: String,
    pub transform_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One input of an event, with file provenance when it is a landed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub dataset: DatasetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
}

impl InputRef {
    pub fn file(
        dataset: DatasetRef,
        file_path: impl Into<String>,
        content_hash: impl Into<String>,
        route_id: Option<String>,
    ) -> Self {
        Self {
            dataset,
            file_path: Some(file_path.into()),
            content_hash: Some(content_hash.into()),
            route_id,
        }
    }
}

/// A write-once lineage fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEvent {
    pub event_id: String,
    pub event_schema_version: u32,
    pub event_type: EventType,
    pub event_time: DateTime<Utc>,
    pub dataset: DatasetRef,
    pub run: RunRef,
    pub inputs: Vec<InputRef>,
    pub outputs: Vec<DatasetRef>,
    pub metrics: Value,
    pub dq: Value,
    pub extra: Value,
}

impl LineageEvent {
    fn new(event_type: EventType, dataset: DatasetRef, run: RunRef) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_schema_version: EVENT_SCHEMA_VERSION,
            event_type,
            event_time: run.finished_at,
            outputs: vec![dataset.clone()],
            dataset,
            run,
            inputs: Vec::new(),
            metrics: json!({}),
            dq: json!({ "status": "n/a" }),
            extra: json!({}),
        }
    }

    /// A discovery pass: registration and routing of newly landed files.
    pub fn discover(
        run_id: &str,
        transform_version: &str,
        started_at: DateTime<Utc>,
        registration: &RegistrationResult,
        routing: &RoutingOutcome,
    ) -> Self {
        let run = RunRef {
            run_id: run_id.to_string(),
            transform_version: transform_version.to_string(),
            started_at,
            finished_at: Utc::now(),
        };
        let mut event = Self::new(EventType::Discover, DatasetRef::landing(), run);
        event.inputs = registration
            .new_versions
            .iter()
            .map(|(path, hash)| InputRef::file(DatasetRef::landing(), path, hash, None))
            .collect();
        event.metrics = json!({
            "inserted": registration.inserted,
            "unchanged": registration.unchanged,
            "superseded": registration.superseded,
            "revived": registration.revived,
            "failed": registration.failed,
            "links_created": routing.links_created,
            "dirty_marked": routing.dirty_marked,
            "unmatched": routing.unmatched.len(),
            "rejected": routing.rejected.len(),
        });
        event
    }

    /// An external transformation over a planned partition.
    pub fn transform_run(
        run_id: &str,
        transform_version: &str,
        started_at: DateTime<Utc>,
        contract: &Contract,
        plan: &BuildPlan,
        metrics: Value,
    ) -> Self {
        let dataset = DatasetRef::new(&contract.layer, &contract.entity)
            .partition(contract.grain, &plan.partition_key);
        let run = RunRef {
            run_id: run_id.to_string(),
            transform_version: transform_version.to_string(),
            started_at,
            finished_at: Utc::now(),
        };
        let mut event = Self::new(EventType::TransformRun, dataset, run);
        event.inputs = plan
            .inputs
            .iter()
            .map(|i| {
                InputRef::file(
                    DatasetRef::landing(),
                    &i.file_path,
                    &i.content_hash,
                    Some(i.route_id.clone()),
                )
            })
            .collect();
        event.metrics = metrics;
        event.extra = json!({ "spec_version": contract.version });
        event
    }

    /// A committed partition swap.
    pub fn partition_published(record: &CommitRecord, grain: Grain) -> Self {
        let dataset = DatasetRef::new(&record.layer, &record.entity)
            .partition(grain, &record.partition_key);
        let run = RunRef {
            run_id: record.run_id.clone(),
            transform_version: record.transform_version.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
        };
        let mut event = Self::new(EventType::PartitionPublished, dataset, run);
        event.inputs = record
            .inputs
            .iter()
            .map(|i| {
                InputRef::file(
                    DatasetRef::landing(),
                    &i.file_path,
                    &i.content_hash,
                    i.route_id.clone(),
                )
            })
            .collect();
        event.metrics = json!({
            "rows_in": record.rows_in,
            "rows_out": record.row_count,
            "insert_cnt": record.insert_cnt,
            "update_cnt": record.update_cnt,
            "delete_cnt": record.delete_cnt,
            "partition_hash": record.partition_hash,
        });
        event.dq = json!({
            "status": record.quality_summary.get("status").cloned().unwrap_or(json!("n/a")),
        });
        event.extra = json!({ "spec_version": record.spec_version });
        event
    }

    pub fn spec_version(&self) -> Option<&str> {
        self.extra.get("spec_version").and_then(Value::as_str)
    }

    pub fn dq_status(&self) -> Option<&str> {
        self.dq.get("status").and_then(Value::as_str)
    }

    fn metric(&self, name: &str) -> Option<i64> {
        self.metrics.get(name).and_then(Value::as_i64)
    }
}

/// Persists lineage events inside the caller's transaction.
pub trait LineageEmitter: Send + Sync {
    fn emit(&self, conn: &Connection, event: &LineageEvent) -> std::result::Result<(), StorageError>;
}

/// Writes one `lineage_events` row plus one `lineage_event_inputs` row per input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAuditEmitter;

impl LineageEmitter for SqliteAuditEmitter {
    fn emit(&self, conn: &Connection, event: &LineageEvent) -> std::result::Result<(), StorageError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| StorageError::corrupt("payload_json", e.to_string()))?;
        conn.execute(
            "INSERT INTO lineage_events (
                event_id, event_time, event_type, event_schema_version, layer, entity,
                grain, partition_key, run_id, transform_version, spec_version,
                rows_in, rows_out, dq_status, payload_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                event.event_id,
                format_ts(&event.event_time),
                event.event_type.as_str(),
                event.event_schema_version,
                event.dataset.layer,
                event.dataset.entity,
                event.dataset.grain.map(|g| g.as_str()),
                event.dataset.partition_key,
                event.run.run_id,
                event.run.transform_version,
                event.spec_version(),
                event.metric("rows_in"),
                event.metric("rows_out"),
                event.dq_status(),
                payload,
            ],
        )?;

        let mut stmt = conn.prepare(
            "INSERT INTO lineage_event_inputs (
                event_id, idx, layer, entity, partition_key, file_path, content_hash, route_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for (idx, input) in event.inputs.iter().enumerate() {
            stmt.execute(params![
                event.event_id,
                i64::try_from(idx).unwrap_or(i64::MAX),
                input.dataset.layer,
                input.dataset.entity,
                input.dataset.partition_key,
                input.file_path,
                input.content_hash,
                input.route_id,
            ])?;
        }
        Ok(())
    }
}

/// Log a committed event as JSON under [`LINEAGE_TARGET`].
pub fn log_event(event: &LineageEvent) {
    let payload = serde_json::to_string(event).unwrap_or_default();
    info!(
        target: LINEAGE_TARGET,
        event_id = %event.event_id,
        event_type = %event.event_type,
        run_id = %event.run.run_id,
        payload = %payload,
        "lineage event"
    );
}

/// Normalized one-row-per-input projection of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInputRow {
    pub event_id: String,
    pub idx: usize,
    pub layer: Option<String>,
    pub entity: Option<String>,
    pub partition_key: Option<String>,
    pub file_path: Option<String>,
    pub content_hash: Option<String>,
    pub route_id: Option<String>,
}

/// Read access to persisted lineage.
pub struct LineageLog<'a> {
    storage: &'a Storage,
}

impl<'a> LineageLog<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub fn get(&self, event_id: &str) -> Result<Option<LineageEvent>> {
        let event = self.storage.read(|conn| {
            conn.query_row(
                "SELECT payload_json FROM lineage_events WHERE event_id = ?1",
                [event_id],
                |row| json_column(row, 0),
            )
            .optional()
            .map_err(StorageError::from)
        })?;
        Ok(event)
    }

    /// Events for one partition, oldest first.
    pub fn events_for(&self, entity: &str, partition_key: &str) -> Result<Vec<LineageEvent>> {
        let events = self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload_json FROM lineage_events
                 WHERE entity = ?1 AND partition_key = ?2
                 ORDER BY event_time, rowid",
            )?;
            let rows = stmt.query_map(params![entity, partition_key], |row| json_column(row, 0))?;
            collect_rows(rows)
        })?;
        Ok(events)
    }

    pub fn events_for_run(&self, run_id: &str) -> Result<Vec<LineageEvent>> {
        let events = self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload_json FROM lineage_events WHERE run_id = ?1 ORDER BY event_time, rowid",
            )?;
            let rows = stmt.query_map([run_id], |row| json_column(row, 0))?;
            collect_rows(rows)
        })?;
        Ok(events)
    }

    pub fn inputs_for(&self, event_id: &str) -> Result<Vec<EventInputRow>> {
        let inputs = self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, idx, layer, entity, partition_key, file_path, content_hash, route_id
                 FROM lineage_event_inputs WHERE event_id = ?1 ORDER BY idx",
            )?;
            let rows = stmt.query_map([event_id], |row| {
                let idx: i64 = row.get(1)?;
                Ok(EventInputRow {
                    event_id: row.get(0)?,
                    idx: usize::try_from(idx).unwrap_or(0),
                    layer: row.get(2)?,
                    entity: row.get(3)?,
                    partition_key: row.get(4)?,
                    file_path: row.get(5)?,
                    content_hash: row.get(6)?,
                    route_id: row.get(7)?,
                })
            })?;
            collect_rows(rows)
        })?;
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanInput;
    use crate::types::FileStatus;
    use pretty_assertions::assert_eq;

    fn contract() -> Contract {
        Contract::from_yaml(
            "entity: E\ngrain: year\nversion: '4'\ncolumns:\n  - { name: id, type: string }\nprimary_key: [id]\n",
        )
        .unwrap()
    }

    fn plan() -> BuildPlan {
        BuildPlan {
            entity: "E".into(),
            partition_key: "2020".into(),
            inputs: vec![PlanInput {
                file_path: "src/2020.parquet".into(),
                content_hash: "abc".into(),
                file_size: 3,
                source_id: "src".into(),
                discovered_at: Utc::now(),
                status: FileStatus::Pending,
                route_id: "r1".into(),
            }],
        }
    }

    #[test]
    fn test_transform_run_event_shape() {
        let event = LineageEvent::transform_run(
            "run-1",
            "0.3.0",
            Utc::now(),
            &contract(),
            &plan(),
            json!({"rows_in": 3, "rows_out": 2}),
        );
        assert_eq!(event.event_type, EventType::TransformRun);
        assert_eq!(event.event_schema_version, 1);
        assert_eq!(event.dataset.partition_key.as_deref(), Some("2020"));
        assert_eq!(event.dataset.layer, "silver");
        assert_eq!(event.spec_version(), Some("4"));
        assert_eq!(event.inputs[0].route_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_sqlite_emitter_persists_event_and_inputs() {
        let storage = Storage::open_in_memory().unwrap();
        let event = LineageEvent::transform_run(
            "run-1",
            "0.3.0",
            Utc::now(),
            &contract(),
            &plan(),
            json!({"rows_in": 3, "rows_out": 2}),
        );
        storage
            .transaction(|conn| SqliteAuditEmitter.emit(conn, &event))
            .unwrap();

        let log = LineageLog::new(&storage);
        let stored = log.get(&event.event_id).unwrap().unwrap();
        assert_eq!(stored, event);
        assert_eq!(log.events_for("E", "2020").unwrap().len(), 1);
        assert_eq!(log.events_for_run("run-1").unwrap().len(), 1);

        let inputs = log.inputs_for(&event.event_id).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].file_path.as_deref(), Some("src/2020.parquet"));
        assert_eq!(inputs[0].layer.as_deref(), Some("bronze"));
    }

    #[test]
    fn test_event_id_is_write_once() {
        let storage = Storage::open_in_memory().unwrap();
        let event = LineageEvent::transform_run(
            "run-1",
            "0.3.0",
            Utc::now(),
            &contract(),
            &plan(),
            json!({}),
        );
        storage
            .transaction(|conn| SqliteAuditEmitter.emit(conn, &event))
            .unwrap();
        let again: std::result::Result<(), StorageError> =
            storage.transaction(|conn| SqliteAuditEmitter.emit(conn, &event));
        assert!(again.is_err());
    }
}
