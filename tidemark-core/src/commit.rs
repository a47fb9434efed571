//! Commit protocol: the failure-atomic publish of one partition.
//!
//! A publish stages and gates the rows, then in a single `BEGIN IMMEDIATE`
//! transaction reconciles against the published state, swaps the partition,
//! writes the immutable [`CommitRecord`], emits the `partition_published`
//! lineage event and runs the post-commit hooks. Any error rolls all of it
//! back.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contract::Contract;
use crate::dirty::mark_clean_in;
use crate::error::{QualityGateFailure, Result, StorageError, TidemarkError};
use crate::fingerprint::row_fingerprint;
use crate::lineage::{LineageEmitter, LineageEvent, SqliteAuditEmitter, log_event};
use crate::planner::PlanInput;
use crate::quality::{GateContext, QualityGate, QualityReport};
use crate::reconcile::{ReconcileSummary, reconcile};
use crate::registry::mark_processed;
use crate::storage::{
    Storage, collect_rows, ensure_entity_table, json_column, read_partition, replace_partition,
    ts_column,
};
use crate::types::{ROW_HASH_COLUMN, RUN_ID_COLUMN, Row, format_ts};

/// One input file version recorded on a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInput {
    pub file_path: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
}

impl From<&PlanInput> for CommitInput {
    fn from(input: &PlanInput) -> Self {
        Self {
            file_path: input.file_path.clone(),
            content_hash: input.content_hash.clone(),
            route_id: Some(input.route_id.clone()),
        }
    }
}

/// Immutable audit record of one successful publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub entity: String,
    pub partition_key: String,
    pub run_id: String,
    pub layer: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rows handed to the transformation, when known; else the staged count.
    pub rows_in: u64,
    pub row_count: u64,
    pub insert_cnt: u64,
    pub update_cnt: u64,
    pub delete_cnt: u64,
    pub partition_hash: Option<String>,
    pub inputs: Vec<CommitInput>,
    pub quality_summary: Value,
    pub spec_version: String,
    pub transform_version: String,
}

/// Caller-supplied facts about the run being published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub run_id: String,
    pub transform_version: String,
    pub started_at: DateTime<Utc>,
    /// Inputs in plan order.
    pub inputs: Vec<CommitInput>,
    /// Overrides the contract's layer.
    pub layer: Option<String>,
    pub rows_in: Option<u64>,
}

impl CommitMetadata {
    pub fn new(run_id: impl Into<String>, transform_version: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            transform_version: transform_version.into(),
            started_at: Utc::now(),
            inputs: Vec::new(),
            layer: None,
            rows_in: None,
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = CommitInput>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }
}

/// Everything needed to publish one partition.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub contract: &'a Contract,
    pub partition_key: &'a str,
    pub rows: Vec<Row>,
    pub metadata: CommitMetadata,
}

/// Result of [`Publisher::publish`].
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Committed {
        record: CommitRecord,
        summary: ReconcileSummary,
        event_id: String,
        report: QualityReport,
    },
    /// The run was already committed for this partition; nothing changed.
    AlreadyCommitted(CommitRecord),
}

impl PublishOutcome {
    pub fn record(&self) -> &CommitRecord {
        match self {
            PublishOutcome::Committed { record, .. } => record,
            PublishOutcome::AlreadyCommitted(record) => record,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, PublishOutcome::Committed { .. })
    }
}

/// Context handed to post-commit hooks.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub contract: &'a Contract,
    pub record: &'a CommitRecord,
}

/// A side effect that must commit or roll back together with the publish.
pub trait CommitHook: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, conn: &Connection, ctx: &HookContext<'_>) -> Result<()>;
}

/// Marks the partition's pending inputs `processed` by this run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkInputsProcessed;

impl CommitHook for MarkInputsProcessed {
    fn name(&self) -> &str {
        "mark_inputs_processed"
    }

    fn run(&self, conn: &Connection, ctx: &HookContext<'_>) -> Result<()> {
        let record = ctx.record;
        let mut marked = 0;
        for input in &record.inputs {
            if mark_processed(
                conn,
                &input.file_path,
                &input.content_hash,
                &record.run_id,
                &record.finished_at,
            )? {
                marked += 1;
            }
        }
        debug!(run_id = %record.run_id, marked, "Marked inputs processed");
        Ok(())
    }
}

/// Moves this run's rebuilding claim to `clean`.
///
/// A claim held by another run is a conflict and aborts the publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearDirtyFlag;

impl CommitHook for ClearDirtyFlag {
    fn name(&self) -> &str {
        "clear_dirty_flag"
    }

    fn run(&self, conn: &Connection, ctx: &HookContext<'_>) -> Result<()> {
        let record = ctx.record;
        mark_clean_in(
            conn,
            &record.entity,
            &record.partition_key,
            &record.run_id,
            &record.finished_at,
        )?;
        Ok(())
    }
}

/// Project rows onto the contract and stamp the technical columns.
///
/// Values are normalized to their column type. Unknown columns are dropped
/// and absent ones stay absent so the `schema` check can see them; the swap
/// stores them as NULL.
pub fn stage_rows(contract: &Contract, rows: Vec<Row>, run_id: &str) -> Vec<Row> {
    rows.into_iter()
        .map(|mut row| {
            let mut staged = Row::new();
            for col in &contract.columns {
                if let Some(value) = row.remove(&col.name) {
                    staged.insert(col.name.clone(), col.dtype.normalize(value));
                }
            }
            let hash = row_fingerprint(&staged, &contract.fingerprint);
            staged.insert(RUN_ID_COLUMN.to_string(), Value::String(run_id.to_string()));
            staged.insert(ROW_HASH_COLUMN.to_string(), Value::String(hash));
            staged
        })
        .collect()
}

const SELECT_COMMIT: &str = "SELECT entity, partition_key, run_id, layer, started_at, finished_at,
        rows_in, row_count, insert_cnt, update_cnt, delete_cnt, partition_hash,
        inputs_json, quality_summary_json, spec_version, transform_version
    FROM commits";

fn count_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    Ok(u64::try_from(value).unwrap_or(0))
}

fn commit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommitRecord> {
    Ok(CommitRecord {
        entity: row.get(0)?,
        partition_key: row.get(1)?,
        run_id: row.get(2)?,
        layer: row.get(3)?,
        started_at: ts_column(row, 4)?,
        finished_at: ts_column(row, 5)?,
        rows_in: count_column(row, 6)?,
        row_count: count_column(row, 7)?,
        insert_cnt: count_column(row, 8)?,
        update_cnt: count_column(row, 9)?,
        delete_cnt: count_column(row, 10)?,
        partition_hash: row.get(11)?,
        inputs: json_column(row, 12)?,
        quality_summary: json_column(row, 13)?,
        spec_version: row.get(14)?,
        transform_version: row.get(15)?,
    })
}

pub(crate) fn get_commit(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
    run_id: &str,
) -> std::result::Result<Option<CommitRecord>, StorageError> {
    let sql = format!("{SELECT_COMMIT} WHERE entity = ?1 AND partition_key = ?2 AND run_id = ?3");
    Ok(conn
        .query_row(&sql, params![entity, partition_key, run_id], commit_from_row)
        .optional()?)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Insert a commit record; returns `false` if the key already existed.
fn insert_commit(
    conn: &Connection,
    record: &CommitRecord,
) -> std::result::Result<bool, StorageError> {
    let inputs = serde_json::to_string(&record.inputs)
        .map_err(|e| StorageError::corrupt("inputs_json", e.to_string()))?;
    let quality = serde_json::to_string(&record.quality_summary)
        .map_err(|e| StorageError::corrupt("quality_summary_json", e.to_string()))?;
    let inserted = conn.execute(
        "INSERT INTO commits (
            entity, partition_key, run_id, layer, started_at, finished_at,
            rows_in, row_count, insert_cnt, update_cnt, delete_cnt, partition_hash,
            inputs_json, quality_summary_json, spec_version, transform_version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT (entity, partition_key, run_id) DO NOTHING",
        params![
            record.entity,
            record.partition_key,
            record.run_id,
            record.layer,
            format_ts(&record.started_at),
            format_ts(&record.finished_at),
            to_i64(record.rows_in),
            to_i64(record.row_count),
            to_i64(record.insert_cnt),
            to_i64(record.update_cnt),
            to_i64(record.delete_cnt),
            record.partition_hash,
            inputs,
            quality,
            record.spec_version,
            record.transform_version,
        ],
    )?;
    Ok(inserted > 0)
}

/// Publishes partitions through the commit protocol.
pub struct Publisher<'a> {
    storage: &'a Storage,
    emitter: Box<dyn LineageEmitter>,
    hooks: Vec<Box<dyn CommitHook>>,
}

impl<'a> Publisher<'a> {
    /// A publisher with the SQLite audit emitter and no hooks.
    pub fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            emitter: Box::new(SqliteAuditEmitter),
            hooks: Vec::new(),
        }
    }

    /// A publisher with the built-in hooks: mark inputs processed, clear dirty flag.
    pub fn with_default_hooks(storage: &'a Storage) -> Self {
        Self::new(storage)
            .with_hook(MarkInputsProcessed)
            .with_hook(ClearDirtyFlag)
    }

    pub fn with_emitter(mut self, emitter: impl LineageEmitter + 'static) -> Self {
        self.emitter = Box::new(emitter);
        self
    }

    pub fn with_hook(mut self, hook: impl CommitHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Publish one partition.
    ///
    /// A failing quality gate aborts before any mutation. A run already
    /// committed for this partition returns [`PublishOutcome::AlreadyCommitted`]
    /// without touching anything.
    pub fn publish(
        &self,
        request: PublishRequest<'_>,
        gate: &dyn QualityGate,
    ) -> Result<PublishOutcome> {
        let PublishRequest {
            contract,
            partition_key,
            rows,
            metadata,
        } = request;
        let run_id = metadata.run_id.as_str();
        let entity = contract.entity.as_str();

        if let Some(existing) = self
            .storage
            .read(|conn| committed_for(conn, contract, partition_key, run_id))?
        {
            info!(entity, partition_key, run_id, "Run already committed, skipping");
            return Ok(PublishOutcome::AlreadyCommitted(existing));
        }

        let rows_in = metadata.rows_in.unwrap_or(rows.len() as u64);
        let staged = stage_rows(contract, rows, run_id);
        let ctx = GateContext {
            contract,
            partition_key,
            run_id,
        };
        let report = gate.evaluate(&staged, &ctx);
        if !report.passed() {
            let failure = QualityGateFailure {
                entity: entity.to_string(),
                partition_key: partition_key.to_string(),
                report,
            };
            warn!(entity, partition_key, run_id, error = %failure, "Quality gate rejected partition");
            return Err(failure.into());
        }

        let (outcome, event) = self.storage.transaction(|conn| {
            if let Some(existing) = committed_for(conn, contract, partition_key, run_id)? {
                return Ok((PublishOutcome::AlreadyCommitted(existing), None));
            }

            ensure_entity_table(conn, contract)?;
            let old = read_partition(conn, contract, partition_key)?;
            let summary = reconcile(&staged, &old, &contract.primary_key)?;
            replace_partition(conn, contract, partition_key, &staged)?;

            let record = CommitRecord {
                entity: entity.to_string(),
                partition_key: partition_key.to_string(),
                run_id: run_id.to_string(),
                layer: metadata
                    .layer
                    .clone()
                    .unwrap_or_else(|| contract.layer.clone()),
                started_at: metadata.started_at.trunc_subsecs(6),
                finished_at: Utc::now().trunc_subsecs(6),
                rows_in,
                row_count: staged.len() as u64,
                insert_cnt: summary.inserts as u64,
                update_cnt: summary.updates as u64,
                delete_cnt: summary.deletes as u64,
                partition_hash: summary.partition_hash.clone(),
                inputs: metadata.inputs.clone(),
                quality_summary: report.summary(),
                spec_version: contract.version.clone(),
                transform_version: metadata.transform_version.clone(),
            };
            if !insert_commit(conn, &record)? {
                return Err(TidemarkError::from(StorageError::conflict(
                    entity,
                    partition_key,
                    format!("commit for run {run_id} appeared concurrently"),
                )));
            }

            let event = LineageEvent::partition_published(&record, contract.grain);
            self.emitter.emit(conn, &event)?;

            let hook_ctx = HookContext {
                contract,
                record: &record,
            };
            for hook in &self.hooks {
                hook.run(conn, &hook_ctx).inspect_err(|e| {
                    warn!(hook = hook.name(), error = %e, "Post-commit hook failed");
                })?;
            }

            let outcome = PublishOutcome::Committed {
                record,
                summary,
                event_id: event.event_id.clone(),
                report: report.clone(),
            };
            Ok::<_, TidemarkError>((outcome, Some(event)))
        })?;

        if let Some(event) = &event {
            log_event(event);
        }
        match &outcome {
            PublishOutcome::Committed { record, summary, .. } => {
                info!(
                    entity,
                    partition_key,
                    run_id,
                    rows = record.row_count,
                    inserts = summary.inserts,
                    updates = summary.updates,
                    deletes = summary.deletes,
                    "Published partition"
                );
            }
            PublishOutcome::AlreadyCommitted(_) => {
                info!(entity, partition_key, run_id, "Run already committed, skipping");
            }
        }
        Ok(outcome)
    }
}

fn committed_for(
    conn: &Connection,
    contract: &Contract,
    partition_key: &str,
    run_id: &str,
) -> std::result::Result<Option<CommitRecord>, StorageError> {
    get_commit(conn, &contract.entity, partition_key, run_id)
}

/// Read access to commit records.
pub struct CommitLog<'a> {
    storage: &'a Storage,
}

impl<'a> CommitLog<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub fn get(&self, entity: &str, partition_key: &str, run_id: &str) -> Result<Option<CommitRecord>> {
        Ok(self
            .storage
            .read(|conn| get_commit(conn, entity, partition_key, run_id))?)
    }

    /// Every commit of a partition, oldest first.
    pub fn history(&self, entity: &str, partition_key: &str) -> Result<Vec<CommitRecord>> {
        self.query(
            "WHERE entity = ?1 AND partition_key = ?2 ORDER BY finished_at, rowid",
            &[entity, partition_key],
        )
    }

    pub fn latest(&self, entity: &str, partition_key: &str) -> Result<Option<CommitRecord>> {
        Ok(self
            .query(
                "WHERE entity = ?1 AND partition_key = ?2 ORDER BY finished_at DESC, rowid DESC LIMIT 1",
                &[entity, partition_key],
            )?
            .into_iter()
            .next())
    }

    /// Commits finished in `[from, to)`, oldest first.
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<CommitRecord>> {
        self.query(
            "WHERE finished_at >= ?1 AND finished_at < ?2 ORDER BY finished_at, rowid",
            &[format_ts(&from).as_str(), format_ts(&to).as_str()],
        )
    }

    pub fn all(&self) -> Result<Vec<CommitRecord>> {
        self.query("ORDER BY finished_at, rowid", &[])
    }

    fn query(&self, clause: &str, args: &[&str]) -> Result<Vec<CommitRecord>> {
        let records = self.storage.read(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COMMIT} {clause}"))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), commit_from_row)?;
            collect_rows(rows)
        })?;
        Ok(records)
    }
}
