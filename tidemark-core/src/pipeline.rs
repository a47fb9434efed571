//! Pipeline orchestration: discovery and rebuild of dirty partitions.
//!
//! [`Pipeline::discover`] runs scan -> register -> route. [`Pipeline::rebuild_dirty`]
//! walks the dirty queue and, per partition, claims, plans, transforms and
//! publishes. A failing partition is released back to `dirty` and reported;
//! it never stops the others.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::commit::{CommitInput, CommitMetadata, PublishOutcome, PublishRequest, Publisher};
use crate::config::TidemarkConfig;
use crate::contract::Contract;
use crate::dirty::DirtyTracker;
use crate::error::{Result, TidemarkError, TransformError};
use crate::lineage::{LineageEmitter, LineageEvent, SqliteAuditEmitter, log_event};
use crate::planner::{BuildPlan, Planner};
use crate::quality::{QualityGate, value_matches_key};
use crate::registry::{RegistrationResult, Registry};
use crate::router::{RoutingOutcome, route_pending_in};
use crate::scanner::{ScanOptions, scan_directory};
use crate::storage::Storage;
use crate::types::Row;

/// What a transformation knows about the run it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub run_id: &'a str,
    pub started_at: DateTime<Utc>,
}

/// Rows produced by a transformation, plus what it threw away.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub rows: Vec<Row>,
    pub rejects: Vec<Row>,
    /// Free-form metrics; recorded on the `transform_run` lineage event.
    pub diagnostics: Value,
}

/// The external, entity-specific step between planned inputs and publishable rows.
pub trait TransformStage: Send + Sync {
    fn transform(
        &self,
        contract: &Contract,
        plan: &BuildPlan,
        ctx: &TransformContext<'_>,
    ) -> std::result::Result<TransformOutput, TransformError>;
}

impl<F> TransformStage for F
where
    F: Fn(&Contract, &BuildPlan, &TransformContext<'_>) -> std::result::Result<TransformOutput, TransformError>
        + Send
        + Sync,
{
    fn transform(
        &self,
        contract: &Contract,
        plan: &BuildPlan,
        ctx: &TransformContext<'_>,
    ) -> std::result::Result<TransformOutput, TransformError> {
        self(contract, plan, ctx)
    }
}

/// Reads JSON (`.json`, array or single object) and JSON Lines (`.jsonl`)
/// inputs and keeps the records belonging to the partition.
///
/// When the contract names a partition column, records whose column does not
/// equal the partition key are skipped; a multi-year file feeds every year it
/// covers. Non-object records are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordsTransform;

impl JsonRecordsTransform {
    fn read_records(path: &Path) -> std::result::Result<Vec<Value>, String> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let file = std::fs::File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
        match ext.as_str() {
            "jsonl" => {
                let mut records = Vec::new();
                for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
                    let line = line.map_err(|e| format!("{}: {e}", path.display()))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value = serde_json::from_str(&line)
                        .map_err(|e| format!("{}:{}: {e}", path.display(), n + 1))?;
                    records.push(value);
                }
                Ok(records)
            }
            "json" => {
                let value: Value = serde_json::from_reader(std::io::BufReader::new(file))
                    .map_err(|e| format!("{}: {e}", path.display()))?;
                Ok(match value {
                    Value::Array(items) => items,
                    other => vec![other],
                })
            }
            other => Err(format!(
                "{}: unsupported input format '{other}'",
                path.display()
            )),
        }
    }
}

impl TransformStage for JsonRecordsTransform {
    fn transform(
        &self,
        contract: &Contract,
        plan: &BuildPlan,
        _ctx: &TransformContext<'_>,
    ) -> std::result::Result<TransformOutput, TransformError> {
        let fail = |message: String| TransformError::Failed {
            entity: plan.entity.clone(),
            partition_key: plan.partition_key.clone(),
            message,
        };

        let mut output = TransformOutput::default();
        let mut records_read = 0usize;
        let mut out_of_partition = 0usize;
        for input in &plan.inputs {
            for record in Self::read_records(Path::new(&input.file_path)).map_err(fail)? {
                records_read += 1;
                let Value::Object(row) = record else {
                    output.rejects.push(Row::from_iter([
                        ("_reason".to_string(), json!("not an object")),
                        ("_source".to_string(), json!(input.file_path)),
                        ("value".to_string(), record),
                    ]));
                    continue;
                };
                let in_partition = match &contract.partition_column {
                    Some(column) => value_matches_key(row.get(column), &plan.partition_key),
                    None => true,
                };
                if in_partition {
                    output.rows.push(row);
                } else {
                    out_of_partition += 1;
                }
            }
        }
        output.diagnostics = json!({
            "rows_in": records_read,
            "rows_out": output.rows.len(),
            "rejects": output.rejects.len(),
            "out_of_partition": out_of_partition,
        });
        Ok(output)
    }
}

/// Result of [`Pipeline::discover`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub run_id: String,
    pub scanned: usize,
    pub registration: RegistrationResult,
    pub routing: RoutingOutcome,
    /// `discover` lineage event, when the pass changed anything.
    pub event_id: Option<String>,
}

/// What happened to one dirty partition during [`Pipeline::rebuild_dirty`].
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionStatus {
    Published(PublishOutcome),
    /// No contract is registered for the entity; left dirty.
    Skipped { reason: String },
    /// The attempt failed; the claim was released back to `dirty`.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOutcome {
    pub entity: String,
    pub partition_key: String,
    pub run_id: String,
    pub status: PartitionStatus,
}

impl PartitionOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self.status, PartitionStatus::Published(_))
    }
}

/// Orchestrates the control-plane components over one storage handle.
pub struct Pipeline {
    storage: Arc<Storage>,
    scan: ScanOptions,
    transform_version: String,
    layer: Option<String>,
}

impl Pipeline {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            scan: ScanOptions::default(),
            transform_version: env!("CARGO_PKG_VERSION").to_string(),
            layer: None,
        }
    }

    pub fn from_config(storage: Arc<Storage>, config: &TidemarkConfig) -> Self {
        Self {
            storage,
            scan: ScanOptions {
                max_workers: config.discovery.max_workers,
                extensions: config.discovery.extensions.clone(),
            },
            transform_version: config.publish.transform_version.clone(),
            layer: config.publish.layer.clone(),
        }
    }

    pub fn with_scan_options(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_transform_version(mut self, version: impl Into<String>) -> Self {
        self.transform_version = version.into();
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Scan `root`, register what was found, then route and mark dirty.
    ///
    /// Registration and routing are separate transactions; the `discover`
    /// lineage event commits with routing.
    pub async fn discover(&self, root: &Path) -> Result<DiscoveryReport> {
        let run_id = new_run_id();
        let started_at = Utc::now();

        let scanned = scan_directory(root, &self.scan).await?;
        let registration = Registry::new(&self.storage).register_scan(&scanned)?;

        let now = Utc::now();
        let (routing, event) = self.storage.transaction(|conn| {
            let routing = route_pending_in(conn, &run_id, &now)?;
            let event = if registration.changed() || routing.links_created > 0 {
                let event = LineageEvent::discover(
                    &run_id,
                    &self.transform_version,
                    started_at,
                    &registration,
                    &routing,
                );
                SqliteAuditEmitter.emit(conn, &event)?;
                Some(event)
            } else {
                None
            };
            Ok::<_, TidemarkError>((routing, event))
        })?;

        if let Some(event) = &event {
            log_event(event);
        }
        info!(
            run_id = %run_id,
            scanned = scanned.len(),
            inserted = registration.inserted,
            links_created = routing.links_created,
            dirty_marked = routing.dirty_marked,
            "Discovery finished"
        );
        Ok(DiscoveryReport {
            run_id,
            scanned: scanned.len(),
            registration,
            routing,
            event_id: event.map(|e| e.event_id),
        })
    }

    /// Rebuild every dirty partition that has a contract, in planning order.
    ///
    /// Each partition gets its own run id. Storage errors while reading the
    /// queue propagate; everything per partition is reported in the outcomes.
    pub fn rebuild_dirty(
        &self,
        contracts: &[Contract],
        transform: &dyn TransformStage,
        gate: &dyn QualityGate,
    ) -> Result<Vec<PartitionOutcome>> {
        let contracts: HashMap<&str, Contract> = contracts
            .iter()
            .map(|c| {
                let mut contract = c.clone();
                if let Some(layer) = &self.layer {
                    contract.layer = layer.clone();
                }
                (c.entity.as_str(), contract)
            })
            .collect();

        let queue = Planner::new(&self.storage).dirty_queue()?;
        let mut outcomes = Vec::with_capacity(queue.len());
        for dirty in queue {
            let run_id = new_run_id();
            let Some(contract) = contracts.get(dirty.entity.as_str()) else {
                let reason = TransformError::MissingContract {
                    entity: dirty.entity.clone(),
                }
                .to_string();
                warn!(entity = %dirty.entity, partition_key = %dirty.partition_key, "{reason}");
                outcomes.push(PartitionOutcome {
                    entity: dirty.entity,
                    partition_key: dirty.partition_key,
                    run_id,
                    status: PartitionStatus::Skipped { reason },
                });
                continue;
            };

            let status = match self.rebuild_partition(
                contract,
                &dirty.partition_key,
                &run_id,
                transform,
                gate,
            ) {
                Ok(outcome) => PartitionStatus::Published(outcome),
                Err(e) => PartitionStatus::Failed {
                    error: e.to_string(),
                },
            };
            outcomes.push(PartitionOutcome {
                entity: dirty.entity,
                partition_key: dirty.partition_key,
                run_id,
                status,
            });
        }

        let published = outcomes.iter().filter(|o| o.is_published()).count();
        info!(
            partitions = outcomes.len(),
            published,
            "Rebuild pass finished"
        );
        Ok(outcomes)
    }

    /// Claim, plan, transform and publish one partition under `run_id`.
    ///
    /// Any failure after the claim releases it back to `dirty` with the error
    /// as reason before returning the error.
    pub fn rebuild_partition(
        &self,
        contract: &Contract,
        partition_key: &str,
        run_id: &str,
        transform: &dyn TransformStage,
        gate: &dyn QualityGate,
    ) -> Result<PublishOutcome> {
        let entity = contract.entity.as_str();
        let (_claim, plan) =
            Planner::new(&self.storage).claim_and_plan(entity, partition_key, run_id)?;

        let result = self.transform_and_publish(contract, &plan, run_id, transform, gate);
        if let Err(e) = &result {
            warn!(entity, partition_key, run_id, error = %e, "Partition rebuild failed");
            let reason = format!("rebuild failed: {e}");
            if let Err(release_err) =
                DirtyTracker::new(&self.storage).release(entity, partition_key, run_id, &reason)
            {
                warn!(entity, partition_key, run_id, error = %release_err, "Failed to release claim");
            }
        }
        result
    }

    fn transform_and_publish(
        &self,
        contract: &Contract,
        plan: &BuildPlan,
        run_id: &str,
        transform: &dyn TransformStage,
        gate: &dyn QualityGate,
    ) -> Result<PublishOutcome> {
        let started_at = Utc::now();
        let ctx = TransformContext { run_id, started_at };
        let output = transform.transform(contract, plan, &ctx)?;
        let rows_in = output
            .diagnostics
            .get("rows_in")
            .and_then(Value::as_u64)
            .unwrap_or((output.rows.len() + output.rejects.len()) as u64);

        let event = LineageEvent::transform_run(
            run_id,
            &self.transform_version,
            started_at,
            contract,
            plan,
            json!({
                "rows_in": rows_in,
                "rows_out": output.rows.len(),
                "rejects": output.rejects.len(),
                "diagnostics": output.diagnostics,
            }),
        );
        self.storage
            .transaction(|conn| SqliteAuditEmitter.emit(conn, &event))?;
        log_event(&event);

        let metadata = CommitMetadata {
            run_id: run_id.to_string(),
            transform_version: self.transform_version.clone(),
            started_at,
            inputs: plan.inputs.iter().map(CommitInput::from).collect(),
            layer: None,
            rows_in: Some(rows_in),
        };
        Publisher::with_default_hooks(&self.storage).publish(
            PublishRequest {
                contract,
                partition_key: &plan.partition_key,
                rows: output.rows,
                metadata,
            },
            gate,
        )
    }
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanInput;
    use crate::types::FileStatus;
    use pretty_assertions::assert_eq;

    fn contract() -> Contract {
        Contract::from_yaml(
            r#"
entity: displacement
grain: year
partition_column: year
columns:
  - { name: country, type: string, nullable: false }
  - { name: year, type: integer, nullable: false }
  - { name: refugees, type: integer }
primary_key: [country, year]
"#,
        )
        .unwrap()
    }

    fn plan_for(paths: &[&Path], partition_key: &str) -> BuildPlan {
        BuildPlan {
            entity: "displacement".into(),
            partition_key: partition_key.into(),
            inputs: paths
                .iter()
                .map(|p| PlanInput {
                    file_path: p.to_string_lossy().into_owned(),
                    content_hash: "h".into(),
                    file_size: 0,
                    source_id: "unhcr".into(),
                    discovered_at: Utc::now(),
                    status: FileStatus::Pending,
                    route_id: "r1".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_json_records_transform_filters_partition() {
        let dir = tempfile::tempdir().unwrap();
        let lines = dir.path().join("2019-2020.jsonl");
        std::fs::write(
            &lines,
            "{\"country\":\"AFG\",\"year\":2019}\n\n{\"country\":\"AFG\",\"year\":2020}\n[1]\n",
        )
        .unwrap();
        let array = dir.path().join("2020.json");
        std::fs::write(&array, r#"[{"country":"SYR","year":2020,"refugees":3}]"#).unwrap();

        let ctx = TransformContext {
            run_id: "run-1",
            started_at: Utc::now(),
        };
        let output = JsonRecordsTransform
            .transform(&contract(), &plan_for(&[&lines, &array], "2020"), &ctx)
            .unwrap();
        assert_eq!(output.rows.len(), 2);
        assert_eq!(output.rejects.len(), 1);
        assert_eq!(output.diagnostics["rows_in"], json!(4));
        assert_eq!(output.diagnostics["out_of_partition"], json!(1));
    }

    #[test]
    fn test_json_records_transform_reports_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let parquet = dir.path().join("2020.parquet");
        std::fs::write(&parquet, b"PAR1").unwrap();
        let ctx = TransformContext {
            run_id: "run-1",
            started_at: Utc::now(),
        };
        let err = JsonRecordsTransform
            .transform(&contract(), &plan_for(&[&parquet], "2020"), &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported input format 'parquet'"));
    }

    #[test]
    fn test_rebuild_skips_entities_without_contract() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        DirtyTracker::new(&storage)
            .mark_dirty("unknown_entity", "2020", "new_input")
            .unwrap();
        let pipeline = Pipeline::new(Arc::clone(&storage));
        let outcomes = pipeline
            .rebuild_dirty(&[contract()], &JsonRecordsTransform, &crate::quality::ContractGate)
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].status, PartitionStatus::Skipped { .. }));
        assert_eq!(
            DirtyTracker::new(&storage).list(None).unwrap()[0].status,
            crate::types::DirtyStatus::Dirty
        );
    }
}
