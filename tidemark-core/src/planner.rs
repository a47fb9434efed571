//! Planner: resolves the input set for rebuilding one partition.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dirty::{claim_in, list_in};
use crate::error::{Result, StorageError};
use crate::storage::{Storage, collect_rows, parse_column, ts_column};
use crate::types::{DirtyPartition, DirtyStatus, FileStatus};

/// One file version feeding a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInput {
    pub file_path: String,
    pub content_hash: String,
    pub file_size: u64,
    pub source_id: String,
    pub discovered_at: DateTime<Utc>,
    pub status: FileStatus,
    pub route_id: String,
}

/// Ordered, deduplicated inputs for one (entity, partition_key).
///
/// Inputs are ordered by `(discovered_at, file_path)`; transformation stages
/// rely on this order for reproducible rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub entity: String,
    pub partition_key: String,
    pub inputs: Vec<PlanInput>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

pub(crate) fn plan_in(
    conn: &Connection,
    entity: &str,
    partition_key: &str,
) -> std::result::Result<BuildPlan, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT file_path, content_hash, file_size, source_id, discovered_at, status, route_id
         FROM (
            SELECT m.file_path, m.content_hash, m.file_size, m.source_id,
                   m.discovered_at, m.status, l.route_id,
                   ROW_NUMBER() OVER (
                       PARTITION BY m.file_path
                       ORDER BY m.discovered_at DESC, m.rowid DESC, l.route_id
                   ) AS rn
            FROM manifest_partition_link l
            JOIN ingest_manifest m
              ON m.file_path = l.file_path AND m.content_hash = l.content_hash
            WHERE l.entity = ?1 AND l.partition_key = ?2
              AND m.status IN ('pending', 'processed')
         )
         WHERE rn = 1
         ORDER BY discovered_at, file_path",
    )?;
    let rows = stmt.query_map(params![entity, partition_key], |row| {
        let file_size: i64 = row.get(2)?;
        Ok(PlanInput {
            file_path: row.get(0)?,
            content_hash: row.get(1)?,
            file_size: u64::try_from(file_size).unwrap_or(0),
            source_id: row.get(3)?,
            discovered_at: ts_column(row, 4)?,
            status: parse_column(row, 5)?,
            route_id: row.get(6)?,
        })
    })?;
    Ok(BuildPlan {
        entity: entity.to_string(),
        partition_key: partition_key.to_string(),
        inputs: collect_rows(rows)?,
    })
}

/// Planner operations over a [`Storage`].
pub struct Planner<'a> {
    storage: &'a Storage,
}

impl<'a> Planner<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Resolve the inputs of a partition. An empty plan is not an error.
    pub fn plan(&self, entity: &str, partition_key: &str) -> Result<BuildPlan> {
        Ok(self
            .storage
            .read(|conn| plan_in(conn, entity, partition_key))?)
    }

    /// Claim a dirty partition for `run_id` and resolve its plan atomically.
    pub fn claim_and_plan(
        &self,
        entity: &str,
        partition_key: &str,
        run_id: &str,
    ) -> Result<(DirtyPartition, BuildPlan)> {
        let (claim, plan) = self.storage.transaction(|conn| {
            let claim = claim_in(conn, entity, partition_key, run_id)?;
            let plan = plan_in(conn, entity, partition_key)?;
            Ok::<_, StorageError>((claim, plan))
        })?;
        info!(
            entity,
            partition_key,
            run_id,
            inputs = plan.inputs.len(),
            "Claimed and planned partition"
        );
        Ok((claim, plan))
    }

    /// Dirty partitions in planning order.
    pub fn dirty_queue(&self) -> Result<Vec<DirtyPartition>> {
        Ok(self
            .storage
            .read(|conn| list_in(conn, Some(DirtyStatus::Dirty)))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::router::{Router, RuleSet};
    use crate::scanner::ScannedFile;
    use crate::types::Grain;
    use pretty_assertions::assert_eq;

    fn scanned(path: &str, hash: &str, start: &str, end: &str) -> ScannedFile {
        ScannedFile {
            source_id: "src".into(),
            file_path: path.into(),
            content_hash: hash.into(),
            file_size: 4,
            coverage_start: Some(start.into()),
            coverage_end: Some(end.into()),
            grain: Some(Grain::Year),
            error: None,
        }
    }

    fn setup() -> Storage {
        let storage = Storage::open_in_memory().unwrap();
        let rules = RuleSet::from_yaml(
            "routes:\n  - { route_id: r1, path_pattern: 'src/', entity: E, grain: year }\n",
        )
        .unwrap();
        Router::new(&storage).load_rules(&rules).unwrap();
        storage
    }

    #[test]
    fn test_plan_orders_inputs_and_keeps_latest_version() {
        let storage = setup();
        let registry = Registry::new(&storage);
        let router = Router::new(&storage);

        registry
            .register_scan(&[scanned("src/b/2020.parquet", "b1", "2020", "2020")])
            .unwrap();
        registry
            .register_scan(&[scanned("src/a/2019-2020.parquet", "a1", "2019", "2020")])
            .unwrap();
        router.route_pending("run-0").unwrap();

        let plan = Planner::new(&storage).plan("E", "2020").unwrap();
        let order: Vec<_> = plan.inputs.iter().map(|i| i.file_path.as_str()).collect();
        assert_eq!(order, vec!["src/b/2020.parquet", "src/a/2019-2020.parquet"]);

        // New content for b supersedes b1; only b2 survives in the plan.
        registry
            .register_scan(&[scanned("src/b/2020.parquet", "b2", "2020", "2020")])
            .unwrap();
        router.route_pending("run-1").unwrap();
        let plan = Planner::new(&storage).plan("E", "2020").unwrap();
        let hashes: Vec<_> = plan.inputs.iter().map(|i| i.content_hash.as_str()).collect();
        assert_eq!(hashes, vec!["a1", "b2"]);
        assert!(plan.inputs.iter().all(|i| i.route_id == "r1"));
    }

    #[test]
    fn test_empty_plan_is_not_an_error() {
        let storage = setup();
        let plan = Planner::new(&storage).plan("E", "1900").unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.partition_key, "1900");
    }

    #[test]
    fn test_claim_and_plan_and_queue() {
        let storage = setup();
        Registry::new(&storage)
            .register_scan(&[scanned("src/a/2019-2020.parquet", "a1", "2019", "2020")])
            .unwrap();
        Router::new(&storage).route_pending("run-0").unwrap();

        let planner = Planner::new(&storage);
        let queue: Vec<_> = planner
            .dirty_queue()
            .unwrap()
            .into_iter()
            .map(|d| d.partition_key)
            .collect();
        assert_eq!(queue, vec!["2019", "2020"]);

        let (claim, plan) = planner.claim_and_plan("E", "2019", "run-1").unwrap();
        assert_eq!(claim.status, DirtyStatus::Rebuilding);
        assert_eq!(plan.inputs.len(), 1);
        assert!(planner.claim_and_plan("E", "2019", "run-2").unwrap_err().is_conflict());
        assert_eq!(planner.dirty_queue().unwrap().len(), 1);
    }
}
