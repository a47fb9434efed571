//! End-to-end tests: discover -> route -> plan -> rebuild -> publish over a
//! real landing directory and an on-disk database.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use tidemark_core::commit::CommitLog;
use tidemark_core::error::TransformError;
use tidemark_core::lineage::{EventType, LineageLog};
use tidemark_core::pipeline::{PartitionStatus, TransformContext, TransformOutput};
use tidemark_core::storage::DEFAULT_BUSY_TIMEOUT;
use tidemark_core::{
    BuildPlan, Contract, ContractGate, DirtyStatus, DirtyTracker, FileStatus,
    JsonRecordsTransform, Pipeline, Planner, Registry, Router, RuleSet, Storage,
};

const RULES: &str = r#"
routes:
  - route_id: displacement_year
    source_id: unhcr
    path_pattern: 'displacement/'
    entity: displacement
    grain: year
"#;

const CONTRACT: &str = r#"
entity: displacement
grain: year
version: "3"
partition_column: year
columns:
  - { name: country, type: string, nullable: false }
  - { name: year, type: integer, nullable: false }
  - { name: refugees, type: integer }
primary_key: [country, year]
rules:
  non_negative: [refugees]
"#;

struct Workspace {
    _dir: TempDir,
    root: std::path::PathBuf,
    storage: Arc<Storage>,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("bronze");
    std::fs::create_dir_all(root.join("unhcr").join("displacement")).unwrap();
    let storage =
        Arc::new(Storage::open(dir.path().join("warehouse.db"), DEFAULT_BUSY_TIMEOUT).unwrap());
    Router::new(&storage)
        .load_rules(&RuleSet::from_yaml(RULES).unwrap())
        .unwrap();
    Workspace {
        _dir: dir,
        root,
        storage,
    }
}

/// JSON Lines for `countries` x `years`, with refugees = base + index.
fn records(countries: std::ops::Range<usize>, years: &[i64], base: i64) -> String {
    let mut out = String::new();
    for year in years {
        for i in countries.clone() {
            let row = json!({"country": format!("C{i}"), "year": year, "refugees": base + i as i64});
            out.push_str(&row.to_string());
            out.push('\n');
        }
    }
    out
}

fn land(root: &Path, name: &str, content: &str) {
    std::fs::write(root.join("unhcr").join("displacement").join(name), content).unwrap();
}

fn contract() -> Contract {
    Contract::from_yaml(CONTRACT).unwrap()
}

#[tokio::test]
async fn test_two_files_two_years_publish_independently() {
    let ws = workspace();
    land(&ws.root, "2019-2020.jsonl", &records(0..5, &[2019, 2020], 100));
    land(&ws.root, "2019-2020-part-2.jsonl", &records(5..10, &[2019, 2020], 100));

    let pipeline = Pipeline::new(Arc::clone(&ws.storage));
    let report = pipeline.discover(&ws.root).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.registration.inserted, 2);
    assert_eq!(report.routing.links_created, 4);
    assert!(report.event_id.is_some());

    let planner = Planner::new(&ws.storage);
    let queue: Vec<_> = planner
        .dirty_queue()
        .unwrap()
        .into_iter()
        .map(|d| (d.entity, d.partition_key))
        .collect();
    assert_eq!(
        queue,
        vec![
            ("displacement".to_string(), "2019".to_string()),
            ("displacement".to_string(), "2020".to_string()),
        ]
    );
    for year in ["2019", "2020"] {
        assert_eq!(planner.plan("displacement", year).unwrap().inputs.len(), 2);
    }

    let outcomes = pipeline
        .rebuild_dirty(&[contract()], &JsonRecordsTransform, &ContractGate)
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        let PartitionStatus::Published(published) = &outcome.status else {
            panic!("partition {} not published: {:?}", outcome.partition_key, outcome.status);
        };
        let record = published.record();
        assert_eq!(record.row_count, 10);
        assert_eq!(
            (record.insert_cnt, record.update_cnt, record.delete_cnt),
            (10, 0, 0)
        );
        assert_eq!(record.rows_in, 20);
        assert_eq!(record.spec_version, "3");
        assert_eq!(record.inputs.len(), 2);
        assert!(record.partition_hash.is_some());
    }

    let commits = CommitLog::new(&ws.storage).all().unwrap();
    assert_eq!(commits.len(), 2);
    assert_ne!(commits[0].run_id, commits[1].run_id);

    let tracker = DirtyTracker::new(&ws.storage);
    assert!(tracker.list(Some(DirtyStatus::Dirty)).unwrap().is_empty());
    assert!(tracker.list(Some(DirtyStatus::Rebuilding)).unwrap().is_empty());
    assert_eq!(
        Registry::new(&ws.storage)
            .by_status(FileStatus::Processed)
            .unwrap()
            .len(),
        2
    );

    let events = LineageLog::new(&ws.storage)
        .events_for("displacement", "2019")
        .unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::TransformRun, EventType::PartitionPublished]);
    let published = &events[1];
    assert_eq!(published.dq_status(), Some("passed"));
    assert_eq!(
        LineageLog::new(&ws.storage)
            .inputs_for(&published.event_id)
            .unwrap()
            .len(),
        2
    );

    // Nothing new landed: a second pass changes nothing and emits nothing.
    let again = pipeline.discover(&ws.root).await.unwrap();
    assert_eq!(again.registration.unchanged, 2);
    assert_eq!(again.routing.links_created, 0);
    assert_eq!(again.event_id, None);
}

#[tokio::test]
async fn test_new_file_version_reports_updates_and_deletes() {
    let ws = workspace();
    land(&ws.root, "2019-2020.jsonl", &records(0..5, &[2019, 2020], 100));
    land(&ws.root, "2019-2020-part-2.jsonl", &records(5..10, &[2019, 2020], 100));

    let pipeline = Pipeline::new(Arc::clone(&ws.storage));
    pipeline.discover(&ws.root).await.unwrap();
    pipeline
        .rebuild_dirty(&[contract()], &JsonRecordsTransform, &ContractGate)
        .unwrap();

    // The second file is re-delivered: C9/2019 is gone and C5/2020 changed.
    let mut revised = records(5..9, &[2019], 100);
    revised.push_str(&records(6..10, &[2020], 100));
    revised.push_str(&json!({"country": "C5", "year": 2020, "refugees": 999}).to_string());
    revised.push('\n');
    land(&ws.root, "2019-2020-part-2.jsonl", &revised);

    let report = pipeline.discover(&ws.root).await.unwrap();
    assert_eq!(report.registration.inserted, 1);
    assert_eq!(report.registration.superseded, 1);
    assert_eq!(report.routing.links_created, 2);

    let outcomes = pipeline
        .rebuild_dirty(&[contract()], &JsonRecordsTransform, &ContractGate)
        .unwrap();
    let counts: Vec<_> = outcomes
        .iter()
        .map(|o| match &o.status {
            PartitionStatus::Published(p) => {
                let r = p.record();
                (o.partition_key.clone(), r.insert_cnt, r.update_cnt, r.delete_cnt)
            }
            other => panic!("unexpected status {other:?}"),
        })
        .collect();
    assert_eq!(
        counts,
        vec![("2019".to_string(), 0, 0, 1), ("2020".to_string(), 0, 1, 0)]
    );

    let history = CommitLog::new(&ws.storage)
        .history("displacement", "2020")
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_ne!(history[0].partition_hash, history[1].partition_hash);
}

fn failing_transform(
    _contract: &Contract,
    plan: &BuildPlan,
    _ctx: &TransformContext<'_>,
) -> Result<TransformOutput, TransformError> {
    Err(TransformError::Failed {
        entity: plan.entity.clone(),
        partition_key: plan.partition_key.clone(),
        message: "upstream schema drift".to_string(),
    })
}

#[tokio::test]
async fn test_failed_rebuild_leaves_partition_dirty_for_retry() {
    let ws = workspace();
    land(&ws.root, "2020.jsonl", &records(0..3, &[2020], 1));

    let pipeline = Pipeline::new(Arc::clone(&ws.storage));
    pipeline.discover(&ws.root).await.unwrap();

    let outcomes = pipeline
        .rebuild_dirty(&[contract()], &failing_transform, &ContractGate)
        .unwrap();
    assert!(matches!(
        &outcomes[0].status,
        PartitionStatus::Failed { error } if error.contains("upstream schema drift")
    ));

    let dirty = DirtyTracker::new(&ws.storage)
        .active("displacement", "2020")
        .unwrap();
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].status, DirtyStatus::Dirty);
    assert!(dirty[0].reason.as_deref().unwrap().starts_with("rebuild failed"));
    assert!(CommitLog::new(&ws.storage).all().unwrap().is_empty());
    assert_eq!(
        Registry::new(&ws.storage)
            .by_status(FileStatus::Pending)
            .unwrap()
            .len(),
        1
    );

    let retry = pipeline
        .rebuild_dirty(&[contract()], &JsonRecordsTransform, &ContractGate)
        .unwrap();
    assert!(retry[0].is_published());
    assert_eq!(retry[0].status_record_inserts(), Some(3));
}

#[tokio::test]
async fn test_gate_failure_is_reported_and_retryable() {
    let ws = workspace();
    let mut bad = records(0..2, &[2020], 1);
    bad.push_str(&json!({"country": "C9", "year": 2020, "refugees": -4}).to_string());
    land(&ws.root, "2020.jsonl", &bad);

    let pipeline = Pipeline::new(Arc::clone(&ws.storage));
    pipeline.discover(&ws.root).await.unwrap();
    let outcomes = pipeline
        .rebuild_dirty(&[contract()], &JsonRecordsTransform, &ContractGate)
        .unwrap();
    assert!(matches!(
        &outcomes[0].status,
        PartitionStatus::Failed { error } if error.contains("non_negative")
    ));
    assert_eq!(
        DirtyTracker::new(&ws.storage)
            .list(Some(DirtyStatus::Dirty))
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_reverted_file_revives_older_version() {
    let ws = workspace();
    let original = records(0..2, &[2020], 1);
    land(&ws.root, "2020.jsonl", &original);
    let pipeline = Pipeline::new(Arc::clone(&ws.storage));
    pipeline.discover(&ws.root).await.unwrap();

    land(&ws.root, "2020.jsonl", &records(0..2, &[2020], 50));
    pipeline.discover(&ws.root).await.unwrap();

    land(&ws.root, "2020.jsonl", &original);
    let report = pipeline.discover(&ws.root).await.unwrap();
    assert_eq!(report.registration.revived, 1);
    assert_eq!(report.registration.superseded, 1);

    let path = ws.root.join("unhcr").join("displacement").join("2020.jsonl");
    let versions = Registry::new(&ws.storage)
        .versions(&path.to_string_lossy())
        .unwrap();
    let statuses: Vec<_> = versions.iter().map(|v| v.status).collect();
    assert_eq!(statuses, vec![FileStatus::Superseded, FileStatus::Pending]);
}

trait StatusExt {
    fn status_record_inserts(&self) -> Option<u64>;
}

impl StatusExt for tidemark_core::PartitionOutcome {
    fn status_record_inserts(&self) -> Option<u64> {
        match &self.status {
            PartitionStatus::Published(p) => Some(p.record().insert_cnt),
            _ => None,
        }
    }
}
