//! Change detection between a freshly built partition and its published state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ReconciliationError;
use crate::fingerprint::{canonical_token, partition_hash};
use crate::types::{ROW_HASH_COLUMN, Row};

/// Insert/update/delete accounting for one rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub unchanged: usize,
    /// Order-independent digest of the new rows; `None` when there are none.
    pub partition_hash: Option<String>,
}

impl ReconcileSummary {
    /// The rebuild would leave the partition exactly as it is.
    pub fn is_noop(&self) -> bool {
        self.inserts == 0 && self.updates == 0 && self.deletes == 0
    }
}

type Side = &'static str;

fn row_hash<'r>(row: &'r Row, side: Side, index: usize) -> Result<&'r str, ReconciliationError> {
    row.get(ROW_HASH_COLUMN)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ReconciliationError::MissingColumn {
            side,
            index,
            column: ROW_HASH_COLUMN.to_string(),
        })
}

fn key_of(
    row: &Row,
    primary_key: &[String],
    side: Side,
    index: usize,
) -> Result<Vec<String>, ReconciliationError> {
    primary_key
        .iter()
        .map(|col| {
            row.get(col)
                .map(canonical_token)
                .ok_or_else(|| ReconciliationError::MissingColumn {
                    side,
                    index,
                    column: col.clone(),
                })
        })
        .collect()
}

fn index_rows<'r>(
    rows: &'r [Row],
    primary_key: &[String],
    side: Side,
) -> Result<HashMap<Vec<String>, &'r str>, ReconciliationError> {
    let mut index = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let key = key_of(row, primary_key, side, i)?;
        let hash = row_hash(row, side, i)?;
        if index.contains_key(&key) {
            return Err(ReconciliationError::DuplicateKey {
                side,
                key: key.join(", "),
            });
        }
        index.insert(key, hash);
    }
    Ok(index)
}

/// Compare `new_rows` against `old_rows` on `primary_key`.
///
/// Both sides must carry `_row_hash`. New-only keys are inserts, old-only keys
/// are deletes, and matched keys with differing fingerprints are updates.
pub fn reconcile(
    new_rows: &[Row],
    old_rows: &[Row],
    primary_key: &[String],
) -> Result<ReconcileSummary, ReconciliationError> {
    if primary_key.is_empty() {
        return Err(ReconciliationError::EmptyPrimaryKey);
    }

    let new_index = index_rows(new_rows, primary_key, "new")?;
    let old_index = index_rows(old_rows, primary_key, "old")?;

    let mut summary = ReconcileSummary::default();
    for (key, new_hash) in &new_index {
        match old_index.get(key) {
            None => summary.inserts += 1,
            Some(old_hash) if old_hash != new_hash => summary.updates += 1,
            Some(_) => summary.unchanged += 1,
        }
    }
    summary.deletes = old_index
        .keys()
        .filter(|key| !new_index.contains_key(*key))
        .count();
    summary.partition_hash = partition_hash(new_index.values().copied());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, hash: &str) -> Row {
        json!({"id": id, "_row_hash": hash})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn pk() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_insert_delete_without_update() {
        let old = vec![row("A", "h1"), row("B", "h2")];
        let new = vec![row("A", "h1"), row("C", "h3")];
        let summary = reconcile(&new, &old, &pk()).unwrap();
        assert_eq!(
            (summary.inserts, summary.updates, summary.deletes, summary.unchanged),
            (1, 0, 1, 1)
        );

        let reversed: Vec<Row> = new.iter().rev().cloned().collect();
        let again = reconcile(&reversed, &old, &pk()).unwrap();
        assert_eq!(summary.partition_hash, again.partition_hash);
    }

    #[test]
    fn test_identical_sets_are_noop() {
        let rows = vec![row("A", "h1"), row("B", "h2")];
        let first = reconcile(&rows, &rows, &pk()).unwrap();
        let second = reconcile(&rows, &rows, &pk()).unwrap();
        assert!(first.is_noop());
        assert_eq!(first.unchanged, 2);
        assert_eq!(first.partition_hash, second.partition_hash);
        assert!(first.partition_hash.is_some());
    }

    #[test]
    fn test_changed_fingerprint_is_update() {
        let old = vec![row("A", "h1")];
        let new = vec![row("A", "h1-changed")];
        let summary = reconcile(&new, &old, &pk()).unwrap();
        assert_eq!(summary.updates, 1);
        assert!(!summary.is_noop());
    }

    #[test]
    fn test_empty_sides() {
        let rows = vec![row("A", "h1"), row("B", "h2")];
        let all_new = reconcile(&rows, &[], &pk()).unwrap();
        assert_eq!((all_new.inserts, all_new.updates, all_new.deletes), (2, 0, 0));

        let all_gone = reconcile(&[], &rows, &pk()).unwrap();
        assert_eq!(all_gone.deletes, 2);
        assert_eq!(all_gone.partition_hash, None);
    }

    #[test]
    fn test_missing_columns_are_fatal() {
        let no_hash = vec![json!({"id": "A"}).as_object().cloned().unwrap()];
        assert!(matches!(
            reconcile(&no_hash, &[], &pk()),
            Err(ReconciliationError::MissingColumn { side: "new", .. })
        ));

        let no_key = vec![json!({"_row_hash": "h"}).as_object().cloned().unwrap()];
        assert!(matches!(
            reconcile(&[], &no_key, &pk()),
            Err(ReconciliationError::MissingColumn { side: "old", ref column, .. }) if column == "id"
        ));

        assert!(matches!(
            reconcile(&[], &[], &[]),
            Err(ReconciliationError::EmptyPrimaryKey)
        ));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let dup = vec![row("A", "h1"), row("A", "h2")];
        assert!(matches!(
            reconcile(&dup, &[], &pk()),
            Err(ReconciliationError::DuplicateKey { side: "new", .. })
        ));
    }
}
