//! JSON snapshots of the commit log and dirty queue.
//!
//! Snapshots are written atomically: serialize, write a uniquely named
//! temporary sibling, then rename over the target, so readers never see a
//! half-written file.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::commit::{CommitLog, CommitRecord};
use crate::dirty::DirtyTracker;
use crate::error::Result;
use crate::storage::Storage;
use crate::types::DirtyPartition;

/// Point-in-time view of what has been published and what is still owed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub exported_at: DateTime<Utc>,
    pub schema_version: i64,
    pub commits: Vec<CommitRecord>,
    /// Dirty and rebuilding partitions; clean history is omitted.
    pub outstanding: Vec<DirtyPartition>,
}

impl Snapshot {
    pub fn capture(storage: &Storage) -> Result<Self> {
        let commits = CommitLog::new(storage).all()?;
        let outstanding = DirtyTracker::new(storage)
            .list(None)?
            .into_iter()
            .filter(|d| d.status.is_active())
            .collect();
        Ok(Self {
            exported_at: Utc::now(),
            schema_version: storage.schema_version()?,
            commits,
            outstanding,
        })
    }
}

/// Write `snapshot` as pretty JSON, replacing `path` in one rename.
///
/// The temporary file is a hidden, uniquely named sibling so concurrent
/// exports to the same target never share it; it is removed if the rename
/// fails.
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let tmp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, json)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Capture a [`Snapshot`] and write it to `path`.
pub fn export_snapshot(storage: &Storage, path: &Path) -> Result<Snapshot> {
    let snapshot = Snapshot::capture(storage)?;
    write_snapshot(path, &snapshot)?;
    info!(
        path = %path.display(),
        commits = snapshot.commits.len(),
        outstanding = snapshot.outstanding.len(),
        "Exported snapshot"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_export_empty_store() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open_in_memory().unwrap();
        let path = dir.path().join("nested").join("snapshot.json");

        let snapshot = export_snapshot(&storage, &path).unwrap();
        assert!(snapshot.commits.is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("snapshot.json")]);

        let loaded: Snapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_export_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "stale").unwrap();

        let storage = Storage::open_in_memory().unwrap();
        DirtyTracker::new(&storage)
            .mark_dirty("E", "2020", "new_input")
            .unwrap();
        export_snapshot(&storage, &path).unwrap();

        let loaded: Snapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.outstanding.len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_snapshot_lists_outstanding_only() {
        let storage = Storage::open_in_memory().unwrap();
        let tracker = DirtyTracker::new(&storage);
        tracker.mark_dirty("E", "2019", "new_input").unwrap();
        tracker.mark_dirty("E", "2020", "new_input").unwrap();
        tracker.claim("E", "2020", "run-1").unwrap();
        tracker.mark_clean("E", "2020", "run-1").unwrap();

        let snapshot = Snapshot::capture(&storage).unwrap();
        let keys: Vec<_> = snapshot
            .outstanding
            .iter()
            .map(|d| d.partition_key.as_str())
            .collect();
        assert_eq!(keys, vec!["2019"]);
    }
}
