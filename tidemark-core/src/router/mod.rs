//! Router: maps registered files to (entity, partition) targets.
//!
//! Rules are declared in YAML, compiled once, and stored in the
//! `entity_router` table keyed by `route_id`. A file may match several rules;
//! each match fans out independently into one link per covered period.
//!
//! ```yaml
//! routes:
//!   - route_id: unhcr_displacement
//!     source_id: unhcr
//!     path_pattern: 'displacement/.*\.parquet$'
//!     entity: refugee_displacement
//!     grain: year
//! ```

pub mod coverage;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contract::is_valid_identifier;
use crate::dirty::{is_active_in, mark_dirty_in};
use crate::error::{ConfigError, Result, RoutingError, StorageError};
use crate::registry::{latest_pending, mark_failed};
use crate::storage::{Storage, collect_rows, parse_column};
use crate::types::{FileRecord, Grain, PartitionLink, format_ts};

pub use coverage::expand_coverage;

/// Reason recorded on dirty partitions marked by routing.
pub const NEW_INPUT_REASON: &str = "new_input";

/// Dirty reason for a linked file version that is pending again.
pub const PENDING_INPUT_REASON: &str = "pending_input";

fn default_enabled() -> bool {
    true
}

/// Declarative form of a route rule, as read from YAML or the router table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub path_pattern: String,
    pub entity: String,
    pub grain: Grain,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    routes: Vec<RuleSpec>,
}

/// A route rule with its path pattern compiled.
#[derive(Debug, Clone)]
pub struct RouteRule {
    spec: RuleSpec,
    pattern: Regex,
}

impl RouteRule {
    pub fn new(spec: RuleSpec) -> std::result::Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            route_id: spec.route_id.clone(),
            reason,
        };
        if spec.route_id.trim().is_empty() {
            return Err(invalid("route_id is empty".into()));
        }
        if !is_valid_identifier(&spec.entity) {
            return Err(invalid(format!("invalid entity name '{}'", spec.entity)));
        }
        let pattern = Regex::new(&spec.path_pattern)
            .map_err(|e| invalid(format!("bad path_pattern: {e}")))?;
        Ok(Self { spec, pattern })
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn route_id(&self) -> &str {
        &self.spec.route_id
    }

    pub fn entity(&self) -> &str {
        &self.spec.entity
    }

    pub fn grain(&self) -> Grain {
        self.spec.grain
    }

    /// Enabled, source filter absent or equal, and pattern found in the path.
    pub fn matches(&self, file: &FileRecord) -> bool {
        self.spec.enabled
            && self
                .spec
                .source_id
                .as_deref()
                .is_none_or(|s| s == file.source_id)
            && self.pattern.is_match(&file.file_path)
    }
}

/// An ordered, validated collection of route rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RouteRule>,
}

impl RuleSet {
    /// Compile rules, rejecting duplicate route ids.
    pub fn new(specs: Vec<RuleSpec>) -> std::result::Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec.route_id.clone()) {
                return Err(ConfigError::DuplicateRoute {
                    route_id: spec.route_id,
                });
            }
            rules.push(RouteRule::new(spec)?);
        }
        Ok(Self { rules })
    }

    pub fn from_yaml(text: &str) -> std::result::Result<Self, ConfigError> {
        let file: RuleFile = serde_yaml::from_str(text).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        Self::new(file.routes)
    }

    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_yaml(&text)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Expand a file into partition links against every matching rule.
///
/// Coverage is interpreted in each rule's grain. If any matching rule cannot
/// expand the file, the whole file is rejected and no links are returned.
pub fn expand(
    file: &FileRecord,
    rules: &RuleSet,
) -> std::result::Result<Vec<PartitionLink>, RoutingError> {
    let mut links = Vec::new();
    for rule in rules.rules().iter().filter(|r| r.matches(file)) {
        let (Some(start), Some(end)) = (&file.coverage_start, &file.coverage_end) else {
            return Err(RoutingError::MissingCoverage);
        };
        for partition_key in expand_coverage(start, end, rule.grain())? {
            links.push(PartitionLink {
                file_path: file.file_path.clone(),
                content_hash: file.content_hash.clone(),
                entity: rule.entity().to_string(),
                partition_key,
                route_id: rule.route_id().to_string(),
            });
        }
    }
    Ok(links)
}

/// Result of one routing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOutcome {
    /// Pending files examined.
    pub files_routed: usize,
    pub links_created: usize,
    pub dirty_marked: usize,
    /// Pending files no enabled rule matched.
    pub unmatched: Vec<String>,
    /// Files rejected by expansion, with the reason. They are now `failed`.
    pub rejected: Vec<(String, String)>,
    /// Distinct (entity, partition_key) targets marked dirty by this pass.
    pub targets: BTreeSet<(String, String)>,
}

fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleSpec> {
    let enabled: i64 = row.get(5)?;
    Ok(RuleSpec {
        route_id: row.get(0)?,
        source_id: row.get(1)?,
        path_pattern: row.get(2)?,
        entity: row.get(3)?,
        grain: parse_column(row, 4)?,
        enabled: enabled != 0,
        notes: row.get(6)?,
    })
}

pub(crate) fn stored_rules(conn: &Connection) -> Result<RuleSet> {
    let mut stmt = conn.prepare(
        "SELECT route_id, source_id, path_pattern, entity, grain, enabled, notes
         FROM entity_router ORDER BY route_id",
    )?;
    let rows = stmt.query_map([], rule_from_row)?;
    let specs = collect_rows(rows)?;
    Ok(RuleSet::new(specs)?)
}

fn insert_link(
    conn: &Connection,
    link: &PartitionLink,
    run_id: &str,
    now: &DateTime<Utc>,
) -> std::result::Result<bool, StorageError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO manifest_partition_link
            (file_path, content_hash, entity, partition_key, route_id, linked_at, run_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            link.file_path,
            link.content_hash,
            link.entity,
            link.partition_key,
            link.route_id,
            format_ts(now),
            run_id,
        ],
    )?;
    Ok(inserted > 0)
}

/// Route every latest pending file inside the caller's transaction.
pub(crate) fn route_pending_in(
    conn: &Connection,
    run_id: &str,
    now: &DateTime<Utc>,
) -> Result<RoutingOutcome> {
    let rules = stored_rules(conn)?;
    let pending = latest_pending(conn)?;
    let mut outcome = RoutingOutcome {
        files_routed: pending.len(),
        ..RoutingOutcome::default()
    };

    for file in &pending {
        let links = match expand(file, &rules) {
            Ok(links) => links,
            Err(e) => {
                let reason = format!("routing: {e}");
                warn!(path = %file.file_path, reason = %reason, "Rejected file during routing");
                mark_failed(conn, &file.file_path, &file.content_hash, &reason)?;
                outcome.rejected.push((file.file_path.clone(), reason));
                continue;
            }
        };
        if links.is_empty() {
            debug!(path = %file.file_path, "No route matched file");
            outcome.unmatched.push(file.file_path.clone());
            continue;
        }

        let mut seen_targets = HashSet::new();
        for link in &links {
            if !seen_targets.insert((link.entity.as_str(), link.partition_key.as_str())) {
                debug!(
                    path = %file.file_path,
                    entity = %link.entity,
                    partition_key = %link.partition_key,
                    route_id = %link.route_id,
                    "Multiple routes target the same partition"
                );
            }
            let reason = if insert_link(conn, link, run_id, now)? {
                outcome.links_created += 1;
                NEW_INPUT_REASON
            } else if !is_active_in(conn, &link.entity, &link.partition_key)? {
                // Already linked but still pending, e.g. a revived version.
                PENDING_INPUT_REASON
            } else {
                continue;
            };
            mark_dirty_in(conn, &link.entity, &link.partition_key, reason, now)?;
            outcome.dirty_marked += 1;
            outcome
                .targets
                .insert((link.entity.clone(), link.partition_key.clone()));
        }
    }

    Ok(outcome)
}

/// Router operations over a [`Storage`].
pub struct Router<'a> {
    storage: &'a Storage,
}

impl<'a> Router<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Upsert rules into the router table, keyed by `route_id`.
    pub fn load_rules(&self, rules: &RuleSet) -> Result<usize> {
        let now = format_ts(&Utc::now());
        let count = self.storage.transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO entity_router
                    (route_id, source_id, path_pattern, entity, grain, enabled, notes, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(route_id) DO UPDATE SET
                    source_id = excluded.source_id,
                    path_pattern = excluded.path_pattern,
                    entity = excluded.entity,
                    grain = excluded.grain,
                    enabled = excluded.enabled,
                    notes = excluded.notes,
                    updated_at = excluded.updated_at",
            )?;
            for rule in rules.rules() {
                let spec = rule.spec();
                stmt.execute(params![
                    spec.route_id,
                    spec.source_id,
                    spec.path_pattern,
                    spec.entity,
                    spec.grain.as_str(),
                    i64::from(spec.enabled),
                    spec.notes,
                    now,
                ])?;
            }
            Ok::<_, StorageError>(rules.len())
        })?;
        info!(rules = count, "Loaded route rules");
        Ok(count)
    }

    /// Rules currently stored in the router table.
    pub fn rules(&self) -> Result<RuleSet> {
        self.storage.read(stored_rules)
    }

    /// Expand every latest pending file, link it, and mark targets dirty.
    pub fn route_pending(&self, run_id: &str) -> Result<RoutingOutcome> {
        let now = Utc::now();
        let outcome = self
            .storage
            .transaction(|conn| route_pending_in(conn, run_id, &now))?;
        info!(
            run_id,
            files = outcome.files_routed,
            links_created = outcome.links_created,
            dirty_marked = outcome.dirty_marked,
            unmatched = outcome.unmatched.len(),
            rejected = outcome.rejected.len(),
            "Routed pending files"
        );
        Ok(outcome)
    }

    /// Links pointing at one partition.
    pub fn links_for(&self, entity: &str, partition_key: &str) -> Result<Vec<PartitionLink>> {
        let links = self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_path, content_hash, entity, partition_key, route_id
                 FROM manifest_partition_link
                 WHERE entity = ?1 AND partition_key = ?2
                 ORDER BY file_path, content_hash, route_id",
            )?;
            let rows = stmt.query_map(params![entity, partition_key], |row| {
                Ok(PartitionLink {
                    file_path: row.get(0)?,
                    content_hash: row.get(1)?,
                    entity: row.get(2)?,
                    partition_key: row.get(3)?,
                    route_id: row.get(4)?,
                })
            })?;
            collect_rows(rows)
        })?;
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileStatus;
    use pretty_assertions::assert_eq;

    const RULES: &str = r#"
routes:
  - route_id: displacement_year
    source_id: unhcr
    path_pattern: 'displacement/'
    entity: displacement
    grain: year
  - route_id: displacement_month
    path_pattern: 'displacement/'
    entity: displacement_monthly
    grain: month
  - route_id: disabled
    path_pattern: '.*'
    entity: never
    grain: year
    enabled: false
"#;

    fn file(path: &str, start: &str, end: &str) -> FileRecord {
        FileRecord {
            source_id: "unhcr".into(),
            file_path: path.into(),
            content_hash: "h".into(),
            file_size: 1,
            coverage_start: Some(start.into()),
            coverage_end: Some(end.into()),
            grain: Some(Grain::Year),
            discovered_at: Utc::now(),
            processed_at: None,
            status: FileStatus::Pending,
            run_id: None,
            notes: None,
        }
    }

    #[test]
    fn test_rule_set_from_yaml() {
        let rules = RuleSet::from_yaml(RULES).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.rules()[0].spec().enabled);
        assert!(!rules.rules()[2].spec().enabled);
    }

    #[test]
    fn test_duplicate_route_ids_rejected() {
        let text = RULES.replace("route_id: disabled", "route_id: displacement_year");
        assert!(matches!(
            RuleSet::from_yaml(&text),
            Err(ConfigError::DuplicateRoute { .. })
        ));
    }

    #[test]
    fn test_bad_pattern_fails_at_load() {
        let text = RULES.replace("'.*'", "'(unclosed'");
        assert!(matches!(
            RuleSet::from_yaml(&text),
            Err(ConfigError::InvalidRule { ref route_id, .. }) if route_id == "disabled"
        ));
    }

    #[test]
    fn test_expand_fans_out_across_rules() {
        let rules = RuleSet::from_yaml(RULES).unwrap();
        let links = expand(&file("unhcr/displacement/2019-2020.parquet", "2019", "2020"), &rules)
            .unwrap();
        let yearly: Vec<_> = links
            .iter()
            .filter(|l| l.entity == "displacement")
            .map(|l| l.partition_key.as_str())
            .collect();
        assert_eq!(yearly, vec!["2019", "2020"]);
        let monthly = links
            .iter()
            .filter(|l| l.entity == "displacement_monthly")
            .count();
        assert_eq!(monthly, 24);
        assert!(links.iter().all(|l| l.entity != "never"));
    }

    #[test]
    fn test_source_filter() {
        let rules = RuleSet::from_yaml(RULES).unwrap();
        let mut other = file("acled/displacement/2020.parquet", "2020", "2020");
        other.source_id = "acled".into();
        let links = expand(&other, &rules).unwrap();
        assert!(links.iter().all(|l| l.route_id == "displacement_month"));
    }

    #[test]
    fn test_inverted_coverage_rejects_whole_file() {
        let rules = RuleSet::from_yaml(RULES).unwrap();
        let err = expand(&file("unhcr/displacement/x.parquet", "2021", "2019"), &rules).unwrap_err();
        assert!(matches!(err, RoutingError::InvertedRange { .. }));
    }

    #[test]
    fn test_load_rules_upserts_in_place() {
        let storage = Storage::open_in_memory().unwrap();
        let router = Router::new(&storage);
        router.load_rules(&RuleSet::from_yaml(RULES).unwrap()).unwrap();

        let changed = RULES.replace("entity: displacement\n", "entity: displacement_v2\n");
        router.load_rules(&RuleSet::from_yaml(&changed).unwrap()).unwrap();

        let stored = router.rules().unwrap();
        assert_eq!(stored.len(), 3);
        let year = stored
            .rules()
            .iter()
            .find(|r| r.route_id() == "displacement_year")
            .unwrap();
        assert_eq!(year.entity(), "displacement_v2");
    }

    fn scanned(path: &str, hash: &str) -> crate::scanner::ScannedFile {
        crate::scanner::ScannedFile {
            source_id: "unhcr".into(),
            file_path: path.into(),
            content_hash: hash.into(),
            file_size: 1,
            coverage_start: Some("2020".into()),
            coverage_end: Some("2020".into()),
            grain: Some(Grain::Year),
            error: None,
        }
    }

    #[test]
    fn test_route_pending_is_idempotent_and_redirties_revived_versions() {
        use crate::dirty::DirtyTracker;
        use crate::registry::Registry;
        use crate::types::DirtyStatus;

        let storage = Storage::open_in_memory().unwrap();
        let router = Router::new(&storage);
        router.load_rules(&RuleSet::from_yaml(RULES).unwrap()).unwrap();
        let registry = Registry::new(&storage);
        let tracker = DirtyTracker::new(&storage);
        let path = "unhcr/displacement/2020.parquet";

        registry.register_scan(&[scanned(path, "v1")]).unwrap();
        let first = router.route_pending("run-1").unwrap();
        assert_eq!(first.links_created, 13);
        assert_eq!(first.targets.len(), 13);
        let again = router.route_pending("run-2").unwrap();
        assert_eq!(again.links_created, 0);
        assert_eq!(again.dirty_marked, 0);

        // Publish 2020 so the yearly key is clean, then revert to v1 via v2.
        tracker.claim("displacement", "2020", "run-3").unwrap();
        tracker.mark_clean("displacement", "2020", "run-3").unwrap();
        registry.register_scan(&[scanned(path, "v2")]).unwrap();
        registry.register_scan(&[scanned(path, "v1")]).unwrap();
        let revived = router.route_pending("run-4").unwrap();
        assert_eq!(revived.links_created, 0);
        assert!(
            revived
                .targets
                .contains(&("displacement".to_string(), "2020".to_string()))
        );
        let active = tracker.active("displacement", "2020").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, DirtyStatus::Dirty);
        assert_eq!(active[0].reason.as_deref(), Some(PENDING_INPUT_REASON));
    }
}
