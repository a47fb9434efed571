//! Quality gates: named pass/fail checks over staged rows.
//!
//! A gate never mutates anything; the publisher aborts before the swap when
//! any check fails and surfaces the whole report.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::contract::Contract;
use crate::fingerprint::canonical_token;
use crate::types::Row;

/// Maximum number of offending row indices kept in a check's details.
const SAMPLE_LIMIT: usize = 5;

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Passed => write!(f, "passed"),
            CheckStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One named check with its details payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    /// Check-specific payload; always carries a `violations` count.
    pub details: Value,
}

impl CheckResult {
    /// Build a result from a violation count: zero violations passes.
    pub fn from_violations(name: impl Into<String>, violations: usize, mut details: Value) -> Self {
        if let Value::Object(map) = &mut details {
            map.insert("violations".into(), json!(violations));
        } else {
            details = json!({ "violations": violations });
        }
        Self {
            name: name.into(),
            status: if violations == 0 {
                CheckStatus::Passed
            } else {
                CheckStatus::Failed
            },
            details,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }

    pub fn violations(&self) -> u64 {
        self.details
            .get("violations")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Ordered list of checks. Passed iff every check passed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub checks: Vec<CheckResult>,
}

impl QualityReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        Self { checks }
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }

    pub fn status(&self) -> CheckStatus {
        if self.passed() {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed
        }
    }

    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed()).collect()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed_checks()
            .into_iter()
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Compact summary stored on commit records and lineage events.
    pub fn summary(&self) -> Value {
        json!({
            "status": self.status(),
            "tests_total": self.checks.len(),
            "tests_failed": self.failed_checks().len(),
            "checks": self.checks.iter().map(|c| json!({
                "name": c.name,
                "status": c.status,
                "violations": c.violations(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// What a gate knows about the partition being published.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub contract: &'a Contract,
    pub partition_key: &'a str,
    pub run_id: &'a str,
}

/// A pure function from staged rows to a report.
pub trait QualityGate: Send + Sync {
    fn evaluate(&self, rows: &[Row], ctx: &GateContext<'_>) -> QualityReport;
}

impl<F> QualityGate for F
where
    F: Fn(&[Row], &GateContext<'_>) -> QualityReport + Send + Sync,
{
    fn evaluate(&self, rows: &[Row], ctx: &GateContext<'_>) -> QualityReport {
        self(rows, ctx)
    }
}

/// Runs several gates and concatenates their checks in order.
#[derive(Default)]
pub struct GateChain {
    gates: Vec<Box<dyn QualityGate>>,
}

impl GateChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gate: impl QualityGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }
}

impl QualityGate for GateChain {
    fn evaluate(&self, rows: &[Row], ctx: &GateContext<'_>) -> QualityReport {
        QualityReport::new(
            self.gates
                .iter()
                .flat_map(|g| g.evaluate(rows, ctx).checks)
                .collect(),
        )
    }
}

/// The contract checks: schema, keys, nullability, sign, types and partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractGate;

fn is_null(row: &Row, column: &str) -> bool {
    row.get(column).is_none_or(Value::is_null)
}

/// Whether a partition column value names `partition_key`. Numbers compare
/// numerically, so a float column holding `2020.0` matches key `2020`.
pub(crate) fn value_matches_key(value: Option<&Value>, partition_key: &str) -> bool {
    match value {
        Some(Value::Number(n)) => {
            n.to_string() == partition_key
                || partition_key
                    .parse::<f64>()
                    .is_ok_and(|key| n.as_f64() == Some(key))
        }
        Some(value) => canonical_token(value) == partition_key,
        None => false,
    }
}

fn sample(indices: &[usize]) -> Vec<usize> {
    indices.iter().take(SAMPLE_LIMIT).copied().collect()
}

/// Count rows per column that fail `bad`, with sample row indices.
fn per_column<F>(rows: &[Row], columns: &[String], bad: F) -> (usize, Value)
where
    F: Fn(&Row, &str) -> bool,
{
    let mut total = 0;
    let mut by_column = BTreeMap::new();
    for col in columns {
        let offenders: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| bad(row, col))
            .map(|(i, _)| i)
            .collect();
        if !offenders.is_empty() {
            total += offenders.len();
            by_column.insert(
                col.clone(),
                json!({ "count": offenders.len(), "sample_rows": sample(&offenders) }),
            );
        }
    }
    (total, json!({ "columns": by_column }))
}

impl ContractGate {
    fn schema(rows: &[Row], contract: &Contract) -> CheckResult {
        let columns = contract.column_names();
        let (violations, details) = per_column(rows, &columns, |row, col| !row.contains_key(col));
        CheckResult::from_violations("schema", violations, details)
    }

    fn pk_not_null(rows: &[Row], contract: &Contract) -> CheckResult {
        let (violations, details) = per_column(rows, &contract.primary_key, is_null);
        CheckResult::from_violations("pk_not_null", violations, details)
    }

    fn pk_unique(rows: &[Row], contract: &Contract) -> CheckResult {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let key: Vec<String> = contract
                .primary_key
                .iter()
                .map(|c| row.get(c).map(canonical_token).unwrap_or_default())
                .collect();
            if !seen.insert(key) {
                duplicates.push(i);
            }
        }
        CheckResult::from_violations(
            "pk_unique",
            duplicates.len(),
            json!({ "sample_rows": sample(&duplicates) }),
        )
    }

    fn not_null(rows: &[Row], contract: &Contract) -> CheckResult {
        let required: Vec<String> = contract
            .columns
            .iter()
            .filter(|c| !c.nullable)
            .map(|c| c.name.clone())
            .collect();
        let (violations, details) = per_column(rows, &required, is_null);
        CheckResult::from_violations("not_null", violations, details)
    }

    fn non_negative(rows: &[Row], contract: &Contract) -> CheckResult {
        let (violations, details) = per_column(rows, &contract.rules.non_negative, |row, col| {
            row.get(col)
                .and_then(Value::as_f64)
                .is_some_and(|v| v < 0.0)
        });
        CheckResult::from_violations("non_negative", violations, details)
    }

    fn types_match(rows: &[Row], contract: &Contract) -> CheckResult {
        let columns = contract.column_names();
        let (violations, details) = per_column(rows, &columns, |row, col| {
            match (row.get(col), contract.column(col)) {
                (Some(value), Some(spec)) => !spec.dtype.accepts(value),
                _ => false,
            }
        });
        CheckResult::from_violations("types_match", violations, details)
    }

    fn partition_matches_key(rows: &[Row], column: &str, partition_key: &str) -> CheckResult {
        let offenders: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !value_matches_key(row.get(column), partition_key))
            .map(|(i, _)| i)
            .collect();
        CheckResult::from_violations(
            "partition_matches_key",
            offenders.len(),
            json!({
                "column": column,
                "partition_key": partition_key,
                "sample_rows": sample(&offenders),
            }),
        )
    }
}

impl QualityGate for ContractGate {
    fn evaluate(&self, rows: &[Row], ctx: &GateContext<'_>) -> QualityReport {
        let contract = ctx.contract;
        let mut checks = vec![
            Self::schema(rows, contract),
            Self::pk_not_null(rows, contract),
            Self::pk_unique(rows, contract),
            Self::not_null(rows, contract),
            Self::non_negative(rows, contract),
            Self::types_match(rows, contract),
        ];
        if let Some(column) = &contract.partition_column {
            checks.push(Self::partition_matches_key(rows, column, ctx.partition_key));
        }
        QualityReport::new(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
rules:
  non_negative: [refugees]
"#,
        )
        .unwrap()
    }

    fn rows(values: Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn ctx<'a>(contract: &'a Contract) -> GateContext<'a> {
        GateContext {
            contract,
            partition_key: "2020",
            run_id: "run-1",
        }
    }

    #[test]
    fn test_clean_rows_pass_every_check() {
        let contract = contract();
        let data = rows(json!([
            {"country": "AFG", "year": 2020, "refugees": 10},
            {"country": "SYR", "year": 2020, "refugees": 0},
        ]));
        let report = ContractGate.evaluate(&data, &ctx(&contract));
        assert!(report.passed());
        assert_eq!(report.checks.len(), 7);
        assert_eq!(report.summary()["tests_failed"], json!(0));
    }

    #[test]
    fn test_every_failing_check_is_reported_with_counts() {
        let contract = contract();
        let data = rows(json!([
            {"country": "AFG", "year": 2020, "refugees": -5},
            {"country": "AFG", "year": 2020, "refugees": "many"},
            {"country": null, "year": 2019},
        ]));
        let report = ContractGate.evaluate(&data, &ctx(&contract));
        assert!(!report.passed());
        assert_eq!(
            report.failed_names(),
            vec![
                "schema",
                "pk_not_null",
                "pk_unique",
                "not_null",
                "non_negative",
                "types_match",
                "partition_matches_key",
            ]
        );
        let by_name = |name: &str| {
            report
                .checks
                .iter()
                .find(|c| c.name == name)
                .unwrap()
                .violations()
        };
        assert_eq!(by_name("non_negative"), 1);
        assert_eq!(by_name("pk_unique"), 1);
        assert_eq!(by_name("partition_matches_key"), 1);
        assert_eq!(by_name("schema"), 1);
    }

    #[test]
    fn test_float_partition_column_matches_whole_key() {
        assert!(value_matches_key(Some(&json!(2020.0)), "2020"));
        assert!(value_matches_key(Some(&json!(2020)), "2020"));
        assert!(value_matches_key(Some(&json!("2020")), "2020"));
        assert!(!value_matches_key(Some(&json!(2019.5)), "2020"));
        assert!(!value_matches_key(None, "2020"));
    }

    #[test]
    fn test_closure_gate_and_chain() {
        let contract = contract();
        fn row_limit(rows: &[Row], _: &GateContext<'_>) -> QualityReport {
            QualityReport::new(vec![CheckResult::from_violations(
                "row_limit",
                rows.len().saturating_sub(1),
                json!({}),
            )])
        }
        let chain = GateChain::new().with(ContractGate).with(row_limit);
        let data = rows(json!([
            {"country": "AFG", "year": 2020, "refugees": 1},
            {"country": "SYR", "year": 2020, "refugees": 1},
        ]));
        let report = chain.evaluate(&data, &ctx(&contract));
        assert_eq!(report.checks.len(), 8);
        assert_eq!(report.failed_names(), vec!["row_limit"]);
    }
}
