//! Entity contracts: the typed shape of a published partition.
//!
//! Contracts are loaded from YAML and validated eagerly, so a bad column
//! reference fails at load time rather than halfway through a publish.
//!
//! ```yaml
//! entity: refugee_displacement
//! layer: silver
//! grain: year
//! version: "3"
//! partition_column: year
//! columns:
//!   - { name: country_origin, type: string, nullable: false }
//!   - { name: year, type: integer, nullable: false }
//!   - { name: refugees, type: integer }
//! primary_key: [country_origin, year]
//! rules:
//!   non_negative: [refugees]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::error::ContractError;
use crate::types::{Grain, PARTITION_KEY_COLUMN, ROW_HASH_COLUMN, RUN_ID_COLUMN};

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[serde(alias = "int", alias = "bigint")]
    Integer,
    #[serde(alias = "double", alias = "real")]
    Float,
    #[serde(alias = "text", alias = "varchar")]
    String,
    #[serde(alias = "bool")]
    Boolean,
    Date,
    #[serde(alias = "timestamp")]
    DateTime,
    Json,
}

impl ColumnType {
    /// SQLite storage class used for this column.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String | ColumnType::Date | ColumnType::DateTime | ColumnType::Json => {
                "TEXT"
            }
        }
    }

    /// Whether a non-null value has this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Json, _) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Date, Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            (ColumnType::DateTime, Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s).is_ok()
            }
            _ => false,
        }
    }

    /// Bring a value into the form this type is stored and read back as.
    ///
    /// Whole numbers in a float column become floats, so `1` and `1.0` hash
    /// and compare the same before and after a round trip through storage.
    pub fn normalize(&self, value: Value) -> Value {
        match (self, value) {
            (ColumnType::Float, Value::Number(n)) if !n.is_f64() => n
                .as_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Number(n)),
            (_, value) => value,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::Json => "json",
        };
        f.write_str(name)
    }
}

/// Schema for a single contract column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_nullable() -> bool {
    true
}

fn default_layer() -> String {
    "silver".to_string()
}

fn default_version() -> String {
    "1".to_string()
}

/// Named rules the built-in contract gate evaluates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractRules {
    #[serde(default)]
    pub non_negative: Vec<String>,
}

/// The typed, validated contract of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub entity: String,
    #[serde(default = "default_layer")]
    pub layer: String,
    pub grain: Grain,
    /// Contract version, recorded on every commit as `spec_version`.
    #[serde(default = "default_version")]
    pub version: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
    /// Columns hashed into the row fingerprint, in order. Defaults to all
    /// contract columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingerprint: Vec<String>,
    /// Business column that must equal the partition key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_column: Option<String>,
    #[serde(default)]
    pub rules: ContractRules,
}

impl Contract {
    /// Parse and validate a contract from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ContractError> {
        let mut contract: Contract =
            serde_yaml::from_str(text).map_err(|e| ContractError::Parse {
                message: e.to_string(),
            })?;
        if contract.fingerprint.is_empty() {
            contract.fingerprint = contract.column_names();
        }
        contract.validate()?;
        Ok(contract)
    }

    /// Load and validate a contract file.
    pub fn load(path: &Path) -> Result<Self, ContractError> {
        let text = std::fs::read_to_string(path).map_err(|e| ContractError::Parse {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_yaml(&text)
    }

    /// Load every `*.yaml`/`*.yml` contract in a directory, sorted by entity.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>, ContractError> {
        let mut contracts = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| ContractError::Parse {
            message: format!("{}: {e}", dir.display()),
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if is_yaml {
                contracts.push(Self::load(&path)?);
            }
        }
        contracts.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(contracts)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check the invariants a loaded contract must hold.
    pub fn validate(&self) -> Result<(), ContractError> {
        let entity = self.entity.clone();
        if !is_valid_identifier(&self.entity) {
            return Err(ContractError::InvalidEntity { entity });
        }
        if self.columns.is_empty() {
            return Err(ContractError::NoColumns { entity });
        }

        let mut seen = HashSet::new();
        for col in &self.columns {
            if [ROW_HASH_COLUMN, RUN_ID_COLUMN, PARTITION_KEY_COLUMN].contains(&col.name.as_str())
            {
                return Err(ContractError::ReservedColumn {
                    entity,
                    column: col.name.clone(),
                });
            }
            if !seen.insert(col.name.as_str()) {
                return Err(ContractError::DuplicateColumn {
                    entity,
                    column: col.name.clone(),
                });
            }
        }

        if self.primary_key.is_empty() {
            return Err(ContractError::EmptyPrimaryKey { entity });
        }
        let sections: [(&str, &[String]); 3] = [
            ("primary_key", &self.primary_key),
            ("fingerprint", &self.fingerprint),
            ("rules.non_negative", &self.rules.non_negative),
        ];
        for (section, names) in sections {
            for name in names {
                if !seen.contains(name.as_str()) {
                    return Err(ContractError::UnknownColumn {
                        entity,
                        column: name.clone(),
                        section: section.to_string(),
                    });
                }
            }
        }
        if let Some(col) = &self.partition_column {
            if !seen.contains(col.as_str()) {
                return Err(ContractError::UnknownColumn {
                    entity,
                    column: col.clone(),
                    section: "partition_column".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Plain ASCII identifier: letter or underscore, then letters, digits, underscores.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONTRACT: &str = r#"
entity: displacement
grain: year
version: "2"
partition_column: year
columns:
  - { name: country_origin, type: text, nullable: false }
  - { name: year, type: int, nullable: false }
  - { name: refugees, type: bigint }
  - { name: meta, type: json }
primary_key: [country_origin, year]
rules:
  non_negative: [refugees]
"#;

    #[test]
    fn test_parse_contract() {
        let c = Contract::from_yaml(CONTRACT).unwrap();
        assert_eq!(c.entity, "displacement");
        assert_eq!(c.layer, "silver");
        assert_eq!(c.grain, Grain::Year);
        assert_eq!(c.version, "2");
        assert_eq!(c.columns[1].dtype, ColumnType::Integer);
        assert!(c.columns[2].nullable);
        assert!(!c.columns[0].nullable);
        assert_eq!(
            c.fingerprint,
            vec!["country_origin", "year", "refugees", "meta"]
        );
    }

    #[test]
    fn test_unknown_primary_key_column_fails_fast() {
        let text = CONTRACT.replace("[country_origin, year]", "[country_origin, yr]");
        let err = Contract::from_yaml(&text).unwrap_err();
        assert!(matches!(
            err,
            ContractError::UnknownColumn { ref column, .. } if column == "yr"
        ));
    }

    #[test]
    fn test_reserved_and_duplicate_columns_rejected() {
        let text = CONTRACT.replace("name: meta", "name: _row_hash");
        assert!(matches!(
            Contract::from_yaml(&text),
            Err(ContractError::ReservedColumn { .. })
        ));
        let text = CONTRACT.replace("name: meta", "name: refugees");
        assert!(matches!(
            Contract::from_yaml(&text),
            Err(ContractError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_invalid_entity_name() {
        let text = CONTRACT.replace("entity: displacement", "entity: \"drop table\"");
        assert!(matches!(
            Contract::from_yaml(&text),
            Err(ContractError::InvalidEntity { .. })
        ));
    }

    #[test]
    fn test_column_type_accepts() {
        assert!(ColumnType::Integer.accepts(&json!(3)));
        assert!(!ColumnType::Integer.accepts(&json!(3.5)));
        assert!(ColumnType::Float.accepts(&json!(3)));
        assert!(ColumnType::Date.accepts(&json!("2020-02-29")));
        assert!(!ColumnType::Date.accepts(&json!("2020-02-30")));
        assert!(ColumnType::DateTime.accepts(&json!("2020-01-01T00:00:00Z")));
        assert!(ColumnType::String.accepts(&Value::Null));
        assert!(!ColumnType::Boolean.accepts(&json!("true")));
    }

    #[test]
    fn test_normalize_float_whole_numbers() {
        assert_eq!(ColumnType::Float.normalize(json!(1)), json!(1.0));
        assert_eq!(ColumnType::Float.normalize(json!(2.5)), json!(2.5));
        assert_eq!(ColumnType::Float.normalize(Value::Null), Value::Null);
        assert_eq!(ColumnType::Integer.normalize(json!(1)), json!(1));
        assert_eq!(ColumnType::Json.normalize(json!("x")), json!("x"));
    }
}
