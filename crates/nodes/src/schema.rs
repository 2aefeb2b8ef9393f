//! Column schemas for table loads.
//!
//! A [`ColumnSchema`] is positional: column `i` of the schema describes field
//! `i` of every CSV record. Header names in the file are never consulted.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::NodeError;

// ---------------------------------------------------------------------------
// Column types
// ---------------------------------------------------------------------------

/// Semantic type of a column. Parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    String,
    Integer,
    /// `NUMERIC`, `FLOAT` and `FLOAT64` all load as 64-bit floats.
    Numeric,
    Date,
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => Ok(Self::String),
            "INTEGER" | "INT64" => Ok(Self::Integer),
            "NUMERIC" | "FLOAT" | "FLOAT64" => Ok(Self::Numeric),
            "DATE" => Ok(Self::Date),
            other => Err(format!("unknown column type: {other}")),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String  => write!(f, "STRING"),
            Self::Integer => write!(f, "INTEGER"),
            Self::Numeric => write!(f, "NUMERIC"),
            Self::Date    => write!(f, "DATE"),
        }
    }
}

/// Whether a column accepts empty values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnMode {
    #[default]
    Nullable,
    Required,
}

impl FromStr for ColumnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NULLABLE" => Ok(Self::Nullable),
            "REQUIRED" => Ok(Self::Required),
            other => Err(format!("unknown column mode: {other}")),
        }
    }
}

impl TryFrom<String> for ColumnMode {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnMode> for String {
    fn from(value: ColumnMode) -> Self {
        match value {
            ColumnMode::Nullable => "NULLABLE".into(),
            ColumnMode::Required => "REQUIRED".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ColumnDef / ColumnSchema
// ---------------------------------------------------------------------------

/// One column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub mode: ColumnMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            mode: ColumnMode::Nullable,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.mode = ColumnMode::Required;
        self
    }
}

/// Ordered list of columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSchema(pub Vec<ColumnDef>);

/// A typed warehouse value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Null,
    String(String),
    Integer(i64),
    Numeric(f64),
    Date(NaiveDate),
}

impl ColumnSchema {
    pub fn columns(&self) -> &[ColumnDef] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.name.as_str())
    }

    /// First column name that appears more than once, if any.
    pub fn duplicate_name(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.names().find(|name| !seen.insert(*name))
    }

    /// Coerce one CSV record into typed cells.
    ///
    /// `line` is only used in error messages.
    pub fn coerce_record(
        &self,
        record: &csv::StringRecord,
        line: u64,
    ) -> Result<Vec<Cell>, NodeError> {
        if record.len() != self.len() {
            return Err(NodeError::SchemaMismatch(format!(
                "line {line}: expected {} columns, found {}",
                self.len(),
                record.len()
            )));
        }

        self.0
            .iter()
            .zip(record.iter())
            .map(|(column, raw)| coerce_value(column, raw).map_err(|reason| {
                NodeError::SchemaMismatch(format!(
                    "line {line}, column '{}': {reason}",
                    column.name
                ))
            }))
            .collect()
    }
}

fn coerce_value(column: &ColumnDef, raw: &str) -> Result<Cell, String> {
    let value = raw.trim();
    if value.is_empty() {
        return match column.mode {
            ColumnMode::Nullable => Ok(Cell::Null),
            ColumnMode::Required => Err("empty value in REQUIRED column".into()),
        };
    }

    match column.column_type {
        ColumnType::String => Ok(Cell::String(raw.to_owned())),
        ColumnType::Integer => value
            .parse::<i64>()
            .map(Cell::Integer)
            .map_err(|_| format!("'{value}' is not an INTEGER")),
        ColumnType::Numeric => value
            .parse::<f64>()
            .map(Cell::Numeric)
            .map_err(|_| format!("'{value}' is not NUMERIC")),
        ColumnType::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Cell::Date)
            .map_err(|_| format!("'{value}' is not a DATE (YYYY-MM-DD)")),
    }
}
