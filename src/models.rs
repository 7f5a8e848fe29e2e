//! Core data models shared by parsing, persistence, the cache and the sandbox.
//!
//! Raw tabular data ([`Table`], [`CellValue`]) only ever lives in memory.
//! Everything else here has a durable counterpart in SQLite.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Display format used when a timestamp leaves the typed world.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single spreadsheet cell after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    DateTime(NaiveDateTime),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Numeric view of the cell, if it holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Float(f) if !f.is_nan() => Some(*f),
            _ => None,
        }
    }

    /// JSON view of the cell: missing values become `null`, timestamps
    /// become strings, non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Empty => serde_json::Value::Null,
            CellValue::Int(i) => serde_json::Value::from(*i),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Text(s) if s.trim().is_empty() => serde_json::Value::Null,
            CellValue::Text(s) => serde_json::Value::String(s.clone()),
            CellValue::DateTime(dt) => {
                serde_json::Value::String(dt.format(DATETIME_FORMAT).to_string())
            }
        }
    }
}

/// One rectangular sheet of data, header already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Original table (sheet) name inside its file.
    pub name: String,
    pub columns: Vec<String>,
    /// Row-major cells; every row has exactly `columns.len()` cells.
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    /// Iterate the cells of one column, top to bottom.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &CellValue> {
        self.rows.iter().filter_map(move |r| r.get(idx))
    }
}

/// Summary statistics of one numeric column.
///
/// Field names match the familiar `describe()` layout so that generated
/// code and prompts can refer to them directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    #[serde(rename = "25%")]
    pub p25: Option<f64>,
    #[serde(rename = "50%")]
    pub p50: Option<f64>,
    #[serde(rename = "75%")]
    pub p75: Option<f64>,
    pub max: Option<f64>,
}

/// Durable structural metadata of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub columns: Vec<String>,
    pub dtypes: BTreeMap<String, String>,
    pub row_count: usize,
    pub sample_rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub numeric_columns: Vec<String>,
    pub statistics: BTreeMap<String, ColumnStats>,
}

/// Durable session record.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub uploaded_files: Vec<UploadedFile>,
}

/// Metadata of one uploaded file. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub id: String,
    pub session_id: String,
    /// Original client-side file name (drives the composite-key stem).
    pub filename: String,
    /// Where the artifact was stored on disk.
    pub file_path: PathBuf,
    pub file_size: u64,
    pub content_sha256: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A persisted table schema, keyed by its original (non-composite) name.
#[derive(Debug, Clone)]
pub struct TableSchemaRecord {
    pub uploaded_file_id: String,
    pub table_name: String,
    pub schema: SchemaSummary,
}

/// One appended conversation entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub session_id: String,
    pub question: Option<String>,
    pub answer: Option<String>,
    /// Analysis code that produced the answer, never shown to end users.
    #[serde(skip_serializing)]
    pub code: Option<String>,
    pub created_at: DateTime<Utc>,
}
