//! The per-session table namespace and the merger that fills it.
//!
//! Every table is addressed by a composite key `{file stem}_{table name}`,
//! assigned unconditionally so identically named sheets from different files
//! never collide. When a key is already owned by another uploaded file (the
//! same file name uploaded twice, `sales.xlsx` next to `sales.csv`), the
//! first free `_2`, `_3`, ... suffix is appended. Merging files in durable
//! upload order therefore always yields the same keys.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{SchemaSummary, Table};

/// One addressable table of a session.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub key: String,
    pub file_id: String,
    /// Table name inside its file, as recorded durably.
    pub raw_name: String,
    pub schema: SchemaSummary,
    /// Raw rows, absent when the originating file is gone from disk.
    pub data: Option<Arc<Table>>,
}

/// A table about to be merged into a namespace.
#[derive(Debug, Clone)]
pub struct PendingTable {
    pub raw_name: String,
    pub schema: SchemaSummary,
    pub data: Option<Arc<Table>>,
}

/// Ordered set of tables keyed by composite key.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    entries: Vec<TableEntry>,
}

/// Stem of an uploaded file name: directory components and the last
/// extension removed. `None` when nothing usable is left.
pub fn file_stem(filename: &str) -> Option<String> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim();
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

pub fn composite_key(stem: &str, table_name: &str) -> String {
    format!("{}_{}", stem, table_name)
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any table still has raw rows to compute on.
    pub fn has_data(&self) -> bool {
        self.entries.iter().any(|e| e.data.is_some())
    }

    pub fn get(&self, key: &str) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Merge the tables of one uploaded file and return their assigned keys
    /// in input order.
    ///
    /// Fails with [`Error::MissingFileContext`] when `filename` yields no
    /// stem; the namespace is unchanged in that case.
    pub fn merge(
        &mut self,
        file_id: &str,
        filename: &str,
        tables: Vec<PendingTable>,
    ) -> Result<Vec<String>> {
        let stem = match file_stem(filename) {
            Some(s) => s,
            None => {
                let table = tables
                    .first()
                    .map(|t| t.raw_name.clone())
                    .unwrap_or_default();
                return Err(Error::MissingFileContext(table));
            }
        };

        let mut taken: HashSet<String> = self.entries.iter().map(|e| e.key.clone()).collect();
        let mut assigned = Vec::with_capacity(tables.len());

        for table in tables {
            let base = composite_key(&stem, &table.raw_name);
            let mut key = base.clone();
            let mut n = 2;
            while taken.contains(&key) {
                key = format!("{}_{}", base, n);
                n += 1;
            }
            taken.insert(key.clone());
            assigned.push(key.clone());
            self.entries.push(TableEntry {
                key,
                file_id: file_id.to_string(),
                raw_name: table.raw_name,
                schema: table.schema,
                data: table.data,
            });
        }
        Ok(assigned)
    }

    /// Schema summaries keyed by composite key, in namespace order.
    pub fn schemas_json(&self) -> Value {
        let mut map = Map::new();
        for entry in &self.entries {
            let value = serde_json::to_value(&entry.schema).unwrap_or(Value::Null);
            map.insert(entry.key.clone(), value);
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pending(name: &str, with_data: bool) -> PendingTable {
        let schema = SchemaSummary {
            columns: vec!["a".into()],
            dtypes: BTreeMap::new(),
            row_count: 0,
            sample_rows: Vec::new(),
            numeric_columns: Vec::new(),
            statistics: BTreeMap::new(),
        };
        PendingTable {
            raw_name: name.to_string(),
            schema,
            data: with_data.then(|| {
                Arc::new(Table {
                    name: name.to_string(),
                    columns: vec!["a".into()],
                    rows: Vec::new(),
                })
            }),
        }
    }

    #[test]
    fn same_sheet_name_in_two_files() {
        let mut ns = Namespace::new();
        ns.merge("f1", "sales.xlsx", vec![pending("Summary", true)]).unwrap();
        ns.merge("f2", "branch.xlsx", vec![pending("Summary", true)]).unwrap();
        let keys: Vec<&str> = ns.keys().collect();
        assert_eq!(keys, vec!["sales_Summary", "branch_Summary"]);
    }

    #[test]
    fn first_upload_is_prefixed_too() {
        let mut ns = Namespace::new();
        let keys = ns
            .merge("f1", "q1.csv", vec![pending("Sheet1", true)])
            .unwrap();
        assert_eq!(keys, vec!["q1_Sheet1"]);
    }

    #[test]
    fn repeated_file_name_gets_suffix() {
        let mut ns = Namespace::new();
        ns.merge("f1", "sales.xlsx", vec![pending("Summary", true)]).unwrap();
        ns.merge("f2", "sales.csv", vec![pending("Summary", true)]).unwrap();
        let third = ns
            .merge("f3", "sales.xlsx", vec![pending("Summary", true)])
            .unwrap();
        assert_eq!(third, vec!["sales_Summary_3"]);
        let keys: HashSet<&str> = ns.keys().collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("sales_Summary_2"));
    }

    #[test]
    fn missing_stem_fails_loudly() {
        let mut ns = Namespace::new();
        let err = ns.merge("f1", "", vec![pending("Sheet1", true)]).unwrap_err();
        assert!(matches!(err, Error::MissingFileContext(ref t) if t == "Sheet1"));
        assert!(ns.is_empty());
    }

    #[test]
    fn stems() {
        assert_eq!(file_stem("sales.xlsx").as_deref(), Some("sales"));
        assert_eq!(file_stem("C:\\tmp\\q1.v2.csv").as_deref(), Some("q1.v2"));
        assert_eq!(file_stem("dir/report").as_deref(), Some("report"));
        assert_eq!(file_stem("  "), None);
    }

    #[test]
    fn schema_only_tables_do_not_count_as_data() {
        let mut ns = Namespace::new();
        ns.merge("f1", "old.xlsx", vec![pending("Sheet1", false)]).unwrap();
        assert!(!ns.is_empty());
        assert!(!ns.has_data());
        ns.merge("f2", "new.xlsx", vec![pending("Sheet1", true)]).unwrap();
        assert!(ns.has_data());
        assert!(ns.schemas_json().get("old_Sheet1").is_some());
    }
}
