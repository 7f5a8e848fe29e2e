//! Conversion of whatever a fragment bound into JSON-safe shapes.
//!
//! Normalisation is total: every Lua value maps to some [`ResultShape`].
//! Values JSON cannot carry (functions, userdata, non-finite numbers,
//! cyclic or overly deep tables) degrade to text at the point where they
//! occur.

use mlua::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Deepest table nesting converted before falling back to text.
pub const MAX_DEPTH: usize = 32;

/// The shape of a fragment's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultShape {
    /// Rows of named cells.
    Tabular {
        columns: Vec<String>,
        rows: Vec<Map<String, Value>>,
    },
    /// One column of values, optionally named.
    Column {
        name: Option<String>,
        values: Vec<Value>,
    },
    /// A number, string, boolean or null.
    Scalar { value: Value },
    /// Nested mappings and sequences.
    Structured { value: Value },
    /// Textual stand-in for something with no data representation.
    Opaque { text: String },
}

impl ResultShape {
    pub fn kind(&self) -> &'static str {
        match self {
            ResultShape::Tabular { .. } => "tabular",
            ResultShape::Column { .. } => "column",
            ResultShape::Scalar { .. } => "scalar",
            ResultShape::Structured { .. } => "structured",
            ResultShape::Opaque { .. } => "opaque",
        }
    }

    /// Plain JSON view: tabular results become a list of row objects,
    /// columns a list of values.
    pub fn to_json(&self) -> Value {
        match self {
            ResultShape::Tabular { rows, .. } => {
                Value::Array(rows.iter().cloned().map(Value::Object).collect())
            }
            ResultShape::Column { values, .. } => Value::Array(values.clone()),
            ResultShape::Scalar { value } | ResultShape::Structured { value } => value.clone(),
            ResultShape::Opaque { text } => Value::String(text.clone()),
        }
    }

    /// Compact rendering for prompts and logs, cut at `max_chars`.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = match self {
            ResultShape::Scalar {
                value: Value::String(s),
            } => s.clone(),
            ResultShape::Opaque { text } => text.clone(),
            other => other.to_json().to_string(),
        };
        if text.chars().count() <= max_chars {
            text
        } else {
            let cut: String = text.chars().take(max_chars).collect();
            format!("{}... (truncated)", cut)
        }
    }
}

/// Whether a Lua value stands for "no value" (`nil` or the `null` sentinel).
pub fn is_null(value: &LuaValue) -> bool {
    match value {
        LuaValue::Nil => true,
        LuaValue::LightUserData(ud) => ud.0.is_null(),
        _ => false,
    }
}

fn opaque_text(value: &LuaValue) -> String {
    format!("<{}>", value.type_name())
}

fn number_to_json(n: f64) -> Value {
    match serde_json::Number::from_f64(n) {
        Some(num) => Value::Number(num),
        None if n.is_nan() => Value::String("NaN".to_string()),
        None if n > 0.0 => Value::String("Infinity".to_string()),
        None => Value::String("-Infinity".to_string()),
    }
}

fn key_text(key: &LuaValue) -> String {
    match key {
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        other => opaque_text(other),
    }
}

/// Columns and rows of a frame-like table (`{ columns = {...}, rows = {...} }`).
fn frame_parts(t: &LuaTable) -> Option<(Vec<String>, LuaTable)> {
    let columns = match t.raw_get::<LuaValue>("columns").ok()? {
        LuaValue::Table(c) => c,
        _ => return None,
    };
    let rows = match t.raw_get::<LuaValue>("rows").ok()? {
        LuaValue::Table(r) => r,
        _ => return None,
    };
    let names = (1..=columns.raw_len())
        .map(|i| {
            columns
                .raw_get::<LuaValue>(i)
                .map(|v| key_text(&v))
                .unwrap_or_default()
        })
        .collect();
    Some((names, rows))
}

/// Elements of a table that is a proper sequence `1..n` with no other keys.
fn sequence_items(t: &LuaTable) -> Option<Vec<LuaValue>> {
    let len = t.raw_len();
    if len == 0 {
        return None;
    }
    let pairs = t.clone().pairs::<LuaValue, LuaValue>().count();
    if pairs != len {
        return None;
    }
    Some(
        (1..=len)
            .map(|i| t.raw_get::<LuaValue>(i).unwrap_or(LuaValue::Nil))
            .collect(),
    )
}

#[derive(Default)]
struct Converter {
    visiting: HashSet<usize>,
}

impl Converter {
    fn value(&mut self, value: &LuaValue, depth: usize) -> Value {
        match value {
            v if is_null(v) => Value::Null,
            LuaValue::Boolean(b) => Value::Bool(*b),
            LuaValue::Integer(i) => Value::from(*i),
            LuaValue::Number(n) => number_to_json(*n),
            LuaValue::String(s) => Value::String(s.to_string_lossy().to_string()),
            LuaValue::Table(t) => self.table(t, depth),
            other => Value::String(opaque_text(other)),
        }
    }

    fn table(&mut self, t: &LuaTable, depth: usize) -> Value {
        if depth >= MAX_DEPTH {
            return Value::String("<table: nested too deeply>".to_string());
        }
        let ptr = t.to_pointer() as usize;
        if !self.visiting.insert(ptr) {
            return Value::String("<table: cycle>".to_string());
        }

        let out = if let Some((columns, rows)) = frame_parts(t) {
            Value::Array(
                self.frame_rows(&columns, &rows, depth)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            )
        } else if let Some(items) = sequence_items(t) {
            Value::Array(items.iter().map(|v| self.value(v, depth + 1)).collect())
        } else {
            let mut entries: Vec<(String, Value)> = t
                .clone()
                .pairs::<LuaValue, LuaValue>()
                .filter_map(|pair| pair.ok())
                .map(|(k, v)| (key_text(&k), v))
                .map(|(k, v)| {
                    let json = self.value(&v, depth + 1);
                    (k, json)
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        };

        self.visiting.remove(&ptr);
        out
    }

    fn frame_rows(&mut self, columns: &[String], rows: &LuaTable, depth: usize) -> Vec<Map<String, Value>> {
        let mut out = Vec::with_capacity(rows.raw_len());
        for i in 1..=rows.raw_len() {
            let row = match rows.raw_get::<LuaValue>(i) {
                Ok(LuaValue::Table(r)) => r,
                _ => continue,
            };
            let mut record = Map::new();
            for (idx, col) in columns.iter().enumerate() {
                let mut cell = row.raw_get::<LuaValue>(col.as_str()).unwrap_or(LuaValue::Nil);
                if matches!(cell, LuaValue::Nil) {
                    // Positional rows: { "north", 12 }
                    cell = row.raw_get::<LuaValue>(idx + 1).unwrap_or(LuaValue::Nil);
                }
                record.insert(col.clone(), self.value(&cell, depth + 2));
            }
            out.push(record);
        }
        out
    }
}

/// Convert a Lua value to JSON, degrading unrepresentable parts to text.
pub fn to_json(value: &LuaValue) -> Value {
    Converter::default().value(value, 0)
}

/// Classify and convert the value bound to `result`.
pub fn normalize(value: &LuaValue) -> ResultShape {
    let mut conv = Converter::default();
    match value {
        v if is_null(v) => ResultShape::Scalar { value: Value::Null },
        LuaValue::Boolean(_) | LuaValue::Integer(_) | LuaValue::String(_) => ResultShape::Scalar {
            value: conv.value(value, 0),
        },
        LuaValue::Number(n) if n.is_finite() => ResultShape::Scalar {
            value: number_to_json(*n),
        },
        LuaValue::Number(n) => ResultShape::Opaque {
            text: n.to_string(),
        },
        LuaValue::Table(t) => normalize_table(&mut conv, t),
        other => ResultShape::Opaque {
            text: opaque_text(other),
        },
    }
}

fn normalize_table(conv: &mut Converter, t: &LuaTable) -> ResultShape {
    if let Some((columns, rows)) = frame_parts(t) {
        let ptr = t.to_pointer() as usize;
        conv.visiting.insert(ptr);
        let records = conv.frame_rows(&columns, &rows, 0);
        if columns.len() == 1 {
            let name = columns[0].clone();
            let values = records
                .into_iter()
                .map(|mut r| r.remove(&name).unwrap_or(Value::Null))
                .collect();
            return ResultShape::Column {
                name: Some(name),
                values,
            };
        }
        return ResultShape::Tabular {
            columns,
            rows: records,
        };
    }

    let json = conv.table(t, 0);
    match json {
        Value::Array(items) if !items.is_empty() && items.iter().all(is_record) => {
            let mut columns: Vec<String> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            let rows: Vec<Map<String, Value>> = items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(m) => Some(m),
                    _ => None,
                })
                .collect();
            for row in &rows {
                for key in row.keys() {
                    if seen.insert(key.clone()) {
                        columns.push(key.clone());
                    }
                }
            }
            let rows = rows
                .into_iter()
                .map(|mut row| {
                    columns
                        .iter()
                        .map(|c| (c.clone(), row.remove(c).unwrap_or(Value::Null)))
                        .collect()
                })
                .collect();
            ResultShape::Tabular { columns, rows }
        }
        Value::Array(items) if items.iter().all(|v| !v.is_array() && !v.is_object()) => {
            ResultShape::Column {
                name: None,
                values: items,
            }
        }
        other => ResultShape::Structured { value: other },
    }
}

fn is_record(v: &Value) -> bool {
    matches!(v, Value::Object(m) if !m.is_empty())
}
