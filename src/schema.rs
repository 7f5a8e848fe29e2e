//! Structural summaries of parsed tables.
//!
//! A [`SchemaSummary`] is what the code generation oracle sees of a table
//! and what survives durably when the raw data does not. Extraction never
//! fails: a table without data simply has no summary.

use std::collections::BTreeMap;

use crate::models::{CellValue, ColumnStats, SchemaSummary, Table};

/// Number of leading rows copied into a summary.
pub const SAMPLE_ROWS: usize = 5;

pub const DTYPE_INT: &str = "int64";
pub const DTYPE_FLOAT: &str = "float64";
pub const DTYPE_BOOL: &str = "bool";
pub const DTYPE_DATETIME: &str = "datetime64[ns]";
pub const DTYPE_OBJECT: &str = "object";

/// Summarise `table`, or `None` when it holds no data at all.
pub fn extract_schema(table: &Table) -> Option<SchemaSummary> {
    let has_data = table
        .rows
        .iter()
        .any(|r| r.iter().any(|c| !c.is_empty()));
    if table.columns.is_empty() || !has_data {
        return None;
    }

    let mut dtypes = BTreeMap::new();
    let mut numeric_columns = Vec::new();
    let mut statistics = BTreeMap::new();

    for (idx, name) in table.columns.iter().enumerate() {
        let dtype = infer_dtype(table.column_values(idx));
        if dtype == DTYPE_INT || dtype == DTYPE_FLOAT {
            numeric_columns.push(name.clone());
            let values: Vec<f64> = table.column_values(idx).filter_map(CellValue::as_f64).collect();
            statistics.insert(name.clone(), describe(&values));
        }
        dtypes.insert(name.clone(), dtype.to_string());
    }

    let sample_rows = table
        .rows
        .iter()
        .take(SAMPLE_ROWS)
        .map(|row| {
            table
                .columns
                .iter()
                .zip(row.iter())
                .map(|(col, cell)| (col.clone(), cell.to_json()))
                .collect()
        })
        .collect();

    Some(SchemaSummary {
        columns: table.columns.clone(),
        dtypes,
        row_count: table.row_count(),
        sample_rows,
        numeric_columns,
        statistics,
    })
}

/// Column type in the usual dataframe vocabulary. An integer column with
/// gaps widens to `float64`, a boolean column with gaps to `object`.
pub fn infer_dtype<'a>(cells: impl Iterator<Item = &'a CellValue>) -> &'static str {
    let mut ints = 0usize;
    let mut floats = 0usize;
    let mut bools = 0usize;
    let mut dates = 0usize;
    let mut others = 0usize;
    let mut empties = 0usize;

    for cell in cells {
        match cell {
            c if c.is_empty() => empties += 1,
            CellValue::Int(_) => ints += 1,
            CellValue::Float(_) => floats += 1,
            CellValue::Bool(_) => bools += 1,
            CellValue::DateTime(_) => dates += 1,
            _ => others += 1,
        }
    }

    let present = ints + floats + bools + dates + others;
    if present == 0 {
        return DTYPE_FLOAT;
    }
    if others > 0 {
        return DTYPE_OBJECT;
    }
    if ints + floats == present {
        return if floats == 0 && empties == 0 {
            DTYPE_INT
        } else {
            DTYPE_FLOAT
        };
    }
    if bools == present {
        return if empties == 0 { DTYPE_BOOL } else { DTYPE_OBJECT };
    }
    if dates == present {
        return DTYPE_DATETIME;
    }
    DTYPE_OBJECT
}

/// `count, mean, std, min, 25%, 50%, 75%, max` over the given values.
/// Undefined statistics (anything of an empty column, the spread of a single
/// value) are `None`.
pub fn describe(values: &[f64]) -> ColumnStats {
    let n = values.len();
    if n == 0 {
        return ColumnStats {
            count: Some(0.0),
            mean: None,
            std: None,
            min: None,
            p25: None,
            p50: None,
            p75: None,
            max: None,
        };
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let std = if n > 1 {
        let var = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        Some(var.sqrt())
    } else {
        None
    };

    ColumnStats {
        count: Some(n as f64),
        mean: finite(mean),
        std: std.and_then(finite),
        min: finite(sorted[0]),
        p25: finite(quantile(&sorted, 0.25)),
        p50: finite(quantile(&sorted, 0.50)),
        p75: finite(quantile(&sorted, 0.75)),
        max: finite(sorted[n - 1]),
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Linear-interpolated quantile of sorted, non-empty data.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
