//! Sandboxed execution of generated Lua fragments.
//!
//! Every run gets a fresh Lua 5.4 VM on a blocking thread (via
//! [`tokio::task::spawn_blocking`]) with only the `table`, `string`, `math`
//! and `utf8` libraries loaded and a closed allow-list of base functions.
//! Nothing can reach the filesystem, network, processes or the loader.
//!
//! # Host APIs
//!
//! | Global | Contents |
//! |--------|----------|
//! | `tables` | snapshot of the session namespace, one frame per composite key |
//! | `frame` | frame helpers (`new`, `from_records`, filtering, sorting, grouping, reducers) |
//! | `chart` | Plotly-compatible trace and figure builders |
//! | `json` | `parse`, `encode` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `print` | routed to the `sandbox` tracing target |
//! | `null` | explicit "no value" |
//!
//! # Limits
//!
//! A wall-clock deadline is enforced by an instruction hook (and re-raised
//! through `pcall`/`xpcall`), backed by an outer [`tokio::time::timeout`].
//! The VM's allocator is capped.
//!
//! # Output bindings
//!
//! Analysis fragments must assign the global `result`; chart fragments
//! `chart_json` (a serialised figure) or `fig` (a figure table). A missing
//! binding is an execution error.

pub mod normalize;

use mlua::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::models::{CellValue, DATETIME_FORMAT};
use crate::namespace::{Namespace, TableEntry};

pub use normalize::ResultShape;

/// Lua source of the `frame` and `chart` modules.
const PRELUDE: &str = include_str!("prelude.lua");

/// Marker carried by deadline errors so the prelude can re-raise them.
const DEADLINE_MARKER: &str = "sandbox deadline exceeded";

/// Base-library globals a fragment may use. Everything else is removed.
const ALLOWED_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "xpcall",
    "select",
    "tonumber",
    "tostring",
    "type",
    "rawequal",
    "rawget",
    "rawlen",
    "setmetatable",
    "getmetatable",
    "_VERSION",
    "string",
    "table",
    "math",
    "utf8",
];

/// A rendered chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartOutput {
    pub chart_type: String,
    pub figure: Value,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Analysis,
    Chart,
}

enum Output {
    Analysis(ResultShape),
    Chart(Value),
}

/// Executor configured with time and memory limits.
#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
    memory_limit: usize,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            memory_limit: config.memory_limit_mb * 1024 * 1024,
        }
    }

    /// Run an analysis fragment and normalise its `result`.
    pub async fn run_analysis(&self, code: &str, namespace: Arc<Namespace>) -> Result<ResultShape> {
        match self.run(code, namespace, Mode::Analysis).await? {
            Output::Analysis(shape) => Ok(shape),
            Output::Chart(_) => Err(Error::Execution("unexpected chart output".to_string())),
        }
    }

    /// Run a chart fragment and extract its figure.
    pub async fn run_chart(&self, code: &str, namespace: Arc<Namespace>) -> Result<ChartOutput> {
        match self.run(code, namespace, Mode::Chart).await? {
            Output::Chart(figure) => Ok(ChartOutput {
                chart_type: chart_type(&figure),
                figure,
            }),
            Output::Analysis(_) => Err(Error::Execution("unexpected analysis output".to_string())),
        }
    }

    async fn run(&self, code: &str, namespace: Arc<Namespace>, mode: Mode) -> Result<Output> {
        let code = code.to_string();
        let limits = self.clone();
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || run_blocking(&code, &namespace, mode, &limits));
        // The hook fires first; the grace period only covers a VM stuck
        // outside Lua code.
        let outcome = tokio::time::timeout(self.timeout + Duration::from_secs(1), task).await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Execution(format!("sandbox task failed: {}", join))),
            Err(_) => Err(Error::Execution(format!(
                "{} after {} seconds",
                DEADLINE_MARKER,
                self.timeout.as_secs()
            ))),
        };

        match &result {
            Ok(_) => tracing::debug!(mode = ?mode, elapsed_ms = started.elapsed().as_millis() as u64, "Fragment finished"),
            Err(e) => tracing::warn!(mode = ?mode, error = %e, "Fragment failed"),
        }
        result
    }
}

fn execution_error(e: LuaError) -> Error {
    match e {
        LuaError::MemoryError(_) => Error::Execution("memory limit exceeded".to_string()),
        other => Error::Execution(other.to_string()),
    }
}

fn run_blocking(code: &str, namespace: &Namespace, mode: Mode, limits: &Sandbox) -> Result<Output> {
    let lua = Lua::new_with(
        LuaStdLib::TABLE | LuaStdLib::STRING | LuaStdLib::MATH | LuaStdLib::UTF8,
        LuaOptions::default(),
    )
    .map_err(execution_error)?;

    // Set up the deadline via instruction hook
    let timeout_secs = limits.timeout.as_secs();
    let deadline = Instant::now() + limits.timeout;
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "{} after {} seconds",
                    DEADLINE_MARKER, timeout_secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );

    let bound = install_environment(&lua, namespace).map_err(execution_error)?;
    // The snapshot is already resident; the cap applies to what the
    // fragment allocates on top of it.
    lua.set_memory_limit(lua.used_memory() + limits.memory_limit)
        .map_err(execution_error)?;

    lua.load(code)
        .set_name("fragment")
        .exec()
        .map_err(execution_error)?;

    let is_bound = |name: &str| bound.lock().map(|set| set.contains(name)).unwrap_or(false);
    let globals = lua.globals();

    match mode {
        Mode::Analysis => {
            if !is_bound("result") {
                return Err(Error::Execution(
                    "fragment did not assign the 'result' variable".to_string(),
                ));
            }
            let value: LuaValue = globals.raw_get("result").map_err(execution_error)?;
            Ok(Output::Analysis(normalize::normalize(&value)))
        }
        Mode::Chart => {
            if is_bound("chart_json") {
                let value: LuaValue = globals.raw_get("chart_json").map_err(execution_error)?;
                let text = match value {
                    LuaValue::String(s) => s.to_string_lossy().to_string(),
                    other => {
                        return Err(Error::Execution(format!(
                            "'chart_json' must be a string, got {}",
                            other.type_name()
                        )))
                    }
                };
                let figure: Value = serde_json::from_str(&text)
                    .map_err(|e| Error::Execution(format!("'chart_json' is not valid JSON: {}", e)))?;
                return validate_figure(figure);
            }
            if is_bound("fig") {
                let value: LuaValue = globals.raw_get("fig").map_err(execution_error)?;
                return validate_figure(normalize::to_json(&value));
            }
            Err(Error::Execution(
                "fragment did not create a 'fig' or 'chart_json' variable".to_string(),
            ))
        }
    }
}

fn validate_figure(figure: Value) -> Result<Output> {
    match figure.get("data") {
        Some(Value::Array(_)) => Ok(Output::Chart(figure)),
        _ => Err(Error::Execution(
            "chart figure must be an object with a 'data' list of traces".to_string(),
        )),
    }
}

/// Chart kind of a figure, from its first trace. A `scatter` trace drawn
/// with lines only counts as a line chart.
pub fn chart_type(figure: &Value) -> String {
    let first = match figure.get("data").and_then(|d| d.get(0)) {
        Some(t) => t,
        None => return "unknown".to_string(),
    };
    let kind = first
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    match kind {
        "scatter" if first.get("mode").and_then(Value::as_str) == Some("lines") => "line".to_string(),
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Environment
// ═══════════════════════════════════════════════════════════════════════

/// Sandbox the globals, register host APIs, load the prelude and the table
/// snapshot, then start tracking global assignments. Returns the set of
/// global names the fragment assigns.
fn install_environment(lua: &Lua, namespace: &Namespace) -> LuaResult<Arc<Mutex<HashSet<String>>>> {
    restrict_globals(lua)?;
    let globals = lua.globals();
    globals.set("null", LuaValue::NULL)?;
    register_json_api(lua)?;
    register_log_api(lua)?;
    register_print(lua)?;

    lua.load(PRELUDE).set_name("prelude").exec()?;
    register_tables(lua, namespace)?;

    track_assignments(lua)
}

/// Remove every global outside [`ALLOWED_GLOBALS`], and `string.dump`.
fn restrict_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    let mut doomed = Vec::new();
    for pair in globals.clone().pairs::<LuaValue, LuaValue>() {
        let (key, _) = pair?;
        let allowed = match &key {
            LuaValue::String(s) => ALLOWED_GLOBALS.contains(&&*s.to_str()?),
            _ => false,
        };
        if !allowed {
            doomed.push(key);
        }
    }
    for key in doomed {
        globals.raw_set(key, LuaValue::Nil)?;
    }

    let string: LuaTable = globals.get("string")?;
    string.set("dump", LuaValue::Nil)?;
    Ok(())
}

/// Record the name of every new global the fragment assigns. The
/// metatable is protected so the fragment cannot remove it.
fn track_assignments(lua: &Lua) -> LuaResult<Arc<Mutex<HashSet<String>>>> {
    let bound = Arc::new(Mutex::new(HashSet::new()));
    let b = bound.clone();
    let newindex = lua.create_function(move |_lua, (t, k, v): (LuaTable, LuaValue, LuaValue)| {
        if let LuaValue::String(s) = &k {
            if let Ok(mut set) = b.lock() {
                set.insert(s.to_str()?.to_string());
            }
        }
        t.raw_set(k, v)
    })?;

    let mt = lua.create_table()?;
    mt.set("__newindex", newindex)?;
    mt.set("__metatable", false)?;
    let setmetatable: LuaFunction = lua.globals().get("setmetatable")?;
    setmetatable.call::<LuaValue>((lua.globals(), mt))?;
    Ok(bound)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: tables
// ═══════════════════════════════════════════════════════════════════════

fn cell_to_lua(lua: &Lua, cell: &CellValue) -> LuaResult<LuaValue> {
    Ok(match cell {
        CellValue::Empty => LuaValue::Nil,
        CellValue::Int(i) => LuaValue::Integer(*i),
        CellValue::Float(f) if f.is_nan() => LuaValue::Nil,
        CellValue::Float(f) => LuaValue::Number(*f),
        CellValue::Bool(b) => LuaValue::Boolean(*b),
        CellValue::Text(s) if s.trim().is_empty() => LuaValue::Nil,
        CellValue::Text(s) => LuaValue::String(lua.create_string(s)?),
        CellValue::DateTime(dt) => {
            LuaValue::String(lua.create_string(dt.format(DATETIME_FORMAT).to_string())?)
        }
    })
}

/// Build one frame table. Tables whose raw data is gone keep their columns
/// and dtypes but have no rows and `has_data = false`.
fn entry_to_lua(lua: &Lua, entry: &TableEntry) -> LuaResult<LuaTable> {
    let t = lua.create_table()?;
    t.set("name", entry.key.as_str())?;
    t.set("source", entry.raw_name.as_str())?;

    let columns = lua.create_sequence_from(entry.schema.columns.iter().map(String::as_str))?;
    t.set("columns", columns)?;

    let dtypes = lua.create_table()?;
    for (col, dtype) in &entry.schema.dtypes {
        dtypes.set(col.as_str(), dtype.as_str())?;
    }
    t.set("dtypes", dtypes)?;

    let rows = lua.create_table()?;
    if let Some(data) = &entry.data {
        for (i, row) in data.rows.iter().enumerate() {
            let record = lua.create_table_with_capacity(0, data.columns.len())?;
            for (col, cell) in data.columns.iter().zip(row.iter()) {
                record.raw_set(col.as_str(), cell_to_lua(lua, cell)?)?;
            }
            rows.raw_set(i + 1, record)?;
        }
    }
    t.set("rows", rows)?;
    t.set("row_count", entry.schema.row_count)?;
    t.set("has_data", entry.data.is_some())?;
    Ok(t)
}

fn register_tables(lua: &Lua, namespace: &Namespace) -> LuaResult<()> {
    let frame: LuaTable = lua.globals().get("frame")?;
    let wrap: LuaFunction = frame.get("wrap")?;

    let tables = lua.create_table()?;
    for entry in namespace.entries() {
        let t = entry_to_lua(lua, entry)?;
        tables.set(entry.key.as_str(), wrap.call::<LuaTable>(t)?)?;
    }
    lua.globals().set("tables", tables)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: Value = serde_json::from_str(&s)
                .map_err(|e| LuaError::external(format!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            serde_json::to_string(&normalize::to_json(&value))
                .map_err(|e| LuaError::external(format!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

/// Convert a JSON value to a Lua value. JSON `null` becomes `null`.
fn json_value_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::NULL),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => lua.create_string(s).map(LuaValue::String),
        Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log / print
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua) -> LuaResult<()> {
    let log = lua.create_table()?;

    log.set(
        "info",
        lua.create_function(|_lua, msg: String| {
            tracing::info!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "warn",
        lua.create_function(|_lua, msg: String| {
            tracing::warn!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "error",
        lua.create_function(|_lua, msg: String| {
            tracing::error!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "debug",
        lua.create_function(|_lua, msg: String| {
            tracing::debug!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

fn display_value(value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        v if normalize::is_null(v) => "nil".to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

fn register_print(lua: &Lua) -> LuaResult<()> {
    lua.globals().set(
        "print",
        lua.create_function(|_lua, args: LuaMultiValue| {
            let line: Vec<String> = args.iter().map(display_value).collect();
            tracing::debug!(target: "sandbox", "{}", line.join("\t"));
            Ok(())
        })?,
    )?;
    Ok(())
}
