//! # Sheet Harness
//!
//! Session-scoped spreadsheet analysis: upload workbooks, ask questions in
//! natural language, get answers and charts computed by generated code.
//!
//! Uploaded files are parsed into tables and merged into a per-session
//! namespace under collision-free composite keys (`{file-stem}_{sheet}`).
//! Metadata and schema summaries live in SQLite; raw tables live in an
//! in-memory cache that is rebuilt from the stored artifacts after a
//! restart or eviction. Questions go to a code generation oracle whose Lua
//! fragments run in a sandbox against an immutable namespace snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │  Upload  │──▶│ Workbook │──▶│  Schema + │──▶│  SQLite  │
//! │ (ingest) │   │  parser  │   │ namespace │   │  (store) │
//! └──────────┘   └──────────┘   └─────┬─────┘   └────┬─────┘
//!                                     ▼              │ cold start
//!                               ┌───────────┐◀───────┘
//!                               │   cache   │
//!                               └─────┬─────┘
//!                                     ▼ snapshot
//! ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │ question │──▶│  oracle  │──▶│  sandbox  │──▶ answer / chart
//! └──────────┘   └──────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`workbook`] | `.xlsx` / `.csv` parsing into raw tables |
//! | [`schema`] | Schema summaries (dtypes, samples, statistics) |
//! | [`namespace`] | Composite-key table namespace |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Durable session store |
//! | [`cache`] | Per-session in-memory namespace cache |
//! | [`session`] | Session lifecycle and cold reconstruction |
//! | [`ingest`] | Batch upload pipeline |
//! | [`sandbox`] | Lua sandbox and result normalisation |
//! | [`oracle`] | Code generation oracle |
//! | [`pipeline`] | Question and chart pipelines |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod namespace;
pub mod oracle;
pub mod pipeline;
pub mod sandbox;
pub mod schema;
pub mod server;
pub mod session;
pub mod store;
pub mod workbook;
