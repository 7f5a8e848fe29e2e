//! Implementations of the `sheet` subcommands.
//!
//! Each command opens the configured database (migrating it if needed),
//! does its work and prints a human-readable summary or pretty JSON.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::ingest::{ingest_files, IncomingFile};
use crate::oracle::build_oracle;
use crate::pipeline::{oracle_context, Assistant};
use crate::session::SessionManager;

async fn open_manager(config: &Config) -> Result<Arc<SessionManager>> {
    let manager = SessionManager::open(config.clone())
        .await
        .with_context(|| format!("failed to open database {}", config.db.path.display()))?;
    Ok(Arc::new(manager))
}

async fn open_assistant(config: &Config) -> Result<Assistant> {
    let manager = open_manager(config).await?;
    let oracle = build_oracle(&config.oracle)?;
    Ok(Assistant::new(manager, oracle))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `sheet init`: create the database and upload directory.
pub async fn run_init(config: &Config) -> Result<()> {
    open_manager(config).await?;
    tokio::fs::create_dir_all(&config.storage.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.storage.upload_dir.display()))?;
    println!("Database initialized successfully.");
    Ok(())
}

/// `sheet session new`
pub async fn run_session_new(config: &Config) -> Result<()> {
    let manager = open_manager(config).await?;
    let view = manager.create_session().await?;
    println!("{}", view.session_id());
    Ok(())
}

/// `sheet session list`
pub async fn run_session_list(config: &Config) -> Result<()> {
    let manager = open_manager(config).await?;
    let sessions = manager.store().list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{}  files={}  turns={}  last_accessed={}",
            s.session_id,
            s.file_count,
            s.turn_count,
            s.last_accessed.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// `sheet session show <id>`: record, merged schema and history.
pub async fn run_session_show(config: &Config, id: &str) -> Result<()> {
    let manager = open_manager(config).await?;
    let view = manager.get_session(id).await?;
    let history = manager.history(id).await?;

    println!("Session:       {}", view.record.session_id);
    println!("Created:       {}", view.record.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Last accessed: {}", view.record.last_accessed.format("%Y-%m-%d %H:%M:%S"));
    println!("Files:");
    for f in &view.record.uploaded_files {
        println!("  {} ({} bytes, {})", f.filename, f.file_size, f.id);
    }
    println!("Tables:");
    for entry in view.namespace.entries() {
        let state = if entry.data.is_some() { "loaded" } else { "schema only" };
        println!(
            "  {} ({} rows, {} columns, {})",
            entry.key,
            entry.schema.row_count,
            entry.schema.columns.len(),
            state
        );
    }
    println!("History: {} turn(s)", history.len());
    for turn in &history {
        println!("  Q: {}", turn.question.as_deref().unwrap_or("-"));
        println!("  A: {}", turn.answer.as_deref().unwrap_or("-"));
    }
    println!();
    print_json(&oracle_context(&view.namespace))
}

/// `sheet upload <files…> [--session <id>]`
pub async fn run_upload(config: &Config, paths: &[PathBuf], session: Option<&str>) -> Result<()> {
    let manager = open_manager(config).await?;
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = IncomingFile::from_path(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        files.push(file);
    }

    let report = ingest_files(&manager, session, files).await?;
    println!("Session: {}", report.session_id);
    for f in &report.files {
        println!("  ok    {} → {}", f.filename, f.tables.join(", "));
        for w in &f.warnings {
            println!("        warning: {}", w);
        }
    }
    for e in &report.errors {
        println!("  fail  {} ({}): {}", e.filename, e.code, e.message);
    }
    if report.all_failed() {
        bail!("{}", report.message);
    }
    Ok(())
}

/// `sheet ask <question> [--session <id>]`
pub async fn run_ask(config: &Config, question: &str, session: Option<&str>) -> Result<()> {
    let assistant = open_assistant(config).await?;
    let answer = assistant.ask(session, question).await?;
    println!("{}", answer.answer);
    if let Some(data) = &answer.data {
        println!();
        print_json(data)?;
    }
    Ok(())
}

/// `sheet chart <request> [--session <id>]`: prints the figure JSON.
pub async fn run_chart(config: &Config, request: &str, session: Option<&str>) -> Result<()> {
    let assistant = open_assistant(config).await?;
    let chart = assistant.visualize(session, request).await?;
    print_json(&chart)
}

/// `sheet run <script.lua> --session <id> [--chart]`: execute a local
/// fragment in the sandbox without the oracle.
pub async fn run_script(config: &Config, path: &Path, session: &str, chart: bool) -> Result<()> {
    let code = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let assistant = open_assistant(config).await?;
    let output = assistant.run_fragment(session, &code, chart).await?;
    print_json(&output)
}

/// `sheet purge [--older-than-hours N]`
pub async fn run_purge(config: &Config, older_than_hours: Option<u64>) -> Result<()> {
    let hours = older_than_hours.unwrap_or(config.sessions.purge_after_hours);
    let manager = open_manager(config).await?;
    let purged = manager.purge(chrono::Duration::hours(hours as i64)).await?;
    println!("Purged {} session(s) idle for more than {}h.", purged.len(), hours);
    for id in purged {
        println!("  {}", id);
    }
    Ok(())
}
