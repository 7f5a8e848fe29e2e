//! # Sheet Harness CLI (`sheet`)
//!
//! The `sheet` binary runs the HTTP API and exposes every session operation
//! on the command line.
//!
//! ## Usage
//!
//! ```bash
//! sheet --config ./config/sheet.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sheet init` | Create the SQLite database and the upload directory |
//! | `sheet serve` | Start the HTTP API |
//! | `sheet session new` | Create a session and print its id |
//! | `sheet session list` | List sessions with file and turn counts |
//! | `sheet session show <id>` | Print a session's files, tables, schema and history |
//! | `sheet upload <files…>` | Upload spreadsheets into a session |
//! | `sheet ask "<question>"` | Ask a question about a session's tables |
//! | `sheet chart "<request>"` | Build a chart and print its figure JSON |
//! | `sheet run <script.lua>` | Run a local fragment in the sandbox |
//! | `sheet purge` | Delete sessions idle for longer than a cutoff |
//!
//! ## Examples
//!
//! ```bash
//! sheet init
//! sheet upload sales.xlsx branch.xlsx
//! sheet ask "Which region had the highest revenue?" --session <id>
//! sheet run ./total.lua --session <id>
//! sheet serve
//! ```
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sheet_harness::{commands, config, server};

/// Sheet Harness — ask questions about uploaded spreadsheets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sheet.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sheet",
    about = "Sheet Harness — session-scoped spreadsheet analysis with generated, sandboxed code",
    version,
    long_about = "Sheet Harness keeps uploaded workbooks in per-session table namespaces, \
    persists their metadata in SQLite, and answers questions by running generated Lua \
    fragments in a sandbox against those tables."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/sheet.toml`.
    #[arg(long, global = true, default_value = "./config/sheet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the upload directory.
    ///
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP API server on `[server].bind`.
    Serve,

    /// Create, list and inspect sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Upload one or more spreadsheets (`.xlsx`, `.csv`).
    ///
    /// Files that fail validation or parsing are reported individually;
    /// the others are still ingested.
    Upload {
        /// Spreadsheet files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Session to upload into. A new session is created when absent or unknown.
        #[arg(long)]
        session: Option<String>,
    },

    /// Ask a natural-language question about a session's tables.
    Ask {
        question: String,

        #[arg(long)]
        session: Option<String>,
    },

    /// Build a chart from a natural-language request.
    Chart {
        request: String,

        #[arg(long)]
        session: Option<String>,
    },

    /// Execute a local Lua fragment in the sandbox against a session.
    ///
    /// The fragment must assign `result` (or `fig` / `chart_json` with
    /// `--chart`). Nothing is recorded in the conversation log.
    Run {
        /// Path to the `.lua` fragment.
        script: PathBuf,

        #[arg(long)]
        session: String,

        /// Extract a chart instead of `result`.
        #[arg(long)]
        chart: bool,
    },

    /// Delete sessions (records, uploads, history) idle for too long.
    Purge {
        /// Idle cutoff in hours. Defaults to `[sessions].purge_after_hours`.
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

/// Session subcommands.
#[derive(Subcommand)]
enum SessionAction {
    /// Create a session and print its id.
    New,
    /// List all sessions.
    List,
    /// Show a session's files, tables, merged schema and history.
    Show { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Session { action } => match action {
            SessionAction::New => commands::run_session_new(&cfg).await?,
            SessionAction::List => commands::run_session_list(&cfg).await?,
            SessionAction::Show { id } => commands::run_session_show(&cfg, &id).await?,
        },
        Commands::Upload { files, session } => {
            commands::run_upload(&cfg, &files, session.as_deref()).await?;
        }
        Commands::Ask { question, session } => {
            commands::run_ask(&cfg, &question, session.as_deref()).await?;
        }
        Commands::Chart { request, session } => {
            commands::run_chart(&cfg, &request, session.as_deref()).await?;
        }
        Commands::Run {
            script,
            session,
            chart,
        } => {
            commands::run_script(&cfg, &script, &session, chart).await?;
        }
        Commands::Purge { older_than_hours } => {
            commands::run_purge(&cfg, older_than_hours).await?;
        }
    }

    Ok(())
}
