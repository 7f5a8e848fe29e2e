//! Batch upload pipeline.
//!
//! Each file goes through: validate (name, extension, size) → store the
//! artifact → parse → extract schemas → assign keys → record durably. A
//! failure at any step is reported for that file only; its artifact is
//! removed and nothing of it is recorded, while sibling files continue.
//! The whole batch runs under the session's cache lock, and the merged
//! namespace is published once at the end.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::UploadedFile;
use crate::namespace::{self, Namespace, PendingTable};
use crate::schema::extract_schema;
use crate::session::{content_sha256, SessionManager};
use crate::workbook::{self, Format};

/// One file received for upload.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    /// Read a local file, keeping only its base name.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self { filename, bytes })
    }
}

/// A file that made it into the session.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub filename: String,
    pub file_id: String,
    /// Original table names, workbook order.
    pub sheets: Vec<String>,
    pub sheet_count: usize,
    /// Composite keys assigned to those tables.
    pub tables: Vec<String>,
    pub warnings: Vec<String>,
}

/// A file that was rejected.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub filename: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub session_id: String,
    pub message: String,
    pub files: Vec<FileOutcome>,
    pub errors: Vec<FileFailure>,
    pub total_sheets: usize,
    pub all_sheets: Vec<String>,
    /// Schema summaries of every table in the session, by composite key.
    pub schema: Value,
}

impl UploadReport {
    pub fn all_failed(&self) -> bool {
        self.files.is_empty()
    }
}

/// Ingest a batch of files into a session (created when `session_id` is
/// absent or does not resolve).
pub async fn ingest_files(
    manager: &SessionManager,
    session_id: Option<&str>,
    files: Vec<IncomingFile>,
) -> Result<UploadReport> {
    let mut session = manager.lock_or_create_session(session_id).await?;
    let session_id = session.record.session_id.clone();
    let mut namespace: Namespace = (*session.namespace).clone();

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();

    for file in files {
        let filename = file.filename.clone();
        match ingest_one(manager, &session_id, &mut namespace, file).await {
            Ok(outcome) => {
                tracing::info!(
                    session_id = %session_id,
                    file = %outcome.filename,
                    tables = ?outcome.tables,
                    "Ingested upload"
                );
                outcomes.push(outcome);
            }
            Err(e) => {
                if e.is_per_file() {
                    tracing::warn!(session_id = %session_id, file = %filename, error = %e, "Rejected upload");
                } else {
                    tracing::error!(session_id = %session_id, file = %filename, error = %e, "Upload failed");
                }
                failures.push(FileFailure {
                    filename: display_name(&filename),
                    code: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    if !outcomes.is_empty() {
        session.publish(namespace);
    }

    let all_sheets: Vec<String> = outcomes.iter().flat_map(|o| o.sheets.clone()).collect();
    let message = summary_message(&outcomes, &failures);

    Ok(UploadReport {
        session_id,
        message,
        total_sheets: all_sheets.len(),
        all_sheets,
        schema: session.namespace.schemas_json(),
        files: outcomes,
        errors: failures,
    })
}

fn display_name(filename: &str) -> String {
    if filename.trim().is_empty() {
        "(unnamed file)".to_string()
    } else {
        filename.to_string()
    }
}

fn summary_message(outcomes: &[FileOutcome], failures: &[FileFailure]) -> String {
    let mut message = match outcomes {
        [] if failures.is_empty() => "No files provided".to_string(),
        [] => "All files failed to upload".to_string(),
        [one] => format!("File '{}' uploaded and parsed successfully", one.filename),
        many => format!("{} files uploaded and parsed successfully", many.len()),
    };
    let mut notes: Vec<String> = failures.iter().map(|f| f.message.clone()).collect();
    notes.extend(
        outcomes
            .iter()
            .flat_map(|o| o.warnings.iter().map(move |w| format!("{}: {}", o.filename, w))),
    );
    if !notes.is_empty() {
        let label = if outcomes.is_empty() { ": " } else { ". Warnings: " };
        message.push_str(label);
        message.push_str(&notes.join("; "));
    }
    message
}

/// Keep a stored file name to a safe single path component.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

async fn ingest_one(
    manager: &SessionManager,
    session_id: &str,
    namespace: &mut Namespace,
    file: IncomingFile,
) -> Result<FileOutcome> {
    let config = manager.config();
    let filename = file
        .filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    let allowed = config.storage.allowed_extensions.join(", ");

    let extension = Path::new(&filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let format = Format::from_extension(&extension)
        .filter(|_| !filename.is_empty() && config.accepts_extension(&extension))
        .ok_or_else(|| Error::UnsupportedFileFormat {
            file: display_name(&filename),
            extension: extension.clone(),
            allowed: allowed.clone(),
        })?;

    let size = file.bytes.len() as u64;
    if size > config.storage.max_file_size {
        return Err(Error::FileTooLarge {
            file: filename,
            size,
            limit: config.storage.max_file_size,
        });
    }
    if namespace::file_stem(&filename).is_none() {
        return Err(Error::MissingFileContext(filename));
    }

    let file_id = Uuid::new_v4().to_string();
    let dir = manager.session_dir(session_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{}-{}", file_id, sanitize_filename(&filename)));
    tokio::fs::write(&path, &file.bytes).await?;

    match parse_and_record(manager, session_id, namespace, &file_id, &filename, &path, file.bytes, format).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %cleanup, "Could not remove rejected upload");
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn parse_and_record(
    manager: &SessionManager,
    session_id: &str,
    namespace: &mut Namespace,
    file_id: &str,
    filename: &str,
    path: &Path,
    bytes: Vec<u8>,
    format: Format,
) -> Result<FileOutcome> {
    let size = bytes.len() as u64;
    let digest = content_sha256(&bytes);

    let tables = tokio::task::spawn_blocking(move || workbook::parse_bytes(&bytes, format))
        .await
        .map_err(|e| Error::ParseFailure {
            file: filename.to_string(),
            reason: e.to_string(),
        })?
        .map_err(|e| Error::ParseFailure {
            file: filename.to_string(),
            reason: e.to_string(),
        })?;

    let mut warnings = Vec::new();
    let mut pending = Vec::new();
    for table in tables {
        match extract_schema(&table) {
            Some(schema) => pending.push(PendingTable {
                raw_name: table.name.clone(),
                schema,
                data: Some(Arc::new(table)),
            }),
            None => warnings.push(format!("sheet '{}' is empty and was skipped", table.name)),
        }
    }
    if pending.is_empty() {
        warnings.push("no sheet contains data".to_string());
    }

    let mut next = namespace.clone();
    let keys = next.merge(file_id, filename, pending.clone())?;

    let uploaded = UploadedFile {
        id: file_id.to_string(),
        session_id: session_id.to_string(),
        filename: filename.to_string(),
        file_path: PathBuf::from(path),
        file_size: size,
        content_sha256: digest,
        uploaded_at: chrono::Utc::now(),
    };
    manager.record_upload(&uploaded, &pending).await?;
    *namespace = next;

    let sheets: Vec<String> = pending.iter().map(|p| p.raw_name.clone()).collect();
    Ok(FileOutcome {
        filename: filename.to_string(),
        file_id: file_id.to_string(),
        sheet_count: sheets.len(),
        sheets,
        tables: keys,
        warnings,
    })
}
