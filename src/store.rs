//! SQLite persistence for sessions, uploaded files, table schemas and the
//! conversation log.
//!
//! Durable storage is the source of truth; the in-memory cache is rebuilt
//! from what this module returns. Every method is a thin mapping onto one
//! or a few statements against the schema created in [`crate::migrate`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;

use crate::error::Result;
use crate::models::{ConversationTurn, SchemaSummary, SessionRecord, TableSchemaRecord, UploadedFile};

/// Summary line for session listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionListing {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub file_count: i64,
    pub turn_count: i64,
}

/// SQLite-backed session store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn file_from_row(row: &SqliteRow) -> UploadedFile {
    UploadedFile {
        id: row.get("id"),
        session_id: row.get("session_id"),
        filename: row.get("filename"),
        file_path: PathBuf::from(row.get::<String, _>("file_path")),
        file_size: row.get::<i64, _>("file_size").max(0) as u64,
        content_sha256: row.get("content_sha256"),
        uploaded_at: from_millis(row.get("uploaded_at")),
    }
}

fn turn_from_row(row: &SqliteRow) -> ConversationTurn {
    ConversationTurn {
        id: row.get("id"),
        session_id: row.get("session_id"),
        question: row.get("question"),
        answer: row.get("answer"),
        code: row.get("code"),
        created_at: from_millis(row.get("created_at")),
    }
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<SessionRecord> {
        sqlx::query("INSERT INTO sessions (session_id, created_at, last_accessed) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(to_millis(now))
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;

        Ok(SessionRecord {
            session_id: session_id.to_string(),
            created_at: now,
            last_accessed: now,
            uploaded_files: Vec::new(),
        })
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Load a session with its uploaded files in upload order.
    pub async fn get_session_record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT session_id, created_at, last_accessed FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let uploaded_files = self.list_uploaded_files(session_id).await?;

        Ok(Some(SessionRecord {
            session_id: row.get("session_id"),
            created_at: from_millis(row.get("created_at")),
            last_accessed: from_millis(row.get("last_accessed")),
            uploaded_files,
        }))
    }

    /// Uploaded files of a session, oldest first. Ties on the timestamp are
    /// broken by insertion order so key assignment is reproducible.
    pub async fn list_uploaded_files(&self, session_id: &str) -> Result<Vec<UploadedFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, filename, file_path, file_size, content_sha256, uploaded_at
            FROM uploaded_files
            WHERE session_id = ?
            ORDER BY uploaded_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(file_from_row).collect())
    }

    pub async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_accessed = ? WHERE session_id = ?")
            .bind(to_millis(now))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist one uploaded file and the schema of each of its tables.
    ///
    /// Runs in a single transaction: either the file row and all of its
    /// schema rows are written, or nothing is.
    pub async fn record_upload(
        &self,
        file: &UploadedFile,
        tables: &[(String, SchemaSummary)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO uploaded_files (id, session_id, filename, file_path, file_size,
                                        content_sha256, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.session_id)
        .bind(&file.filename)
        .bind(file.file_path.to_string_lossy().to_string())
        .bind(file.file_size as i64)
        .bind(&file.content_sha256)
        .bind(to_millis(file.uploaded_at))
        .execute(&mut *tx)
        .await?;

        for (table_name, schema) in tables {
            let schema_json = serde_json::to_string(schema)?;
            sqlx::query(
                r#"
                INSERT INTO table_schemas (uploaded_file_id, session_id, table_name,
                                           schema_json, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&file.id)
            .bind(&file.session_id)
            .bind(table_name)
            .bind(schema_json)
            .bind(to_millis(file.uploaded_at))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE sessions SET last_accessed = ? WHERE session_id = ?")
            .bind(to_millis(file.uploaded_at))
            .bind(&file.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Persisted table schemas of one file, in workbook order.
    pub async fn list_table_schemas(&self, uploaded_file_id: &str) -> Result<Vec<TableSchemaRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT uploaded_file_id, table_name, schema_json
            FROM table_schemas
            WHERE uploaded_file_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(uploaded_file_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let schema_json: String = row.get("schema_json");
            records.push(TableSchemaRecord {
                uploaded_file_id: row.get("uploaded_file_id"),
                table_name: row.get("table_name"),
                schema: serde_json::from_str(&schema_json)?,
            });
        }
        Ok(records)
    }

    pub async fn append_conversation(
        &self,
        session_id: &str,
        question: Option<&str>,
        answer: Option<&str>,
        code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ConversationTurn> {
        let result = sqlx::query(
            r#"
            INSERT INTO conversations (session_id, question, answer, code, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(question)
        .bind(answer)
        .bind(code)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(ConversationTurn {
            id: result.last_insert_rowid(),
            session_id: session_id.to_string(),
            question: question.map(str::to_string),
            answer: answer.map(str::to_string),
            code: code.map(str::to_string),
            created_at: now,
        })
    }

    /// Conversation history of a session, oldest first.
    pub async fn list_conversation(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, question, answer, code, created_at
            FROM conversations
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(turn_from_row).collect())
    }

    /// All sessions, most recently used first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionListing>> {
        let rows = sqlx::query(
            r#"
            SELECT s.session_id, s.created_at, s.last_accessed,
                   (SELECT COUNT(*) FROM uploaded_files f WHERE f.session_id = s.session_id) AS file_count,
                   (SELECT COUNT(*) FROM conversations c WHERE c.session_id = s.session_id) AS turn_count
            FROM sessions s
            ORDER BY s.last_accessed DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SessionListing {
                session_id: row.get("session_id"),
                created_at: from_millis(row.get("created_at")),
                last_accessed: from_millis(row.get("last_accessed")),
                file_count: row.get("file_count"),
                turn_count: row.get("turn_count"),
            })
            .collect())
    }

    /// Delete every session last accessed before `idle_before`, cascading
    /// to files, schemas and conversations. Returns the removed ids; the
    /// caller owns cleanup of artifacts on disk.
    pub async fn purge_sessions(&self, idle_before: DateTime<Utc>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> =
            sqlx::query_scalar("SELECT session_id FROM sessions WHERE last_accessed < ?")
                .bind(to_millis(idle_before))
                .fetch_all(&mut *tx)
                .await?;

        for id in &ids {
            sqlx::query("DELETE FROM sessions WHERE session_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::BTreeMap;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let config = Config::rooted_at(dir.path());
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn schema(columns: &[&str]) -> SchemaSummary {
        SchemaSummary {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            dtypes: columns
                .iter()
                .map(|c| (c.to_string(), "object".to_string()))
                .collect(),
            row_count: 1,
            sample_rows: Vec::new(),
            numeric_columns: Vec::new(),
            statistics: BTreeMap::new(),
        }
    }

    fn upload(session_id: &str, id: &str, name: &str, at: DateTime<Utc>) -> UploadedFile {
        UploadedFile {
            id: id.to_string(),
            session_id: session_id.to_string(),
            filename: name.to_string(),
            file_path: PathBuf::from(format!("/tmp/{}", name)),
            file_size: 42,
            content_sha256: "00".repeat(32),
            uploaded_at: at,
        }
    }

    #[tokio::test]
    async fn upload_round_trip_keeps_order_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();
        store.create_session("s1", now).await.unwrap();

        let first = upload("s1", "f1", "sales.xlsx", now);
        let second = upload("s1", "f2", "branch.xlsx", now);
        store
            .record_upload(
                &first,
                &[
                    ("Summary".to_string(), schema(&["a"])),
                    ("Detail".to_string(), schema(&["b"])),
                ],
            )
            .await
            .unwrap();
        store
            .record_upload(&second, &[("Summary".to_string(), schema(&["c"]))])
            .await
            .unwrap();

        let record = store.get_session_record("s1").await.unwrap().unwrap();
        let names: Vec<&str> = record.uploaded_files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["sales.xlsx", "branch.xlsx"]);

        let tables = store.list_table_schemas("f1").await.unwrap();
        let table_names: Vec<&str> = tables.iter().map(|t| t.table_name.as_str()).collect();
        assert_eq!(table_names, vec!["Summary", "Detail"]);
        assert_eq!(tables[1].schema.columns, vec!["b"]);
    }

    #[tokio::test]
    async fn failed_schema_write_rolls_back_file_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.create_session("s1", Utc::now()).await.unwrap();

        // Duplicate table names violate UNIQUE(uploaded_file_id, table_name).
        let file = upload("s1", "f1", "dup.xlsx", Utc::now());
        let result = store
            .record_upload(
                &file,
                &[
                    ("Sheet1".to_string(), schema(&["a"])),
                    ("Sheet1".to_string(), schema(&["a"])),
                ],
            )
            .await;
        assert!(result.is_err());
        assert!(store.list_uploaded_files("s1").await.unwrap().is_empty());
        assert!(store.list_table_schemas("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_into_unknown_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let file = upload("missing", "f1", "a.csv", Utc::now());
        assert!(store.record_upload(&file, &[]).await.is_err());
    }

    #[tokio::test]
    async fn conversation_is_append_only_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.create_session("s1", Utc::now()).await.unwrap();

        store
            .append_conversation("s1", Some("hi"), Some("hello"), None, Utc::now())
            .await
            .unwrap();
        store
            .append_conversation("s1", None, Some("chart"), Some("fig = {}"), Utc::now())
            .await
            .unwrap();

        let turns = store.list_conversation("s1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question.as_deref(), Some("hi"));
        assert!(turns[1].question.is_none());
        assert_eq!(turns[1].code.as_deref(), Some("fig = {}"));
    }

    #[tokio::test]
    async fn purge_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let old = Utc::now() - chrono::Duration::hours(48);
        store.create_session("old", old).await.unwrap();
        store.create_session("new", Utc::now()).await.unwrap();
        store
            .record_upload(&upload("old", "f1", "a.csv", old), &[("Sheet1".to_string(), schema(&["a"]))])
            .await
            .unwrap();
        store
            .append_conversation("old", Some("q"), Some("a"), None, old)
            .await
            .unwrap();

        let purged = store
            .purge_sessions(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(purged, vec!["old".to_string()]);
        assert!(!store.session_exists("old").await.unwrap());
        assert!(store.session_exists("new").await.unwrap());
        assert!(store.list_table_schemas("f1").await.unwrap().is_empty());
        assert!(store.list_conversation("old").await.unwrap().is_empty());

        let listing = store.list_sessions().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].file_count, 0);
    }
}
