//! Session lifecycle on top of the durable store and the in-memory cache.
//!
//! [`SessionManager`] is the only component that moves a session between
//! cold and warm. A cold session is reconstructed lazily on first access:
//! every recorded file still present on disk (with an unchanged digest) is
//! re-parsed, and for every other file only the persisted schemas come
//! back. Reconstruction happens while the session's cache slot is locked,
//! so concurrent first accesses reconstruct once.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::{SessionCache, SlotGuard};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{ConversationTurn, SessionRecord, Table, UploadedFile};
use crate::namespace::{Namespace, PendingTable};
use crate::store::SqliteStore;
use crate::{db, migrate, workbook};

/// A session's durable record together with its warm table namespace.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub record: SessionRecord,
    pub namespace: Arc<Namespace>,
}

impl SessionView {
    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }
}

/// Exclusive, warm access to one session, held for read-modify-write
/// sequences such as an upload batch.
#[derive(Debug)]
pub struct LockedSession {
    guard: SlotGuard,
    pub record: SessionRecord,
    pub namespace: Arc<Namespace>,
}

impl LockedSession {
    /// Publish a new namespace snapshot for this session.
    pub fn publish(&mut self, namespace: Namespace) -> Arc<Namespace> {
        let snapshot = self.guard.publish(namespace);
        self.namespace = snapshot.clone();
        snapshot
    }
}

pub struct SessionManager {
    config: Config,
    store: SqliteStore,
    cache: SessionCache,
}

/// Hex SHA-256 of an upload's bytes.
pub fn content_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether `id` has the shape of a session identity.
pub fn is_valid_session_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

impl SessionManager {
    /// Connect to the configured database, run migrations and start with a
    /// cold cache.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(config, SqliteStore::new(pool)))
    }

    pub fn new(config: Config, store: SqliteStore) -> Self {
        let cache = SessionCache::new(&config.cache);
        Self {
            config,
            store,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Directory holding a session's uploaded artifacts.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.storage.upload_dir.join(session_id)
    }

    pub async fn create_session(&self) -> Result<SessionView> {
        let session_id = Uuid::new_v4().to_string();
        let record = self.store.create_session(&session_id, Utc::now()).await?;
        let namespace = self.cache.insert_empty(&session_id).await;
        tracing::info!(session_id = %session_id, "Created session");
        Ok(SessionView { record, namespace })
    }

    /// Load a session, reconstructing its namespace if the cache is cold.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionView> {
        let locked = self.lock_session(session_id).await?;
        let view = SessionView {
            record: locked.record,
            namespace: locked.namespace,
        };
        drop(locked.guard);
        self.cache.evict();
        Ok(view)
    }

    /// Resolve `session_id`, or allocate a fresh session when it is absent,
    /// malformed or unknown.
    pub async fn get_or_create_session(&self, session_id: Option<&str>) -> Result<SessionView> {
        match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) if is_valid_session_id(id) => match self.get_session(id).await {
                Ok(view) => Ok(view),
                Err(Error::SessionNotFound(_)) => {
                    tracing::debug!(session_id = %id, "Unknown session, creating a new one");
                    self.create_session().await
                }
                Err(e) => Err(e),
            },
            Some(id) => {
                tracing::debug!(session_id = %id, "Malformed session id, creating a new one");
                self.create_session().await
            }
            None => self.create_session().await,
        }
    }

    /// Lock a session for a read-modify-write sequence. The returned handle
    /// is warm; the lock is held until it is dropped.
    pub async fn lock_session(&self, session_id: &str) -> Result<LockedSession> {
        let mut guard = self.cache.lock(session_id).await;

        let mut record = match self.store.get_session_record(session_id).await? {
            Some(record) => record,
            None => {
                // Unknown ids must not leave a cold slot behind.
                drop(guard);
                self.cache.forget(session_id);
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
        };

        let now = Utc::now();
        self.store.touch(session_id, now).await?;
        record.last_accessed = now;

        let namespace = match guard.namespace() {
            Some(ns) => ns,
            None => {
                let ns = self.reconstruct(&record).await?;
                guard.publish(ns)
            }
        };

        Ok(LockedSession {
            guard,
            record,
            namespace,
        })
    }

    /// Lock a session resolved through [`Self::get_or_create_session`].
    pub async fn lock_or_create_session(&self, session_id: Option<&str>) -> Result<LockedSession> {
        let view = self.get_or_create_session(session_id).await?;
        self.lock_session(view.session_id()).await
    }

    async fn reconstruct(&self, record: &SessionRecord) -> Result<Namespace> {
        let mut namespace = Namespace::new();
        let mut recovered = 0usize;
        let mut schema_only = 0usize;

        for file in &record.uploaded_files {
            let schemas = self.store.list_table_schemas(&file.id).await?;
            let parsed = match load_artifact(file).await {
                Ok(tables) => {
                    recovered += 1;
                    Some(tables)
                }
                Err(reason) => {
                    schema_only += 1;
                    tracing::warn!(
                        session_id = %record.session_id,
                        file = %file.filename,
                        reason = %reason,
                        "Raw data unavailable, recovering schema only"
                    );
                    None
                }
            };

            let pending = schemas
                .into_iter()
                .map(|s| {
                    let data = parsed.as_ref().and_then(|tables| {
                        tables
                            .iter()
                            .find(|t| t.name == s.table_name && !t.is_empty())
                            .cloned()
                            .map(Arc::new)
                    });
                    PendingTable {
                        raw_name: s.table_name,
                        schema: s.schema,
                        data,
                    }
                })
                .collect();

            namespace.merge(&file.id, &file.filename, pending)?;
        }

        self.cache.note_reconstruction();
        tracing::info!(
            session_id = %record.session_id,
            files = record.uploaded_files.len(),
            recovered,
            schema_only,
            tables = namespace.len(),
            "Reconstructed session cache"
        );
        Ok(namespace)
    }

    /// Persist one uploaded file with its table schemas. Atomic: on error
    /// nothing of this file is recorded.
    pub async fn record_upload(
        &self,
        file: &UploadedFile,
        tables: &[PendingTable],
    ) -> Result<()> {
        let rows: Vec<(String, crate::models::SchemaSummary)> = tables
            .iter()
            .map(|t| (t.raw_name.clone(), t.schema.clone()))
            .collect();
        self.store.record_upload(file, &rows).await
    }

    pub async fn append_conversation(
        &self,
        session_id: &str,
        question: Option<&str>,
        answer: Option<&str>,
        code: Option<&str>,
    ) -> Result<ConversationTurn> {
        self.store
            .append_conversation(session_id, question, answer, code, Utc::now())
            .await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        if !self.store.session_exists(session_id).await? {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        self.store.list_conversation(session_id).await
    }

    /// Delete sessions idle for longer than `older_than`, their artifacts on
    /// disk and their cache slots. Returns the removed ids.
    pub async fn purge(&self, older_than: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - older_than;
        let purged = self.store.purge_sessions(cutoff).await?;
        for id in &purged {
            self.cache.forget(id);
            let dir = self.session_dir(id);
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove session uploads");
                }
            }
        }
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "Purged idle sessions");
        }
        Ok(purged)
    }
}

/// Re-read and re-parse a recorded artifact. Any reason the raw data cannot
/// be trusted (missing, replaced, unparsable) is reported as a message.
async fn load_artifact(file: &UploadedFile) -> std::result::Result<Vec<Table>, String> {
    let path = file.file_path.clone();
    let expected = file.content_sha256.clone();
    tokio::task::spawn_blocking(move || read_verified(&path, &expected))
        .await
        .map_err(|e| format!("reload task failed: {}", e))?
}

fn read_verified(path: &Path, expected_sha256: &str) -> std::result::Result<Vec<Table>, String> {
    if !path.exists() {
        return Err("file missing from disk".to_string());
    }
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    if content_sha256(&bytes) != expected_sha256 {
        return Err("file content changed since upload".to_string());
    }
    let format = workbook::Format::from_path(path)
        .ok_or_else(|| format!("unrecognised extension: {}", path.display()))?;
    workbook::parse_bytes(&bytes, format).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(dir: &tempfile::TempDir) -> SessionManager {
        SessionManager::open(Config::rooted_at(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn created_session_is_warm_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;
        let view = mgr.create_session().await.unwrap();
        assert!(is_valid_session_id(view.session_id()));
        assert!(view.namespace.is_empty());
        assert!(mgr.cache().is_warm(view.session_id()));
        assert_eq!(mgr.cache().reconstructions(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;
        let id = Uuid::new_v4().to_string();
        let err = mgr.get_session(&id).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn get_or_create_replaces_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;
        let existing = mgr.create_session().await.unwrap();

        let same = mgr
            .get_or_create_session(Some(existing.session_id()))
            .await
            .unwrap();
        assert_eq!(same.session_id(), existing.session_id());

        for bad in [Some("not-a-uuid"), Some(""), None] {
            let fresh = mgr.get_or_create_session(bad).await.unwrap();
            assert_ne!(fresh.session_id(), existing.session_id());
        }
        let unknown = Uuid::new_v4().to_string();
        let fresh = mgr.get_or_create_session(Some(&unknown)).await.unwrap();
        assert_ne!(fresh.session_id(), unknown);
    }

    #[tokio::test]
    async fn cold_empty_session_reconstructs_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir).await;
        let id = mgr.create_session().await.unwrap().record.session_id;
        mgr.cache().invalidate_all().await;

        mgr.get_session(&id).await.unwrap();
        mgr.get_session(&id).await.unwrap();
        assert_eq!(mgr.cache().reconstructions(), 1);
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            content_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
