//! Session persistence.
//!
//! Stores only ever hold serialized bytes: a record handed to `save` and one
//! returned by `load` never share memory. Each store carries the lifetime it
//! gives fresh records, see [`SessionStore::new_record`].

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Duration, Utc};
use harbor_core::{HarborError, SessionRecord};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

const SESSION_EXT: &str = "session.json";

/// Lifetime of a fresh record when none is configured.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HarborError>> + Send + 'a>>;

pub trait SessionStore: Send + Sync {
    /// Fetch a live session. Expired sessions are deleted and read as absent.
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<SessionRecord>>;

    fn save<'a>(&'a self, id: &'a str, record: &'a SessionRecord) -> StoreFuture<'a, ()>;

    /// Returns whether a session was removed.
    fn invalidate<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    /// Delete every session expired at `now`; returns how many.
    fn purge_expired<'a>(&'a self, now: DateTime<Utc>) -> StoreFuture<'a, usize>;

    fn backend_name(&self) -> &str;

    /// Lifetime given to records created by [`new_record`](Self::new_record).
    fn ttl(&self) -> Duration;

    /// An empty record expiring one `ttl` from now.
    fn new_record(&self) -> SessionRecord {
        SessionRecord::new(Utc::now() + self.ttl())
    }
}

/// In-process store. Holds encoded records only.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<u8>>>,
    ttl: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self {
            sessions: RwLock::default(),
            ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Remove `id` if it still holds the expired `seen` bytes. A save that
/// replaced the entry after `seen` was read wins.
fn drop_expired(
    sessions: &mut HashMap<String, Vec<u8>>,
    id: &str,
    seen: &[u8],
    now: DateTime<Utc>,
) -> Result<Option<SessionRecord>, HarborError> {
    let replaced = match sessions.get(id) {
        None => return Ok(None),
        Some(current) if current.as_slice() == seen => None,
        Some(current) => Some(SessionRecord::from_bytes(current)?),
    };
    match replaced {
        Some(record) if !record.is_expired(now) => Ok(Some(record)),
        _ => {
            sessions.remove(id);
            tracing::debug!(session = id, "Expired session dropped on load");
            Ok(None)
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move {
            let bytes = match self.sessions.read().await.get(id) {
                Some(bytes) => bytes.clone(),
                None => return Ok(None),
            };
            let record = SessionRecord::from_bytes(&bytes)?;
            let now = Utc::now();
            if !record.is_expired(now) {
                return Ok(Some(record));
            }

            let mut guard = self.sessions.write().await;
            drop_expired(&mut guard, id, &bytes, now)
        })
    }

    fn save<'a>(&'a self, id: &'a str, record: &'a SessionRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let bytes = record.to_bytes()?;
            self.sessions.write().await.insert(id.to_string(), bytes);
            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.sessions.write().await.remove(id).is_some()) })
    }

    fn purge_expired<'a>(&'a self, now: DateTime<Utc>) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut guard = self.sessions.write().await;
            let before = guard.len();
            guard.retain(|_, bytes| {
                // Undecodable entries can never be loaded, so they go too.
                SessionRecord::from_bytes(bytes).is_ok_and(|r| !r.is_expired(now))
            });
            Ok(before - guard.len())
        })
    }

    fn backend_name(&self) -> &str {
        "memory"
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// One JSON file per session.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {sha256(session_id)}.session.json
///   {sha256(session_id)}.{uuid}.tmp      (in-progress save)
/// ```
pub struct FileSessionStore {
    base_dir: PathBuf,
    ttl: Duration,
}

impl FileSessionStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn init(&self) -> Result<(), HarborError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{SESSION_EXT}", Self::digest(id)))
    }

    fn digest(id: &str) -> String {
        hex::encode(Sha256::digest(id.as_bytes()))
    }

    async fn remove_file(path: &Path) -> Result<bool, HarborError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move {
            let path = self.session_path(id);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let record = SessionRecord::from_bytes(&bytes)?;
            if record.is_expired(Utc::now()) {
                Self::remove_file(&path).await?;
                tracing::debug!(path = %path.display(), "Expired session deleted on load");
                return Ok(None);
            }
            Ok(Some(record))
        })
    }

    fn save<'a>(&'a self, id: &'a str, record: &'a SessionRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let bytes = record.to_bytes()?;
            let path = self.session_path(id);
            // Write then rename so a reader never sees a partial record.
            // Every save gets its own temp file; the last rename wins.
            let tmp = self
                .base_dir
                .join(format!("{}.{}.tmp", Self::digest(id), uuid::Uuid::new_v4()));
            let written = match tokio::fs::write(&tmp, bytes).await {
                Ok(()) => tokio::fs::rename(&tmp, &path).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let removed = Self::remove_file(&self.session_path(id)).await?;
            if removed {
                tracing::debug!(session = id, "Session invalidated");
            }
            Ok(removed)
        })
    }

    fn purge_expired<'a>(&'a self, now: DateTime<Utc>) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
            let mut purged = 0;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_session = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(SESSION_EXT));
                if !is_session {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                match SessionRecord::from_bytes(&bytes) {
                    Ok(record) if record.is_expired(now) => {
                        if Self::remove_file(&path).await? {
                            purged += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                    }
                }
            }
            tracing::info!(purged, dir = %self.base_dir.display(), "Expired sessions purged");
            Ok(purged)
        })
    }

    fn backend_name(&self) -> &str {
        "file"
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(ttl: Duration) -> SessionRecord {
        let mut record = SessionRecord::new(Utc::now() + ttl);
        record.set("user", "ada").unwrap();
        record.set("visits", &3u32).unwrap();
        record
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemorySessionStore::new();
        let saved = record(Duration::hours(1));
        store.save("abc", &saved).await.unwrap();

        let loaded = store.load("abc").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.get::<u32>("visits").unwrap(), Some(3));
    }

    #[tokio::test]
    async fn memory_store_copies_on_save() {
        let store = MemorySessionStore::new();
        let mut saved = record(Duration::hours(1));
        store.save("abc", &saved).await.unwrap();
        saved.set("visits", &4u32).unwrap();

        let loaded = store.load("abc").await.unwrap().unwrap();
        assert_eq!(loaded.get::<u32>("visits").unwrap(), Some(3));
    }

    #[tokio::test]
    async fn memory_store_drops_expired() {
        let store = MemorySessionStore::new();
        store.save("old", &record(Duration::seconds(-1))).await.unwrap();
        store.save("new", &record(Duration::hours(1))).await.unwrap();

        assert!(store.load("old").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        assert!(store.invalidate("new").await.unwrap());
        assert!(!store.invalidate("new").await.unwrap());
    }

    #[tokio::test]
    async fn file_store_names_files_by_digest() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().to_path_buf());
        let path = store.session_path("../../etc/passwd");
        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 64 + 1 + SESSION_EXT.len());
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions"));
        store.init().await.unwrap();

        let saved = record(Duration::hours(1));
        store.save("abc", &saved).await.unwrap();
        assert_eq!(store.load("abc").await.unwrap(), Some(saved));
        assert!(store.load("missing").await.unwrap().is_none());

        assert!(store.invalidate("abc").await.unwrap());
        assert!(store.load("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_purges_expired() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();

        store.save("a", &record(Duration::seconds(-5))).await.unwrap();
        store.save("b", &record(Duration::seconds(-5))).await.unwrap();
        store.save("c", &record(Duration::hours(1))).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 2);
        assert!(store.load("c").await.unwrap().is_some());
        assert!(!store.session_path("a").exists());
    }

    #[test]
    fn expired_entry_replaced_by_a_save_is_kept() {
        let now = Utc::now();
        let stale = record(Duration::seconds(-1)).to_bytes().unwrap();
        let fresh = record(Duration::hours(1));
        let mut sessions = HashMap::new();
        sessions.insert("u".to_string(), fresh.to_bytes().unwrap());

        let loaded = drop_expired(&mut sessions, "u", &stale, now).unwrap();

        assert_eq!(loaded, Some(fresh));
        assert!(sessions.contains_key("u"));

        sessions.insert("u".to_string(), stale.clone());
        assert_eq!(drop_expired(&mut sessions, "u", &stale, now).unwrap(), None);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn new_records_use_the_store_ttl() {
        let store = MemorySessionStore::new().with_ttl(Duration::minutes(5));
        let before = Utc::now();
        let fresh = store.new_record();
        assert!(fresh.is_empty());
        assert!(fresh.expires_at() >= before + Duration::minutes(5));
        assert!(fresh.expires_at() <= Utc::now() + Duration::minutes(5));

        let dir = TempDir::new().unwrap();
        let files = FileSessionStore::new(dir.path().to_path_buf());
        assert_eq!(files.ttl(), Duration::days(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_saves_of_one_session_all_succeed() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(FileSessionStore::new(dir.path().to_path_buf()));
        store.init().await.unwrap();

        let saves: Vec<_> = (0..64u32)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    let mut saved = record(Duration::hours(1));
                    saved.set("visits", &i).unwrap();
                    store.save("same-user", &saved).await
                })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        let loaded = store.load("same-user").await.unwrap().unwrap();
        assert!(loaded.get::<u32>("visits").unwrap().unwrap() < 64);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn file_store_deletes_expired_on_load() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();

        store.save("gone", &record(Duration::seconds(-1))).await.unwrap();
        assert!(store.session_path("gone").exists());
        assert!(store.load("gone").await.unwrap().is_none());
        assert!(!store.session_path("gone").exists());
    }
}
