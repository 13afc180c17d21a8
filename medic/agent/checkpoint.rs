//! Checkpoint stores for resuming sessions across turns.

use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::CheckpointError;
use crate::session::{SessionKey, SessionState};

/// Persistence for [`SessionState`] keyed by session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the state saved under `key`.
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionState>, CheckpointError>;
    /// Saves `state` under `key`, replacing any previous state.
    async fn save(&self, key: &SessionKey, state: &SessionState) -> Result<(), CheckpointError>;
    /// Claims `key` for writing against every other user of the same storage,
    /// or returns `None` while someone else holds it. Stores private to one
    /// process rely on [`WriterLeases`] alone.
    async fn claim(&self, _key: &SessionKey) -> Result<Option<SessionClaim>, CheckpointError> {
        Ok(Some(SessionClaim::default()))
    }
}

/// Storage-level write claim on one session; released on drop.
#[derive(Debug, Default)]
pub struct SessionClaim {
    lock_file: Option<PathBuf>,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        if let Some(path) = self.lock_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Single-turn store: never finds anything, discards saves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointStore;

#[async_trait]
impl CheckpointStore for NoopCheckpointStore {
    async fn load(&self, _key: &SessionKey) -> Result<Option<SessionState>, CheckpointError> {
        Ok(None)
    }

    async fn save(&self, _key: &SessionKey, _state: &SessionState) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// Process-local store. Keeps the encoded JSON so loads never alias live state.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    entries: Arc<RwLock<HashMap<SessionKey, String>>>,
}

impl MemoryCheckpointStore {
    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionState>, CheckpointError> {
        let raw = self.entries.read().get(key).cloned();
        raw.map(|json| serde_json::from_str(&json).map_err(CheckpointError::from))
            .transpose()
    }

    async fn save(&self, key: &SessionKey, state: &SessionState) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(state)?;
        self.entries.write().insert(key.clone(), json);
        Ok(())
    }
}

/// Lock files older than this are left over from a crashed writer.
pub const DEFAULT_STALE_CLAIM: Duration = Duration::from_secs(600);

/// One JSON file per session under a directory, written via temp file + rename.
/// Writers claim a session through a `<key>.lock` file created exclusively,
/// so separate processes sharing the directory exclude each other.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    stale_after: Duration,
}

impl FileCheckpointStore {
    /// Creates the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stale_after: DEFAULT_STALE_CLAIM,
        })
    }

    /// Age after which an abandoned lock file is taken over.
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    async fn create_lock(path: &Path) -> std::io::Result<()> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map(drop)
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|at| SystemTime::now().duration_since(at).ok())
            .is_some_and(|age| age >= self.stale_after)
    }

    fn path_for(&self, key: &SessionKey) -> Result<PathBuf, CheckpointError> {
        let name = key.as_str();
        let valid = !name.is_empty()
            && name.len() <= 128
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(CheckpointError::InvalidKey(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<SessionState>, CheckpointError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, key: &SessionKey, state: &SessionState) -> Result<(), CheckpointError> {
        let path = self.path_for(key)?;
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", key.as_str(), Uuid::new_v4().simple()));
        let data = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, data).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn claim(&self, key: &SessionKey) -> Result<Option<SessionClaim>, CheckpointError> {
        let lock = self.path_for(key)?.with_extension("lock");
        for _ in 0..2 {
            match Self::create_lock(&lock).await {
                Ok(()) => {
                    return Ok(Some(SessionClaim {
                        lock_file: Some(lock),
                    }));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if !self.is_stale(&lock).await {
                        return Ok(None);
                    }
                    match tokio::fs::remove_file(&lock).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }
}

/// Grants at most one writer per session key at a time.
#[derive(Debug, Default, Clone)]
pub struct WriterLeases {
    held: Arc<Mutex<HashSet<SessionKey>>>,
}

impl WriterLeases {
    /// Takes the lease for `key`, or `None` if another request holds it.
    #[must_use]
    pub fn try_acquire(&self, key: &SessionKey) -> Option<WriterLease> {
        if self.held.lock().insert(key.clone()) {
            Some(WriterLease {
                key: key.clone(),
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    /// Whether `key` is currently leased.
    #[must_use]
    pub fn is_held(&self, key: &SessionKey) -> bool {
        self.held.lock().contains(key)
    }
}

/// Exclusive write access to one session key; released on drop.
#[derive(Debug)]
pub struct WriterLease {
    key: SessionKey,
    held: Arc<Mutex<HashSet<SessionKey>>>,
}

impl WriterLease {
    /// Leased key.
    #[must_use]
    pub const fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}
