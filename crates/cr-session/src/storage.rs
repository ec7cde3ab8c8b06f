//! Durable object storage for staged segments.
//!
//! Keys are `/`-separated relative paths such as
//! `hls_media/<session id>/stream3.ts`. The store knows nothing about
//! playlists or sessions; namespacing is done by the callers through
//! [`object_key`] and [`session_prefix`].

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cr_core::config::{StorageBackend, StorageConfig};
use cr_core::{Error, Result, SessionId};
use dashmap::DashMap;

/// Pluggable key-value object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `data` under `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read the object under `key`, or `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// List every key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete `keys`, returning how many objects were actually removed.
    /// Missing keys are not an error.
    async fn delete_many(&self, keys: &[String]) -> Result<usize>;
}

/// Build the configured backend.
pub fn build_store(config: &StorageConfig) -> Arc<dyn ObjectStore> {
    match config.backend {
        StorageBackend::Fs => Arc::new(FsObjectStore::new(&config.root)),
        StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
    }
}

/// `<prefix>/<session id>/`, the namespace of one session.
pub fn session_prefix(prefix: &str, session_id: &SessionId) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{session_id}/")
    } else {
        format!("{prefix}/{session_id}/")
    }
}

/// The key of `file_name` inside a session's namespace.
pub fn object_key(prefix: &str, session_id: &SessionId, file_name: &str) -> String {
    format!("{}{file_name}", session_prefix(prefix, session_id))
}

/// Reject keys that are empty, absolute, or could escape the store root.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(Error::Validation(format!("invalid object key: {key:?}")));
    }
    let ok = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !ok || key.split('/').any(str::is_empty) {
        return Err(Error::Validation(format!("invalid object key: {key:?}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Objects stored as plain files below a root directory.
///
/// Writes land in a temporary sibling first and are renamed into place, so a
/// reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

const PARTIAL_SUFFIX: &str = ".partial";

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(
            ".{file_name}.{}{PARTIAL_SUFFIX}",
            uuid::Uuid::new_v4().simple()
        ));

        let size = data.len();
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::trace!("Stored {key} ({size} bytes)");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };

                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    // Only descend where the prefix can still match.
                    let as_dir = format!("{key}/");
                    if as_dir.starts_with(prefix) || prefix.starts_with(&as_dir) {
                        pending.push((entry.path(), key));
                    }
                } else if file_type.is_file()
                    && !name.ends_with(PARTIAL_SUFFIX)
                    && key.starts_with(prefix)
                {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            // Prune now-empty directories up to the root; stops at the first
            // non-empty one.
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Objects held in process memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        Ok(self.objects.get(key).map(|v| v.value().clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        Ok(keys
            .iter()
            .filter(|k| self.objects.remove(k.as_str()).is_some())
            .count())
    }
}
