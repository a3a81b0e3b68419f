//! Blob stores backing the response cache.

use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Minimal object store: whole-blob reads and writes addressed by a `/`-separated path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. A missing blob is `Ok(None)`, not an error.
    async fn read(&self, path: &str) -> ProviderResult<Option<Vec<u8>>>;

    /// Create or replace a blob.
    async fn write(&self, path: &str, bytes: &[u8]) -> ProviderResult<()>;

    /// Delete every blob whose path starts with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> ProviderResult<usize>;
}

/// Suffix of in-progress writes; such files are not blobs.
const TMP_SUFFIX: &str = ".tmp";

/// Blob store rooted at a local directory. Each path maps to one file.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> ProviderResult<PathBuf> {
        let relative = Path::new(path.trim_end_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(ProviderError::cache(format!(
                "Blob path '{}' must be relative without '..'",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::cache(format!(
                "Failed to read {}: {}",
                file.display(),
                e
            ))),
        }
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> ProviderResult<()> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ProviderError::cache(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        // Write-then-rename so readers never see a partial blob. Each writer gets its own
        // temporary file, so concurrent writers of one path cannot interleave.
        let tmp = temp_path(&file);
        let written = async {
            tokio::fs::write(&tmp, bytes).await.map_err(|e| {
                ProviderError::cache(format!("Failed to write {}: {}", tmp.display(), e))
            })?;
            tokio::fs::rename(&tmp, &file).await.map_err(|e| {
                ProviderError::cache(format!("Failed to rename into {}: {}", file.display(), e))
            })
        }
        .await;
        if written.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        written
    }

    async fn delete_prefix(&self, prefix: &str) -> ProviderResult<usize> {
        let dir = self.resolve(prefix)?;
        let mut removed = 0;
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ProviderError::cache(e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ProviderError::cache(e.to_string()))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| ProviderError::cache(e.to_string()))?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if !is_temp(&entry.path()) {
                    removed += 1;
                }
            }
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(ProviderError::cache(format!(
                "Failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }
}

/// Hidden sibling of `file` with a random component.
fn temp_path(file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    file.with_file_name(format!(".{}.{:016x}{}", name, rand::random::<u64>(), TMP_SUFFIX))
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(TMP_SUFFIX))
}

/// In-process blob store, mostly for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored paths in sorted order.
    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        Ok(self.lock().get(path).cloned())
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> ProviderResult<()> {
        self.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> ProviderResult<usize> {
        let mut blobs = self.lock();
        let before = blobs.len();
        blobs.retain(|path, _| !path.starts_with(prefix));
        Ok(before - blobs.len())
    }
}
