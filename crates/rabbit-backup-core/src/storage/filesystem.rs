//! Filesystem storage backend implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::StorageBackend;
use crate::error::StorageError;
use crate::Result;

/// Suffix of the scratch file a unit is written to before it is renamed
const PARTIAL_SUFFIX: &str = ".partial";

/// Filesystem-based storage backend.
///
/// Units are written to a hidden sibling first, synced, renamed into place,
/// and the directory is synced so the rename itself survives a crash. A
/// half-written archive never appears under its final name.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base path
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Create a backend, making the base directory if it is missing
    pub fn create(base_path: PathBuf) -> Result<Self> {
        if !base_path.is_dir() {
            std::fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Backend(format!(
                    "Failed to create output directory {}: {}",
                    base_path.display(),
                    e
                ))
            })?;
            info!("Created output directory {}", base_path.display());
        }
        Ok(Self::new(base_path))
    }

    /// Convert a storage key to a filesystem path
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = key.trim_start_matches('/');
        if normalized
            .split('/')
            .any(|segment| segment == "..")
        {
            return Err(StorageError::InvalidPath(key.to_string()).into());
        }
        Ok(self.base_path.join(normalized))
    }

    fn partial_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Backend(format!("Failed to create directories: {}", e))
            })?;
        }

        let partial = Self::partial_path(&path);
        let mut file = fs::File::create(&partial).await.map_err(|e| {
            StorageError::Backend(format!(
                "Failed to create file {}: {}",
                partial.display(),
                e
            ))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::Backend(format!(
                "Failed to write to file {}: {}",
                partial.display(),
                e
            ))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::Backend(format!("Failed to sync file {}: {}", partial.display(), e))
        })?;
        drop(file);

        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(StorageError::Backend(format!(
                "Failed to move {} into place: {}",
                path.display(),
                e
            ))
            .into());
        }

        if let Some(parent) = path.parent() {
            sync_dir(parent).await?;
        }

        debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        self.base_path
            .join(key.trim_start_matches('/'))
            .display()
            .to_string()
    }
}

/// Flush a directory's entries to disk
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir).await.map_err(|e| {
        StorageError::Backend(format!("Failed to open directory {}: {}", dir.display(), e))
    })?;
    handle.sync_all().await.map_err(|e| {
        StorageError::Backend(format!("Failed to sync directory {}: {}", dir.display(), e))
    })?;
    Ok(())
}

// No directory handle to sync on this platform
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
