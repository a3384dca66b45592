//! Storage configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use super::s3::S3Target;
use crate::{Error, Result};

/// Where sealed archive units are written.
///
/// Tagged by `backend:` in YAML:
///
/// ```yaml
/// backend: filesystem
/// path: /var/backups/events
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    /// Output directory, created when missing
    Filesystem { path: PathBuf },

    /// Process memory (for testing)
    Memory,

    /// S3 bucket, used as the upload mirror
    S3(S3Target),
}

impl StorageBackendConfig {
    /// Parse `file:///dir`, `memory://` or `s3://bucket/prefix?region=..`
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed =
            Url::parse(url).map_err(|e| Error::Config(format!("Invalid storage URL {}: {}", url, e)))?;

        match parsed.scheme() {
            "file" => Ok(Self::Filesystem {
                path: PathBuf::from(parsed.path()),
            }),
            "memory" => Ok(Self::Memory),
            "s3" | "s3a" => Ok(Self::S3(S3Target::from_url(&parsed)?)),
            scheme => Err(Error::Config(format!("Unknown storage scheme: {}", scheme))),
        }
    }
}
