//! Storage backend trait definition.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Destination sealed archive units are written to
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Durably store a sealed unit under `key`. Once this returns, the unit
    /// survives a crash; readers never observe a partially written unit.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Human-readable final location of a key (path or URL)
    fn location(&self, key: &str) -> String;
}
