//! In-memory storage backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::StorageBackend;
use crate::error::StorageError;
use crate::Result;

/// Units kept in process memory, keyed by storage key.
///
/// Nothing persists between runs. Writes can be made to fail on demand,
/// which lets tests observe what happens when a unit cannot be persisted.
#[derive(Default)]
pub struct MemoryBackend {
    units: Mutex<BTreeMap<String, Bytes>>,
    fail_puts: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (or succeed again)
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.units.lock().keys().cloned().collect()
    }

    /// Bytes stored under `key`
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.units.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.units.lock().contains_key(key)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "Memory PUT failed: writes disabled for {}",
                key
            ))
            .into());
        }

        self.units.lock().insert(key.to_string(), data);
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("memory://{}", key)
    }
}
