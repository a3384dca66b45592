//! Destinations for sealed archive units.
//!
//! - **Filesystem**: the output directory, written atomically and synced
//! - **S3**: optional best-effort mirror of every sealed unit
//! - **Memory**: in-process map (for testing)

mod backend;
mod config;
mod filesystem;
mod memory;
mod s3;

pub use backend::StorageBackend;
pub use config::StorageBackendConfig;
pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;
pub use s3::{S3Mirror, S3Target};

use crate::Result;
use std::sync::Arc;

/// Create a storage backend from configuration.
///
/// Filesystem backends create their base directory when it is missing.
pub fn create_backend(config: &StorageBackendConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageBackendConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemBackend::create(path.clone())?))
        }
        StorageBackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        StorageBackendConfig::S3(target) => Ok(Arc::new(S3Mirror::connect(target.clone())?)),
    }
}
