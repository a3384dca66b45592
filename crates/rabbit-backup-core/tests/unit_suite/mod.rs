//! Pipeline tests for rabbit-backup-core.

pub mod archive;
pub mod backup;
pub mod codec;
pub mod helpers;
pub mod restore;
