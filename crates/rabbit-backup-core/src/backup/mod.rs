//! Backup: broker queue to archive units.

pub mod engine;

pub use engine::{BackupEngine, BackupReport, UnitReport};
