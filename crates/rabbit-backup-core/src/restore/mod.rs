//! Restore: archive units back into a broker exchange.

pub mod engine;
pub mod input;

pub use engine::{RestoreEngine, RestoreReport};
pub use input::ArchiveInput;
