//! RabbitMQ Backup Core Library
//!
//! This crate moves messages between RabbitMQ queues and compressed archive
//! units, in both directions:
//!
//! - **Backup**: a queue is drained into tar archives of `batch_size`
//!   messages; each unit is acknowledged on the broker only after it was
//!   persisted.
//! - **Restore**: archive units are replayed into an exchange with
//!   confirmed, persistent publishes.

pub mod archive;
pub mod backup;
pub mod broker;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod flow;
pub mod message;
pub mod metrics;
pub mod restore;
pub mod storage;

pub use archive::{ArchiveReader, ArchiveWriter, ArchiveWriterConfig, SealedUnit};
pub use backup::{BackupEngine, BackupReport};
pub use broker::{AmqpBroker, Broker, BrokerConsumer, BrokerPublisher, MemoryBroker};
pub use config::{BackupOptions, BrokerConfig, CompressionType, Config, Mode, RestoreOptions};
pub use error::{BrokerError, Error, Result, StorageError};
pub use flow::InFlight;
pub use message::{AckRequest, HeaderValue, Headers, Message, RoutingOverride};
pub use metrics::{MetricsReport, PerformanceMetrics};
pub use restore::{ArchiveInput, RestoreEngine, RestoreReport};
