//! Test helper utilities.
//!
//! Message generation, configuration builders and pipeline drivers shared
//! across the suite.

use std::path::Path;
use std::sync::Arc;

use rabbit_backup_core::storage::{FilesystemBackend, StorageBackend};
use rabbit_backup_core::{BackupEngine, BackupReport, Config, MemoryBroker, Message};

/// Queue every test broker serves
pub const QUEUE: &str = "events";

/// Exchange every restore publishes to
pub const EXCHANGE: &str = "restored";

/// Generate a message with one header of each kind
pub fn test_message(i: usize) -> Message {
    Message::new(format!("{{\"id\":{}}}", i), format!("orders.{}", i % 3))
        .with_header("source", "billing")
        .with_header("sequence", i as i64)
        .with_header("weight", i as f64 / 4.0)
        .with_header("replayed", i % 2 == 0)
}

/// Broker holding `count` test messages
pub fn seeded_broker(count: usize) -> MemoryBroker {
    let broker = MemoryBroker::new(QUEUE).with_exchange(EXCHANGE);
    for i in 0..count {
        broker.enqueue(test_message(i));
    }
    broker
}

/// Backup configuration with the given unit size and prefetch
pub fn backup_config(batch_size: usize, prefetch: u16) -> Config {
    Config::from_yaml(&format!(
        "mode: backup\nbroker:\n  queue: {}\n  prefetch: {}\nbackup:\n  batch_size: {}\n",
        QUEUE, prefetch, batch_size
    ))
    .unwrap()
}

/// Restore configuration reading `input`
pub fn restore_config(input: &Path, routing_key: &str) -> Config {
    Config::from_yaml(&format!(
        "mode: restore\nbroker:\n  exchange: {}\n  routing_key: \"{}\"\nrestore:\n  input: {}\n",
        EXCHANGE,
        routing_key,
        input.display()
    ))
    .unwrap()
}

/// Run a backup of `broker` into `storage`
pub async fn run_backup(
    broker: &MemoryBroker,
    storage: Arc<dyn StorageBackend>,
    batch_size: usize,
) -> rabbit_backup_core::Result<BackupReport> {
    let engine = BackupEngine::with_broker(
        backup_config(batch_size, 10),
        Arc::new(broker.clone()),
        storage,
    )?;
    engine.run().await
}

/// Back up `count` test messages as unit files under `dir`
pub async fn backup_to_dir(dir: &Path, count: usize, batch_size: usize) -> BackupReport {
    let broker = seeded_broker(count);
    let storage = Arc::new(FilesystemBackend::create(dir.to_path_buf()).unwrap());
    run_backup(&broker, storage, batch_size).await.unwrap()
}

/// Compare everything a message carries except its delivery tag
pub fn assert_same_content(actual: &Message, expected: &Message) {
    assert_eq!(actual.body, expected.body);
    assert_eq!(actual.routing_key, expected.routing_key);
    assert_eq!(actual.headers, expected.headers);
}
