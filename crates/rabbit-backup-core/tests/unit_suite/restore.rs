//! Restore pipeline tests.
//!
//! Tests for the archive -> broker path including:
//! - Ordering across units and within a unit
//! - Routing key override
//! - Fatal publish and decode failures

use std::fs::OpenOptions;
use std::sync::Arc;

use rabbit_backup_core::{Error, MemoryBroker, Message, RestoreEngine};

use super::helpers::{
    assert_same_content, backup_to_dir, restore_config, test_message, EXCHANGE, QUEUE,
};

fn target_broker() -> MemoryBroker {
    MemoryBroker::new(QUEUE).with_exchange(EXCHANGE)
}

fn published_messages(broker: &MemoryBroker) -> Vec<Message> {
    broker.published().into_iter().map(|p| p.message).collect()
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_directory_restore_preserves_order() {
    let dir = tempfile::TempDir::new().unwrap();
    // 13 units, so unit 10 must not sort before unit 2
    backup_to_dir(dir.path(), 25, 2).await;

    let broker = target_broker();
    let engine =
        RestoreEngine::with_broker(restore_config(dir.path(), "#"), Arc::new(broker.clone()))
            .unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.units_restored, 13);
    assert_eq!(report.messages_published, 25);
    assert!(!report.interrupted);

    let published = broker.published();
    assert_eq!(published.len(), 25);
    for (i, p) in published.iter().enumerate() {
        assert_eq!(p.exchange, EXCHANGE);
        assert_eq!(p.routing_key, test_message(i).routing_key);
        assert_same_content(&p.message, &test_message(i));
    }
    assert!(broker.is_closed());
}

#[tokio::test]
async fn test_single_file_restore() {
    let dir = tempfile::TempDir::new().unwrap();
    backup_to_dir(dir.path(), 7, 5).await;

    let broker = target_broker();
    let engine = RestoreEngine::with_broker(
        restore_config(&dir.path().join("2_messages_2.tgz"), "#"),
        Arc::new(broker.clone()),
    )
    .unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.units_restored, 1);
    let published = published_messages(&broker);
    assert_eq!(published.len(), 2);
    assert_same_content(&published[0], &test_message(5));
    assert_same_content(&published[1], &test_message(6));
}

#[tokio::test]
async fn test_restoring_twice_publishes_identical_sequences() {
    let dir = tempfile::TempDir::new().unwrap();
    backup_to_dir(dir.path(), 9, 4).await;

    let broker = target_broker();
    for _ in 0..2 {
        let engine =
            RestoreEngine::with_broker(restore_config(dir.path(), "#"), Arc::new(broker.clone()))
                .unwrap();
        engine.run().await.unwrap();
    }

    let published = published_messages(&broker);
    assert_eq!(published.len(), 18);
    assert_eq!(published[..9], published[9..]);
}

// ============================================================================
// Routing override
// ============================================================================

#[tokio::test]
async fn test_fixed_routing_key_replaces_stored_keys() {
    let dir = tempfile::TempDir::new().unwrap();
    backup_to_dir(dir.path(), 6, 10).await;

    let broker = target_broker();
    let engine =
        RestoreEngine::with_broker(restore_config(dir.path(), "replay.all"), Arc::new(broker.clone()))
            .unwrap();
    engine.run().await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 6);
    assert!(published.iter().all(|p| p.routing_key == "replay.all"));
    // The stored key still travels with the message itself
    assert_eq!(published[1].message.routing_key, "orders.1");
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_publish_failure_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    backup_to_dir(dir.path(), 20, 5).await;

    let broker = target_broker();
    broker.fail_publish_after(7);
    let engine =
        RestoreEngine::with_broker(restore_config(dir.path(), "#"), Arc::new(broker.clone()))
            .unwrap();

    let result = engine.run().await;
    assert!(matches!(result, Err(Error::Broker(_))));
    assert_eq!(broker.published().len(), 7);
    assert!(broker.is_closed());
}

#[tokio::test]
async fn test_truncated_unit_is_a_decode_error() {
    let dir = tempfile::TempDir::new().unwrap();
    backup_to_dir(dir.path(), 50, 50).await;

    let path = dir.path().join("1_messages_50.tgz");
    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len / 2)
        .unwrap();

    let broker = target_broker();
    let engine =
        RestoreEngine::with_broker(restore_config(dir.path(), "#"), Arc::new(broker.clone()))
            .unwrap();

    let result = engine.run().await;
    assert!(matches!(result, Err(Error::Decode { .. })));
    // Whatever was read before the damage is still published, in order
    let published = published_messages(&broker);
    assert!(published.len() < 50);
    for (i, message) in published.iter().enumerate() {
        assert_same_content(message, &test_message(i));
    }
}

#[tokio::test]
async fn test_missing_input_is_a_config_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = RestoreEngine::with_broker(
        restore_config(&dir.path().join("nowhere"), "#"),
        Arc::new(target_broker()),
    )
    .unwrap();

    assert!(matches!(engine.run().await, Err(Error::Config(_))));
}
