//! Backup pipeline tests.
//!
//! Tests for the broker -> archive path including:
//! - Unit boundaries and acknowledgement timing
//! - Crash safety when acknowledgements or persistence fail
//! - Operator shutdown
//! - Mirror uploads

use std::sync::Arc;
use std::time::Duration;

use rabbit_backup_core::storage::MemoryBackend;
use rabbit_backup_core::{AckRequest, ArchiveReader, BackupEngine, Error};

use super::helpers::{backup_config, backup_to_dir, run_backup, seeded_broker, test_message};

// ============================================================================
// Unit boundaries
// ============================================================================

#[tokio::test]
async fn test_2500_messages_three_units_three_acks() {
    let broker = seeded_broker(2500);
    let storage = Arc::new(MemoryBackend::new());

    let report = run_backup(&broker, storage.clone(), 1000).await.unwrap();

    assert_eq!(report.messages_consumed, 2500);
    let counts: Vec<usize> = report.units.iter().map(|u| u.message_count).collect();
    assert_eq!(counts, vec![1000, 1000, 500]);

    assert_eq!(
        broker.acks(),
        vec![
            AckRequest::cumulative(1000),
            AckRequest::cumulative(2000),
            AckRequest::cumulative(2500),
        ]
    );
    assert_eq!(broker.ready(), 0);
    assert_eq!(broker.unacked(), 0);
    assert!(broker.is_closed());
    assert_eq!(storage.keys().len(), 3);
}

#[tokio::test]
async fn test_empty_queue_is_not_an_error() {
    let broker = seeded_broker(0);
    let storage = Arc::new(MemoryBackend::new());

    let report = run_backup(&broker, storage.clone(), 10).await.unwrap();

    assert_eq!(report.messages_consumed, 0);
    assert!(report.units.is_empty());
    assert!(broker.acks().is_empty());
    assert!(storage.keys().is_empty());
    assert!(broker.is_closed());
}

#[tokio::test]
async fn test_units_land_in_output_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let output = dir.path().join("archives");

    let report = backup_to_dir(&output, 7, 3).await;

    assert_eq!(report.messages_archived(), 7);
    let mut names: Vec<String> = std::fs::read_dir(&output)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["1_messages_3.tgz", "2_messages_3.tgz", "3_messages_1.tgz"]
    );

    let mut reader = ArchiveReader::open(&output.join("3_messages_1.tgz")).unwrap();
    let last = reader.messages().unwrap().next().unwrap().unwrap();
    assert_eq!(last.body, test_message(6).body);
}

// ============================================================================
// Crash safety
// ============================================================================

#[tokio::test]
async fn test_rejected_ack_leaves_persisted_unit_redeliverable() {
    let broker = seeded_broker(25);
    broker.set_fail_acks(true);
    let first_storage = Arc::new(MemoryBackend::new());

    let result = run_backup(&broker, first_storage.clone(), 10).await;
    assert!(matches!(result, Err(Error::Broker(_))));

    // The unit was persisted but never acknowledged
    assert_eq!(
        first_storage.keys(),
        vec!["1_messages_10.tgz"]
    );
    assert!(broker.acks().is_empty());
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.ready(), 25);

    // Reconnecting redelivers everything, duplicates included
    broker.set_fail_acks(false);
    let second_storage = Arc::new(MemoryBackend::new());
    let report = run_backup(&broker, second_storage, 10).await.unwrap();

    assert_eq!(report.messages_archived(), 25);
    assert_eq!(broker.ready(), 0);
    assert_eq!(broker.unacked(), 0);
}

#[tokio::test]
async fn test_persist_failure_stops_without_acks() {
    let broker = seeded_broker(25);
    let storage = Arc::new(MemoryBackend::new());
    storage.set_fail_puts(true);

    let result = run_backup(&broker, storage.clone(), 10).await;

    assert!(matches!(result, Err(Error::Persist { .. })));
    assert!(broker.acks().is_empty());
    assert!(storage.keys().is_empty());
    assert_eq!(broker.unacked(), 0);
    assert_eq!(broker.ready(), 25);
}

#[tokio::test]
async fn test_connection_loss_is_fatal() {
    let broker = seeded_broker(5);
    broker.set_keep_open(true);
    let storage = Arc::new(MemoryBackend::new());

    let engine = Arc::new(
        BackupEngine::with_broker(backup_config(10, 10), Arc::new(broker.clone()), storage.clone())
            .unwrap(),
    );
    let handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    wait_for(|| engine.metrics().report().messages_processed == 5).await;
    broker.drop_connections();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_connection_error());
    // The open unit is never sealed after a fatal error
    assert!(storage.keys().is_empty());
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_seals_and_acks_open_unit() {
    let broker = seeded_broker(15);
    broker.set_keep_open(true);
    let storage = Arc::new(MemoryBackend::new());

    let engine = Arc::new(
        BackupEngine::with_broker(backup_config(10, 10), Arc::new(broker.clone()), storage.clone())
            .unwrap(),
    );
    let handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    wait_for(|| engine.metrics().report().messages_processed == 15).await;
    engine.shutdown();

    let report = handle.await.unwrap().unwrap();
    let counts: Vec<usize> = report.units.iter().map(|u| u.message_count).collect();
    assert_eq!(counts, vec![10, 5]);
    assert_eq!(
        broker.acks(),
        vec![AckRequest::cumulative(10), AckRequest::cumulative(15)]
    );
    assert_eq!(broker.unacked(), 0);
    assert!(broker.is_closed());
}

// ============================================================================
// Mirror uploads
// ============================================================================

#[tokio::test]
async fn test_mirror_receives_every_unit() {
    let broker = seeded_broker(12);
    let storage = Arc::new(MemoryBackend::new());
    let mirror = Arc::new(MemoryBackend::new());

    let engine =
        BackupEngine::with_broker(backup_config(5, 10), Arc::new(broker.clone()), storage.clone())
            .unwrap()
            .with_mirror(mirror.clone());
    engine.run().await.unwrap();

    let stored = storage.keys();
    assert_eq!(stored.len(), 3);
    assert_eq!(mirror.keys(), stored);
}

#[tokio::test]
async fn test_mirror_failure_is_not_fatal() {
    let broker = seeded_broker(12);
    let storage = Arc::new(MemoryBackend::new());
    let mirror = Arc::new(MemoryBackend::new());
    mirror.set_fail_puts(true);

    let engine =
        BackupEngine::with_broker(backup_config(5, 10), Arc::new(broker.clone()), storage.clone())
            .unwrap()
            .with_mirror(mirror.clone());
    let report = engine.run().await.unwrap();

    assert_eq!(report.units.len(), 3);
    assert_eq!(broker.acks().len(), 3);
    assert!(mirror.keys().is_empty());
}

/// Poll `condition` until it holds, failing after a few seconds
async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

