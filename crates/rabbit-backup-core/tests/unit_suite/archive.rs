//! Archive writer and reader tests.

use std::sync::Arc;
use tokio::sync::mpsc;

use rabbit_backup_core::archive::parse_unit_key;
use rabbit_backup_core::storage::MemoryBackend;
use rabbit_backup_core::{
    AckRequest, ArchiveReader, ArchiveWriter, ArchiveWriterConfig, CompressionType, Message,
    PerformanceMetrics, SealedUnit,
};

use super::helpers::{assert_same_content, test_message};

// ============================================================================
// Helpers
// ============================================================================

/// Push `count` tagged test messages through a writer, returning the sealed
/// units and every ack request it emitted
async fn write_messages(
    count: usize,
    config: ArchiveWriterConfig,
    storage: Arc<MemoryBackend>,
) -> (Vec<SealedUnit>, Vec<AckRequest>) {
    let (ack_tx, mut ack_rx) = mpsc::channel(count + 1);
    let mut writer = ArchiveWriter::new(
        config,
        storage,
        ack_tx,
        Arc::new(PerformanceMetrics::new()),
    )
    .unwrap();

    let mut units = Vec::new();
    for i in 0..count {
        let message = test_message(i).with_delivery_tag(i as u64 + 1);
        if let Some(unit) = writer.accept(message).await.unwrap() {
            units.push(unit);
        }
    }
    units.extend(writer.finish().await.unwrap());

    let mut acks = Vec::new();
    while let Some(ack) = ack_rx.recv().await {
        acks.push(ack);
    }
    (units, acks)
}

fn batch(batch_size: usize) -> ArchiveWriterConfig {
    ArchiveWriterConfig {
        batch_size,
        ..Default::default()
    }
}

fn read_all(unit: &SealedUnit) -> Vec<Message> {
    read_bytes(unit.data.clone(), &unit.key)
}

fn read_bytes(data: bytes::Bytes, key: &str) -> Vec<Message> {
    let mut reader = ArchiveReader::from_bytes(data, key).unwrap();
    let mut messages = Vec::new();
    for message in reader.messages().unwrap() {
        messages.push(message.unwrap());
    }
    messages
}

// ============================================================================
// Batch boundaries
// ============================================================================

#[tokio::test]
async fn test_2500_messages_make_three_units() {
    let storage = Arc::new(MemoryBackend::new());
    let (units, acks) = write_messages(2500, batch(1000), storage.clone()).await;

    let counts: Vec<usize> = units.iter().map(|u| u.message_count).collect();
    assert_eq!(counts, vec![1000, 1000, 500]);

    assert_eq!(
        acks,
        vec![
            AckRequest::cumulative(1000),
            AckRequest::cumulative(2000),
            AckRequest::cumulative(2500),
        ]
    );
    assert!(acks.windows(2).all(|w| w[0].tag < w[1].tag));

    assert_eq!(
        storage.keys(),
        vec![
            "1_messages_1000.tgz",
            "2_messages_1000.tgz",
            "3_messages_500.tgz"
        ]
    );
}

#[tokio::test]
async fn test_unit_count_is_ceiling_of_messages_over_batch() {
    for (count, batch_size) in [(1, 1), (9, 3), (10, 3), (7, 100)] {
        let storage = Arc::new(MemoryBackend::new());
        let (units, acks) = write_messages(count, batch(batch_size), storage).await;

        let expected = count.div_ceil(batch_size);
        assert_eq!(units.len(), expected, "{} messages / {}", count, batch_size);
        assert_eq!(acks.len(), expected);
        assert!(acks.iter().all(|a| a.cumulative));

        for (unit, ack) in units.iter().zip(&acks) {
            assert_eq!(unit.max_delivery_tag, Some(ack.tag));
            assert_eq!(parse_unit_key(&unit.key), Some((unit.index, unit.message_count)));
        }
        assert!(units[..units.len() - 1]
            .iter()
            .all(|u| u.message_count == batch_size));
    }
}

#[tokio::test]
async fn test_no_messages_no_units() {
    let storage = Arc::new(MemoryBackend::new());
    let (units, acks) = write_messages(0, batch(10), storage.clone()).await;

    assert!(units.is_empty());
    assert!(acks.is_empty());
    assert!(storage.keys().is_empty());
}

// ============================================================================
// Reading units back
// ============================================================================

#[tokio::test]
async fn test_unit_preserves_order_and_metadata() {
    let storage = Arc::new(MemoryBackend::new());
    let (units, _) = write_messages(25, batch(10), storage).await;

    let mut next = 0;
    for unit in &units {
        for message in read_all(unit) {
            assert_same_content(&message, &test_message(next));
            assert_eq!(message.delivery_tag, None);
            next += 1;
        }
    }
    assert_eq!(next, 25);
}

#[tokio::test]
async fn test_unpacking_twice_is_identical() {
    let storage = Arc::new(MemoryBackend::new());
    let (units, _) = write_messages(12, batch(12), storage.clone()).await;
    let key = &units[0].key;

    let stored = storage.get(key).unwrap();
    let first = read_bytes(stored.clone(), key);
    let second = read_bytes(stored, key);

    assert_eq!(first.len(), 12);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_header_names_with_equals_sign_survive_sealing() {
    let storage = Arc::new(MemoryBackend::new());
    let (ack_tx, _ack_rx) = mpsc::channel(1);
    let mut writer = ArchiveWriter::new(
        batch(1),
        storage,
        ack_tx,
        Arc::new(PerformanceMetrics::new()),
    )
    .unwrap();

    let message = Message::new("{}", "rk")
        .with_header("a=b", "v")
        .with_header("x==", 7i64)
        .with_header("50%", true);
    let unit = writer.accept(message.clone()).await.unwrap().unwrap();

    let read = read_all(&unit);
    assert_eq!(read, vec![message]);
}

#[tokio::test]
async fn test_every_codec_reads_back() {
    for compression in [
        CompressionType::Gzip,
        CompressionType::Zstd,
        CompressionType::Lz4,
        CompressionType::None,
    ] {
        let storage = Arc::new(MemoryBackend::new());
        let config = ArchiveWriterConfig {
            batch_size: 5,
            compression,
            compression_level: rabbit_backup_core::compression::default_level(compression),
        };
        let (units, _) = write_messages(5, config, storage).await;

        assert!(units[0]
            .key
            .ends_with(rabbit_backup_core::compression::extension(compression)));
        let messages = read_all(&units[0]);
        assert_eq!(messages.len(), 5);
        assert_same_content(&messages[4], &test_message(4));
    }
}
