//! Message and header codec tests.

use rabbit_backup_core::codec::{self, MetadataEntry, ROUTING_KEY};
use rabbit_backup_core::{HeaderValue, Message};

use super::helpers::{assert_same_content, test_message};

#[test]
fn test_int_header_scenario() {
    let message = Message::new("body", "orders.created").with_header("retries", 3i64);

    let metadata = codec::encode(&message);
    assert_eq!(metadata["amqp.Headers.int.retries"], "3");
    assert_eq!(metadata[ROUTING_KEY], "orders.created");

    let decoded = codec::decode("body", &metadata);
    assert_eq!(decoded.headers["retries"], HeaderValue::Int(3));
}

#[test]
fn test_every_kind_survives() {
    for i in [0, 1, 7, 1001] {
        let message = test_message(i);
        let decoded = codec::decode(message.body.clone(), &codec::encode(&message));
        assert_same_content(&decoded, &message);
        assert_eq!(decoded.delivery_tag, None);
    }
}

#[test]
fn test_empty_routing_key_and_no_headers() {
    let message = Message::new("", "");
    let metadata = codec::encode(&message);
    assert_eq!(metadata.len(), 1);

    let decoded = codec::decode("", &metadata);
    assert_eq!(decoded.routing_key, "");
    assert!(decoded.headers.is_empty());
}

#[test]
fn test_header_names_may_contain_delimiter() {
    let message = Message::new("x", "rk").with_header("trace.span.id", "abc");
    let metadata = codec::encode(&message);
    assert!(metadata.contains_key("amqp.Headers.string.trace.span.id"));

    let decoded = codec::decode("x", &metadata);
    assert_eq!(
        decoded.headers["trace.span.id"],
        HeaderValue::String("abc".to_string())
    );
}

#[test]
fn test_malformed_header_is_dropped_not_fatal() {
    let mut metadata = MetadataEntry::new();
    metadata.insert(ROUTING_KEY.to_string(), "rk".to_string());
    metadata.insert("amqp.Headers.int.retries".to_string(), "three".to_string());
    metadata.insert("amqp.Headers.bool.flag".to_string(), "yes".to_string());
    metadata.insert("amqp.Headers.bool.replayed".to_string(), "T".to_string());
    metadata.insert("amqp.Headers.float.ratio".to_string(), "0.25".to_string());

    let decoded = codec::decode("body", &metadata);
    assert_eq!(decoded.routing_key, "rk");
    assert_eq!(decoded.headers.len(), 2);
    assert_eq!(decoded.headers["replayed"], HeaderValue::Bool(true));
    assert_eq!(decoded.headers["ratio"], HeaderValue::Float(0.25));
}

#[test]
fn test_unrecognized_keys_are_ignored() {
    let mut metadata = MetadataEntry::new();
    metadata.insert("user.comment".to_string(), "hello".to_string());
    metadata.insert("amqp.Headers.date.when".to_string(), "2024".to_string());
    metadata.insert("amqp.Other.int.x".to_string(), "1".to_string());

    let decoded = codec::decode("body", &metadata);
    assert_eq!(decoded.routing_key, "");
    assert!(decoded.headers.is_empty());
}
