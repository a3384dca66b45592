//! Mapping between messages and flat archive metadata.
//!
//! Each archive entry carries a string-to-string metadata map:
//!
//! ```text
//! amqp.routingKey              -> "orders.created"
//! amqp.Headers.int.retries     -> "3"
//! amqp.Headers.string.source   -> "billing"
//! ```
//!
//! Header names may contain the delimiter; only the first three delimiters
//! are significant when decoding. Keys end up in PAX `key=value` records,
//! so `=` in a header name is stored as `%3D` and `%` as `%25`.

use bytes::Bytes;
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::warn;

use crate::message::{HeaderKind, HeaderValue, Headers, Message};

/// Namespace prefix shared by every metadata key
pub const NAMESPACE: &str = "amqp";

/// Segment between the namespace and the header kind
pub const HEADERS_SEGMENT: &str = "Headers";

/// Separator between key segments
pub const DELIMITER: char = '.';

/// Metadata key holding the routing key
pub const ROUTING_KEY: &str = "amqp.routingKey";

/// Flat metadata attached to one archive entry
pub type MetadataEntry = BTreeMap<String, String>;

/// Metadata key for a header of the given kind and name
pub fn header_key(kind: HeaderKind, name: &str) -> String {
    format!(
        "{ns}{d}{hs}{d}{kind}{d}{name}",
        ns = NAMESPACE,
        hs = HEADERS_SEGMENT,
        kind = kind.tag(),
        name = escape_name(name),
        d = DELIMITER,
    )
}

fn escape_name(name: &str) -> Cow<'_, str> {
    if !name.contains(['%', '=']) {
        return Cow::Borrowed(name);
    }
    Cow::Owned(name.replace('%', "%25").replace('=', "%3D"))
}

fn unescape_name(name: &str) -> Cow<'_, str> {
    if !name.contains('%') {
        return Cow::Borrowed(name);
    }

    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("%3D") {
            out.push('=');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%25") {
            out.push('%');
            rest = after;
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Encode a message's routing key and headers into archive metadata.
pub fn encode(message: &Message) -> MetadataEntry {
    let mut metadata = MetadataEntry::new();
    metadata.insert(ROUTING_KEY.to_string(), message.routing_key.clone());

    for (name, value) in &message.headers {
        metadata.insert(header_key(value.kind(), name), value.to_string());
    }

    metadata
}

/// Rebuild a message from an entry body and its metadata.
///
/// Unrecognized keys are ignored. A header whose value does not parse for
/// its declared kind is dropped without failing the message.
pub fn decode(body: impl Into<Bytes>, metadata: &MetadataEntry) -> Message {
    let mut routing_key = String::new();
    let mut headers = Headers::new();

    for (key, raw) in metadata {
        if key == ROUTING_KEY {
            routing_key = raw.clone();
            continue;
        }

        let Some((kind, name)) = parse_header_key(key) else {
            continue;
        };

        match parse_value(kind, raw) {
            Some(value) => {
                headers.insert(name.into_owned(), value);
            }
            None => {
                warn!(
                    "Dropping header {:?}: value {:?} is not a valid {}",
                    name,
                    raw,
                    kind.tag()
                );
            }
        }
    }

    Message {
        body: body.into(),
        routing_key,
        headers,
        delivery_tag: None,
    }
}

/// Split a header metadata key into its kind and header name
fn parse_header_key(key: &str) -> Option<(HeaderKind, Cow<'_, str>)> {
    let mut parts = key.splitn(4, DELIMITER);
    if parts.next()? != NAMESPACE || parts.next()? != HEADERS_SEGMENT {
        return None;
    }
    let kind = HeaderKind::from_tag(parts.next()?)?;
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }
    Some((kind, unescape_name(name)))
}

fn parse_value(kind: HeaderKind, raw: &str) -> Option<HeaderValue> {
    match kind {
        HeaderKind::String => Some(HeaderValue::String(raw.to_string())),
        HeaderKind::Int => raw.parse::<i64>().ok().map(HeaderValue::Int),
        HeaderKind::Float => raw.parse::<f64>().ok().map(HeaderValue::Float),
        HeaderKind::Bool => parse_bool(raw).map(HeaderValue::Bool),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
