//! In-memory message representation shared by every pipeline stage.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Routing key value meaning "keep the routing key stored with the message".
pub const WILDCARD_ROUTING_KEY: &str = "#";

/// Typed header value.
///
/// Only these four kinds survive a trip through an archive; the broker
/// adapters drop every other field kind when building a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl HeaderValue {
    /// Kind tag used in archive metadata keys
    pub fn kind(&self) -> HeaderKind {
        match self {
            HeaderValue::String(_) => HeaderKind::String,
            HeaderValue::Int(_) => HeaderKind::Int,
            HeaderValue::Float(_) => HeaderKind::Float,
            HeaderValue::Bool(_) => HeaderKind::Bool,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::String(s) => f.write_str(s),
            HeaderValue::Int(i) => write!(f, "{}", i),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Header value kinds, as spelled in archive metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    String,
    Int,
    Float,
    Bool,
}

impl HeaderKind {
    pub fn tag(self) -> &'static str {
        match self {
            HeaderKind::String => "string",
            HeaderKind::Int => "int",
            HeaderKind::Float => "float",
            HeaderKind::Bool => "bool",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(HeaderKind::String),
            "int" => Some(HeaderKind::Int),
            "float" => Some(HeaderKind::Float),
            "bool" => Some(HeaderKind::Bool),
            _ => None,
        }
    }
}

/// Message headers keyed by name
pub type Headers = BTreeMap<String, HeaderValue>;

/// A message moving between the broker and an archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Opaque payload
    pub body: Bytes,
    /// Broker-side dispatch key; empty means "no key"
    pub routing_key: String,
    /// Typed headers
    pub headers: Headers,
    /// Broker delivery tag, only set for messages consumed from a broker
    pub delivery_tag: Option<u64>,
}

impl Message {
    /// Create a message with no headers and no delivery tag
    pub fn new(body: impl Into<Bytes>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            headers: Headers::new(),
            delivery_tag: None,
        }
    }

    /// Add a header, builder style
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a broker delivery tag
    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = Some(tag);
        self
    }
}

/// Instruction to acknowledge broker deliveries after a unit was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRequest {
    /// Highest delivery tag covered by the sealed unit
    pub tag: u64,
    /// Acknowledge every lower outstanding tag as well
    pub cumulative: bool,
}

impl AckRequest {
    pub fn cumulative(tag: u64) -> Self {
        Self {
            tag,
            cumulative: true,
        }
    }

    pub fn single(tag: u64) -> Self {
        Self {
            tag,
            cumulative: false,
        }
    }
}

/// Routing key policy applied when publishing restored messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoutingOverride {
    /// Publish with the routing key stored in each message
    #[default]
    Keep,
    /// Publish every message with this routing key
    Fixed(String),
}

impl RoutingOverride {
    /// Interpret a routing key flag: `#` or an empty value keeps the stored key.
    pub fn from_flag(value: &str) -> Self {
        if value.is_empty() || value == WILDCARD_ROUTING_KEY {
            RoutingOverride::Keep
        } else {
            RoutingOverride::Fixed(value.to_string())
        }
    }

    /// Routing key to publish `message` with
    pub fn resolve<'a>(&'a self, message: &'a Message) -> &'a str {
        match self {
            RoutingOverride::Keep => &message.routing_key,
            RoutingOverride::Fixed(key) => key,
        }
    }
}
