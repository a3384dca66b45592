//! Error types for the RabbitMQ backup core library.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the RabbitMQ backup library.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A sealed archive unit could not be persisted
    #[error("Failed to persist archive {key}: {message}")]
    Persist { key: String, message: String },

    /// Malformed archive container
    #[error("Failed to decode archive {source_name}: {message}")]
    Decode {
        source_name: String,
        message: String,
    },

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker-specific errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokerError {
    /// Connection could not be established
    #[error("Failed to connect to broker {uri}: {message}")]
    ConnectionFailed { uri: String, message: String },

    /// Connection was lost after it was established
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Subscription or publish setup rejected by the broker
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Acknowledgement rejected by the broker
    #[error("Failed to acknowledge delivery tag {tag}: {message}")]
    Ack { tag: u64, message: String },

    /// Publish rejected by the broker
    #[error("Failed to publish to {exchange} with routing key {routing_key:?}: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl Error {
    /// Build a decode error for the named archive source
    pub fn decode(source_name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Decode {
            source_name: source_name.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error came from the broker connection itself
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Broker(BrokerError::ConnectionFailed { .. })
                | Error::Broker(BrokerError::ConnectionClosed(_))
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
