//! Broker adapters.
//!
//! The pipeline talks to a broker through three seams:
//!
//! - [`Subscription`]: ordered deliveries from one queue, never auto-acked
//! - [`Acknowledger`]: acknowledgements on the subscription's channel
//! - [`PublishChannel`]: confirmed, persistent publishes to one exchange
//!
//! [`AmqpBroker`] implements them over RabbitMQ with lapin, [`MemoryBroker`]
//! in process for tests. Every subscription and publish channel owns its
//! own connection; nothing is shared between pipeline stages.

mod amqp;
mod consumer;
mod memory;
mod publisher;

pub use amqp::AmqpBroker;
pub use consumer::{apply_ack, BrokerConsumer};
pub use memory::{MemoryBroker, Published};
pub use publisher::BrokerPublisher;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::message::Message;
use crate::Result;

/// Content type set on every restored message
pub const CONTENT_TYPE: &str = "application/json";

/// Content encoding set on every restored message
pub const CONTENT_ENCODING: &str = "UTF-8";

/// Persistent delivery mode
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Subscription parameters
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Queue to consume from; must already exist
    pub queue: String,
    /// Exchange to bind the queue to, if any
    pub exchange: Option<String>,
    /// Binding key used with `exchange`
    pub routing_key: String,
    pub consumer_tag: String,
    /// Maximum unacknowledged deliveries outstanding to this subscriber,
    /// 0 for no limit
    pub prefetch: u16,
}

impl SubscribeOptions {
    /// Options for a backup run. The broker-side prefetch is raised to the
    /// batch size so a whole unit can be outstanding before it is acked.
    pub fn for_backup(config: &BrokerConfig, batch_size: usize) -> Self {
        let prefetch = match u16::try_from(batch_size) {
            Ok(batch) => config.prefetch.max(batch),
            Err(_) => 0,
        };
        Self {
            queue: config.queue.clone(),
            exchange: Some(config.exchange.clone()).filter(|e| !e.is_empty()),
            routing_key: config.routing_key.clone(),
            consumer_tag: config.consumer_tag.clone(),
            prefetch,
        }
    }
}

/// Entry point to a broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a subscription on its own connection
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<Box<dyn Subscription>>;

    /// Open a publish channel to `exchange` on its own connection
    async fn publish_channel(&self, exchange: &str) -> Result<Box<dyn PublishChannel>>;
}

/// Ordered deliveries from one queue
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, tagged with its delivery tag; `None` once the
    /// subscription has ended
    async fn next_delivery(&mut self) -> Option<Result<Message>>;

    /// Handle acknowledging deliveries of this subscription
    fn acknowledger(&self) -> Arc<dyn Acknowledger>;

    /// Stop further deliveries; unacknowledged ones stay unacknowledged
    async fn cancel(&mut self) -> Result<()>;

    /// Close the channel and connection
    async fn close(&mut self) -> Result<()>;
}

/// Acknowledges deliveries on the channel they arrived on
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge `tag`, and every lower outstanding tag when `multiple`
    async fn ack(&self, tag: u64, multiple: bool) -> Result<()>;
}

/// Publishes to one exchange
#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Publish a message persistently; returns once the broker confirmed it
    async fn publish(&self, routing_key: &str, message: &Message) -> Result<()>;

    /// Close the channel and connection
    async fn close(&self) -> Result<()>;
}
