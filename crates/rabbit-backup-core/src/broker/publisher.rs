//! Broker publisher: restored messages out to an exchange.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::PublishChannel;
use crate::flow::InFlight;
use crate::message::{Message, RoutingOverride};
use crate::metrics::PerformanceMetrics;
use crate::Result;

/// Publishes every message from a queue, applying a routing override.
///
/// Each confirmed publish completes one [`InFlight`] slot. The first failed
/// publish stops the publisher with that error.
pub struct BrokerPublisher {
    channel: Box<dyn PublishChannel>,
    routing: RoutingOverride,
    in_flight: InFlight,
    metrics: Arc<PerformanceMetrics>,
}

impl BrokerPublisher {
    pub fn new(
        channel: Box<dyn PublishChannel>,
        routing: RoutingOverride,
        in_flight: InFlight,
        metrics: Arc<PerformanceMetrics>,
    ) -> Self {
        Self {
            channel,
            routing,
            in_flight,
            metrics,
        }
    }

    /// Publish one message with the effective routing key
    pub async fn publish(&self, message: &Message) -> Result<()> {
        let start = Instant::now();
        let routing_key = self.routing.resolve(message);

        self.channel.publish(routing_key, message).await?;

        self.metrics.record_publish(start.elapsed());
        debug!("Published {} bytes with routing key {:?}", message.body.len(), routing_key);
        Ok(())
    }

    /// Publish until `messages` is closed, then close the channel.
    /// Returns the number of messages published.
    pub async fn publish_all(self, mut messages: mpsc::Receiver<Message>) -> Result<u64> {
        let mut published = 0u64;

        while let Some(message) = messages.recv().await {
            if let Err(e) = self.publish(&message).await {
                error!("Publish failed after {} messages: {}", published, e);
                self.metrics.record_error();
                messages.close();
                let _ = self.channel.close().await;
                return Err(e);
            }
            self.in_flight.complete();
            published += 1;
        }

        self.channel.close().await?;
        info!("Published {} messages", published);
        Ok(published)
    }
}
