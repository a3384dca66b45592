//! In-process broker for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{Acknowledger, Broker, PublishChannel, SubscribeOptions, Subscription};
use crate::error::BrokerError;
use crate::message::{AckRequest, Message};
use crate::Result;

/// A message accepted by a [`MemoryBroker`] publish channel
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

#[derive(Default)]
struct State {
    queue_name: String,
    exchanges: HashSet<String>,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    next_tag: u64,
    acks: Vec<AckRequest>,
    published: Vec<Published>,
    keep_open: bool,
    connection_lost: bool,
    fail_acks: bool,
    fail_publish_after: Option<usize>,
    open_channels: usize,
    closed_channels: usize,
}

struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

impl Inner {
    fn notify(&self) {
        self.changed.notify_waiters();
    }

    /// Return unacknowledged deliveries to the head of the queue, oldest first
    fn requeue_unacked(state: &mut State) {
        let unacked = std::mem::take(&mut state.unacked);
        for message in unacked.into_values().rev() {
            state.ready.push_front(message);
        }
    }
}

/// Single-queue broker living in process memory.
///
/// Mirrors the broker behaviour the pipeline relies on: delivery tags
/// increase per subscription, deliveries stop at the prefetch limit until
/// acks arrive, acking an unknown tag is a channel error, and closing a
/// subscription returns its unacknowledged deliveries to the queue.
///
/// Unless [`set_keep_open`] is enabled a subscription ends once the queue
/// is drained.
///
/// [`set_keep_open`]: MemoryBroker::set_keep_open
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create a broker holding one empty queue
    pub fn new(queue: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue_name: queue.to_string(),
                    next_tag: 1,
                    ..Default::default()
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Declare an exchange restored messages can be published to
    pub fn with_exchange(self, exchange: &str) -> Self {
        self.inner
            .state
            .lock()
            .exchanges
            .insert(exchange.to_string());
        self
    }

    /// Add a message to the queue
    pub fn enqueue(&self, message: Message) {
        self.inner.state.lock().ready.push_back(message);
        self.inner.notify();
    }

    /// Keep subscriptions waiting for new messages instead of ending when drained
    pub fn set_keep_open(&self, keep_open: bool) {
        self.inner.state.lock().keep_open = keep_open;
        self.inner.notify();
    }

    /// Reject every subsequent ack
    pub fn set_fail_acks(&self, fail: bool) {
        self.inner.state.lock().fail_acks = fail;
    }

    /// Reject publishes once `count` messages have been accepted
    pub fn fail_publish_after(&self, count: usize) {
        self.inner.state.lock().fail_publish_after = Some(count);
    }

    /// Simulate the broker closing every connection
    pub fn drop_connections(&self) {
        self.inner.state.lock().connection_lost = true;
        self.inner.notify();
    }

    /// Messages waiting in the queue
    pub fn ready(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Deliveries not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    /// Every ack received, in order
    pub fn acks(&self) -> Vec<AckRequest> {
        self.inner.state.lock().acks.clone()
    }

    /// Every message published, in order
    pub fn published(&self) -> Vec<Published> {
        self.inner.state.lock().published.clone()
    }

    /// Whether every channel opened so far has been closed
    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        state.open_channels > 0 && state.open_channels == state.closed_channels
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<Box<dyn Subscription>> {
        let mut state = self.inner.state.lock();
        if state.connection_lost {
            return Err(BrokerError::ConnectionFailed {
                uri: "memory://".to_string(),
                message: "connection refused".to_string(),
            }
            .into());
        }
        if options.queue != state.queue_name {
            return Err(BrokerError::Protocol(format!(
                "NOT_FOUND - no queue '{}'",
                options.queue
            ))
            .into());
        }
        if let Some(exchange) = &options.exchange {
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::Protocol(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                ))
                .into());
            }
        }
        state.open_channels += 1;
        state.next_tag = 1;

        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            prefetch: options.prefetch as usize,
            cancelled: false,
            closed: false,
        }))
    }

    async fn publish_channel(&self, exchange: &str) -> Result<Box<dyn PublishChannel>> {
        let mut state = self.inner.state.lock();
        if state.connection_lost {
            return Err(BrokerError::ConnectionFailed {
                uri: "memory://".to_string(),
                message: "connection refused".to_string(),
            }
            .into());
        }
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Protocol(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            ))
            .into());
        }
        state.open_channels += 1;

        Ok(Box::new(MemoryPublishChannel {
            inner: Arc::clone(&self.inner),
            exchange: exchange.to_string(),
            closed: Mutex::new(false),
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    prefetch: usize,
    cancelled: bool,
    closed: bool,
}

impl MemorySubscription {
    fn try_deliver(&self) -> Option<Option<Result<Message>>> {
        let mut state = self.inner.state.lock();

        if state.connection_lost {
            return Some(Some(Err(BrokerError::ConnectionClosed(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            )
            .into())));
        }
        if self.cancelled || self.closed {
            return Some(None);
        }

        let under_limit = self.prefetch == 0 || state.unacked.len() < self.prefetch;
        if under_limit {
            if let Some(message) = state.ready.pop_front() {
                let tag = state.next_tag;
                state.next_tag += 1;
                state.unacked.insert(tag, message.clone());
                return Some(Some(Ok(message.with_delivery_tag(tag))));
            }
            if !state.keep_open {
                return Some(None);
            }
        }

        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Message>> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(delivery) = self.try_deliver() {
                return delivery;
            }
            changed.await;
        }
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        Arc::new(MemoryAcknowledger {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn cancel(&mut self) -> Result<()> {
        self.cancelled = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.inner.state.lock();
        Inner::requeue_unacked(&mut state);
        state.closed_channels += 1;
        drop(state);
        self.inner.notify();
        Ok(())
    }
}

// A dropped connection hands its unacknowledged deliveries back to the queue
impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if !self.closed {
            Inner::requeue_unacked(&mut self.inner.state.lock());
            self.inner.notify();
        }
    }
}

struct MemoryAcknowledger {
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, tag: u64, multiple: bool) -> Result<()> {
        let mut state = self.inner.state.lock();

        if state.connection_lost {
            return Err(BrokerError::ConnectionClosed("channel closed".to_string()).into());
        }
        if state.fail_acks {
            return Err(BrokerError::Ack {
                tag,
                message: "channel is closing".to_string(),
            }
            .into());
        }
        if !state.unacked.contains_key(&tag) {
            return Err(BrokerError::Ack {
                tag,
                message: "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            }
            .into());
        }

        if multiple {
            state.unacked.retain(|&t, _| t > tag);
        } else {
            state.unacked.remove(&tag);
        }
        state.acks.push(AckRequest {
            tag,
            cumulative: multiple,
        });
        drop(state);

        self.inner.notify();
        Ok(())
    }
}

struct MemoryPublishChannel {
    inner: Arc<Inner>,
    exchange: String,
    closed: Mutex<bool>,
}

#[async_trait]
impl PublishChannel for MemoryPublishChannel {
    async fn publish(&self, routing_key: &str, message: &Message) -> Result<()> {
        let mut state = self.inner.state.lock();

        let rejected = state.connection_lost
            || state
                .fail_publish_after
                .is_some_and(|limit| state.published.len() >= limit);
        if rejected {
            return Err(BrokerError::Publish {
                exchange: self.exchange.clone(),
                routing_key: routing_key.to_string(),
                message: "broker nacked the publish".to_string(),
            }
            .into());
        }

        let mut message = message.clone();
        message.delivery_tag = None;
        state.published.push(Published {
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            message,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            self.inner.state.lock().closed_channels += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(queue: &str, prefetch: u16) -> SubscribeOptions {
        SubscribeOptions {
            queue: queue.to_string(),
            exchange: None,
            routing_key: "#".to_string(),
            consumer_tag: "test".to_string(),
            prefetch,
        }
    }

    #[tokio::test]
    async fn test_prefetch_gates_deliveries() {
        let broker = MemoryBroker::new("q");
        for i in 0..3 {
            broker.enqueue(Message::new(format!("{}", i), ""));
        }

        let mut subscription = broker.subscribe(&options("q", 2)).await.unwrap();
        let acker = subscription.acknowledger();

        assert_eq!(
            subscription.next_delivery().await.unwrap().unwrap().delivery_tag,
            Some(1)
        );
        subscription.next_delivery().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(30),
            subscription.next_delivery(),
        )
        .await;
        assert!(blocked.is_err());

        acker.ack(2, true).await.unwrap();
        let third = subscription.next_delivery().await.unwrap().unwrap();
        assert_eq!(third.delivery_tag, Some(3));
        assert_eq!(third.body, "2");

        acker.ack(3, false).await.unwrap();
        assert!(subscription.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_in_order() {
        let broker = MemoryBroker::new("q");
        for i in 0..3 {
            broker.enqueue(Message::new(format!("{}", i), ""));
        }

        let mut subscription = broker.subscribe(&options("q", 0)).await.unwrap();
        subscription.next_delivery().await.unwrap().unwrap();
        subscription.next_delivery().await.unwrap().unwrap();
        subscription.close().await.unwrap();
        assert_eq!(broker.ready(), 3);

        let mut again = broker.subscribe(&options("q", 0)).await.unwrap();
        let first = again.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.body, "0");
        assert_eq!(first.delivery_tag, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_queue_and_exchange() {
        let broker = MemoryBroker::new("q").with_exchange("ex");

        assert!(broker.subscribe(&options("other", 1)).await.is_err());
        assert!(broker.publish_channel("missing").await.is_err());
        assert!(broker.publish_channel("ex").await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_failure_after_limit() {
        let broker = MemoryBroker::new("q").with_exchange("ex");
        broker.fail_publish_after(1);
        let channel = broker.publish_channel("ex").await.unwrap();

        channel.publish("a", &Message::new("1", "")).await.unwrap();
        assert!(channel.publish("a", &Message::new("2", "")).await.is_err());
        assert_eq!(broker.published().len(), 1);
    }
}
