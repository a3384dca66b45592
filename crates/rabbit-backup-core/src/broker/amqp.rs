//! RabbitMQ adapter built on lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    Acknowledger, Broker, PublishChannel, SubscribeOptions, Subscription, CONTENT_ENCODING,
    CONTENT_TYPE, DELIVERY_MODE_PERSISTENT,
};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::message::{HeaderValue, Headers, Message};
use crate::Result;

const REPLY_SUCCESS: u16 = 200;

/// How often connection flow-control state is sampled
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// RabbitMQ broker reached over AMQP 0-9-1
pub struct AmqpBroker {
    config: BrokerConfig,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<(Connection, Channel, JoinHandle<()>)> {
        let uri = self.config.redacted_uri();

        let connection = Connection::connect(&self.config.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                uri: uri.clone(),
                message: e.to_string(),
            })?;
        info!("Connected to {}", uri);

        let watcher = watch_connection(&connection);

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                uri,
                message: format!("failed to open channel: {}", e),
            })?;

        Ok((connection, channel, watcher))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<Box<dyn Subscription>> {
        let (connection, channel, watcher) = self.connect().await?;

        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| protocol("set prefetch", e))?;

        let queue = channel
            .queue_declare(
                &options.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| protocol(&format!("find queue {}", options.queue), e))?;

        if let Some(exchange) = &options.exchange {
            declare_exchange_passive(&channel, exchange).await?;
            channel
                .queue_bind(
                    &options.queue,
                    exchange,
                    &options.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| protocol(&format!("bind queue {} to {}", options.queue, exchange), e))?;
            info!(
                "Bound queue {} to exchange {} with routing key {:?}",
                options.queue, exchange, options.routing_key
            );
        }

        let waiting = queue.message_count();
        if waiting == 0 {
            info!("Queue {} has no messages waiting", options.queue);
        } else {
            info!("Queue {} has {} messages waiting", options.queue, waiting);
        }

        let consumer = channel
            .basic_consume(
                &options.queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| protocol(&format!("consume from {}", options.queue), e))?;

        Ok(Box::new(AmqpSubscription {
            connection,
            channel,
            consumer,
            consumer_tag: options.consumer_tag.clone(),
            watcher,
            closed: false,
        }))
    }

    async fn publish_channel(&self, exchange: &str) -> Result<Box<dyn PublishChannel>> {
        let (connection, channel, watcher) = self.connect().await?;

        declare_exchange_passive(&channel, exchange).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| protocol("enable publisher confirms", e))?;
        debug!("Publisher confirms enabled on exchange {}", exchange);

        Ok(Box::new(AmqpPublishChannel {
            connection,
            channel,
            exchange: exchange.to_string(),
            watcher,
        }))
    }
}

async fn declare_exchange_passive(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: true,
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| protocol(&format!("find exchange {}", exchange), e))
}

fn protocol(action: &str, err: lapin::Error) -> crate::Error {
    BrokerError::Protocol(format!("failed to {}: {}", action, err)).into()
}

/// Log connection errors and flow-control transitions
fn watch_connection(connection: &Connection) -> JoinHandle<()> {
    connection.on_error(|err| {
        error!("Broker connection closed: {}", err);
    });

    let status = connection.status().clone();
    tokio::spawn(async move {
        let mut blocked = false;
        let mut interval = tokio::time::interval(BLOCKED_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if !status.connected() {
                break;
            }
            let now_blocked = status.blocked();
            if now_blocked != blocked {
                if now_blocked {
                    warn!("Broker blocked the connection, publishing is paused");
                } else {
                    info!("Broker unblocked the connection");
                }
                blocked = now_blocked;
            }
        }
    })
}

async fn close_connection(connection: &Connection, channel: &Channel) -> Result<()> {
    if channel.status().connected() {
        channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::ConnectionClosed(format!("failed to close channel: {}", e)))?;
    }
    if connection.status().connected() {
        connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| {
                BrokerError::ConnectionClosed(format!("failed to close connection: {}", e))
            })?;
    }
    Ok(())
}

struct AmqpSubscription {
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
    consumer_tag: String,
    watcher: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Message>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(BrokerError::ConnectionClosed(e.to_string()).into())),
        };

        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(headers_from_amqp)
            .unwrap_or_default();

        Some(Ok(Message {
            body: delivery.data.into(),
            routing_key: delivery.routing_key.as_str().to_string(),
            headers,
            delivery_tag: Some(delivery.delivery_tag),
        }))
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        Arc::new(AmqpAcknowledger {
            channel: self.channel.clone(),
        })
    }

    async fn cancel(&mut self) -> Result<()> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| protocol(&format!("cancel consumer {}", self.consumer_tag), e))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.watcher.abort();
        close_connection(&self.connection, &self.channel).await?;
        info!("Subscription connection closed");
        Ok(())
    }
}

struct AmqpAcknowledger {
    channel: Channel,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self, tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| {
                BrokerError::Ack {
                    tag,
                    message: e.to_string(),
                }
                .into()
            })
    }
}

struct AmqpPublishChannel {
    connection: Connection,
    channel: Channel,
    exchange: String,
    watcher: JoinHandle<()>,
}

#[async_trait]
impl PublishChannel for AmqpPublishChannel {
    async fn publish(&self, routing_key: &str, message: &Message) -> Result<()> {
        let publish_error = |message: String| BrokerError::Publish {
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            message,
        };

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_content_encoding(ShortString::from(CONTENT_ENCODING))
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_headers(headers_to_amqp(&message.headers));

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(publish_error("broker nacked the publish".to_string()).into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.watcher.abort();
        close_connection(&self.connection, &self.channel).await?;
        info!("Publisher connection closed");
        Ok(())
    }
}

/// Convert AMQP headers, dropping field kinds that have no [`HeaderValue`]
pub(crate) fn headers_from_amqp(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();

    for (name, value) in table.inner() {
        let converted = match value {
            AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
            AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
            // Through the decimal text so 0.1f32 stays 0.1
            AMQPValue::Float(f) => {
                HeaderValue::Float(f.to_string().parse().unwrap_or_else(|_| f64::from(*f)))
            }
            AMQPValue::Double(f) => HeaderValue::Float(*f),
            AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_string()),
            AMQPValue::LongString(s) => {
                HeaderValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            other => {
                debug!("Dropping header {} of unsupported kind {:?}", name.as_str(), other);
                continue;
            }
        };
        headers.insert(name.as_str().to_string(), converted);
    }

    headers
}

pub(crate) fn headers_to_amqp(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();

    for (name, value) in headers {
        let value = match value {
            HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(name.clone()), value);
    }

    table
}
