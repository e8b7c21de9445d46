//! Fanout-exchange backend over RabbitMQ.
//!
//! A topic is a durable fanout exchange. Every `subscribe` declares its own
//! exclusive, auto-delete queue bound to that exchange, so all subscribers always
//! receive every message and there is no competing-consumer mode. A `group`, when
//! given, only prefixes the queue name.
//!
//! AMQP offers no way to enumerate exchanges, so `list_topics` and `topic_exists`
//! answer from the exchanges this process declared. That directory is best-effort
//! and not authoritative across restarts or instances.

use crate::{
    BrokerClient, BrokerKind, BrokerMessage, Error, MessageStream, Payload, SessionScope,
    TopicSettings,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use log::*;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_PREFETCH: u16 = 64;

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

pub struct RabbitMqBroker {
    uri: String,
    address: String,
    prefetch: u16,
    session: Mutex<Option<AmqpSession>>,
    exchanges: DashSet<String>,
    /// queue name -> consumer tag, for every queue bound since `connect`
    queues: Arc<DashMap<String, String>>,
    scope: SessionScope,
}

impl RabbitMqBroker {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            uri: format!("amqp://{username}:{password}@{host}:{port}/%2f"),
            address: format!("{host}:{port}"),
            prefetch: DEFAULT_PREFETCH,
            session: Mutex::new(None),
            exchanges: DashSet::new(),
            queues: Arc::new(DashMap::new()),
            scope: SessionScope::default(),
        }
    }

    /// Caps the number of unacknowledged deliveries buffered per subscription.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Number of queues currently bound by this client.
    pub fn bound_queues(&self) -> usize {
        self.queues.len()
    }

    /// Returns an open channel, connecting or reopening the channel as needed.
    async fn channel(&self) -> Result<Channel, Error> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.as_mut() {
            if existing.channel.status().connected() {
                return Ok(existing.channel.clone());
            }
            if existing.connection.status().connected() {
                existing.channel = existing.connection.create_channel().await?;
                debug!("Reopened RabbitMQ channel");
                return Ok(existing.channel.clone());
            }
        }

        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        *session = Some(AmqpSession {
            connection,
            channel: channel.clone(),
        });
        info!("Connected to RabbitMQ broker at {}", self.address);
        Ok(channel)
    }

    async fn declare_exchange(&self, channel: &Channel, topic: &str) -> Result<(), Error> {
        channel
            .exchange_declare(
                topic,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.exchanges.insert(topic.to_string());
        Ok(())
    }

    async fn ensure_exchange(&self, channel: &Channel, topic: &str) -> Result<(), Error> {
        if self.exchanges.contains(topic) {
            return Ok(());
        }
        self.declare_exchange(channel, topic).await
    }

    async fn try_publish(&self, topic: &str, payload: Payload, key: Option<&str>) -> Result<(), Error> {
        let channel = self.channel().await?;
        self.ensure_exchange(&channel, topic).await?;

        let bytes = BrokerMessage::stamped(payload).to_bytes()?;
        channel
            .basic_publish(
                topic,
                key.unwrap_or(""),
                BasicPublishOptions::default(),
                &bytes,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, topic: &str, group: Option<&str>) -> Result<QueueGuard, Error> {
        let channel = self.channel().await?;
        self.ensure_exchange(&channel, topic).await?;

        let queue = format!("{}-{}", group.unwrap_or("queue"), Uuid::new_v4());
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(&queue, topic, "", QueueBindOptions::default(), FieldTable::default())
            .await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("ctag-{queue}");
        self.queues.insert(queue.clone(), tag.clone());
        Ok(QueueGuard {
            channel,
            queues: Arc::clone(&self.queues),
            queue,
            tag,
            released: false,
        })
    }
}

/// Cancels the consumer and deletes its queue when a subscription ends.
struct QueueGuard {
    channel: Channel,
    queues: Arc<DashMap<String, String>>,
    queue: String,
    tag: String,
    released: bool,
}

impl QueueGuard {
    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queues.remove(&self.queue);
        release_queue(self.channel.clone(), self.queue.clone(), self.tag.clone()).await;
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queues.remove(&self.queue);
        // Dropped mid-stream: finish the broker-side cleanup on the runtime.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(release_queue(
                self.channel.clone(),
                self.queue.clone(),
                self.tag.clone(),
            ));
        }
    }
}

async fn release_queue(channel: Channel, queue: String, tag: String) {
    if let Err(e) = channel
        .basic_cancel(&tag, BasicCancelOptions::default())
        .await
    {
        debug!("Could not cancel consumer {tag}: {e}");
    }
    if let Err(e) = channel
        .queue_delete(&queue, QueueDeleteOptions::default())
        .await
    {
        debug!("Could not delete queue {queue}: {e}");
    }
    debug!("Released RabbitMQ queue {queue}");
}

#[async_trait]
impl BrokerClient for RabbitMqBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::FanoutExchange
    }

    async fn connect(&self) -> bool {
        match self.channel().await {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to connect to RabbitMQ broker at {}: {e}", self.address);
                false
            }
        }
    }

    async fn disconnect(&self) -> bool {
        self.scope.end();

        let session = self.session.lock().await.take();
        let closed = match session {
            Some(session) => match session.connection.close(200, "disconnect").await {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to disconnect from RabbitMQ broker: {e}");
                    false
                }
            },
            None => true,
        };

        // Closing the connection drops every exclusive queue and its consumer.
        self.queues.clear();
        self.exchanges.clear();
        if closed {
            info!("Disconnected from RabbitMQ broker");
        }
        closed
    }

    async fn publish(&self, topic: &str, payload: Payload, key: Option<&str>) -> bool {
        match self.try_publish(topic, payload, key).await {
            Ok(()) => {
                debug!("Published message to topic {topic}");
                true
            }
            Err(e) => {
                error!("Failed to publish message to topic {topic}: {e}");
                false
            }
        }
    }

    async fn subscribe(&self, topic: &str, group: Option<&str>) -> Result<MessageStream, Error> {
        let mut guard = self.bind_queue(topic, group).await.map_err(|e| {
            error!("Error in subscription to topic {topic}: {e}");
            Error::subscription(e)
        })?;

        let consumer = match guard
            .channel
            .basic_consume(
                &guard.queue,
                &guard.tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!("Error in subscription to topic {topic}: {e}");
                guard.release().await;
                return Err(Error::subscription(e));
            }
        };
        info!("Subscribed to topic {topic} with queue {}", guard.queue);

        let cancel = self.scope.current();
        let topic = topic.to_string();

        let stream = async_stream::stream! {
            let mut guard = guard;
            let mut consumer = consumer;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    delivery = consumer.next() => delivery,
                };
                match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!("Failed to acknowledge delivery on topic {topic}: {e}");
                        }
                        match BrokerMessage::from_bytes(&delivery.data) {
                            Ok(message) => yield Ok::<BrokerMessage, Error>(message),
                            Err(e) => warn!("Skipping undecodable message on topic {topic}: {e}"),
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in subscription to topic {topic}: {e}");
                        yield Err(Error::subscription(e));
                        break;
                    }
                    None => break,
                }
            }
            guard.release().await;
        };
        Ok(Box::pin(stream))
    }

    async fn create_topic(&self, topic: &str, settings: TopicSettings) -> bool {
        let result = match self.channel().await {
            Ok(channel) => self.declare_exchange(&channel, topic).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("Exchange {topic} ignores partition settings {settings:?}");
                info!("Created topic (exchange) {topic}");
                true
            }
            Err(e) => {
                error!("Failed to create topic (exchange) {topic}: {e}");
                false
            }
        }
    }

    async fn delete_topic(&self, topic: &str) -> bool {
        let result = match self.channel().await {
            Ok(channel) => channel
                .exchange_delete(topic, ExchangeDeleteOptions::default())
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.exchanges.remove(topic);
                info!("Deleted topic (exchange) {topic}");
                true
            }
            Err(e) => {
                error!("Failed to delete topic (exchange) {topic}: {e}");
                false
            }
        }
    }

    async fn list_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.exchanges.iter().map(|topic| topic.key().clone()).collect();
        topics.sort();
        topics
    }

    async fn topic_exists(&self, topic: &str) -> bool {
        self.exchanges.contains(topic)
    }
}
