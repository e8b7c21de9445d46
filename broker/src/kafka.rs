//! Streaming-queue backend over Kafka.
//!
//! Topics are native Kafka topics and a subscribe `group` is a native consumer
//! group: two subscribers sharing a group id split the partitions between them
//! instead of both receiving every message. Callers pick that on purpose by
//! passing the same group; the default is a fresh group per subscriber.

use crate::{
    BrokerClient, BrokerKind, BrokerMessage, Error, MessageStream, Payload, SessionScope,
    TopicSettings,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::*;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

type Consumers = Arc<DashMap<String, Arc<StreamConsumer>>>;

struct KafkaHandles {
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
}

pub struct KafkaBroker {
    bootstrap_servers: String,
    default_settings: TopicSettings,
    handles: RwLock<Option<KafkaHandles>>,
    consumers: Consumers,
    /// Topics this client already saw or created, to skip a metadata round trip per publish.
    provisioned: DashSet<String>,
    scope: SessionScope,
}

impl KafkaBroker {
    pub fn new(host: &str, port: u16, default_settings: TopicSettings) -> Self {
        Self {
            bootstrap_servers: format!("{host}:{port}"),
            default_settings,
            handles: RwLock::new(None),
            consumers: Arc::new(DashMap::new()),
            provisioned: DashSet::new(),
            scope: SessionScope::default(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config
    }

    fn producer(&self) -> Option<FutureProducer> {
        self.read_handles(|handles| handles.producer.clone())
    }

    fn admin(&self) -> Option<Arc<AdminClient<DefaultClientContext>>> {
        self.read_handles(|handles| Arc::clone(&handles.admin))
    }

    fn read_handles<T>(&self, f: impl FnOnce(&KafkaHandles) -> T) -> Option<T> {
        let guard = self
            .handles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.as_ref().map(f)
    }

    async fn ensure_producer(&self) -> Option<FutureProducer> {
        if let Some(producer) = self.producer() {
            return Some(producer);
        }
        if self.connect().await {
            self.producer()
        } else {
            None
        }
    }

    async fn ensure_admin(&self) -> Option<Arc<AdminClient<DefaultClientContext>>> {
        if let Some(admin) = self.admin() {
            return Some(admin);
        }
        if self.connect().await {
            self.admin()
        } else {
            None
        }
    }

    fn create_consumer(&self, topic: &str, group: &str) -> Result<StreamConsumer, Error> {
        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(consumer)
    }

    /// Creates `topic` with the default settings unless it is known to exist.
    async fn ensure_topic(&self, topic: &str) -> bool {
        if self.provisioned.contains(topic) {
            return true;
        }
        if !self.topic_exists(topic).await
            && !self.create_topic(topic, self.default_settings).await
        {
            return false;
        }
        self.provisioned.insert(topic.to_string());
        true
    }

    async fn fetch_topic_names(&self) -> Result<Vec<String>, Error> {
        let producer = self
            .ensure_producer()
            .await
            .ok_or_else(|| Error::new(crate::BrokerErrorKind::Unavailable))?;
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
        })
        .await
        .map_err(|e| Error::with_source(crate::BrokerErrorKind::Admin, e))??;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }
}

/// Releases a consumer once the last stream using it goes away.
struct ConsumerGuard {
    consumers: Consumers,
    key: String,
    consumer: Arc<StreamConsumer>,
}

/// Consume errors librdkafka reports and then recovers from on its own, such as a
/// subscribed topic that has not been created yet.
fn is_transient(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::PartitionEOF
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
        )
    )
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        // The map holds one reference and this guard another.
        let removed = self.consumers.remove_if(&self.key, |_, consumer| {
            Arc::ptr_eq(consumer, &self.consumer) && Arc::strong_count(consumer) <= 2
        });
        if removed.is_some() {
            self.consumer.unsubscribe();
            debug!("Released Kafka consumer {}", self.key);
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::StreamingQueue
    }

    async fn connect(&self) -> bool {
        let mut handles = self
            .handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handles.is_some() {
            return true;
        }

        let producer: FutureProducer = match self
            .client_config()
            .set("message.timeout.ms", "5000")
            .create()
        {
            Ok(producer) => producer,
            Err(e) => {
                error!("Failed to connect to Kafka broker: {e}");
                return false;
            }
        };
        let admin: AdminClient<DefaultClientContext> = match self.client_config().create() {
            Ok(admin) => admin,
            Err(e) => {
                error!("Failed to create Kafka admin client: {e}");
                return false;
            }
        };

        *handles = Some(KafkaHandles {
            producer,
            admin: Arc::new(admin),
        });
        info!("Connected to Kafka broker at {}", self.bootstrap_servers);
        true
    }

    async fn disconnect(&self) -> bool {
        self.scope.end();

        let handles = self
            .handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handles) = handles {
            let producer = handles.producer;
            let flushed =
                tokio::task::spawn_blocking(move || producer.flush(Timeout::After(DELIVERY_TIMEOUT)))
                    .await;
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Kafka producer flush failed during disconnect: {e}"),
                Err(e) => warn!("Kafka producer flush task failed: {e}"),
            }
        }

        for entry in self.consumers.iter() {
            entry.value().unsubscribe();
        }
        self.consumers.clear();

        info!("Disconnected from Kafka broker");
        true
    }

    async fn publish(&self, topic: &str, payload: Payload, key: Option<&str>) -> bool {
        let Some(producer) = self.ensure_producer().await else {
            error!("Failed to publish message to topic {topic}: broker unavailable");
            return false;
        };

        if !self.ensure_topic(topic).await {
            error!("Failed to publish message to topic {topic}: topic could not be created");
            return false;
        }

        let message = BrokerMessage::stamped(payload);
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode message for topic {topic}: {e}");
                return false;
            }
        };

        let record: FutureRecord<'_, str, Vec<u8>> = FutureRecord::to(topic).payload(&bytes);
        let record = match key {
            Some(key) => record.key(key),
            None => record,
        };

        match producer.send(record, Timeout::After(DELIVERY_TIMEOUT)).await {
            Ok(_) => {
                debug!("Published message to topic {topic}");
                true
            }
            Err((e, _)) => {
                error!("Failed to publish message to topic {topic}: {e}");
                false
            }
        }
    }

    async fn subscribe(&self, topic: &str, group: Option<&str>) -> Result<MessageStream, Error> {
        if !self.ensure_topic(topic).await {
            error!("Error in subscription to topic {topic}: topic could not be created");
            return Err(Error::unavailable(format!(
                "topic {topic} could not be created"
            )));
        }

        let group = group
            .map(str::to_string)
            .unwrap_or_else(|| format!("group-{}", Uuid::new_v4()));
        let key = format!("{topic}-{group}");

        let consumer = match self.consumers.get(&key) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let consumer = Arc::new(self.create_consumer(topic, &group).map_err(|e| {
                    error!("Error in subscription to topic {topic}: {e}");
                    Error::subscription(e)
                })?);
                self.consumers.insert(key.clone(), Arc::clone(&consumer));
                consumer
            }
        };
        info!("Subscribed to topic {topic} with group {group}");

        let guard = ConsumerGuard {
            consumers: Arc::clone(&self.consumers),
            key,
            consumer,
        };
        let cancel = self.scope.current();
        let topic = topic.to_string();

        let stream = async_stream::stream! {
            let guard = guard;
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = guard.consumer.recv() => {
                        received.map(|message| message.payload().map(BrokerMessage::from_bytes))
                    }
                };
                match received {
                    Ok(Some(Ok(message))) => yield Ok::<BrokerMessage, Error>(message),
                    Ok(Some(Err(e))) => warn!("Skipping undecodable message on topic {topic}: {e}"),
                    Ok(None) => trace!("Skipping empty message on topic {topic}"),
                    Err(e) if is_transient(&e) => {
                        debug!("Transient consume error on topic {topic}: {e}");
                    }
                    Err(e) => {
                        error!("Error in subscription to topic {topic}: {e}");
                        yield Err(Error::subscription(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn create_topic(&self, topic: &str, settings: TopicSettings) -> bool {
        let Some(admin) = self.ensure_admin().await else {
            error!("Failed to create topic {topic}: broker unavailable");
            return false;
        };

        let new_topic = NewTopic::new(
            topic,
            settings.partitions,
            TopicReplication::Fixed(settings.replication_factor),
        );
        match admin.create_topics(&[new_topic], &AdminOptions::new()).await {
            Ok(results) => results.into_iter().all(|result| match result {
                Ok(_) => {
                    info!("Created topic {topic}");
                    true
                }
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    info!("Topic {topic} already exists");
                    true
                }
                Err((_, code)) => {
                    error!("Failed to create topic {topic}: {code}");
                    false
                }
            }),
            Err(e) => {
                error!("Failed to create topic {topic}: {e}");
                false
            }
        }
    }

    async fn delete_topic(&self, topic: &str) -> bool {
        let Some(admin) = self.ensure_admin().await else {
            error!("Failed to delete topic {topic}: broker unavailable");
            return false;
        };

        match admin.delete_topics(&[topic], &AdminOptions::new()).await {
            Ok(results) => results.into_iter().all(|result| match result {
                Ok(_) => {
                    self.provisioned.remove(topic);
                    info!("Deleted topic {topic}");
                    true
                }
                Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    self.provisioned.remove(topic);
                    info!("Topic {topic} does not exist");
                    true
                }
                Err((_, code)) => {
                    error!("Failed to delete topic {topic}: {code}");
                    false
                }
            }),
            Err(e) => {
                error!("Failed to delete topic {topic}: {e}");
                false
            }
        }
    }

    async fn list_topics(&self) -> Vec<String> {
        match self.fetch_topic_names().await {
            Ok(topics) => topics,
            Err(e) => {
                error!("Failed to list topics: {e}");
                Vec::new()
            }
        }
    }

    async fn topic_exists(&self, topic: &str) -> bool {
        match self.fetch_topic_names().await {
            Ok(topics) => topics.iter().any(|name| name == topic),
            Err(e) => {
                error!("Failed to check if topic {topic} exists: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_servers_combine_host_and_port() {
        let broker = KafkaBroker::new("kafka.internal", 9093, TopicSettings::default());
        assert_eq!(broker.bootstrap_servers, "kafka.internal:9093");
        assert_eq!(broker.kind(), BrokerKind::StreamingQueue);
    }

    #[test]
    fn missing_topics_do_not_end_a_subscription() {
        for code in [
            RDKafkaErrorCode::UnknownTopicOrPartition,
            RDKafkaErrorCode::UnknownTopic,
            RDKafkaErrorCode::PartitionEOF,
        ] {
            assert!(is_transient(&KafkaError::MessageConsumption(code)), "{code:?}");
        }
    }

    #[test]
    fn fatal_consume_errors_end_a_subscription() {
        assert!(!is_transient(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        )));
        assert!(!is_transient(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::GroupAuthorizationFailed
        )));
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_no_op() {
        let broker = KafkaBroker::new("localhost", 9092, TopicSettings::default());
        assert!(broker.disconnect().await);
        assert!(broker.disconnect().await);
        assert!(broker.consumers.is_empty());
    }
}
