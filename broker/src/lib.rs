//! Broker-agnostic publish/subscribe for the streaming platform.
//!
//! This crate defines the [`BrokerClient`] capability set and its backends:
//!
//! - **Streaming-queue** (`kafka` feature): partitioned, ordered-per-partition
//!   broker. A subscribe `group` maps to a native consumer group, so subscribers
//!   sharing a group compete for messages. That is caller-controlled behavior.
//! - **Fanout-exchange** (`rabbitmq` feature): broadcast-only broker. Every
//!   subscribe binds its own queue; all subscribers receive every message.
//! - **Memory**: in-process backend with either delivery mode, used for local
//!   development and tests.
//!
//! # Contract
//!
//! - `publish` never fails loudly: failures are logged and reported as `false`.
//!   Retrying is the caller's business.
//! - The `timestamp` field of every published payload is stamped here and
//!   overwrites whatever the caller supplied.
//! - Dropping or exhausting a [`MessageStream`] releases its broker consumer.
//!   `disconnect` ends every stream still open.

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use serde_json::{Map, Value};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use error::{BrokerErrorKind, Error};
pub use memory::{DeliveryMode, MemoryBroker};

/// Structured message body exchanged with the broker.
pub type Payload = Map<String, Value>;

/// A lazy, unbounded, non-restartable sequence of broker messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BrokerMessage, Error>> + Send>>;

/// Payload field holding the server-side publish time in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A message as it travels through the broker: a JSON object whose
/// [`TIMESTAMP_FIELD`] was written by the publishing side.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    payload: Payload,
}

impl BrokerMessage {
    /// Stamps `payload` with the current server time, replacing any
    /// client-supplied timestamp.
    pub fn stamped(mut payload: Payload) -> Self {
        payload.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::from(Utc::now().timestamp_millis()),
        );
        Self { payload }
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.payload.get(TIMESTAMP_FIELD).and_then(Value::as_i64)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    /// Decodes a message received from the broker. Anything but a JSON object is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let payload: Payload = serde_json::from_slice(bytes)?;
        Ok(Self { payload })
    }
}

/// Delivery semantics a backend offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    StreamingQueue,
    FanoutExchange,
}

/// Backend selector supplied through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Kafka,
    RabbitMq,
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct BrokerBackendParseError;

impl fmt::Display for BrokerBackendParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "expected one of: kafka, rabbitmq, memory")
    }
}

impl std::error::Error for BrokerBackendParseError {}

impl FromStr for BrokerBackend {
    type Err = BrokerBackendParseError;

    fn from_str(value: &str) -> Result<BrokerBackend, Self::Err> {
        match value.to_lowercase().as_str() {
            "kafka" => Ok(BrokerBackend::Kafka),
            "rabbitmq" => Ok(BrokerBackend::RabbitMq),
            "memory" => Ok(BrokerBackend::Memory),
            _ => Err(BrokerBackendParseError),
        }
    }
}

impl fmt::Display for BrokerBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerBackend::Kafka => write!(f, "kafka"),
            BrokerBackend::RabbitMq => write!(f, "rabbitmq"),
            BrokerBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Provisioning parameters for `create_topic`. Backends without partitions ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSettings {
    pub partitions: i32,
    pub replication_factor: i32,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
        }
    }
}

/// Uniform publish/subscribe/topic-admin operations over an external message broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Idempotent. Returns `false` if the broker cannot be reached.
    async fn connect(&self) -> bool;

    /// Idempotent. Releases the producer, admin handle and every consumer bound
    /// since `connect`, ending all open message streams.
    async fn disconnect(&self) -> bool;

    /// Publishes `payload` to `topic`, creating the topic if needed. Returns
    /// `false` on any failure.
    async fn publish(&self, topic: &str, payload: Payload, key: Option<&str>) -> bool;

    /// Binds a consumer for `(topic, group)`. Without a group a fresh random one
    /// is used, giving every subscriber its own copy of each message.
    async fn subscribe(&self, topic: &str, group: Option<&str>) -> Result<MessageStream, Error>;

    async fn create_topic(&self, topic: &str, settings: TopicSettings) -> bool;

    async fn delete_topic(&self, topic: &str) -> bool;

    async fn list_topics(&self) -> Vec<String>;

    async fn topic_exists(&self, topic: &str) -> bool;
}

/// Cancellation scope for every stream opened during one connect/disconnect session.
#[derive(Debug, Default)]
pub(crate) struct SessionScope {
    token: RwLock<CancellationToken>,
}

impl SessionScope {
    /// Token that is cancelled when the current session ends.
    pub(crate) fn current(&self) -> CancellationToken {
        match self.token.read() {
            Ok(token) => token.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        }
    }

    /// Cancels every stream of the current session and starts a fresh scope.
    pub(crate) fn end(&self) {
        let mut token = match self.token.write() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        token.cancel();
        *token = CancellationToken::new();
    }
}
