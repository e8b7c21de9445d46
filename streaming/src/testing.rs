//! Broker doubles and async helpers shared by the unit tests.

use crate::message::Response;
use async_trait::async_trait;
use broker::{BrokerClient, BrokerKind, Error, MessageStream, Payload, TopicSettings};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, timeout, Instant};

/// Refuses every operation, as an unreachable broker would.
pub struct UnreachableBroker;

#[async_trait]
impl BrokerClient for UnreachableBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::StreamingQueue
    }
    async fn connect(&self) -> bool {
        false
    }
    async fn disconnect(&self) -> bool {
        true
    }
    async fn publish(&self, _topic: &str, _payload: Payload, _key: Option<&str>) -> bool {
        false
    }
    async fn subscribe(&self, _topic: &str, _group: Option<&str>) -> Result<MessageStream, Error> {
        Err(Error::unavailable("connection refused"))
    }
    async fn create_topic(&self, _topic: &str, _settings: TopicSettings) -> bool {
        false
    }
    async fn delete_topic(&self, _topic: &str) -> bool {
        false
    }
    async fn list_topics(&self) -> Vec<String> {
        Vec::new()
    }
    async fn topic_exists(&self, _topic: &str) -> bool {
        false
    }
}

/// Binds fine, then fails the stream with its first item.
pub struct BrokenStreamBroker;

#[async_trait]
impl BrokerClient for BrokenStreamBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::FanoutExchange
    }
    async fn connect(&self) -> bool {
        true
    }
    async fn disconnect(&self) -> bool {
        true
    }
    async fn publish(&self, _topic: &str, _payload: Payload, _key: Option<&str>) -> bool {
        true
    }
    async fn subscribe(&self, _topic: &str, _group: Option<&str>) -> Result<MessageStream, Error> {
        Ok(Box::pin(async_stream::stream! {
            sleep(Duration::from_millis(10)).await;
            yield Err(Error::subscription("consumer crashed"));
        }))
    }
    async fn create_topic(&self, _topic: &str, _settings: TopicSettings) -> bool {
        true
    }
    async fn delete_topic(&self, _topic: &str) -> bool {
        true
    }
    async fn list_topics(&self) -> Vec<String> {
        Vec::new()
    }
    async fn topic_exists(&self, _topic: &str) -> bool {
        false
    }
}

pub fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

pub async fn next_response(receiver: &mut Receiver<Response>) -> Response {
    timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("outbound queue closed")
}

/// Asserts nothing arrives within a short window.
pub async fn assert_quiet(receiver: &mut Receiver<Response>) {
    if let Ok(Some(response)) = timeout(Duration::from_millis(100), receiver.recv()).await {
        panic!("unexpected response: {response:?}");
    }
}

/// Polls `condition` until it holds or a second has passed.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(5)).await;
    }
}
