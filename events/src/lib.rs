//! Entity lifecycle notifications for the streaming platform.
//!
//! Code that mutates an entity tells the outside world about it through
//! [`EventPublisher`]. Events are published to the entity's own topic
//! (`entity.<lowercased type>.<id>`) so that only connections authorized to read
//! that entity receive them.
//!
//! Delivery is best-effort and at-most-once. A failed notification must never fail
//! or roll back the state change that produced it, so callers either ignore the
//! returned flag or use [`EventPublisher::spawn_entity_event`].

use broker::{BrokerClient, Payload};
use domain::topic::entity_topic;
use domain::Id;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub const EVENT_TYPE_FIELD: &str = "event_type";
pub const ENTITY_TYPE_FIELD: &str = "entity_type";
pub const ENTITY_ID_FIELD: &str = "entity_id";

/// What happened to the entity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// Any other application-defined event name.
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Custom(name) => name,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "created" => EventKind::Created,
            "updated" => EventKind::Updated,
            "deleted" => EventKind::Deleted,
            _ => EventKind::Custom(value),
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        EventKind::from(value.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A change to a single entity, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub entity_type: String,
    pub entity_id: Id,
    pub kind: EventKind,
    pub data: Payload,
}

impl EntityEvent {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: Id,
        kind: impl Into<EventKind>,
        data: Payload,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            kind: kind.into(),
            data,
        }
    }

    pub fn topic(&self) -> String {
        entity_topic(&self.entity_type, self.entity_id)
    }

    /// The broker payload: `data` with the event identification fields injected.
    /// Injected fields win over same-named keys in `data`.
    pub fn into_payload(self) -> Payload {
        let mut payload = self.data;
        payload.insert(
            EVENT_TYPE_FIELD.to_string(),
            Value::from(String::from(self.kind)),
        );
        payload.insert(ENTITY_TYPE_FIELD.to_string(), Value::from(self.entity_type));
        payload.insert(
            ENTITY_ID_FIELD.to_string(),
            Value::from(self.entity_id.to_string()),
        );
        payload
    }
}

/// Publishes entity events through the configured broker.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn BrokerClient>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self { broker }
    }

    /// Returns whether the broker accepted the event. Callers must not treat
    /// `false` as a failure of the operation that triggered the event.
    pub async fn publish_entity_event(
        &self,
        entity_type: &str,
        entity_id: Id,
        event_type: impl Into<EventKind>,
        data: Payload,
    ) -> bool {
        self.publish(EntityEvent::new(entity_type, entity_id, event_type, data))
            .await
    }

    pub async fn publish(&self, event: EntityEvent) -> bool {
        let topic = event.topic();
        let kind = event.kind.clone();
        let published = self.broker.publish(&topic, event.into_payload(), None).await;
        if published {
            debug!("Published {kind} event to {topic}");
        } else {
            warn!("Failed to publish {kind} event to {topic}");
        }
        published
    }

    /// Detaches the publish onto the runtime; the caller never waits on the broker.
    pub fn spawn_entity_event(&self, event: EntityEvent) {
        let publisher = self.clone();
        tokio::spawn(async move {
            publisher.publish(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker::{BrokerKind, Error, MemoryBroker, MessageStream, TopicSettings};
    use domain::topic::public_topic;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    struct UnreachableBroker;

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
            Err(Error::unavailable("broker unreachable"))
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

    #[test]
    fn event_kind_round_trips_through_strings() {
        assert_eq!(EventKind::from("created"), EventKind::Created);
        assert_eq!(EventKind::from("archived"), EventKind::Custom("archived".into()));
        assert_eq!(String::from(EventKind::Deleted), "deleted");
        assert_eq!(
            serde_json::from_value::<EventKind>(json!("updated")).unwrap(),
            EventKind::Updated
        );
    }

    #[test]
    fn payload_carries_the_event_identification() {
        let id = Id::new_v4();
        let event = EntityEvent::new(
            "Invoice",
            id,
            "created",
            payload(json!({"total": 10, "event_type": "forged"})),
        );

        assert_eq!(event.topic(), format!("entity.invoice.{id}"));
        let payload = event.into_payload();
        assert_eq!(payload["event_type"], json!("created"));
        assert_eq!(payload["entity_type"], json!("Invoice"));
        assert_eq!(payload["entity_id"], json!(id.to_string()));
        assert_eq!(payload["total"], json!(10));
    }

    #[tokio::test]
    async fn entity_events_reach_the_entity_topic() {
        let broker = Arc::new(MemoryBroker::broadcast());
        let publisher = EventPublisher::new(broker.clone());
        let id = Id::new_v4();
        let mut stream = broker
            .subscribe(&entity_topic("order", id), None)
            .await
            .unwrap();

        assert!(
            publisher
                .publish_entity_event("Order", id, EventKind::Updated, payload(json!({"n": 1})))
                .await
        );

        let message = timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.payload()["event_type"], json!("updated"));
        assert!(message.timestamp_millis().is_some());
    }

    #[tokio::test]
    async fn entity_events_are_not_delivered_to_unrelated_topics() {
        let broker = Arc::new(MemoryBroker::broadcast());
        let publisher = EventPublisher::new(broker.clone());
        let mut announcements = broker
            .subscribe(&public_topic("announcements"), None)
            .await
            .unwrap();

        assert!(
            publisher
                .publish_entity_event("Invoice", Id::new_v4(), "created", Payload::new())
                .await
        );

        assert!(timeout(Duration::from_millis(100), announcements.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn broker_failure_is_reported_not_raised() {
        let publisher = EventPublisher::new(Arc::new(UnreachableBroker));

        assert!(
            !publisher
                .publish_entity_event("order", Id::new_v4(), "deleted", Payload::new())
                .await
        );

        // Detached publishing swallows the failure entirely.
        publisher.spawn_entity_event(EntityEvent::new(
            "order",
            Id::new_v4(),
            "deleted",
            Payload::new(),
        ));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn spawned_events_are_delivered() {
        let broker = Arc::new(MemoryBroker::broadcast());
        let publisher = EventPublisher::new(broker.clone());
        let id = Id::new_v4();
        let mut stream = broker
            .subscribe(&entity_topic("order", id), None)
            .await
            .unwrap();

        publisher.spawn_entity_event(EntityEvent::new("order", id, "created", Payload::new()));

        let message = timeout(Duration::from_millis(500), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.payload()["entity_id"], json!(id.to_string()));
    }
}
