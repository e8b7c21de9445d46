//! In-process broker backend.
//!
//! Mirrors the delivery semantics of the networked backends without any external
//! service: [`DeliveryMode::Competing`] behaves like the streaming-queue variant
//! (subscribers sharing a group split the messages), [`DeliveryMode::Broadcast`]
//! like the fanout-exchange variant (every subscriber gets its own queue).
//! Queues are bounded; a full queue drops the new message with a warning.

use crate::{BrokerClient, BrokerKind, BrokerMessage, Error, MessageStream, Payload, SessionScope};
use crate::TopicSettings;
use async_trait::async_trait;
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Subscribers sharing a group compete for messages.
    Competing,
    /// Every subscriber receives every message; groups are ignored.
    Broadcast,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<BrokerMessage>>>;

struct GroupQueue {
    id: u64,
    sender: mpsc::Sender<BrokerMessage>,
    receiver: SharedReceiver,
    members: usize,
}

#[derive(Default)]
struct MemoryState {
    /// topic -> group -> queue
    topics: HashMap<String, HashMap<String, GroupQueue>>,
    next_queue_id: u64,
}

impl MemoryState {
    /// Joins (or creates) the queue for `(topic, group)` and returns its id and receiver.
    fn bind(&mut self, topic: &str, group: &str, capacity: usize) -> (u64, SharedReceiver) {
        let next_id = self.next_queue_id;
        let groups = self.topics.entry(topic.to_string()).or_default();
        let queue = groups.entry(group.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(capacity);
            GroupQueue {
                id: next_id,
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                members: 0,
            }
        });
        if queue.id == next_id {
            self.next_queue_id += 1;
        }
        queue.members += 1;
        (queue.id, Arc::clone(&queue.receiver))
    }

    fn release(&mut self, topic: &str, group: &str, queue_id: u64) {
        let Some(groups) = self.topics.get_mut(topic) else {
            return;
        };
        let remove = match groups.get_mut(group) {
            Some(queue) if queue.id == queue_id => {
                queue.members = queue.members.saturating_sub(1);
                queue.members == 0
            }
            _ => false,
        };
        if remove {
            groups.remove(group);
            trace!("Released memory queue {group} on topic {topic}");
        }
    }
}

/// Removes a subscriber from its group queue when its stream is dropped.
struct MemberGuard {
    state: Weak<Mutex<MemoryState>>,
    topic: String,
    group: String,
    queue_id: u64,
}

impl Drop for MemberGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).release(&self.topic, &self.group, self.queue_id);
        }
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn receive(receiver: &SharedReceiver) -> Option<BrokerMessage> {
    receiver.lock().await.recv().await
}

pub struct MemoryBroker {
    mode: DeliveryMode,
    capacity: usize,
    connected: AtomicBool,
    state: Arc<Mutex<MemoryState>>,
    scope: SessionScope,
}

impl MemoryBroker {
    pub fn new(mode: DeliveryMode, capacity: usize) -> Self {
        Self {
            mode,
            capacity: capacity.max(1),
            connected: AtomicBool::new(false),
            state: Arc::new(Mutex::new(MemoryState::default())),
            scope: SessionScope::default(),
        }
    }

    pub fn competing() -> Self {
        Self::new(DeliveryMode::Competing, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn broadcast() -> Self {
        Self::new(DeliveryMode::Broadcast, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of subscribers currently bound to any queue.
    pub fn active_consumers(&self) -> usize {
        lock(&self.state)
            .topics
            .values()
            .flat_map(|groups| groups.values())
            .map(|queue| queue.members)
            .sum()
    }

    fn queue_name(&self, group: Option<&str>) -> String {
        match (self.mode, group) {
            (DeliveryMode::Competing, Some(group)) => group.to_string(),
            (DeliveryMode::Competing, None) => format!("group-{}", Uuid::new_v4()),
            (DeliveryMode::Broadcast, group) => {
                format!("{}-{}", group.unwrap_or("queue"), Uuid::new_v4())
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::broadcast()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn kind(&self) -> BrokerKind {
        match self.mode {
            DeliveryMode::Competing => BrokerKind::StreamingQueue,
            DeliveryMode::Broadcast => BrokerKind::FanoutExchange,
        }
    }

    async fn connect(&self) -> bool {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("Connected to in-memory broker ({:?})", self.mode);
        }
        true
    }

    async fn disconnect(&self) -> bool {
        self.scope.end();
        let mut state = lock(&self.state);
        for groups in state.topics.values_mut() {
            groups.clear();
        }
        drop(state);
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("Disconnected from in-memory broker");
        }
        true
    }

    async fn publish(&self, topic: &str, payload: Payload, _key: Option<&str>) -> bool {
        self.connect().await;
        let message = BrokerMessage::stamped(payload);

        let mut state = lock(&self.state);
        let groups = state.topics.entry(topic.to_string()).or_default();
        for (group, queue) in groups.iter() {
            match queue.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Memory queue {group} on topic {topic} is full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Memory queue {group} on topic {topic} is closed");
                }
            }
        }
        debug!("Published message to topic {topic} ({} queue(s))", groups.len());
        true
    }

    async fn subscribe(&self, topic: &str, group: Option<&str>) -> Result<MessageStream, Error> {
        self.connect().await;
        let group = self.queue_name(group);
        let (queue_id, receiver) = lock(&self.state).bind(topic, &group, self.capacity);
        info!("Subscribed to topic {topic} with group {group}");

        let guard = MemberGuard {
            state: Arc::downgrade(&self.state),
            topic: topic.to_string(),
            group,
            queue_id,
        };
        let cancel = self.scope.current();

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    message = receive(&receiver) => message,
                };
                match next {
                    Some(message) => yield Ok::<BrokerMessage, Error>(message),
                    None => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn create_topic(&self, topic: &str, _settings: TopicSettings) -> bool {
        lock(&self.state).topics.entry(topic.to_string()).or_default();
        true
    }

    async fn delete_topic(&self, topic: &str) -> bool {
        if lock(&self.state).topics.remove(topic).is_none() {
            debug!("Topic {topic} does not exist");
        }
        true
    }

    async fn list_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.state).topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn topic_exists(&self, topic: &str) -> bool {
        lock(&self.state).topics.contains_key(topic)
    }
}
