//! Subscription bookkeeping and message forwarding.
//!
//! [`SubscriptionManager`] owns the [`ConnectionRegistry`] and one forwarding task
//! per live (connection, topic) pair. Each task pulls from its broker stream and
//! pushes `message` envelopes into the connection's bounded outbound queue. Tasks
//! stop as soon as their cancellation token fires (unsubscribe, connection close,
//! shutdown) and re-check liveness before every delivery.

use crate::connection::{ConnectionKey, ConnectionRegistry, PrincipalId, TopicInsert};
use crate::message::{ErrorCode, ProtocolError, Response};
use broker::{BrokerClient, MessageStream, Payload};
use dashmap::{mapref::entry::Entry, DashMap};
use domain::Principal;
use futures::StreamExt;
use log::*;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const USER_ID_FIELD: &str = "user_id";
pub const USERNAME_FIELD: &str = "username";

/// What to do when a connection's outbound queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the message being forwarded.
    DropNewest,
    /// Close the connection.
    Disconnect,
    /// Wait for room up to the configured timeout, then close the connection.
    Block,
}

#[derive(Debug, PartialEq, Eq)]
pub struct OverflowPolicyParseError;

impl fmt::Display for OverflowPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "expected one of: drop-newest, disconnect, block")
    }
}

impl std::error::Error for OverflowPolicyParseError {}

impl FromStr for OverflowPolicy {
    type Err = OverflowPolicyParseError;

    fn from_str(policy: &str) -> Result<OverflowPolicy, Self::Err> {
        match policy.to_lowercase().as_str() {
            "drop-newest" => Ok(OverflowPolicy::DropNewest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            "block" => Ok(OverflowPolicy::Block),
            _ => Err(OverflowPolicyParseError),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OverflowPolicy::DropNewest => write!(f, "drop-newest"),
            OverflowPolicy::Disconnect => write!(f, "disconnect"),
            OverflowPolicy::Block => write!(f, "block"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SubscriptionSettings {
    pub send_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub block_timeout: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            overflow_policy: OverflowPolicy::Disconnect,
            block_timeout: Duration::from_millis(1000),
        }
    }
}

/// Everything a freshly opened connection needs to run its socket loop.
pub struct Registration {
    pub key: ConnectionKey,
    pub sender: Sender<Response>,
    pub receiver: Receiver<Response>,
    pub closed: CancellationToken,
}

type SubscriptionKey = (ConnectionKey, String);

struct ForwardingTask {
    cancel: CancellationToken,
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    registry: ConnectionRegistry,
    broker: Arc<dyn BrokerClient>,
    tasks: DashMap<SubscriptionKey, ForwardingTask>,
    settings: SubscriptionSettings,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(broker: Arc<dyn BrokerClient>, settings: SubscriptionSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ConnectionRegistry::new(),
                broker,
                tasks: DashMap::new(),
                settings,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> SubscriptionSettings {
        self.inner.settings
    }

    /// Registers a connection for `principal` with a fresh bounded outbound queue.
    /// A connection already registered for the same principal is torn down and
    /// told why.
    pub fn register(&self, principal: &Principal) -> Registration {
        let (sender, receiver) = mpsc::channel(self.inner.settings.send_queue_capacity.max(1));
        let closed = CancellationToken::new();
        let (key, displaced) = self.inner.registry.register(
            principal.id,
            &principal.username,
            sender.clone(),
            closed.clone(),
        );

        if let Some(previous) = displaced {
            let previous_key = ConnectionKey {
                principal_id: principal.id,
                connection_id: previous.id,
            };
            let notice = Response::error(
                ErrorCode::SessionReplaced,
                "Connection replaced by a newer session for the same user",
            );
            if previous.sender.try_send(notice).is_err() {
                debug!("Could not notify replaced connection {}", previous.id);
            }
            previous.closed.cancel();
            self.inner.cancel_tasks_for(previous_key);
        }

        info!(
            "Registered connection {} for {} ({})",
            key.connection_id, principal.username, principal.id
        );
        Registration {
            key,
            sender,
            receiver,
            closed,
        }
    }

    /// Tears down a connection and every forwarding task it owns. A key that no
    /// longer matches the registry entry is ignored.
    pub fn close_connection(&self, key: ConnectionKey) -> bool {
        self.inner.close_connection(key)
    }

    pub fn is_live(&self, key: ConnectionKey) -> bool {
        self.inner.registry.is_live(key)
    }

    pub fn is_subscribed(&self, key: ConnectionKey, topic: &str) -> bool {
        self.inner.registry.is_subscribed(key, topic)
    }

    /// Binds a broker consumer for `topic` and starts forwarding to the connection.
    /// Subscribing to a topic the connection already holds is a no-op.
    pub async fn subscribe(&self, key: ConnectionKey, topic: &str) -> Result<(), ProtocolError> {
        let cancel = match self.inner.registry.add_topic(key, topic) {
            TopicInsert::Added(cancel) => cancel,
            TopicInsert::AlreadySubscribed => {
                debug!("Connection {} already subscribed to {topic}", key.connection_id);
                return Ok(());
            }
            TopicInsert::NoConnection if self.inner.registry.has_principal(key.principal_id) => {
                return Err(ProtocolError::new(
                    ErrorCode::SessionReplaced,
                    "Connection replaced by a newer session for the same user",
                ))
            }
            TopicInsert::NoConnection => {
                return Err(ProtocolError::new(
                    ErrorCode::ConnectionClosed,
                    "Connection is closed",
                ))
            }
        };

        let stream = match self.inner.broker.subscribe(topic, None).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to bind subscription to {topic}: {e}");
                self.inner.registry.remove_topic(key, topic);
                return Err(ProtocolError::new(
                    ErrorCode::SubscriptionError,
                    format!("Error in subscription to topic {topic}: {e}"),
                ));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let subscription = (key, topic.to_string());
        let forwarder = Forwarder {
            inner: Arc::clone(&self.inner),
            key,
            topic: topic.to_string(),
            generation,
            cancel: cancel.clone(),
        };

        // The entry lock is held while spawning so the task cannot try to remove
        // itself before it has been recorded.
        match self.inner.tasks.entry(subscription) {
            Entry::Occupied(mut occupied) => {
                let handle = tokio::spawn(forwarder.run(stream));
                let stale = occupied.insert(ForwardingTask {
                    cancel,
                    generation,
                    handle,
                });
                stale.cancel.cancel();
                warn!(
                    "Replaced stale forwarding task generation {} for {topic}",
                    stale.generation
                );
            }
            Entry::Vacant(vacant) => {
                let handle = tokio::spawn(forwarder.run(stream));
                vacant.insert(ForwardingTask {
                    cancel,
                    generation,
                    handle,
                });
            }
        }
        info!("Connection {} subscribed to {topic}", key.connection_id);
        Ok(())
    }

    /// Removes `topic` from the connection and stops its forwarding task.
    pub fn unsubscribe(&self, key: ConnectionKey, topic: &str) -> bool {
        let removed = self.inner.registry.remove_topic(key, topic);
        if let Some((_, task)) = self.inner.tasks.remove(&(key, topic.to_string())) {
            task.cancel.cancel();
        }
        removed
    }

    /// Publishes on behalf of `principal`, stamping its identity into the payload.
    pub async fn publish(
        &self,
        principal: &Principal,
        topic: &str,
        data: Option<Payload>,
    ) -> Result<(), ProtocolError> {
        let mut payload = data.unwrap_or_default();
        payload.insert(
            USER_ID_FIELD.to_string(),
            Value::from(principal.id.to_string()),
        );
        payload.insert(
            USERNAME_FIELD.to_string(),
            Value::from(principal.username.clone()),
        );

        if self.inner.broker.publish(topic, payload, None).await {
            Ok(())
        } else {
            Err(ProtocolError::new(
                ErrorCode::PublishFailed,
                format!("Failed to publish to topic: {topic}"),
            ))
        }
    }

    /// Delivers `payload` straight to every local connection subscribed to
    /// `topic`, bypassing the broker. Returns the number of connections reached.
    pub async fn broadcast(&self, topic: &str, payload: Payload) -> usize {
        let mut delivered = 0;
        for (key, sender) in self.inner.registry.subscribers_of(topic) {
            let response = Response::message(topic, payload.clone());
            match self.inner.deliver(&sender, response).await {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => {}
                Delivery::Overflowed | Delivery::Closed => {
                    self.inner.close_connection(key);
                }
            }
        }
        debug!("Broadcast on {topic} reached {delivered} connection(s)");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn topics_for(&self, principal_id: PrincipalId) -> Vec<String> {
        self.inner.registry.topics_for(principal_id)
    }

    /// Closes every connection and waits for all forwarding tasks to finish.
    pub async fn shutdown(&self) {
        for (_, connection) in self.inner.registry.drain() {
            connection.closed.cancel();
        }

        let keys: Vec<SubscriptionKey> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, task)) = self.inner.tasks.remove(&key) {
                task.cancel.cancel();
                handles.push(task.handle);
            }
        }

        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Forwarding task ended abnormally: {e}");
            }
        }
        info!("Subscription manager shut down ({count} forwarding task(s) stopped)");
    }
}

enum Delivery {
    Sent,
    Dropped,
    Overflowed,
    Closed,
}

impl Inner {
    fn close_connection(&self, key: ConnectionKey) -> bool {
        match self.registry.unregister(key) {
            Some(connection) => {
                connection.closed.cancel();
                self.cancel_tasks_for(key);
                info!(
                    "Closed connection {} for {}",
                    connection.id, connection.username
                );
                true
            }
            None => false,
        }
    }

    fn cancel_tasks_for(&self, key: ConnectionKey) {
        self.tasks.retain(|(owner, _), task| {
            if *owner == key {
                task.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    async fn deliver(&self, sender: &Sender<Response>, response: Response) -> Delivery {
        match self.settings.overflow_policy {
            OverflowPolicy::DropNewest | OverflowPolicy::Disconnect => {
                match sender.try_send(response) {
                    Ok(()) => Delivery::Sent,
                    Err(TrySendError::Closed(_)) => Delivery::Closed,
                    Err(TrySendError::Full(_))
                        if self.settings.overflow_policy == OverflowPolicy::DropNewest =>
                    {
                        warn!("Outbound queue full, dropping message");
                        Delivery::Dropped
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue full, disconnecting slow consumer");
                        Delivery::Overflowed
                    }
                }
            }
            OverflowPolicy::Block => {
                match sender
                    .send_timeout(response, self.settings.block_timeout)
                    .await
                {
                    Ok(()) => Delivery::Sent,
                    Err(SendTimeoutError::Closed(_)) => Delivery::Closed,
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(
                            "Outbound queue still full after {:?}, disconnecting slow consumer",
                            self.settings.block_timeout
                        );
                        Delivery::Overflowed
                    }
                }
            }
        }
    }
}

struct Forwarder {
    inner: Arc<Inner>,
    key: ConnectionKey,
    topic: String,
    generation: u64,
    cancel: CancellationToken,
}

impl Forwarder {
    async fn run(self, mut stream: MessageStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let Some(sender) = self.inner.registry.subscribed_sender(self.key, &self.topic)
                    else {
                        debug!("Connection left {}, stopping forwarder", self.topic);
                        break;
                    };

                    let response = Response::message(&self.topic, message.into_payload());
                    let delivery = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        delivery = self.inner.deliver(&sender, response) => delivery,
                    };
                    match delivery {
                        Delivery::Sent | Delivery::Dropped => {}
                        Delivery::Overflowed | Delivery::Closed => {
                            self.inner.close_connection(self.key);
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("Error in subscription task for topic {}: {e}", self.topic);
                    if let Some(sender) = self.inner.registry.sender(self.key) {
                        let notice = Response::error(
                            ErrorCode::SubscriptionError,
                            format!("Error in subscription to topic {}: {e}", self.topic),
                        );
                        if sender.try_send(notice).is_err() {
                            debug!("Could not report subscription error for {}", self.topic);
                        }
                    }
                    self.retire();
                    break;
                }
                None => {
                    debug!("Broker stream for {} ended", self.topic);
                    self.retire();
                    break;
                }
            }
        }

        self.inner.tasks.remove_if(&(self.key, self.topic.clone()), |_, task| {
            task.generation == self.generation
        });
        // Dropping the stream here releases the broker consumer.
        drop(stream);
        trace!("Forwarder for {} (generation {}) exited", self.topic, self.generation);
    }

    /// Frees the topic so the client may subscribe again, unless the task has
    /// already been superseded or cancelled.
    fn retire(&self) {
        let owned = self
            .inner
            .tasks
            .remove_if(&(self.key, self.topic.clone()), |_, task| {
                task.generation == self.generation
            })
            .is_some();
        if owned {
            self.inner.registry.remove_topic(self.key, &self.topic);
        }
    }
}
