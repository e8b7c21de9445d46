use crate::message::Response;
use dashmap::DashMap;
use domain::Id;
use log::*;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type PrincipalId = Id;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addresses one specific connection of a principal. A key whose connection id no
/// longer matches the registry entry refers to a connection that was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub principal_id: PrincipalId,
    pub connection_id: ConnectionId,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub username: String,
    pub sender: Sender<Response>,
    /// Cancelled when the connection is torn down. Every subscription token is a
    /// child of it.
    pub closed: CancellationToken,
    topics: HashSet<String>,
}

impl Connection {
    pub fn topics(&self) -> &HashSet<String> {
        &self.topics
    }
}

/// Result of adding a topic to a connection's subscribed set.
#[derive(Debug)]
pub enum TopicInsert {
    /// Newly subscribed; the token cancels when the connection closes.
    Added(CancellationToken),
    AlreadySubscribed,
    NoConnection,
}

/// Live connections, one entry per principal.
///
/// All "still registered / still subscribed" reads and topic set writes happen
/// under the entry's shard lock, so each is atomic with respect to the others.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<PrincipalId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `principal_id`, returning its key and the
    /// connection it displaced, if any.
    pub fn register(
        &self,
        principal_id: PrincipalId,
        username: &str,
        sender: Sender<Response>,
        closed: CancellationToken,
    ) -> (ConnectionKey, Option<Connection>) {
        let id = ConnectionId::new();
        let displaced = self.connections.insert(
            principal_id,
            Connection {
                id,
                username: username.to_string(),
                sender,
                closed,
                topics: HashSet::new(),
            },
        );
        if let Some(previous) = &displaced {
            info!(
                "Connection {} for {username} ({principal_id}) replaced by {id}",
                previous.id
            );
        }

        (
            ConnectionKey {
                principal_id,
                connection_id: id,
            },
            displaced,
        )
    }

    /// Removes the connection if `key` still refers to it.
    pub fn unregister(&self, key: ConnectionKey) -> Option<Connection> {
        self.connections
            .remove_if(&key.principal_id, |_, connection| {
                connection.id == key.connection_id
            })
            .map(|(_, connection)| connection)
    }

    pub fn is_live(&self, key: ConnectionKey) -> bool {
        self.connections
            .get(&key.principal_id)
            .is_some_and(|connection| connection.id == key.connection_id)
    }

    /// Whether some connection, not necessarily `key`'s, is registered for its principal.
    pub fn has_principal(&self, principal_id: PrincipalId) -> bool {
        self.connections.contains_key(&principal_id)
    }

    pub fn is_subscribed(&self, key: ConnectionKey, topic: &str) -> bool {
        self.subscribed_sender(key, topic).is_some()
    }

    /// The connection's outbound sender, provided it is still live and subscribed to `topic`.
    pub fn subscribed_sender(&self, key: ConnectionKey, topic: &str) -> Option<Sender<Response>> {
        self.connections
            .get(&key.principal_id)
            .filter(|connection| {
                connection.id == key.connection_id && connection.topics.contains(topic)
            })
            .map(|connection| connection.sender.clone())
    }

    pub fn sender(&self, key: ConnectionKey) -> Option<Sender<Response>> {
        self.connections
            .get(&key.principal_id)
            .filter(|connection| connection.id == key.connection_id)
            .map(|connection| connection.sender.clone())
    }

    pub fn add_topic(&self, key: ConnectionKey, topic: &str) -> TopicInsert {
        match self.connections.get_mut(&key.principal_id) {
            Some(mut connection) if connection.id == key.connection_id => {
                if connection.topics.insert(topic.to_string()) {
                    TopicInsert::Added(connection.closed.child_token())
                } else {
                    TopicInsert::AlreadySubscribed
                }
            }
            _ => TopicInsert::NoConnection,
        }
    }

    /// Returns whether the topic was in the connection's set.
    pub fn remove_topic(&self, key: ConnectionKey, topic: &str) -> bool {
        match self.connections.get_mut(&key.principal_id) {
            Some(mut connection) if connection.id == key.connection_id => {
                connection.topics.remove(topic)
            }
            _ => false,
        }
    }

    /// Senders of every connection subscribed to `topic`.
    pub fn subscribers_of(&self, topic: &str) -> Vec<(ConnectionKey, Sender<Response>)> {
        self.connections
            .iter()
            .filter(|entry| entry.topics.contains(topic))
            .map(|entry| {
                (
                    ConnectionKey {
                        principal_id: *entry.key(),
                        connection_id: entry.id,
                    },
                    entry.sender.clone(),
                )
            })
            .collect()
    }

    pub fn topics_for(&self, principal_id: PrincipalId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .connections
            .get(&principal_id)
            .map(|connection| connection.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Removes every connection, returning them.
    pub fn drain(&self) -> Vec<(PrincipalId, Connection)> {
        let principals: Vec<PrincipalId> = self.connections.iter().map(|e| *e.key()).collect();
        principals
            .into_iter()
            .filter_map(|principal_id| self.connections.remove(&principal_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
