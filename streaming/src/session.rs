//! Per-connection protocol handling.
//!
//! A [`Session`] moves through `Connecting -> Open -> Closed`. While open it
//! decodes each inbound frame, gates it through the authorization policy and hands
//! it to the [`SubscriptionManager`]. Replies share the connection's outbound queue
//! with forwarded messages.

use crate::connection::ConnectionKey;
use crate::manager::SubscriptionManager;
use crate::message::{self, ErrorCode, Operation, ProtocolError, Request, Response, ResponseOperation};
use domain::{authorize, Action, Principal};
use log::*;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Terminal.
    Closed,
}

/// The socket side of an open session: drain `receiver` to the client and stop
/// once `closed` fires.
pub struct Outbound {
    pub receiver: Receiver<Response>,
    pub closed: CancellationToken,
}

pub struct Session {
    principal: Principal,
    manager: SubscriptionManager,
    state: ConnectionState,
    connection: Option<OpenConnection>,
}

struct OpenConnection {
    key: ConnectionKey,
    sender: Sender<Response>,
    closed: CancellationToken,
}

impl Session {
    pub fn new(principal: Principal, manager: SubscriptionManager) -> Self {
        Self {
            principal,
            manager,
            state: ConnectionState::Connecting,
            connection: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn key(&self) -> Option<ConnectionKey> {
        self.connection.as_ref().map(|open| open.key)
    }

    /// Registers the connection and queues the welcome envelope. Only valid from
    /// `Connecting`.
    pub fn open(&mut self) -> Option<Outbound> {
        if self.state != ConnectionState::Connecting {
            warn!("Ignoring open on a session in state {:?}", self.state);
            return None;
        }

        let registration = self.manager.register(&self.principal);
        if registration
            .sender
            .try_send(Response::connected(&self.principal.username))
            .is_err()
        {
            warn!("Could not queue welcome for {}", self.principal.username);
        }

        self.connection = Some(OpenConnection {
            key: registration.key,
            sender: registration.sender,
            closed: registration.closed.clone(),
        });
        self.state = ConnectionState::Open;
        info!(
            "User {} ({}) connected to streaming service",
            self.principal.username, self.principal.id
        );

        Some(Outbound {
            receiver: registration.receiver,
            closed: registration.closed,
        })
    }

    /// Handles one inbound text frame and queues the reply. Returns without a
    /// reply once the connection has been closed, even if its queue is full.
    pub async fn handle_text(&self, text: &str) {
        let Some(open) = self.connection.as_ref() else {
            debug!("Dropping frame received outside of an open session");
            return;
        };
        if open.closed.is_cancelled() {
            debug!("Dropping frame received on a closed connection");
            return;
        }

        let response = self.dispatch(open.key, text).await;
        tokio::select! {
            _ = open.closed.cancelled() => {
                debug!("Connection closed before reply could be queued");
            }
            queued = open.sender.send(response) => {
                if queued.is_err() {
                    debug!("Outbound queue closed before reply could be queued");
                }
            }
        }
    }

    async fn dispatch(&self, key: ConnectionKey, text: &str) -> Response {
        match self.execute(key, text).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request from {} failed: {e}", self.principal.username);
                e.into()
            }
        }
    }

    async fn execute(&self, key: ConnectionKey, text: &str) -> Result<Response, ProtocolError> {
        let request = message::decode(text)?;
        let topic = request.topic.as_str();

        match request.operation {
            Operation::Subscribe => {
                self.authorize(Action::Subscribe, &request)?;
                self.manager.subscribe(key, topic).await?;
                info!(
                    "User {} ({}) subscribed to topic: {topic}",
                    self.principal.username, self.principal.id
                );
                Ok(Response::success(
                    ResponseOperation::Subscribe,
                    topic,
                    format!("Subscribed to topic: {topic}"),
                ))
            }
            Operation::Unsubscribe => {
                self.manager.unsubscribe(key, topic);
                info!(
                    "User {} ({}) unsubscribed from topic: {topic}",
                    self.principal.username, self.principal.id
                );
                Ok(Response::success(
                    ResponseOperation::Unsubscribe,
                    topic,
                    format!("Unsubscribed from topic: {topic}"),
                ))
            }
            Operation::Publish => {
                self.authorize(Action::Publish, &request)?;
                self.manager
                    .publish(&self.principal, topic, request.data)
                    .await?;
                info!(
                    "User {} ({}) published to topic: {topic}",
                    self.principal.username, self.principal.id
                );
                Ok(Response::success(
                    ResponseOperation::Publish,
                    topic,
                    format!("Published to topic: {topic}"),
                ))
            }
        }
    }

    fn authorize(&self, action: Action, request: &Request) -> Result<(), ProtocolError> {
        let decision = authorize(
            &self.principal,
            action,
            &request.topic,
            request.entity.as_ref(),
        );
        if decision.is_allowed() {
            debug!(
                "Allowed {action} on {} for {} ({:?})",
                request.topic,
                self.principal.username,
                decision.rule()
            );
            Ok(())
        } else {
            info!(
                "Denied {action} on {} for {} ({:?})",
                request.topic,
                self.principal.username,
                decision.rule()
            );
            Err(ProtocolError::new(
                ErrorCode::PermissionDenied,
                format!("No permission to {action} to topic: {}", request.topic),
            ))
        }
    }

    /// Unregisters the connection and stops its forwarders. Idempotent.
    pub fn close(&mut self) {
        if let Some(open) = self.connection.take() {
            self.manager.close_connection(open.key);
        }
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            info!(
                "User {} ({}) disconnected from streaming service",
                self.principal.username, self.principal.id
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{OverflowPolicy, SubscriptionSettings};
    use crate::message::Status;
    use crate::testing::*;
    use broker::{BrokerClient, MemoryBroker, Payload};
    use domain::topic::{entity_topic, public_topic, user_topic};
    use domain::{Id, Role};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> (Arc<MemoryBroker>, SubscriptionManager) {
        let broker = Arc::new(MemoryBroker::broadcast());
        let manager = SubscriptionManager::new(broker.clone(), SubscriptionSettings::default());
        (broker, manager)
    }

    /// Opens a session and consumes its welcome envelope.
    async fn open(principal: Principal, manager: &SubscriptionManager) -> (Session, Outbound) {
        let mut session = Session::new(principal, manager.clone());
        let mut outbound = session.open().unwrap();
        let welcome = next_response(&mut outbound.receiver).await;
        assert_eq!(welcome.operation, ResponseOperation::Connect);
        (session, outbound)
    }

    async fn request(session: &Session, outbound: &mut Outbound, body: serde_json::Value) -> Response {
        session.handle_text(&body.to_string()).await;
        next_response(&mut outbound.receiver).await
    }

    #[tokio::test]
    async fn open_registers_and_welcomes() {
        let (_broker, manager) = manager();
        let mut session = Session::new(Principal::new(Id::new_v4(), "ada"), manager.clone());
        assert_eq!(session.state(), ConnectionState::Connecting);

        let mut outbound = session.open().unwrap();
        let welcome = next_response(&mut outbound.receiver).await;

        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(welcome.status, Status::Success);
        assert_eq!(
            welcome.message.as_deref(),
            Some("Connected to streaming service as ada")
        );
        assert_eq!(manager.connection_count(), 1);
        assert!(session.open().is_none());
    }

    #[tokio::test]
    async fn protocol_errors_leave_the_session_usable() {
        let (_broker, manager) = manager();
        let (session, mut outbound) = open(Principal::new(Id::new_v4(), "ada"), &manager).await;

        session.handle_text("{oops").await;
        let response = next_response(&mut outbound.receiver).await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidJson));

        let response = request(&session, &mut outbound, json!({"topic": "public.x"})).await;
        assert_eq!(response.error_code, Some(ErrorCode::ValidationError));

        let response = request(
            &session,
            &mut outbound,
            json!({"operation": "replay", "topic": "public.x"}),
        )
        .await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidOperation));

        let response = request(
            &session,
            &mut outbound,
            json!({"operation": "subscribe", "topic": "public.x"}),
        )
        .await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.message.as_deref(), Some("Subscribed to topic: public.x"));
    }

    #[tokio::test]
    async fn read_order_may_subscribe_but_not_publish() {
        let (broker, manager) = manager();
        let principal =
            Principal::new(Id::new_v4(), "ada").with_role(Role::new("viewer", &["read_order"]));
        let (session, mut outbound) = open(principal, &manager).await;
        let order_id = Id::new_v4();
        let topic = entity_topic("order", order_id);

        let subscribe = json!({
            "operation": "subscribe",
            "topic": topic,
            "entity_type": "order",
            "entity_id": order_id
        });
        let response = request(&session, &mut outbound, subscribe).await;
        assert_eq!(response.status, Status::Success);

        let publish = json!({
            "operation": "publish",
            "topic": topic,
            "entity_type": "order",
            "entity_id": order_id,
            "data": {"status": "shipped"}
        });
        let response = request(&session, &mut outbound, publish).await;
        assert_eq!(response.error_code, Some(ErrorCode::PermissionDenied));
        assert_eq!(
            response.message,
            Some(format!("No permission to publish to topic: {topic}"))
        );

        // Nothing reached the broker.
        assert_quiet(&mut outbound.receiver).await;

        broker
            .publish(&topic, payload(json!({"status": "packed"})), None)
            .await;
        let forwarded = next_response(&mut outbound.receiver).await;
        assert_eq!(forwarded.operation, ResponseOperation::Message);
        assert_eq!(forwarded.data.unwrap()["status"], json!("packed"));
    }

    #[tokio::test]
    async fn denied_subscribe_changes_nothing() {
        let (_broker, manager) = manager();
        let principal = Principal::new(Id::new_v4(), "ada");
        let principal_id = principal.id;
        let (session, mut outbound) = open(principal, &manager).await;

        let response = request(
            &session,
            &mut outbound,
            json!({"operation": "subscribe", "topic": user_topic(Id::new_v4(), "inbox")}),
        )
        .await;

        assert_eq!(response.error_code, Some(ErrorCode::PermissionDenied));
        assert!(manager.topics_for(principal_id).is_empty());
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn publishing_to_an_own_topic_round_trips_with_identity() {
        let (_broker, manager) = manager();
        let principal = Principal::new(Id::new_v4(), "ada");
        let topic = user_topic(principal.id, "notes");
        let (session, mut outbound) = open(principal.clone(), &manager).await;

        request(
            &session,
            &mut outbound,
            json!({"operation": "subscribe", "topic": topic}),
        )
        .await;
        let ack = request(
            &session,
            &mut outbound,
            json!({"operation": "publish", "topic": topic, "data": {"text": "hello"}}),
        )
        .await;
        assert_eq!(ack.operation, ResponseOperation::Publish);
        assert_eq!(ack.message, Some(format!("Published to topic: {topic}")));

        let forwarded = next_response(&mut outbound.receiver).await.data.unwrap();
        assert_eq!(forwarded["text"], json!("hello"));
        assert_eq!(forwarded["user_id"], json!(principal.id.to_string()));
        assert_eq!(forwarded["username"], json!("ada"));
    }

    #[tokio::test]
    async fn unsubscribe_is_acknowledged_without_authorization() {
        let (_broker, manager) = manager();
        let (session, mut outbound) = open(Principal::new(Id::new_v4(), "ada"), &manager).await;

        let response = request(
            &session,
            &mut outbound,
            json!({"operation": "unsubscribe", "topic": "system.internal"}),
        )
        .await;

        assert_eq!(response.status, Status::Success);
        assert_eq!(response.operation, ResponseOperation::Unsubscribe);
        assert_eq!(
            response.message.as_deref(),
            Some("Unsubscribed from topic: system.internal")
        );
    }

    #[tokio::test]
    async fn unrelated_entity_events_do_not_reach_public_subscribers() {
        let (broker, manager) = manager();
        let (session, mut outbound) = open(Principal::new(Id::new_v4(), "ada"), &manager).await;

        request(
            &session,
            &mut outbound,
            json!({"operation": "subscribe", "topic": public_topic("announcements")}),
        )
        .await;

        let mut event = Payload::new();
        event.insert("event_type".into(), json!("created"));
        broker
            .publish(&entity_topic("Invoice", Id::new_v4()), event, None)
            .await;

        assert_quiet(&mut outbound.receiver).await;
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let (broker, manager) = manager();
        let (mut session, mut outbound) =
            open(Principal::new(Id::new_v4(), "ada"), &manager).await;
        request(
            &session,
            &mut outbound,
            json!({"operation": "subscribe", "topic": "public.idle"}),
        )
        .await;

        session.close();
        session.close();

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(outbound.closed.is_cancelled());
        assert_eq!(manager.connection_count(), 0);
        eventually(|| broker.active_consumers() == 0).await;

        session
            .handle_text(r#"{"operation": "subscribe", "topic": "public.x"}"#)
            .await;
        assert!(outbound.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn replies_are_abandoned_once_an_overflowing_connection_is_closed() {
        let broker = Arc::new(MemoryBroker::broadcast());
        let manager = SubscriptionManager::new(
            broker,
            SubscriptionSettings {
                send_queue_capacity: 1,
                overflow_policy: OverflowPolicy::Disconnect,
                ..SubscriptionSettings::default()
            },
        );
        let mut session = Session::new(Principal::new(Id::new_v4(), "ada"), manager.clone());
        // The welcome alone fills the queue and nobody drains it.
        let outbound = session.open().unwrap();

        manager.close_connection(session.key().unwrap());
        assert!(outbound.closed.is_cancelled());

        let handled = tokio::time::timeout(
            Duration::from_secs(1),
            session.handle_text(r#"{"operation": "subscribe", "topic": "public.x"}"#),
        )
        .await;
        assert!(handled.is_ok());
    }

    #[tokio::test]
    async fn a_reply_blocked_on_a_full_queue_is_released_by_close() {
        let manager = SubscriptionManager::new(
            Arc::new(MemoryBroker::broadcast()),
            SubscriptionSettings {
                send_queue_capacity: 1,
                ..SubscriptionSettings::default()
            },
        );
        let mut session = Session::new(Principal::new(Id::new_v4(), "ada"), manager.clone());
        let outbound = session.open().unwrap();
        let key = session.key().unwrap();

        let closer = {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                manager.close_connection(key);
            })
        };
        let handled = tokio::time::timeout(
            Duration::from_secs(1),
            session.handle_text(r#"{"operation": "unsubscribe", "topic": "public.x"}"#),
        )
        .await;

        assert!(handled.is_ok());
        assert!(outbound.closed.is_cancelled());
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_session_unregisters_it() {
        let (_broker, manager) = manager();
        let (session, outbound) = open(Principal::new(Id::new_v4(), "ada"), &manager).await;

        drop(session);

        assert!(outbound.closed.is_cancelled());
        assert_eq!(manager.connection_count(), 0);
    }
}
