use crate::extractors::authenticated_principal::AuthenticatedPrincipal;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use domain::Principal;
use futures::{Sink, SinkExt, StreamExt};
use log::*;
use std::time::Duration;
use streaming::{Outbound, Response as Envelope, Session};
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket endpoint for topic streaming. The principal is resolved before the
/// upgrade so rejected clients get a plain HTTP status instead of a socket.
pub(crate) async fn ws_handler(
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    State(app_state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!("Upgrading streaming connection for principal {}", principal.id);
    ws.on_upgrade(move |socket| handle_socket(socket, principal, app_state))
}

async fn handle_socket(socket: WebSocket, principal: Principal, app_state: AppState) {
    let mut session = Session::new(principal, app_state.subscriptions.clone());
    let Some(Outbound { receiver, closed }) = session.open() else {
        return;
    };

    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(write_outbound(sink, receiver, closed.clone()));

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Streaming socket error: {e}");
                break;
            }
        }
    }

    session.close();
    closed.cancel();
    if let Err(e) = writer.await {
        warn!("Streaming writer task failed: {e}");
    }
}

/// Drains the outbound queue into the socket until `closed` fires. A client that
/// stops reading cannot hold the task: every send is raced against `closed`, and
/// the final flush is bounded by [`CLOSE_FLUSH_TIMEOUT`].
async fn write_outbound<S>(mut sink: S, mut receiver: Receiver<Envelope>, closed: CancellationToken)
where
    S: Sink<Message> + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            envelope = receiver.recv() => envelope,
        };
        let Some(envelope) = envelope else { break };

        let sent = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            sent = send_envelope(&mut sink, &envelope) => sent,
        };
        if sent.is_err() {
            closed.cancel();
            return;
        }
    }

    // Flush whatever was queued before the close, e.g. SESSION_REPLACED.
    let flush = async {
        while let Ok(envelope) = receiver.try_recv() {
            if send_envelope(&mut sink, &envelope).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    };
    if timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
        debug!("Gave up flushing to a client that stopped reading");
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("Dropping outbound envelope that failed to serialize: {e}");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::write_outbound;
    use crate::router::define_routes;
    use crate::test_support::{fixture, ALICE_TOKEN};
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(state: crate::AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, define_routes(state)).await;
        });
        addr
    }

    async fn connect(addr: SocketAddr, token: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .unwrap();
        client
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let frame = timeout(Duration::from_secs(2), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send(client: &mut Client, request: Value) {
        client
            .send(Message::text(request.to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_publish_and_receive_over_a_websocket() {
        let fixture = fixture();
        let topic = format!("user.{}.inbox", fixture.alice.id);
        let addr = serve(fixture.state).await;
        let mut client = connect(addr, ALICE_TOKEN).await;

        let welcome = next_json(&mut client).await;
        assert_eq!(welcome["operation"], json!("connect"));
        assert_eq!(welcome["status"], json!("success"));

        send(&mut client, json!({"operation": "subscribe", "topic": topic})).await;
        let ack = next_json(&mut client).await;
        assert_eq!(ack["operation"], json!("subscribe"));
        assert_eq!(ack["message"], json!(format!("Subscribed to topic: {topic}")));

        send(
            &mut client,
            json!({"operation": "publish", "topic": topic, "data": {"text": "hi"}}),
        )
        .await;

        // The publish ack and the forwarded message race through the same queue.
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(next_json(&mut client).await);
        }
        assert!(seen.iter().any(|r| r["operation"] == json!("publish")));
        let forwarded = seen
            .iter()
            .find(|r| r["operation"] == json!("message"))
            .unwrap();
        assert_eq!(forwarded["topic"], json!(topic));
        assert_eq!(forwarded["data"]["text"], json!("hi"));
        assert_eq!(forwarded["data"]["username"], json!("alice"));
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error_envelope() {
        let addr = serve(fixture().state).await;
        let mut client = connect(addr, ALICE_TOKEN).await;
        next_json(&mut client).await;

        client.send(Message::text("not json")).await.unwrap();

        let error = next_json(&mut client).await;
        assert_eq!(error["status"], json!("error"));
        assert_eq!(error["error_code"], json!("INVALID_JSON"));
    }

    #[tokio::test]
    async fn a_second_login_replaces_the_first_connection() {
        let fixture = fixture();
        let manager = fixture.state.subscriptions.clone();
        let addr = serve(fixture.state).await;

        let mut first = connect(addr, ALICE_TOKEN).await;
        next_json(&mut first).await;
        let mut second = connect(addr, ALICE_TOKEN).await;
        next_json(&mut second).await;

        let replaced = next_json(&mut first).await;
        assert_eq!(replaced["error_code"], json!("SESSION_REPLACED"));

        // The old socket is closed by the server once the notice is flushed.
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(manager.connection_count(), 1);
    }

    /// A socket whose client never reads: every send stays pending.
    struct StalledSink;

    impl futures::Sink<axum::extract::ws::Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: axum::extract::ws::Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn writer_stuck_on_a_stalled_client_exits_when_closed() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        let closed = tokio_util::sync::CancellationToken::new();
        sender
            .send(streaming::Response::connected("ada"))
            .await
            .unwrap();
        sender
            .send(streaming::Response::connected("ada"))
            .await
            .unwrap();

        let writer = tokio::spawn(write_outbound(StalledSink, receiver, closed.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        closed.cancel();
        assert!(timeout(Duration::from_secs(3), writer).await.is_ok());
    }
}
