//! `graphql-transport-ws` subscription transport over `tokio-tungstenite`.
//!
//! A single connection is opened lazily on the first subscription and shared
//! by all of them. It is owned by a background task that multiplexes
//! subscriptions by id:
//!
//! ```text
//! WsTransport::subscribe ──Command──▶ connection task ◀──frames──▶ server
//!          ▲                               │
//!          └──── per-subscription channel ◀┘
//! ```
//!
//! When the socket closes every live subscription receives
//! `TransportError::Closed`; the next subscribe opens a fresh connection.
//! The task also closes the socket itself once its last subscription
//! completes and no command is queued.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{
    ExecutionArgs, ExecutionResult, GraphqlError, RequestTarget, TransportError,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info_span, Instrument};

use super::SubscriptionTransport;
use crate::config::WsTransportConfig;

/// Subprotocol name negotiated in the upgrade request.
pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SubscriptionSender = mpsc::Sender<Result<ExecutionResult, TransportError>>;

// ---------------------------------------------------------------------------
// Protocol messages
// ---------------------------------------------------------------------------

/// Messages of the `graphql-transport-ws` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: ExecutionArgs,
    },
    Next {
        id: String,
        payload: ExecutionResult,
    },
    /// Payload is a list of errors; some servers send a single object.
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
}

impl WsMessage {
    fn to_frame(&self) -> Result<Message, TransportError> {
        serde_json::to_string(self)
            .map(Message::text)
            .map_err(|err| TransportError::Protocol(err.to_string()))
    }

    fn from_frame(message: &Message) -> Option<Result<Self, TransportError>> {
        let decoded = match message {
            Message::Text(text) => serde_json::from_str(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice(bytes),
            _ => return None,
        };
        Some(decoded.map_err(|err| TransportError::Protocol(err.to_string())))
    }
}

/// Decodes an `error` payload. Anything that is not a non-empty list of
/// GraphQL errors becomes a single error carrying the raw payload.
fn error_payload(payload: Value) -> Vec<GraphqlError> {
    let decoded = if payload.is_array() {
        serde_json::from_value::<Vec<GraphqlError>>(payload.clone())
    } else {
        serde_json::from_value::<GraphqlError>(payload.clone()).map(|err| vec![err])
    };
    match decoded {
        Ok(errors) if !errors.is_empty() => errors,
        _ => vec![GraphqlError::new(payload.to_string())],
    }
}

// ---------------------------------------------------------------------------
// WsTransport
// ---------------------------------------------------------------------------

enum Command {
    Subscribe {
        id: String,
        payload: ExecutionArgs,
        tx: SubscriptionSender,
    },
    Complete {
        id: String,
    },
}

struct WsShared {
    config: WsTransportConfig,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    next_id: AtomicU64,
}

/// Shared-connection subscription transport.
///
/// Operations' own request targets are ignored: every subscription goes to
/// the endpoint in [`WsTransportConfig`].
#[derive(Clone)]
pub struct WsTransport {
    shared: Arc<WsShared>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.shared.config.url)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    #[must_use]
    pub fn new(config: WsTransportConfig) -> Self {
        Self {
            shared: Arc::new(WsShared {
                config,
                commands: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queues `command` on the live connection task, spawning a new one if
    /// there is none or it has shut down. Returns the channel it went to.
    ///
    /// Holds the command lock across the send; an idle connection takes the
    /// same lock before it stops accepting commands.
    fn send(&self, command: Command) -> mpsc::UnboundedSender<Command> {
        let mut slot = self.shared.commands.lock();
        let command = match slot.as_ref() {
            Some(tx) => match tx.send(command) {
                Ok(()) => return tx.clone(),
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => command,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is still in hand, so this cannot fail.
        let _ = tx.send(command);
        let config = self.shared.config.clone();
        let span = info_span!("ws_connection", url = %config.url);
        tokio::spawn(run_connection(config, Arc::downgrade(&self.shared), rx).instrument(span));
        *slot = Some(tx.clone());
        tx
    }
}

impl SubscriptionTransport for WsTransport {
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    fn subscribe(
        &self,
        _request: &RequestTarget,
        args: &ExecutionArgs,
    ) -> BoxStream<'static, Result<ExecutionResult, TransportError>> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::channel(self.shared.config.channel_capacity.max(1));

        let commands = self.send(Command::Subscribe {
            id: id.clone(),
            payload: args.clone(),
            tx,
        });

        SubscriptionStream {
            id,
            rx,
            commands,
            done: false,
        }
        .boxed()
    }
}

/// Receiving half of one subscription. Dropping it before the server
/// completes sends `complete`.
struct SubscriptionStream {
    id: String,
    rx: mpsc::Receiver<Result<ExecutionResult, TransportError>>,
    commands: mpsc::UnboundedSender<Command>,
    done: bool,
}

impl Stream for SubscriptionStream {
    type Item = Result<ExecutionResult, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if matches!(polled, Poll::Ready(None | Some(Err(_)))) {
            self.done = true;
        }
        polled
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.commands.send(Command::Complete {
                id: std::mem::take(&mut self.id),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn connect(config: &WsTransportConfig) -> Result<Socket, TransportError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| TransportError::Connect(err.to_string()))?;
    for (name, value) in &config.headers {
        request.headers_mut().append(name.clone(), value.clone());
    }
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(GRAPHQL_TRANSPORT_WS),
    );

    let (mut socket, _) =
        tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Connect(err.to_string()))?;

    let init = WsMessage::ConnectionInit {
        payload: config.connection_init_payload.clone(),
    };
    socket
        .send(init.to_frame()?)
        .await
        .map_err(|err| TransportError::Io(err.to_string()))?;

    tokio::time::timeout(config.ack_timeout, await_ack(&mut socket))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(socket)
}

async fn await_ack(socket: &mut Socket) -> Result<(), TransportError> {
    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|err| TransportError::Io(err.to_string()))?;
        if matches!(frame, Message::Close(_)) {
            return Err(TransportError::Closed);
        }
        match WsMessage::from_frame(&frame) {
            None => {}
            Some(Ok(WsMessage::ConnectionAck { .. })) => return Ok(()),
            Some(Ok(WsMessage::Ping { payload })) => {
                socket
                    .send(WsMessage::Pong { payload }.to_frame()?)
                    .await
                    .map_err(|err| TransportError::Io(err.to_string()))?;
            }
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!(
                    "expected connection_ack, got {other:?}"
                )));
            }
            Some(Err(err)) => return Err(err),
        }
    }
    Err(TransportError::Closed)
}

async fn run_connection(
    config: WsTransportConfig,
    shared: Weak<WsShared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let socket = match connect(&config).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::warn!(error = %err, "websocket connection failed");
            fail_pending(&mut commands, &err);
            return;
        }
    };
    tracing::debug!("websocket connection acknowledged");

    let (write, mut read) = socket.split();
    let mut connection = Connection {
        write,
        subscriptions: HashMap::new(),
    };

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    // Transport and every stream dropped.
                    let _ = connection.write.send(Message::Close(None)).await;
                    return;
                };
                if let Err(err) = connection.handle_command(command).await {
                    tracing::warn!(error = %err, "websocket write failed");
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(frame)) => {
                        if let Err(err) = connection.handle_frame(&frame).await {
                            tracing::warn!(error = %err, "websocket write failed");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "websocket read failed");
                        break;
                    }
                }
            }
        }

        if connection.subscriptions.is_empty() && release_idle(&shared, &mut commands) {
            tracing::debug!("closing idle websocket connection");
            let _ = connection.write.send(Message::Close(None)).await;
            return;
        }
    }

    tracing::debug!(
        subscriptions = connection.subscriptions.len(),
        "websocket connection closed"
    );
    for (_, tx) in connection.subscriptions.drain() {
        let _ = tx.try_send(Err(TransportError::Closed));
    }
    fail_pending(&mut commands, &TransportError::Closed);
}

/// Stops accepting commands if none are queued. Subscriptions are only sent
/// under the transport's command lock, so none can slip in after the check.
fn release_idle(
    shared: &Weak<WsShared>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let shared = shared.upgrade();
    let _slot = shared.as_ref().map(|shared| shared.commands.lock());
    if !commands.is_empty() {
        return false;
    }
    commands.close();
    true
}

/// Stops accepting commands and fails every queued subscription.
fn fail_pending(commands: &mut mpsc::UnboundedReceiver<Command>, err: &TransportError) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Subscribe { tx, .. } = command {
            let _ = tx.try_send(Err(err.clone()));
        }
    }
}

struct Connection {
    write: SplitSink<Socket, Message>,
    subscriptions: HashMap<String, SubscriptionSender>,
}

impl Connection {
    async fn send(&mut self, message: &WsMessage) -> Result<(), TransportError> {
        self.write
            .send(message.to_frame()?)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), TransportError> {
        match command {
            Command::Subscribe { id, payload, tx } => {
                let message = WsMessage::Subscribe {
                    id: id.clone(),
                    payload,
                };
                if let Err(err) = self.send(&message).await {
                    let _ = tx.try_send(Err(err.clone()));
                    return Err(err);
                }
                self.subscriptions.insert(id, tx);
            }
            Command::Complete { id } => {
                if self.subscriptions.remove(&id).is_some() {
                    self.send(&WsMessage::Complete { id }).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: &Message) -> Result<(), TransportError> {
        let message = match WsMessage::from_frame(frame) {
            None => return Ok(()),
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "ignoring undecodable websocket message");
                return Ok(());
            }
        };

        match message {
            WsMessage::Next { id, payload } => {
                let Some(tx) = self.subscriptions.get(&id) else {
                    return Ok(());
                };
                if tx.send(Ok(payload)).await.is_err() {
                    self.subscriptions.remove(&id);
                    self.send(&WsMessage::Complete { id }).await?;
                }
            }
            WsMessage::Error { id, payload } => {
                if let Some(tx) = self.subscriptions.remove(&id) {
                    let result = ExecutionResult {
                        errors: Some(error_payload(payload)),
                        ..ExecutionResult::default()
                    };
                    let _ = tx.send(Ok(result)).await;
                }
            }
            WsMessage::Complete { id } => {
                self.subscriptions.remove(&id);
            }
            WsMessage::Ping { payload } => self.send(&WsMessage::Pong { payload }).await?,
            WsMessage::Pong { .. } | WsMessage::ConnectionAck { .. } => {}
            other @ (WsMessage::ConnectionInit { .. } | WsMessage::Subscribe { .. }) => {
                tracing::warn!(message = ?other, "unexpected client message from server");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn messages_use_protocol_type_tags() {
        let init = serde_json::to_value(WsMessage::ConnectionInit { payload: None }).unwrap();
        assert_eq!(init, json!({ "type": "connection_init" }));

        let subscribe = serde_json::to_value(WsMessage::Subscribe {
            id: "1".to_string(),
            payload: ExecutionArgs::new("subscription { ticks }"),
        })
        .unwrap();
        assert_eq!(
            subscribe,
            json!({
                "type": "subscribe",
                "id": "1",
                "payload": { "query": "subscription { ticks }" }
            })
        );
    }

    #[test]
    fn next_message_decodes_execution_result() {
        let message: WsMessage =
            serde_json::from_str(r#"{"type":"next","id":"3","payload":{"data":{"ticks":1}}}"#)
                .unwrap();
        assert_eq!(
            message,
            WsMessage::Next {
                id: "3".to_string(),
                payload: ExecutionResult {
                    data: Some(json!({ "ticks": 1 })),
                    ..ExecutionResult::default()
                },
            }
        );
    }

    #[test]
    fn error_payload_accepts_list_or_object() {
        let list = error_payload(json!([{ "message": "a" }, { "message": "b" }]));
        assert_eq!(list.len(), 2);

        let single = error_payload(json!({ "message": "c" }));
        assert_eq!(single, vec![GraphqlError::new("c")]);
    }

    #[test]
    fn malformed_error_payload_is_still_an_error() {
        let raw = error_payload(json!("internal failure"));
        assert_eq!(raw, vec![GraphqlError::new("\"internal failure\"")]);

        let empty = error_payload(json!([]));
        assert_eq!(empty, vec![GraphqlError::new("[]")]);

        let result = ExecutionResult {
            errors: Some(error_payload(json!({ "code": 500 }))),
            ..ExecutionResult::default()
        };
        assert!(result.graphql_errors().is_some());
    }

    #[tokio::test]
    async fn unreachable_server_fails_the_subscription() {
        let transport = WsTransport::new(WsTransportConfig::new("ws://127.0.0.1:9/graphql"));
        let mut stream =
            transport.subscribe(&RequestTarget::default(), &ExecutionArgs::new("subscription { x }"));

        let first = stream.next().await;
        assert!(matches!(first, Some(Err(_))));
        assert!(stream.next().await.is_none());
    }
}
