//! WebSocket endpoint nodes connect to.
//!
//! A socket carries no identity until the node sends `REGISTER`; after that
//! every `HEARTBEAT` and `RESPONSE` on it is attributed to that node. Any
//! inbound message refreshes the read deadline, and the writer pings on a
//! fixed interval so an idle but healthy node keeps answering with pongs.

use std::ops::ControlFlow;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use exile_id::NodeId;
use exile_proto::{
    Envelope, HeartbeatPayload, RegisterRequest, RegisterResponse, ResponsePayload, Verb,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::hub::{ConnectionId, Link};
use crate::state::AppState;

pub const NODE_SOCKET_PATH: &str = "/api/nodes/ws";

/// Largest inbound message accepted from a node.
const MAX_MESSAGE_BYTES: usize = 512 * 1024;

/// How long the writer gets to flush queued frames after the read side ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn routes() -> Router<AppState> {
    Router::new().route(NODE_SOCKET_PATH, get(node_socket))
}

async fn node_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_node(socket, state))
}

/// Per-socket state while it is being served.
struct Session {
    state: AppState,
    connection: ConnectionId,
    outbound: mpsc::Sender<String>,
    /// Handed to the hub at registration.
    close: Option<watch::Sender<bool>>,
    node_id: Option<NodeId>,
}

async fn serve_node(socket: WebSocket, state: AppState) {
    let connection = state.hub().next_connection_id();
    let read_deadline = state.config().read_deadline;
    let ping_interval = state.config().ping_interval;
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(state.config().outbound_queue);
    let (close_tx, mut close_rx) = watch::channel(false);
    let (mut sender, mut receiver) = socket.split();
    debug!(connection, "Node socket opened");

    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sender.send(Message::Text(frame.into())).await {
                        debug!(connection, error = %e, "Write to node failed");
                        return;
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = sender.send(Message::Ping(Bytes::new())).await {
                        debug!(connection, error = %e, "Ping to node failed");
                        return;
                    }
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });
    let mut writer_done = false;

    let mut session = Session {
        state,
        connection,
        outbound,
        close: Some(close_tx),
        node_id: None,
    };

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(read_deadline, receiver.next()) => next,
            _ = close_rx.changed() => {
                info!(connection, node_id = ?session.node_id, "Connection replaced or closed by hub");
                break;
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };
        let message = match next {
            Err(_) => {
                warn!(
                    connection,
                    node_id = ?session.node_id,
                    deadline_secs = read_deadline.as_secs(),
                    "No message from node within read deadline"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection, node_id = ?session.node_id, error = %e, "Node socket error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if session.handle_text(text.as_str()).await.is_break() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Some(node_id) = session.node_id {
        session
            .state
            .hub()
            .unregister(node_id, session.connection)
            .await;
    }

    drop(session);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(connection, "Node socket closed");
}

impl Session {
    async fn handle_text(&mut self, text: &str) -> ControlFlow<()> {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection = self.connection, error = %e, "Ignoring malformed frame");
                return ControlFlow::Continue(());
            }
        };
        let Some(verb) = envelope.verb() else {
            debug!(connection = self.connection, verb = %envelope.kind, "Ignoring unknown verb");
            return ControlFlow::Continue(());
        };

        match verb {
            Verb::Register => self.handle_register(&envelope).await,
            Verb::Heartbeat => {
                let Some(node_id) = self.registered(verb) else {
                    return ControlFlow::Continue(());
                };
                match envelope.payload_as::<HeartbeatPayload>() {
                    Ok(heartbeat) => self.state.hub().heartbeat(node_id, &heartbeat).await,
                    Err(e) => warn!(node_id = %node_id, error = %e, "Invalid heartbeat"),
                }
                ControlFlow::Continue(())
            }
            Verb::Response => {
                let Some(node_id) = self.registered(verb) else {
                    return ControlFlow::Continue(());
                };
                match envelope.payload_as::<ResponsePayload>() {
                    Ok(response) => {
                        self.state.hub().handle_response(node_id, response);
                    }
                    Err(e) => warn!(node_id = %node_id, error = %e, "Invalid response"),
                }
                ControlFlow::Continue(())
            }
            _ => {
                debug!(connection = self.connection, verb = %verb, "Ignoring node-bound verb");
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_register(&mut self, envelope: &Envelope) -> ControlFlow<()> {
        if let Some(node_id) = self.node_id {
            warn!(node_id = %node_id, "Ignoring second REGISTER on the same connection");
            return ControlFlow::Continue(());
        }
        let request: RegisterRequest = match envelope.payload_as() {
            Ok(request) => request,
            Err(e) => {
                warn!(connection = self.connection, error = %e, "Invalid REGISTER payload");
                self.reply_register(&RegisterResponse::rejected(e.to_string()));
                return ControlFlow::Continue(());
            }
        };
        let Some(close) = self.close.take() else {
            return ControlFlow::Break(());
        };

        let link = Link {
            connection: self.connection,
            outbound: self.outbound.clone(),
            close,
        };
        match self.state.hub().register(&request, link).await {
            Ok(node_id) => {
                self.node_id = Some(node_id);
                self.reply_register(&RegisterResponse::accepted(node_id));
                ControlFlow::Continue(())
            }
            Err(RegistryError::NotEnrolled { host, port }) => {
                warn!(
                    connection = self.connection,
                    host = %host,
                    port,
                    "Rejected registration from node that is not enrolled"
                );
                self.reply_register(&RegisterResponse::rejected(RegisterResponse::NOT_ENROLLED));
                ControlFlow::Break(())
            }
            Err(e) => {
                error!(connection = self.connection, error = %e, "Registration failed");
                self.reply_register(&RegisterResponse::rejected(e.to_string()));
                ControlFlow::Break(())
            }
        }
    }

    fn registered(&self, verb: Verb) -> Option<NodeId> {
        if self.node_id.is_none() {
            debug!(connection = self.connection, verb = %verb, "Ignoring frame before REGISTER");
        }
        self.node_id
    }

    fn reply_register(&self, response: &RegisterResponse) {
        let frame = match Envelope::notify(Verb::RegisterResponse.as_str(), response)
            .and_then(|envelope| envelope.to_json())
        {
            Ok(frame) => frame,
            Err(e) => {
                error!(connection = self.connection, error = %e, "Failed to encode REGISTER_RESPONSE");
                return;
            }
        };
        if self.outbound.try_send(frame).is_err() {
            warn!(connection = self.connection, "Could not queue REGISTER_RESPONSE");
        }
    }
}
