//! Persistent connection to the controller.
//!
//! One connection at a time. After connecting the node sends `REGISTER`,
//! then serves requests until the socket drops or goes quiet for longer
//! than the read deadline, and reconnects after a fixed backoff. A
//! registration rejected with "not enrolled" ends the loop for good.
//!
//! All outbound frames go through a bounded queue drained by one writer
//! task. Responses are queued with `try_send` and dropped when the queue is
//! full; the controller times the request out.

use std::sync::Arc;
use std::time::Duration;

use exile_id::NodeId;
use exile_proto::{
    Envelope, NodeReportedStatus, ProtoError, RegisterRequest, RegisterResponse, ResponsePayload,
    ResponseStatus, Verb,
};
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SharedSettings};
use crate::dispatch::Dispatcher;
use crate::heartbeat::{self, SharedMetrics};
use crate::instance::InstanceManager;

/// Outbound queue size per connection.
pub const SEND_QUEUE_CAPACITY: usize = 256;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Registered,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("node not enrolled: {0}")]
    NotEnrolled(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("API key is not a valid header value")]
    InvalidApiKey,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("timed out connecting to controller after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no message from controller within {0:?}")]
    ReadTimeout(Duration),

    #[error("connection closed by controller")]
    Closed,
}

pub struct NodeClient {
    config: Config,
    manager: Arc<InstanceManager>,
    settings: SharedSettings,
    metrics: SharedMetrics,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConnectionState>,
    node_id: RwLock<Option<NodeId>>,
}

impl NodeClient {
    pub fn new(
        config: Config,
        manager: Arc<InstanceManager>,
        settings: SharedSettings,
        metrics: SharedMetrics,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&manager),
            Arc::clone(&settings),
            config.node_log_file.clone(),
        ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            manager,
            settings,
            metrics,
            dispatcher,
            state,
            node_id: RwLock::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Id assigned by the controller at the last successful registration.
    pub async fn node_id(&self) -> Option<NodeId> {
        self.node_id.read().await.clone()
    }

    /// Connects and serves until shutdown, reconnecting on any failure
    /// except [`ClientError::NotEnrolled`], which is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let backoff = self.config.reconnect_backoff;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let result = tokio::select! {
                result = self.connect_and_serve() => result,
                _ = shutdown.changed() => return Ok(()),
            };
            self.state.send_replace(ConnectionState::Disconnected);

            match result {
                Err(ClientError::NotEnrolled(reason)) => {
                    error!(
                        reason = %reason,
                        "Node is not enrolled with the controller; enroll it before restarting"
                    );
                    return Err(ClientError::NotEnrolled(reason));
                }
                Err(e) => warn!(
                    error = %e,
                    backoff_secs = backoff.as_secs(),
                    "Connection to controller lost, reconnecting"
                ),
                Ok(()) => info!(backoff_secs = backoff.as_secs(), "Controller closed connection, reconnecting"),
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn connect_and_serve(&self) -> Result<(), ClientError> {
        self.state.send_replace(ConnectionState::Connecting);

        let mut request = self.config.controller_url.as_str().into_client_request()?;
        if !self.config.api_key.is_empty() {
            let key = HeaderValue::from_str(&self.config.api_key)
                .map_err(|_| ClientError::InvalidApiKey)?;
            request.headers_mut().insert("X-API-Key", key);
        }

        info!(url = %self.config.controller_url, "Connecting to controller");
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::ConnectTimeout(CONNECT_TIMEOUT))??;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        self.state.send_replace(ConnectionState::Registering);
        let register = self.register_request().await;
        let frame = Envelope::notify(Verb::Register.as_str(), &register)?.to_json()?;
        ws_write.send(Message::Text(frame.into())).await?;
        info!(
            region = %register.region,
            host = %register.host,
            port = register.port,
            "Sent registration"
        );

        let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut writer = tokio::spawn({
            let mut cancel = cancel_rx.clone();
            async move {
                loop {
                    let frame = tokio::select! {
                        frame = rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                        _ = cancel.changed() => break,
                    };
                    if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                        error!(error = %e, "Write to controller failed");
                        break;
                    }
                }
                let _ = ws_write.close().await;
            }
        });
        self.spawn_connection_loops(tx.clone(), cancel_rx);

        let result = tokio::select! {
            result = self.read_loop(&mut ws_read, &tx) => result,
            // The writer only exits early when a write failed.
            _ = &mut writer => Err(ClientError::Closed),
        };

        // Stops the writer, heartbeat and metrics loops of this connection.
        let _ = cancel_tx.send(true);
        result
    }

    /// Starts the heartbeat and metrics loops once the controller accepts
    /// the registration. Both stop with the connection's cancel signal.
    fn spawn_connection_loops(&self, tx: mpsc::Sender<String>, mut cancel: watch::Receiver<bool>) {
        let mut state = self.state.subscribe();
        let heartbeat_interval = self.config.heartbeat_interval;
        let instances_dir = self.config.instances_dir.clone();
        let node_log_file = self.config.node_log_file.clone();
        let manager = Arc::clone(&self.manager);
        let settings = Arc::clone(&self.settings);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            tokio::select! {
                registered = state.wait_for(|s| *s == ConnectionState::Registered) => {
                    if registered.is_err() {
                        return;
                    }
                }
                _ = cancel.changed() => return,
            }
            tokio::spawn(heartbeat::run_metrics_loop(
                heartbeat_interval,
                instances_dir,
                node_log_file,
                Arc::clone(&metrics),
                cancel.clone(),
            ));
            heartbeat::run_heartbeat_loop(heartbeat_interval, manager, settings, metrics, tx, cancel).await;
        });
    }

    async fn register_request(&self) -> RegisterRequest {
        let settings = self.settings.read().await;
        RegisterRequest {
            region: settings.region.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            max_instances: settings.max_instances.max(1),
            current_instances: self.manager.instance_count().await as u32,
            status: NodeReportedStatus::Online,
        }
    }

    async fn read_loop<S>(&self, ws_read: &mut S, tx: &mpsc::Sender<String>) -> Result<(), ClientError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let deadline = self.config.read_deadline;
        loop {
            let next = tokio::time::timeout(deadline, ws_read.next())
                .await
                .map_err(|_| ClientError::ReadTimeout(deadline))?;
            let message = match next {
                Some(message) => message?,
                None => return Err(ClientError::Closed),
            };
            match message {
                Message::Text(text) => self.handle_frame(text.as_str(), tx).await?,
                Message::Close(frame) => {
                    debug!(?frame, "Received close frame");
                    return Ok(());
                }
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
            }
        }
    }

    /// Handles one inbound text frame. Requests run on their own task so a
    /// slow operation never blocks the read loop.
    pub(crate) async fn handle_frame(&self, text: &str, tx: &mpsc::Sender<String>) -> Result<(), ClientError> {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame");
                return Ok(());
            }
        };

        let Some(verb) = envelope.verb() else {
            debug!(verb = %envelope.kind, "Ignoring unknown verb");
            return Ok(());
        };
        if !verb.is_chatty() {
            info!(verb = %verb, request_id = ?envelope.request_id, "Received message");
        }

        match verb {
            Verb::RegisterResponse => return self.handle_register_response(&envelope).await,
            Verb::Register | Verb::Heartbeat | Verb::Response => {
                debug!(verb = %verb, "Ignoring controller-bound verb");
                return Ok(());
            }
            _ => {}
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let tx = tx.clone();
        tokio::spawn(async move {
            let request_id = envelope.request_id.clone();
            let verb = envelope.kind.clone();
            let handled = tokio::spawn(async move { dispatcher.dispatch(&envelope).await }).await;
            let response = match handled {
                Ok(response) => response,
                Err(e) => {
                    error!(verb = %verb, error = %e, "Request handler panicked");
                    request_id.map(|id| ResponsePayload::failure(id, format!("internal error handling {verb}")))
                }
            };
            if let Some(response) = response {
                queue_response(&tx, &response);
            }
        });
        Ok(())
    }

    async fn handle_register_response(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let response: RegisterResponse = envelope.payload_as()?;
        if response.status == ResponseStatus::Success {
            info!(node_id = ?response.id, "Registered with controller");
            *self.node_id.write().await = response.id;
            self.state.send_replace(ConnectionState::Registered);
            return Ok(());
        }

        let reason = response.error.clone().unwrap_or_default();
        error!(reason = %reason, "Registration failed");
        if response.is_not_enrolled() {
            Err(ClientError::NotEnrolled(reason))
        } else {
            Err(ClientError::Rejected(reason))
        }
    }
}

fn queue_response(tx: &mpsc::Sender<String>, response: &ResponsePayload) {
    let frame = match Envelope::response(response).and_then(|envelope| envelope.to_json()) {
        Ok(frame) => frame,
        Err(e) => {
            error!(request_id = %response.request_id, error = %e, "Failed to encode response");
            return;
        }
    };
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(request_id = %response.request_id, "Send queue full, dropping response");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(request_id = %response.request_id, "Connection gone, dropping response");
        }
    }
}
