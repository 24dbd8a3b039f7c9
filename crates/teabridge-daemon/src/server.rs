//! WebSocket bridge server.
//!
//! Accepts client connections on one path, checks the connection token, then
//! serves requests through the [`Dispatcher`] and fans broadcast events out to
//! every connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use teabridge_rpc::{
    CLOSE_INVALID_TOKEN, Consumer, ConsumerId, Event, Frame, FrameReassembler, MessageType, Payload,
    PublishOutcome, ResponsePayload, ServerConfig, Subscription, SubscriptionRegistry, WILDCARD,
    encode_frame,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::handlers::register_builtin;
use crate::session::{ConnectionConsumer, SessionId};

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The daemon side of the bridge.
///
/// Events published before any consumer has attached are buffered and handed
/// to the first one, which is usually the first client connection.
pub struct BridgeServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
    broadcast: SubscriptionRegistry,
    inbound: SubscriptionRegistry,
    sessions: Mutex<HashMap<SessionId, ConsumerId>>,
    shutdown: CancellationToken,
}

impl BridgeServer {
    /// Create a server with the built-in methods registered.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let dispatcher = Dispatcher::new();
        let broadcast = SubscriptionRegistry::buffered();
        register_builtin(&dispatcher, &broadcast);

        Arc::new(Self {
            config,
            dispatcher,
            broadcast,
            inbound: SubscriptionRegistry::unbuffered(),
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Method registry; register application handlers here.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        info!(
            "Bridge listening on ws://{}{}",
            listener.local_addr()?,
            self.config.path
        );
        Ok(listener)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Accept failures are logged and retried; this currently always returns `Ok`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    debug!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }

        info!("Bridge server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        info!("Shutting down bridge server");
        self.shutdown.cancel();
    }

    /// Broadcast an event to all connected clients and in-process subscribers.
    pub fn publish(&self, topic: impl Into<String>, payload: Payload) -> PublishOutcome {
        let outcome = self.broadcast.publish(Event::new(topic, payload));
        trace!("Published event: {:?}", outcome);
        outcome
    }

    /// In-process subscription to broadcast events.
    #[must_use]
    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> Subscription {
        Subscription::attach(&self.broadcast, topics)
    }

    /// Subscription to events sent by clients.
    #[must_use]
    pub fn on_client_event<S: AsRef<str>>(&self, topics: &[S]) -> Subscription {
        Subscription::attach(&self.inbound, topics)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sessions.lock().len()
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let expected_path = self.config.path.clone();
        let mut token: Option<String> = None;

        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                if request.uri().path() != expected_path {
                    let mut rejection = ErrorResponse::new(Some("Not found".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    return Err(rejection);
                }
                token = request.uri().query().and_then(|query| {
                    url::form_urlencoded::parse(query.as_bytes())
                        .find(|(key, _)| key == "token")
                        .map(|(_, value)| value.into_owned())
                });
                Ok(response)
            },
        )
        .await?;

        if token.as_deref() != Some(self.config.token.as_str()) {
            warn!("Rejecting connection from {}: invalid token", addr);
            let close = CloseFrame {
                code: CloseCode::from(CLOSE_INVALID_TOKEN),
                reason: "invalid token".into(),
            };
            if let Err(e) = ws.close(Some(close)).await {
                debug!("Failed to send close frame to {}: {}", addr, e);
            }
            return Ok(());
        }

        let session_id = SessionId::new();
        info!("[{}] Client connected from {}", session_id, addr);

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer = tokio::spawn(write_loop(session_id.clone(), sink, rx));

        let consumer = Arc::new(ConnectionConsumer::new(session_id.clone(), tx.clone()));
        let consumer_id = consumer.id();
        self.sessions.lock().insert(session_id.clone(), consumer_id);
        self.broadcast.subscribe(&[WILDCARD], consumer);

        self.read_loop(&session_id, stream, &tx).await;

        debug!("[{}] Connection closed", session_id);
        self.broadcast.unsubscribe::<&str>(consumer_id, &[]);
        self.sessions.lock().remove(&session_id);
        drop(tx);

        // In-flight dispatch tasks may still hold a sender; don't wait on them.
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        Ok(())
    }

    async fn read_loop(
        self: &Arc<Self>,
        session_id: &SessionId,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        tx: &mpsc::UnboundedSender<String>,
    ) {
        let mut reassembler = FrameReassembler::new();

        loop {
            let message = tokio::select! {
                () = self.shutdown.cancelled() => return,
                message = stream.next() => message,
            };

            let chunk = match message {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("[{}] Read error: {}", session_id, e);
                    return;
                }
            };

            for result in reassembler.push(&chunk) {
                match result {
                    Ok(frame) => self.handle_frame(session_id, frame, tx),
                    Err(e) => warn!("[{}] Discarding malformed frame: {}", session_id, e),
                }
            }
        }
    }

    fn handle_frame(
        self: &Arc<Self>,
        session_id: &SessionId,
        frame: Frame,
        tx: &mpsc::UnboundedSender<String>,
    ) {
        trace!("[{}] Received {} frame {}", session_id, frame.msg_type(), frame.id());

        match frame.msg_type() {
            MessageType::Request => {
                let server = Arc::clone(self);
                let tx = tx.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    let response = server.dispatcher.dispatch_frame(&frame).await;
                    let text = encode_response(&frame, &response);
                    if tx.send(text).is_err() {
                        debug!(
                            "[{}] Connection gone before response to {}",
                            session_id,
                            frame.id()
                        );
                    }
                });
            }
            MessageType::Heartbeat => match encode_frame(&Frame::heartbeat()) {
                Ok(text) => {
                    let _ = tx.send(text);
                }
                Err(e) => error!("Failed to encode heartbeat: {}", e),
            },
            MessageType::Response => {
                debug!("[{}] Discarding unsolicited response {}", session_id, frame.id());
            }
            MessageType::Event(_) => {
                self.inbound.publish(Event::from(frame));
            }
        }
    }
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

fn encode_response(request: &Frame, response: &ResponsePayload) -> String {
    let reply = Frame::response(request.id(), response);
    encode_frame(&reply).unwrap_or_else(|e| {
        error!("Failed to encode response to {}: {}", request.id(), e);
        let fallback = ResponsePayload::internal_error(e.to_string());
        // A bare error response is always small enough to encode.
        encode_frame(&Frame::response(request.id(), &fallback)).unwrap_or_default()
    })
}

async fn write_loop(
    session_id: SessionId,
    mut sink: ServerSink,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    trace!("[{}] writer started", session_id);
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!("[{}] Failed to send: {}", session_id, e);
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    trace!("[{}] writer ended", session_id);
}
