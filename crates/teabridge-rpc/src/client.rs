//! Self-healing WebSocket client for the bridge daemon.
//!
//! [`BridgeClient`] owns one logical connection. Once started it keeps
//! reconnecting with [`Backoff`] until stopped; while connected it runs a
//! reader, a writer and a heartbeat task. Requests are correlated by message
//! id through the [`CorrelationTable`]; every other inbound frame type is fanned
//! out to local [`Subscription`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::correlation::{CorrelationTable, PendingCall};
use crate::protocol::{
    CLOSE_INVALID_TOKEN, Event, Frame, Header, MessageId, MessageType, Payload, ResponsePayload,
};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transport::{CodecError, FrameReassembler, encode_frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a closing session may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur with the bridge client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Client is shutting down")]
    Shutdown,

    #[error("Request timeout for {id}")]
    Timeout { id: MessageId },

    #[error("RPC error: {code} - {message}")]
    Rpc { code: u16, message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("At least one topic is required")]
    NoTopics,

    #[error("Unexpected response type")]
    UnexpectedResponse,
}

impl ClientError {
    /// The request was abandoned because its connection went away.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Shutdown)
    }
}

impl From<ResponsePayload> for ClientError {
    fn from(resp: ResponsePayload) -> Self {
        ClientError::Rpc {
            code: resp.code,
            message: resp.error.unwrap_or_default(),
        }
    }
}

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Stopped for good.
    Closing,
}

/// Reconnect delay schedule: a fixed list of delays, then a steady interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    steady: Duration,
    attempt: usize,
}

impl Backoff {
    #[must_use]
    pub fn new(schedule: Vec<Duration>, steady: Duration) -> Self {
        Self {
            schedule,
            steady,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.retry_intervals.clone(), config.steady_retry)
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .schedule
            .get(self.attempt)
            .copied()
            .unwrap_or(self.steady);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

struct Shared {
    config: ClientConfig,
    pending: CorrelationTable,
    registry: SubscriptionRegistry,
    /// Queue into the current session's writer; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state_tx: watch::Sender<ConnectionState>,
    connected_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    started: AtomicBool,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Closing || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if !changed {
            return;
        }
        debug!("Connection state: {:?}", state);

        let connected = state == ConnectionState::Connected;
        self.connected_tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
    }

    fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Connected);
    }

    /// Stop accepting sends and fail everything in flight.
    fn detach(&self, make_error: fn() -> ClientError) {
        self.outbound.lock().take();
        self.set_state(ConnectionState::Disconnected);
        self.pending.fail_all(|_| make_error());
    }

    fn send_text(&self, text: String) -> Result<(), ClientError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(text).map_err(|_| ClientError::ConnectionClosed)
    }

    fn send_request(&self, frame: &Frame, timeout: Duration) -> Result<PendingCall, ClientError> {
        let text = encode_frame(frame)?;

        // Registration and enqueue happen under the outbound lock so a
        // concurrent teardown either sees the entry or rejects the send.
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        let pending = self.pending.register(frame.id().clone(), timeout);
        if tx.send(text).is_err() {
            self.pending.cancel(frame.id());
            return Err(ClientError::ConnectionClosed);
        }
        trace!("Sent request {}", frame.id());
        Ok(pending)
    }

    fn route(&self, frame: Frame) {
        match frame.msg_type() {
            MessageType::Response => {
                let Some(correlation_id) = frame.header.correlation_id.clone() else {
                    warn!("Response {} carries no correlation id", frame.id());
                    return;
                };
                let outcome = ResponsePayload::from_payload(&frame.payload)
                    .map_err(|e| ClientError::InvalidResponse(e.to_string()));
                self.pending.resolve(&correlation_id, outcome);
            }
            MessageType::Heartbeat => trace!("Heartbeat from daemon"),
            MessageType::Request => {
                debug!("Ignoring request {}: client serves no methods", frame.id());
            }
            MessageType::Event(_) => {
                self.registry.publish(Event::from(frame));
            }
        }
    }
}

/// Managed connection to the bridge daemon.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct BridgeClient {
    shared: Arc<Shared>,
}

impl BridgeClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (connected_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                pending: CorrelationTable::new(),
                registry: SubscriptionRegistry::unbuffered(),
                outbound: Mutex::new(None),
                state_tx,
                connected_tx,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                manager: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Spawn the connection manager. Calling it again has no effect.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(run_manager(Arc::clone(&self.shared)));
        *self.shared.manager.lock() = Some(handle);
    }

    /// Close the connection and stop reconnecting. Terminal.
    ///
    /// Outstanding requests fail with [`ClientError::Shutdown`].
    pub fn stop(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping bridge client");
        self.shared.shutdown.cancel();
        self.shared.detach(|| ClientError::Shutdown);
        self.shared.set_state(ConnectionState::Closing);
    }

    /// [`stop`](Self::stop) and wait for the manager task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.shared.manager.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Connection manager task failed: {}", e);
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Connected/disconnected notifications. Each transition is announced once.
    #[must_use]
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Wait until connected. Returns `false` on timeout or after stop.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connectivity();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await,
            Ok(Ok(_))
        )
    }

    /// Send a request and wait for its response.
    ///
    /// Error-class responses (400, 404, 500) are returned as values.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected, on timeout, or if the connection
    /// drops before the response arrives.
    pub async fn call(
        &self,
        method: &str,
        params: Payload,
        timeout: Duration,
    ) -> Result<ResponsePayload, ClientError> {
        self.call_detached(method, params, timeout)?.await
    }

    /// Send a request without waiting; await the returned handle for the response.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the frame cannot be encoded.
    pub fn call_detached(
        &self,
        method: &str,
        params: Payload,
        timeout: Duration,
    ) -> Result<PendingCall, ClientError> {
        let frame = Frame::request(method, params);
        self.shared.send_request(&frame, timeout)
    }

    /// Send a request and deserialize its `result`, using the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rpc`] for non-200 responses, plus every error of
    /// [`call`](Self::call).
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Payload,
    ) -> Result<T, ClientError> {
        let response = self
            .call(method, params, self.shared.config.request_timeout)
            .await?;
        if !response.is_success() {
            return Err(response.into());
        }
        let result = response
            .result()
            .cloned()
            .ok_or(ClientError::UnexpectedResponse)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a fire-and-forget event frame to the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the frame cannot be encoded.
    pub fn notify(&self, topic: &str, payload: Payload) -> Result<(), ClientError> {
        let text = encode_frame(&Frame::event(topic, payload))?;
        self.shared.send_text(text)
    }

    /// Receive events from the daemon tagged with any of `topics` (`*` for all).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoTopics`] if `topics` is empty.
    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> Result<Subscription, ClientError> {
        if topics.is_empty() {
            return Err(ClientError::NoTopics);
        }
        Ok(Subscription::attach(&self.shared.registry, topics))
    }

    /// Detach `subscription` from `topics`, or from all of them if empty.
    pub fn unsubscribe<S: AsRef<str>>(&self, subscription: &Subscription, topics: &[S]) {
        self.shared.registry.unsubscribe(subscription.id(), topics);
    }

    /// Route a locally built frame as if it had arrived from the daemon.
    pub fn inject(
        &self,
        msg_type: impl Into<MessageType>,
        payload: Payload,
        correlation_id: Option<MessageId>,
    ) {
        let header = Header {
            correlation_id,
            ..Header::new(msg_type.into())
        };
        self.shared.route(Frame::new(header, payload));
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn run_manager(shared: Arc<Shared>) {
    let config = &shared.config;
    let endpoint = format!("{}:{}{}", config.host, config.port, config.path);
    let url = config.url();
    let mut backoff = Backoff::from_config(config);

    while !shared.shutdown.is_cancelled() {
        shared.set_state(ConnectionState::Connecting);
        debug!("Connecting to {}", endpoint);

        let connected = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((ws, _)) => {
                info!("Connected to bridge at {}", endpoint);
                backoff.reset();
                match run_session(&shared, ws).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::Lost(reason) => warn!("Connection to {} lost: {}", endpoint, reason),
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", endpoint, e),
        }

        shared.set_state(ConnectionState::Disconnected);
        let delay = backoff.next_delay();
        debug!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());

        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.detach(|| ClientError::Shutdown);
    shared.set_state(ConnectionState::Closing);
    debug!("Connection manager stopped");
}

async fn run_session(shared: &Arc<Shared>, ws: WsStream) -> SessionEnd {
    let (sink, mut stream) = ws.split();
    let session = shared.shutdown.child_token();
    let (tx, rx) = mpsc::unbounded_channel();

    let mut writer = tokio::spawn(write_loop(sink, rx, session.clone()));
    let heartbeat = tokio::spawn(heartbeat_loop(
        tx.clone(),
        shared.config.heartbeat_interval,
        session.clone(),
    ));
    shared.attach(tx);

    let mut reassembler = FrameReassembler::new();
    let end = loop {
        let message = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break SessionEnd::Stopped,
            () = session.cancelled() => break SessionEnd::Lost("write failed".to_string()),
            message = stream.next() => message,
        };

        let chunk = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                if code == CLOSE_INVALID_TOKEN {
                    error!("Daemon rejected the connection token");
                }
                break SessionEnd::Lost(format!("closed by daemon ({code}) {reason}"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
            None => break SessionEnd::Lost("stream ended".to_string()),
        };

        for result in reassembler.push(&chunk) {
            match result {
                Ok(frame) => {
                    trace!("Received {} frame {}", frame.msg_type(), frame.id());
                    shared.route(frame);
                }
                Err(e) => warn!("Discarding malformed frame: {}", e),
            }
        }
    };

    session.cancel();
    if let Err(e) = heartbeat.await {
        debug!("Heartbeat task ended abnormally: {}", e);
    }
    match end {
        SessionEnd::Stopped => shared.detach(|| ClientError::Shutdown),
        SessionEnd::Lost(_) => shared.detach(|| ClientError::ConnectionClosed),
    }

    // Every sender is gone now, so the writer sends a close frame and exits.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    end
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    session: CancellationToken,
) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!("WebSocket write failed: {}", e);
            session.cancel();
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn heartbeat_loop(
    tx: mpsc::UnboundedSender<String>,
    interval: Duration,
    session: CancellationToken,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);

    loop {
        tokio::select! {
            () = session.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let text = match encode_frame(&Frame::heartbeat()) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode heartbeat: {}", e);
                continue;
            }
        };
        if tx.send(text).is_err() {
            debug!("Heartbeat send failed, ending session");
            session.cancel();
            return;
        }
        trace!("Heartbeat sent");
    }
}
