//! Blocking facade over [`BridgeClient`] for threads without an async runtime.
//!
//! The client owns a multi-threaded tokio runtime whose workers run the
//! connection duties. Every method blocks the calling thread only.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::client::{BridgeClient, ClientError, ConnectionState};
use crate::config::ClientConfig;
use crate::protocol::{Payload, ResponsePayload};
use crate::subscription::Subscription;

pub struct BlockingClient {
    rt: Runtime,
    client: BridgeClient,
}

impl BlockingClient {
    /// Build the runtime and start connecting in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the runtime cannot be created.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("teabridge-client")
            .enable_all()
            .build()
            .map_err(|e| ClientError::Connection(format!("failed to start runtime: {e}")))?;

        let client = BridgeClient::new(config);
        {
            let _guard = rt.enter();
            client.start();
        }

        Ok(Self { rt, client })
    }

    /// The async client driven by this facade.
    #[must_use]
    pub fn inner(&self) -> &BridgeClient {
        &self.client
    }

    /// Block until connected or `timeout` elapses.
    #[must_use]
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        self.rt.block_on(self.client.wait_connected(timeout))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Blocking [`BridgeClient::call`].
    ///
    /// # Errors
    ///
    /// See [`BridgeClient::call`].
    pub fn call(
        &self,
        method: &str,
        params: Payload,
        timeout: Duration,
    ) -> Result<ResponsePayload, ClientError> {
        self.rt.block_on(self.client.call(method, params, timeout))
    }

    /// Blocking [`BridgeClient::request`].
    ///
    /// # Errors
    ///
    /// See [`BridgeClient::request`].
    pub fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Payload,
    ) -> Result<T, ClientError> {
        self.rt.block_on(self.client.request(method, params))
    }

    /// # Errors
    ///
    /// See [`BridgeClient::notify`].
    pub fn notify(&self, topic: &str, payload: Payload) -> Result<(), ClientError> {
        self.client.notify(topic, payload)
    }

    /// Subscribe to `topics`; consume with [`Subscription::recv_blocking`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoTopics`] if `topics` is empty.
    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> Result<Subscription, ClientError> {
        self.client.subscribe(topics)
    }

    pub fn unsubscribe<S: AsRef<str>>(&self, subscription: &Subscription, topics: &[S]) {
        self.client.unsubscribe(subscription, topics);
    }

    /// Close the connection and wait for the connection manager to exit.
    pub fn stop(&self) {
        self.rt.block_on(self.client.shutdown());
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        debug!("Dropping blocking client");
        self.client.stop();
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_without_daemon_is_not_connected() {
        // Nothing listens on this port; the client keeps retrying in the background.
        let client = BlockingClient::new(ClientConfig::new("127.0.0.1", 1, "")).unwrap();
        assert!(!client.is_connected());

        let err = client
            .call("ping", Payload::new(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        assert!(!client.wait_connected(Duration::from_millis(100)));
        client.stop();
        assert_eq!(client.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_subscribe_from_plain_thread() {
        let client = BlockingClient::new(ClientConfig::new("127.0.0.1", 1, "")).unwrap();
        let sub = client.subscribe(&["message"]).unwrap();

        client
            .inner()
            .inject("message", Payload::new(), None);

        let handle = std::thread::spawn(move || sub.recv_blocking().map(|e| e.topic));
        assert_eq!(handle.join().unwrap().as_deref(), Some("message"));
        client.stop();
    }
}
