//! Shared bridge protocol for teabridge.
//!
//! This crate provides the frame types, sentinel codec, request correlation,
//! topic subscriptions and the self-healing client used to talk to the
//! teabridge daemon over a WebSocket.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`protocol`]: Frame, header and payload types
//! - [`transport`]: Sentinel-delimited codec and stream reassembly
//! - [`correlation`]: Outstanding request table with per-request timeouts
//! - [`subscription`]: Topic fan-out registry with pre-connection buffering
//! - [`client`]: Async connection manager ([`BridgeClient`])
//! - [`blocking`]: Thread-blocking facade ([`BlockingClient`])
//! - [`config`]: JSON configuration file and derived client/server settings
//! - [`error`]: Unified error type and result alias
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use teabridge_rpc::{BridgeClient, BridgeConfig, Payload};
//!
//! # async fn example() -> Result<(), teabridge_rpc::ClientError> {
//! let client = BridgeClient::new(BridgeConfig::default().client());
//! client.start();
//! client.wait_connected(Duration::from_secs(5)).await;
//!
//! let plugins: serde_json::Value = client.request("get_plugins", Payload::new()).await?;
//! println!("{plugins}");
//!
//! let events = client.subscribe(&["message"])?;
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.topic, event.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod subscription;
pub mod transport;

// Re-export main client types
pub use blocking::BlockingClient;
pub use client::{Backoff, BridgeClient, ClientError, ConnectionState};

// Re-export error types
pub use error::{Error, Result};

pub use config::{BridgeConfig, ClientConfig, ServerConfig, default_config_path};
pub use correlation::{CorrelationTable, PendingCall};

// Re-export protocol types
pub use protocol::{
    BAD_REQUEST, CLOSE_INVALID_TOKEN, Event, Frame, Header, INTERNAL_ERROR, METHOD_NOT_FOUND,
    MessageId, MessageType, OK, Payload, RequestPayload, ResponsePayload, payload_from_value,
    unix_timestamp,
};

pub use subscription::{
    ChannelConsumer, Consumer, ConsumerId, DeliveryError, PublishOutcome, Subscription,
    SubscriptionRegistry, WILDCARD,
};

// Re-export transport types
pub use transport::{CodecError, FrameCodec, FrameReassembler, SENTINEL, decode_frame, encode_frame};
