//! Error types for the teabridge daemon.

use teabridge_rpc::ResponsePayload;
use teabridge_rpc::transport::CodecError;
use tokio_tungstenite::tungstenite;

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(#[from] teabridge_rpc::Error),

    /// WebSocket handshake or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<tungstenite::Error> for DaemonError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Failure reported by a method handler.
///
/// Only the message crosses the wire; the variant picks the response code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Parameters missing or of the wrong shape (400)
    #[error("{0}")]
    Validation(String),

    /// Handler failed while running (500)
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<HandlerError> for ResponsePayload {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Validation(msg) => ResponsePayload::bad_request(msg),
            HandlerError::Failed(msg) => ResponsePayload::internal_error(msg),
        }
    }
}
