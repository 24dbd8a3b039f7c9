//! Error types for the teabridge-rpc crate.
//!
//! This module provides a unified error type for all bridge operations.

use crate::client::ClientError;
use crate::protocol::{MessageId, ResponsePayload};
use crate::transport::CodecError;

/// Unified error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Disconnected,

    #[error("Client is shutting down")]
    Shutdown,

    #[error("Request timeout for {0}")]
    Timeout(MessageId),

    #[error("RPC error {code}: {message}")]
    Rpc { code: u16, message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unexpected response")]
    UnexpectedResponse,
}

impl Error {
    pub fn rpc(code: u16, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }
}

impl From<ResponsePayload> for Error {
    fn from(resp: ResponsePayload) -> Self {
        Self::Rpc {
            code: resp.code,
            message: resp.error.unwrap_or_default(),
        }
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Connection(msg) => Self::Connection(msg),
            ClientError::NotConnected => Self::NotConnected,
            ClientError::ConnectionClosed => Self::Disconnected,
            ClientError::Shutdown => Self::Shutdown,
            ClientError::Timeout { id } => Self::Timeout(id),
            ClientError::Rpc { code, message } => Self::Rpc { code, message },
            ClientError::Codec(e) => Self::Codec(e),
            ClientError::Json(e) => Self::Json(e),
            ClientError::NoTopics => {
                Self::InvalidRequest("at least one topic is required".to_string())
            }
            ClientError::InvalidResponse(msg) => Self::InvalidRequest(msg),
            ClientError::UnexpectedResponse => Self::UnexpectedResponse,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rpc_factory() {
        let err = Error::rpc(404, "Method not found");
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, 404);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("Expected Rpc error"),
        }
    }

    #[test]
    fn test_error_from_response_payload() {
        let err: Error = ResponsePayload::internal_error("Plugin not found").into();
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "Plugin not found");
            }
            _ => panic!("Expected Rpc error"),
        }
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config not found");
        let err: Error = io_err.into();

        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("config not found"));
    }

    #[test]
    fn test_error_from_codec_error() {
        let err: Error = CodecError::FrameTooLarge(999_999_999).into();
        assert!(matches!(err, Error::Codec(_)));
        assert!(err.to_string().contains("999999999"));
    }

    #[test]
    fn test_error_from_client_error() {
        let err: Error = ClientError::ConnectionClosed.into();
        assert!(matches!(err, Error::Disconnected));

        let err: Error = ClientError::Shutdown.into();
        assert!(matches!(err, Error::Shutdown));

        let err: Error = ClientError::NotConnected.into();
        assert!(matches!(err, Error::NotConnected));

        let err: Error = ClientError::Timeout {
            id: MessageId::from("req-9"),
        }
        .into();
        assert_eq!(err.to_string(), "Request timeout for req-9");

        let err: Error = ClientError::Rpc {
            code: 400,
            message: "Invalid request format".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Rpc { code: 400, .. }));

        let err: Error = ClientError::NoTopics.into();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Disconnected.to_string(), "Connection closed");
        assert_eq!(Error::UnexpectedResponse.to_string(), "Unexpected response");

        let err = Error::rpc(500, "boom");
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }
}
