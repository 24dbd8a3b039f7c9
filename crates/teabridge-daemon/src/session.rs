//! Per-connection identity and broadcast delivery.

use serde::{Deserialize, Serialize};
use teabridge_rpc::{Consumer, ConsumerId, DeliveryError, Event, encode_frame};
use tokio::sync::mpsc;
use tracing::{error, trace};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Broadcast consumer that writes events into one connection's outbound queue.
pub struct ConnectionConsumer {
    id: ConsumerId,
    session_id: SessionId,
    sender: mpsc::UnboundedSender<String>,
}

impl ConnectionConsumer {
    #[must_use]
    pub fn new(session_id: SessionId, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ConsumerId::next(),
            session_id,
            sender,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Consumer for ConnectionConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        let frame = event.clone().into_frame();
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                // Unencodable events are skipped; the connection itself is fine.
                error!("[{}] Dropping '{}' event: {}", self.session_id, event.topic, e);
                return Ok(());
            }
        };
        trace!("[{}] Queueing '{}' event", self.session_id, event.topic);
        self.sender.send(text).map_err(|_| DeliveryError(self.id))
    }
}

impl std::fmt::Debug for ConnectionConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConsumer")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teabridge_rpc::{Payload, decode_frame, transport::SENTINEL};

    #[test]
    fn test_session_id_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::from("abc");
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn test_consumer_writes_encoded_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = ConnectionConsumer::new(SessionId::new(), tx);

        let mut payload = Payload::new();
        payload.insert("bot".to_string(), "1".into());
        consumer.deliver(&Event::new("bot_connect", payload)).unwrap();

        let text = rx.try_recv().unwrap();
        assert_eq!(text.as_bytes().last(), Some(&SENTINEL));
        let frame = decode_frame(&text[..text.len() - 1]).unwrap();
        assert_eq!(frame.msg_type().as_str(), "bot_connect");
        assert_eq!(frame.payload["bot"], "1");
    }

    #[test]
    fn test_consumer_fails_after_connection_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = ConnectionConsumer::new(SessionId::new(), tx);
        drop(rx);

        let err = consumer
            .deliver(&Event::new("message", Payload::new()))
            .unwrap_err();
        assert_eq!(err.0, consumer.id());
    }
}
