//! Wire-level message types.
//!
//! Every frame is a flat JSON record `{id, type, correlation_id?, timestamp, payload}`.
//! Requests and responses carry structured payloads ([`RequestPayload`] and
//! [`ResponsePayload`]); every other message type is an opaque broadcast event.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OK: u16 = 200;
pub const BAD_REQUEST: u16 = 400;
pub const METHOD_NOT_FOUND: u16 = 404;
pub const INTERNAL_ERROR: u16 = 500;

/// Close code sent by the daemon when the connection token does not match.
pub const CLOSE_INVALID_TOKEN: u16 = 4000;

/// Opaque key/value record carried by every frame.
pub type Payload = Map<String, Value>;

/// Globally unique message identifier, generated by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message kind. Anything that is not a request, response or heartbeat is an
/// application-defined broadcast tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Request,
    Response,
    Heartbeat,
    Event(String),
}

impl MessageType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Event(tag) => tag,
        }
    }

    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self, MessageType::Event(_))
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "request" => MessageType::Request,
            "response" => MessageType::Response,
            "heartbeat" => MessageType::Heartbeat,
            _ => MessageType::Event(s),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        MessageType::from(s.to_string())
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Event(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch, as sent in frame headers.
#[must_use]
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Immutable per-message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
    pub timestamp: f64,
}

impl Header {
    #[must_use]
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            id: MessageId::new(),
            msg_type,
            correlation_id: None,
            timestamp: unix_timestamp(),
        }
    }

    #[must_use]
    pub fn response_to(request_id: &MessageId) -> Self {
        Self {
            correlation_id: Some(request_id.clone()),
            ..Self::new(MessageType::Response)
        }
    }
}

/// One complete (header, payload) unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub header: Header,
    pub payload: Payload,
}

impl Frame {
    #[must_use]
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// Build a request frame for `method`.
    #[must_use]
    pub fn request(method: impl Into<String>, params: Payload) -> Self {
        let payload = RequestPayload::new(method, params).into_payload();
        Self::new(Header::new(MessageType::Request), payload)
    }

    /// Build a response frame answering the request with id `request_id`.
    #[must_use]
    pub fn response(request_id: &MessageId, response: &ResponsePayload) -> Self {
        Self::new(Header::response_to(request_id), response.to_payload())
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        let mut payload = Payload::new();
        payload.insert("status".to_string(), Value::from("alive"));
        Self::new(Header::new(MessageType::Heartbeat), payload)
    }

    /// Build a broadcast event frame tagged `topic`.
    #[must_use]
    pub fn event(topic: impl Into<String>, payload: Payload) -> Self {
        Self::new(Header::new(MessageType::from(topic.into())), payload)
    }

    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.header.id
    }

    #[must_use]
    pub fn msg_type(&self) -> &MessageType {
        &self.header.msg_type
    }
}

/// Payload of a `request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    #[serde(default)]
    pub params: Payload,
}

impl RequestPayload {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Payload) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Interpret a frame payload as a request.
    ///
    /// # Errors
    ///
    /// Returns an error if `method` is missing or `params` is not an object.
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload.clone()))
    }

    #[must_use]
    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("method".to_string(), Value::String(self.method));
        payload.insert("params".to_string(), Value::Object(self.params));
        payload
    }
}

/// Payload of a `response` frame. Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    /// Successful response; the handler value is wrapped as `{"result": value}`.
    #[must_use]
    pub fn ok(result: Value) -> Self {
        let mut data = Map::new();
        data.insert("result".to_string(), result);
        Self {
            code: OK,
            data: Some(Value::Object(data)),
            error: None,
        }
    }

    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            error: Some(message.into()),
        }
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::error(METHOD_NOT_FOUND, "Method not found")
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(BAD_REQUEST, message)
    }

    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == OK && self.error.is_none()
    }

    /// The handler's return value (`data.result`) of a successful response.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get("result"))
    }

    /// Interpret a frame payload as a response.
    ///
    /// # Errors
    ///
    /// Returns an error if `code` is missing or a field has the wrong type.
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload.clone()))
    }

    #[must_use]
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("code".to_string(), Value::from(self.code));
        if let Some(data) = &self.data {
            payload.insert("data".to_string(), data.clone());
        }
        if let Some(error) = &self.error {
            payload.insert("error".to_string(), Value::String(error.clone()));
        }
        payload
    }
}

/// A published broadcast: topic plus opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
}

impl Event {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    #[must_use]
    pub fn into_frame(self) -> Frame {
        Frame::event(self.topic, self.payload)
    }
}

impl From<Frame> for Event {
    fn from(frame: Frame) -> Self {
        Self {
            topic: frame.header.msg_type.into(),
            payload: frame.payload,
        }
    }
}

/// Convert a JSON value into a payload map. `null` becomes an empty map.
///
/// # Errors
///
/// Returns the original value if it is neither an object nor `null`.
pub fn payload_from_value(value: Value) -> Result<Payload, Value> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(other),
    }
}
