//! Built-in methods every daemon serves.
//!
//! - `ping`: liveness probe
//! - `methods`: names of all registered methods
//! - `emit`: publish an event through the broadcaster

use serde::Deserialize;
use serde_json::{Value, json};
use teabridge_rpc::{
    Event, MessageType, Payload, PublishOutcome, SubscriptionRegistry, unix_timestamp,
};
use tracing::debug;

use crate::dispatcher::{Dispatcher, Params};
use crate::error::HandlerError;

#[derive(Debug, Deserialize)]
struct EmitParams {
    #[serde(rename = "type")]
    topic: String,
    #[serde(default)]
    payload: Payload,
}

pub fn register_builtin(dispatcher: &Dispatcher, broadcast: &SubscriptionRegistry) {
    dispatcher.register_sync("ping", |_params| Ok(handle_ping()));

    let list_methods = dispatcher.method_lister();
    dispatcher.register_sync("methods", move |_params| Ok(list_methods()));

    let broadcast = broadcast.clone();
    dispatcher.register_sync("emit", move |params| handle_emit(&broadcast, &params));
}

fn handle_ping() -> Value {
    json!({
        "pong": true,
        "timestamp": unix_timestamp(),
    })
}

fn handle_emit(broadcast: &SubscriptionRegistry, params: &Params) -> Result<Value, HandlerError> {
    let EmitParams { topic, payload } = params.parse()?;

    if topic.is_empty() {
        return Err(HandlerError::validation("Event type must not be empty"));
    }
    if !MessageType::from(topic.as_str()).is_event() {
        return Err(HandlerError::validation(format!(
            "Cannot emit reserved message type '{topic}'"
        )));
    }

    debug!("Emitting '{}' event", topic);
    Ok(match broadcast.publish(Event::new(topic, payload)) {
        PublishOutcome::Buffered => json!({ "buffered": true }),
        PublishOutcome::Delivered(n) => json!({ "delivered": n }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use teabridge_rpc::{BAD_REQUEST, RequestPayload, Subscription, WILDCARD, payload_from_value};

    fn setup() -> (Dispatcher, SubscriptionRegistry) {
        let dispatcher = Dispatcher::new();
        let broadcast = SubscriptionRegistry::buffered();
        register_builtin(&dispatcher, &broadcast);
        (dispatcher, broadcast)
    }

    fn request(method: &str, params: Value) -> RequestPayload {
        RequestPayload::new(method, payload_from_value(params).unwrap())
    }

    #[tokio::test]
    async fn test_ping() {
        let (dispatcher, _) = setup();
        let resp = dispatcher.dispatch(&request("ping", json!({}))).await;
        let result = resp.result().unwrap();
        assert_eq!(result["pong"], true);
        assert!(result["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_methods_lists_builtins_and_custom() {
        let (dispatcher, _) = setup();
        dispatcher.register_sync("get_plugins", |_params| Ok(json!({})));

        let resp = dispatcher.dispatch(&request("methods", json!({}))).await;
        assert_eq!(
            resp.result().unwrap(),
            &json!(["emit", "get_plugins", "methods", "ping"])
        );
    }

    #[tokio::test]
    async fn test_emit_buffers_before_first_consumer() {
        let (dispatcher, broadcast) = setup();

        let resp = dispatcher
            .dispatch(&request("emit", json!({"type": "message", "payload": {"n": 1}})))
            .await;
        assert_eq!(resp.result().unwrap(), &json!({"buffered": true}));

        let sub = Subscription::attach(&broadcast, &[WILDCARD]);
        let event = sub.try_recv().unwrap();
        assert_eq!(event.topic, "message");
        assert_eq!(event.payload["n"], 1);
    }

    #[tokio::test]
    async fn test_emit_reports_delivery_count() {
        let (dispatcher, broadcast) = setup();
        let _a = Subscription::attach(&broadcast, &["message"]);
        let _b = Subscription::attach(&broadcast, &[WILDCARD]);

        let resp = dispatcher
            .dispatch(&request("emit", json!({"type": "message"})))
            .await;
        assert_eq!(resp.result().unwrap(), &json!({"delivered": 2}));
    }

    #[tokio::test]
    async fn test_emit_rejects_reserved_type() {
        let (dispatcher, _) = setup();
        let resp = dispatcher
            .dispatch(&request("emit", json!({"type": "response"})))
            .await;
        assert_eq!(resp.code, BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_emit_requires_type() {
        let (dispatcher, _) = setup();
        let resp = dispatcher
            .dispatch(&request("emit", json!({"payload": {}})))
            .await;
        assert_eq!(resp.code, BAD_REQUEST);
    }
}
