//! Method registry and request dispatch.
//!
//! Handlers are stored behind one boxed async signature regardless of whether
//! they were registered as async or sync. Handler failures, including panics,
//! become error responses; they never take down the connection.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use teabridge_rpc::{Frame, Payload, RequestPayload, ResponsePayload};
use tracing::{debug, error, trace, warn};

use crate::error::HandlerError;

pub type HandlerResult = Result<Value, HandlerError>;

type Handler = Arc<dyn Fn(Params) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type HandlerMap = RwLock<HashMap<String, Handler>>;

/// Keyword parameters of a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Payload);

impl Params {
    #[must_use]
    pub fn new(params: Payload) -> Self {
        Self(params)
    }

    /// Deserialize the whole parameter map into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Validation`] if the map does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| HandlerError::validation(format!("Invalid parameters: {e}")))
    }

    /// # Errors
    ///
    /// Returns [`HandlerError::Validation`] if `key` is missing or has the wrong type.
    pub fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| HandlerError::validation(format!("Missing required parameter '{key}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::validation(format!("Invalid parameter '{key}': {e}")))
    }

    /// A missing or `null` value yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Validation`] if `key` is present with the wrong type.
    pub fn optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HandlerError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HandlerError::validation(format!("Invalid parameter '{key}': {e}"))),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Payload {
        self.0
    }
}

fn to_result<T: Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value)
        .map_err(|e| HandlerError::failed(format!("Failed to serialize result: {e}")))
}

/// Maps method names to handlers.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<HandlerMap>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler. Replaces any handler with the same name.
    pub fn register<F, Fut, T>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| {
            let fut = handler(params);
            async move { fut.await.and_then(to_result) }.boxed()
        });
        self.insert(name.into(), handler);
    }

    /// Register a synchronous handler. Replaces any handler with the same name.
    pub fn register_sync<F, T>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Params) -> Result<T, HandlerError> + Send + Sync + 'static,
        T: Serialize + Send + 'static,
    {
        let handler = Arc::new(handler);
        let handler: Handler = Arc::new(move |params| {
            let handler = Arc::clone(&handler);
            async move { handler(params).and_then(to_result) }.boxed()
        });
        self.insert(name.into(), handler);
    }

    fn insert(&self, name: String, handler: Handler) {
        if self.handlers.write().insert(name.clone(), handler).is_some() {
            debug!("Replaced handler for '{}'", name);
        } else {
            trace!("Registered handler for '{}'", name);
        }
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        method_names(&self.handlers)
    }

    /// Method name lister that does not keep the dispatcher alive.
    pub(crate) fn method_lister(&self) -> impl Fn() -> Vec<String> + Send + Sync + 'static {
        let handlers: Weak<HandlerMap> = Arc::downgrade(&self.handlers);
        move || handlers.upgrade().map(|h| method_names(&h)).unwrap_or_default()
    }

    /// Run the handler for `request` and build its response.
    pub async fn dispatch(&self, request: &RequestPayload) -> ResponsePayload {
        let handler = self.handlers.read().get(&request.method).cloned();
        let Some(handler) = handler else {
            debug!("Method not found: {}", request.method);
            return ResponsePayload::method_not_found();
        };

        trace!("Dispatching '{}'", request.method);
        let params = Params::new(request.params.clone());
        let outcome = AssertUnwindSafe(async move { handler(params).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => ResponsePayload::ok(value),
            Ok(Err(e)) => {
                warn!("Handler '{}' failed: {}", request.method, e);
                e.into()
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Handler '{}' panicked: {}", request.method, message);
                ResponsePayload::internal_error(message)
            }
        }
    }

    /// Dispatch a `request` frame, answering 400 if its payload is malformed.
    pub async fn dispatch_frame(&self, frame: &Frame) -> ResponsePayload {
        match RequestPayload::from_payload(&frame.payload) {
            Ok(request) => self.dispatch(&request).await,
            Err(e) => {
                warn!("Invalid request {}: {}", frame.id(), e);
                ResponsePayload::bad_request("Invalid request format")
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}

fn method_names(handlers: &HandlerMap) -> Vec<String> {
    let mut names: Vec<String> = handlers.read().keys().cloned().collect();
    names.sort();
    names
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use teabridge_rpc::{BAD_REQUEST, INTERNAL_ERROR, METHOD_NOT_FOUND, OK, payload_from_value};

    fn request(method: &str, params: Value) -> RequestPayload {
        RequestPayload::new(method, payload_from_value(params).unwrap())
    }

    #[derive(Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_unknown_method_is_404() {
        let dispatcher = Dispatcher::new();
        let resp = dispatcher.dispatch(&request("nope", json!({}))).await;
        assert_eq!(resp.code, METHOD_NOT_FOUND);
        assert_eq!(resp.error.as_deref(), Some("Method not found"));
        assert!(resp.data.is_none());
    }

    #[tokio::test]
    async fn test_async_handler_result_is_wrapped() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("get_plugins", |_params| async {
            Ok::<_, HandlerError>(json!({"alpha": {"name": "alpha"}}))
        });

        let resp = dispatcher.dispatch(&request("get_plugins", json!({}))).await;
        assert_eq!(resp.code, OK);
        assert_eq!(resp.data.unwrap()["result"]["alpha"]["name"], "alpha");
    }

    #[tokio::test]
    async fn test_sync_handler_with_typed_params() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_sync("add", |params| {
            let p: AddParams = params.parse()?;
            Ok(p.a + p.b)
        });

        let resp = dispatcher.dispatch(&request("add", json!({"a": 2, "b": 3}))).await;
        assert_eq!(resp.result(), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_invalid_params_is_400() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_sync("add", |params| {
            let p: AddParams = params.parse()?;
            Ok(p.a + p.b)
        });

        let resp = dispatcher.dispatch(&request("add", json!({"a": "x"}))).await;
        assert_eq!(resp.code, BAD_REQUEST);
        assert!(resp.error.unwrap().starts_with("Invalid parameters"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_500_with_message() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("call_plugin", |params| async move {
            let plugin: String = params.required("plugin")?;
            Err::<Value, HandlerError>(HandlerError::failed(format!("Plugin not found: {plugin}")))
        });

        let resp = dispatcher
            .dispatch(&request("call_plugin", json!({"plugin": "x"})))
            .await;
        assert_eq!(resp.code, INTERNAL_ERROR);
        assert_eq!(resp.error.as_deref(), Some("Plugin not found: x"));
        assert!(resp.data.is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_500() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_sync("explode", |_params| -> Result<(), HandlerError> {
            panic!("kaboom");
        });

        let resp = dispatcher.dispatch(&request("explode", json!({}))).await;
        assert_eq!(resp.code, INTERNAL_ERROR);
        assert_eq!(resp.error.as_deref(), Some("kaboom"));

        // The dispatcher keeps working afterwards
        dispatcher.register_sync("ok", |_params| Ok(true));
        assert!(dispatcher.dispatch(&request("ok", json!({}))).await.is_success());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_sync("version", |_params| Ok(1));
        dispatcher.register_sync("version", |_params| Ok(2));

        let resp = dispatcher.dispatch(&request("version", json!({}))).await;
        assert_eq!(resp.result(), Some(&json!(2)));
        assert_eq!(dispatcher.methods(), vec!["version".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_sync("x", |_params| Ok(()));
        assert!(dispatcher.unregister("x"));
        assert!(!dispatcher.contains("x"));

        let resp = dispatcher.dispatch(&request("x", json!({}))).await;
        assert_eq!(resp.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatch_frame_rejects_malformed_request() {
        let dispatcher = Dispatcher::new();
        let frame = Frame::new(
            teabridge_rpc::Header::new(teabridge_rpc::MessageType::Request),
            payload_from_value(json!({"params": {}})).unwrap(),
        );

        let resp = dispatcher.dispatch_frame(&frame).await;
        assert_eq!(resp.code, BAD_REQUEST);
        assert_eq!(resp.error.as_deref(), Some("Invalid request format"));
    }

    #[test]
    fn test_params_required_and_optional() {
        let params = Params::new(payload_from_value(json!({"id": "a", "limit": null, "n": 3})).unwrap());

        assert_eq!(params.required::<String>("id").unwrap(), "a");
        assert!(matches!(
            params.required::<String>("missing"),
            Err(HandlerError::Validation(msg)) if msg.contains("'missing'")
        ));
        assert!(matches!(
            params.required::<String>("n"),
            Err(HandlerError::Validation(_))
        ));

        assert_eq!(params.optional::<u32>("limit").unwrap(), None);
        assert_eq!(params.optional::<u32>("absent").unwrap(), None);
        assert_eq!(params.optional::<u32>("n").unwrap(), Some(3));
    }

    #[test]
    fn test_methods_sorted_and_lister_is_weak() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_sync("zeta", |_params| Ok(()));
        dispatcher.register_sync("alpha", |_params| Ok(()));

        let lister = dispatcher.method_lister();
        assert_eq!(lister(), vec!["alpha".to_string(), "zeta".to_string()]);

        drop(dispatcher);
        assert!(lister().is_empty());
    }
}
