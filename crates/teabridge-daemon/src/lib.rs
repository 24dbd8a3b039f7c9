//! Teabridge daemon library providing the WebSocket bridge server.
//!
//! This crate provides the server that answers client requests through a
//! method dispatcher and broadcasts events to every connected client.

pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod server;
pub mod session;

pub use dispatcher::{Dispatcher, HandlerResult, Params};
pub use error::{DaemonError, HandlerError, Result};
pub use server::BridgeServer;
pub use session::{ConnectionConsumer, SessionId};
