//! Outstanding request table.
//!
//! Each registered request owns a single-use `oneshot` sender and a timer task.
//! Exactly one of {response, timeout, teardown} removes the entry and resolves
//! the caller; the losing paths find no entry and do nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::client::ClientError;
use crate::protocol::{MessageId, ResponsePayload};

type Outcome = Result<ResponsePayload, ClientError>;

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    timer: AbortHandle,
}

/// Maps request ids to their waiting callers.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    entries: Arc<Mutex<HashMap<MessageId, PendingEntry>>>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and arm its expiry timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: MessageId, timeout: Duration) -> PendingCall {
        let (tx, rx) = oneshot::channel();

        let mut entries = self.entries.lock();

        // The timer cannot observe the table before the entry is inserted:
        // it needs the lock we are holding.
        let table = self.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(&timer_id);
        })
        .abort_handle();

        if let Some(previous) = entries.insert(id.clone(), PendingEntry { tx, timer }) {
            warn!("Duplicate request id {}, replacing pending entry", id);
            previous.timer.abort();
        }
        trace!("Registered pending request {} ({:?})", id, timeout);

        PendingCall { id, rx }
    }

    /// Deliver the outcome for `correlation_id`.
    ///
    /// Returns `false` if no request is waiting (late or duplicate response).
    pub fn resolve(&self, correlation_id: &MessageId, outcome: Outcome) -> bool {
        let Some(entry) = self.entries.lock().remove(correlation_id) else {
            debug!("Discarding response for unknown request {}", correlation_id);
            return false;
        };
        entry.timer.abort();
        // The caller may have dropped its handle; nothing else to do then.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Drop a request without delivering anything.
    pub fn cancel(&self, id: &MessageId) -> bool {
        match self.entries.lock().remove(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request. Returns how many were failed.
    pub fn fail_all(&self, make_error: impl Fn(&MessageId) -> ClientError) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(make_error(&id)));
        }
        if count > 0 {
            debug!("Failed {} pending request(s)", count);
        }
        count
    }

    fn expire(&self, id: &MessageId) {
        let Some(entry) = self.entries.lock().remove(id) else {
            return;
        };
        warn!("Request {} timed out", id);
        let _ = entry.tx.send(Err(ClientError::Timeout { id: id.clone() }));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.lock().contains_key(id)
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .finish()
    }
}

/// Handle to one outstanding request; resolves exactly once.
#[derive(Debug)]
pub struct PendingCall {
    id: MessageId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }
}

impl Future for PendingCall {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClientError::ConnectionClosed)))
    }
}
