//! Topic subscription registry with pre-connection buffering.
//!
//! A registry maps topics to consumers. Publishing an event delivers it to the
//! consumers of its exact topic and of the wildcard topic [`WILDCARD`], each at
//! most once. A *buffered* registry queues events published before any consumer
//! has ever attached and hands them to the first consumer that does; after
//! that, buffering is off for good.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::protocol::Event;

/// Topic that matches every event.
pub const WILDCARD: &str = "*";

/// Identity of a consumer within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// The consumer can no longer accept events.
#[derive(Debug, Clone, thiserror::Error)]
#[error("consumer {0} is gone")]
pub struct DeliveryError(pub ConsumerId);

/// Something that receives published events.
///
/// `deliver` is called with the registry lock held and must not block.
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    /// Hand one event to the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the consumer is closed; the registry then
    /// evicts it from every topic.
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// No consumer has attached yet; the event was queued.
    Buffered,
    /// Delivered to this many consumers.
    Delivered(usize),
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, HashMap<ConsumerId, Arc<dyn Consumer>>>,
    buffer: VecDeque<Event>,
    buffering: bool,
}

impl Inner {
    fn evict(&mut self, id: ConsumerId) {
        self.topics.retain(|_, consumers| {
            consumers.remove(&id);
            !consumers.is_empty()
        });
    }
}

/// Topic to consumer fan-out table.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriptionRegistry {
    /// Registry that queues events until its first consumer attaches.
    #[must_use]
    pub fn buffered() -> Self {
        Self::with_buffering(true)
    }

    /// Registry that drops events nobody is subscribed to.
    #[must_use]
    pub fn unbuffered() -> Self {
        Self::with_buffering(false)
    }

    fn with_buffering(buffering: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffering,
                ..Inner::default()
            })),
        }
    }

    /// Attach `consumer` to each of `topics`. Re-subscribing is a no-op.
    ///
    /// If this is the first consumer ever attached to a buffered registry, the
    /// buffered events matching `topics` are delivered to it in publish order
    /// and the rest are discarded.
    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S], consumer: Arc<dyn Consumer>) {
        let id = consumer.id();
        let mut inner = self.inner.lock();

        for topic in topics {
            inner
                .topics
                .entry(topic.as_ref().to_string())
                .or_default()
                .entry(id)
                .or_insert_with(|| Arc::clone(&consumer));
        }
        debug!("{} subscribed to {} topic(s)", id, topics.len());

        if !inner.buffering {
            return;
        }
        inner.buffering = false;

        let buffered = std::mem::take(&mut inner.buffer);
        if buffered.is_empty() {
            return;
        }

        let wants_all = topics.iter().any(|t| t.as_ref() == WILDCARD);
        let wanted: HashSet<&str> = topics.iter().map(AsRef::as_ref).collect();
        let total = buffered.len();
        let mut flushed = 0usize;

        for event in &buffered {
            if !wants_all && !wanted.contains(event.topic.as_str()) {
                continue;
            }
            if consumer.deliver(event).is_err() {
                inner.evict(id);
                break;
            }
            flushed += 1;
        }
        debug!(
            "Flushed {} of {} buffered event(s) to {}",
            flushed, total, id
        );
    }

    /// Detach a consumer from `topics`, or from every topic if `topics` is empty.
    pub fn unsubscribe<S: AsRef<str>>(&self, id: ConsumerId, topics: &[S]) {
        let mut inner = self.inner.lock();
        if topics.is_empty() {
            inner.evict(id);
        } else {
            for topic in topics {
                let topic = topic.as_ref();
                if let Some(consumers) = inner.topics.get_mut(topic) {
                    consumers.remove(&id);
                    if consumers.is_empty() {
                        inner.topics.remove(topic);
                    }
                }
            }
        }
        debug!("{} unsubscribed", id);
    }

    /// Deliver `event` to every matching consumer, or buffer it.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        let mut inner = self.inner.lock();

        if inner.buffering {
            trace!("Buffering '{}' event until a consumer attaches", event.topic);
            inner.buffer.push_back(event);
            return PublishOutcome::Buffered;
        }

        let mut targets: Vec<Arc<dyn Consumer>> = Vec::new();
        let mut seen = HashSet::new();
        for key in [event.topic.as_str(), WILDCARD] {
            if let Some(consumers) = inner.topics.get(key) {
                for (id, consumer) in consumers {
                    if seen.insert(*id) {
                        targets.push(Arc::clone(consumer));
                    }
                }
            }
        }

        let mut delivered = 0usize;
        for consumer in targets {
            match consumer.deliver(&event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("Evicting consumer: {}", e);
                    inner.evict(consumer.id());
                }
            }
        }
        trace!("'{}' event delivered to {} consumer(s)", event.topic, delivered);

        PublishOutcome::Delivered(delivered)
    }

    /// Whether events are still being queued for the first consumer.
    #[must_use]
    pub fn is_buffering(&self) -> bool {
        self.inner.lock().buffering
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Number of consumers attached to `topic` (exact match only).
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.lock().topics.get(topic).map_or(0, HashMap::len)
    }

    /// Topics that currently have at least one consumer.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &inner.topics.len())
            .field("buffering", &inner.buffering)
            .field("buffered", &inner.buffer.len())
            .finish()
    }
}

/// Consumer backed by an unbounded `async_channel`.
pub struct ChannelConsumer {
    id: ConsumerId,
    tx: async_channel::Sender<Event>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiving half that reads from it.
    #[must_use]
    pub fn channel() -> (Arc<Self>, async_channel::Receiver<Event>) {
        let (tx, rx) = async_channel::unbounded();
        let consumer = Arc::new(Self {
            id: ConsumerId::next(),
            tx,
        });
        (consumer, rx)
    }
}

impl Consumer for ChannelConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        self.tx
            .try_send(event.clone())
            .map_err(|_| DeliveryError(self.id))
    }
}

/// Receiving end of a subscription.
///
/// Dropping it closes the channel; the registry evicts the consumer on the
/// next delivery attempt.
pub struct Subscription {
    id: ConsumerId,
    topics: Vec<String>,
    rx: async_channel::Receiver<Event>,
}

impl Subscription {
    /// Create a channel consumer, attach it to `topics` on `registry` and
    /// return the receiving end.
    #[must_use]
    pub fn attach<S: AsRef<str>>(registry: &SubscriptionRegistry, topics: &[S]) -> Self {
        let (consumer, rx) = ChannelConsumer::channel();
        let id = consumer.id();
        // Receiver must exist before subscribe, which may flush into it.
        let subscription = Self {
            id,
            topics: topics.iter().map(|t| t.as_ref().to_string()).collect(),
            rx,
        };
        registry.subscribe(topics, consumer);
        subscription
    }

    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Topics this subscription was created with.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Wait for the next event. Returns `None` once the consumer was evicted
    /// and its queue drained.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.recv().await.ok()
    }

    /// Blocking variant of [`recv`](Self::recv) for non-async threads.
    #[must_use]
    pub fn recv_blocking(&self) -> Option<Event> {
        self.rx.recv_blocking().ok()
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Events queued and not yet received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use serde_json::json;

    fn event(topic: &str, n: i64) -> Event {
        let mut payload = Payload::new();
        payload.insert("n".to_string(), json!(n));
        Event::new(topic, payload)
    }

    fn drain(sub: &Subscription) -> Vec<(String, i64)> {
        std::iter::from_fn(|| sub.try_recv())
            .map(|e| (e.topic, e.payload["n"].as_i64().unwrap()))
            .collect()
    }

    struct FailingConsumer(ConsumerId);

    impl Consumer for FailingConsumer {
        fn id(&self) -> ConsumerId {
            self.0
        }

        fn deliver(&self, _event: &Event) -> Result<(), DeliveryError> {
            Err(DeliveryError(self.0))
        }
    }

    #[test]
    fn test_exact_topic_delivery() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &["message"]);

        assert_eq!(registry.publish(event("message", 1)), PublishOutcome::Delivered(1));
        assert_eq!(registry.publish(event("other", 2)), PublishOutcome::Delivered(0));

        assert_eq!(drain(&sub), vec![("message".to_string(), 1)]);
    }

    #[test]
    fn test_wildcard_receives_everything() {
        let registry = SubscriptionRegistry::unbuffered();
        let all = Subscription::attach(&registry, &[WILDCARD]);

        registry.publish(event("a", 1));
        registry.publish(event("b", 2));

        assert_eq!(drain(&all), vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[test]
    fn test_exact_and_wildcard_delivers_once() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &["a", WILDCARD]);

        assert_eq!(registry.publish(event("a", 1)), PublishOutcome::Delivered(1));
        assert_eq!(drain(&sub).len(), 1);
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::unbuffered();
        let (consumer, rx) = ChannelConsumer::channel();

        registry.subscribe(&["a"], consumer.clone());
        registry.subscribe(&["a"], consumer);

        assert_eq!(registry.subscriber_count("a"), 1);
        registry.publish(event("a", 1));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_unsubscribe_single_topic() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &["a", "b"]);

        registry.unsubscribe(sub.id(), &["a"]);
        registry.publish(event("a", 1));
        registry.publish(event("b", 2));

        assert_eq!(drain(&sub), vec![("b".to_string(), 2)]);
        assert_eq!(registry.topics(), vec!["b".to_string()]);
    }

    #[test]
    fn test_unsubscribe_all_topics() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &["a", "b", WILDCARD]);

        registry.unsubscribe::<&str>(sub.id(), &[]);
        assert!(registry.topics().is_empty());
        assert_eq!(registry.publish(event("a", 1)), PublishOutcome::Delivered(0));
    }

    #[test]
    fn test_failed_consumer_is_evicted_everywhere() {
        let registry = SubscriptionRegistry::unbuffered();
        let healthy = Subscription::attach(&registry, &["a"]);
        registry.subscribe(&["a", "b"], Arc::new(FailingConsumer(ConsumerId::next())));

        assert_eq!(registry.publish(event("a", 1)), PublishOutcome::Delivered(1));
        assert_eq!(registry.subscriber_count("a"), 1);
        assert_eq!(registry.subscriber_count("b"), 0);
        assert_eq!(drain(&healthy).len(), 1);
    }

    #[test]
    fn test_dropped_subscription_is_evicted_lazily() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &["a"]);
        drop(sub);

        assert_eq!(registry.subscriber_count("a"), 1);
        assert_eq!(registry.publish(event("a", 1)), PublishOutcome::Delivered(0));
        assert_eq!(registry.subscriber_count("a"), 0);
    }

    #[test]
    fn test_unbuffered_drops_without_consumers() {
        let registry = SubscriptionRegistry::unbuffered();
        assert_eq!(registry.publish(event("a", 1)), PublishOutcome::Delivered(0));
        assert_eq!(registry.buffered_len(), 0);
    }

    #[test]
    fn test_buffered_flushes_in_order_to_first_consumer() {
        let registry = SubscriptionRegistry::buffered();
        for n in 0..3 {
            assert_eq!(registry.publish(event("m", n)), PublishOutcome::Buffered);
        }
        assert_eq!(registry.buffered_len(), 3);

        let sub = Subscription::attach(&registry, &[WILDCARD]);
        assert!(!registry.is_buffering());
        assert_eq!(registry.buffered_len(), 0);
        assert_eq!(
            drain(&sub),
            vec![("m".to_string(), 0), ("m".to_string(), 1), ("m".to_string(), 2)]
        );
    }

    #[test]
    fn test_flush_only_delivers_matching_topics() {
        let registry = SubscriptionRegistry::buffered();
        registry.publish(event("keep", 1));
        registry.publish(event("drop", 2));
        registry.publish(event("keep", 3));

        let first = Subscription::attach(&registry, &["keep"]);
        let later = Subscription::attach(&registry, &[WILDCARD]);

        assert_eq!(drain(&first), vec![("keep".to_string(), 1), ("keep".to_string(), 3)]);
        assert!(drain(&later).is_empty());
    }

    #[test]
    fn test_buffering_never_rearms() {
        let registry = SubscriptionRegistry::buffered();
        let sub = Subscription::attach(&registry, &[WILDCARD]);
        drop(sub);
        registry.publish(event("a", 1)); // evicts the dropped consumer

        assert_eq!(registry.publish(event("a", 2)), PublishOutcome::Delivered(0));
        assert!(!registry.is_buffering());

        let late = Subscription::attach(&registry, &[WILDCARD]);
        assert!(drain(&late).is_empty());
    }

    #[test]
    fn test_flush_precedes_later_publishes() {
        let registry = SubscriptionRegistry::buffered();
        registry.publish(event("m", 0));

        let sub = Subscription::attach(&registry, &["m"]);
        registry.publish(event("m", 1));

        assert_eq!(drain(&sub), vec![("m".to_string(), 0), ("m".to_string(), 1)]);
    }

    #[test]
    fn test_concurrent_publishers_preserve_per_thread_order() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &[WILDCARD]);

        let handles: Vec<_> = ["x", "y"]
            .into_iter()
            .map(|topic| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for n in 0..200 {
                        registry.publish(event(topic, n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let received = drain(&sub);
        assert_eq!(received.len(), 400);
        for topic in ["x", "y"] {
            let seq: Vec<i64> = received
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, n)| *n)
                .collect();
            assert_eq!(seq, (0..200).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_async_recv() {
        let registry = SubscriptionRegistry::unbuffered();
        let sub = Subscription::attach(&registry, &["tick"]);
        assert_eq!(sub.topics(), ["tick".to_string()]);

        let publisher = registry.clone();
        tokio::spawn(async move {
            publisher.publish(event("tick", 7));
        });

        let received = sub.recv().await.unwrap();
        assert_eq!(received.payload["n"], 7);
    }
}
