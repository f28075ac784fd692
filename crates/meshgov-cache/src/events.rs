//! Per-cache event publication.
//!
//! Every resource cache owns one [`EventHub`], the topic for its resource
//! kind. After each merged record the cache publishes a [`CacheEvent`]
//! carrying the old value, the new value and the change classification.
//!
//! Delivery is at-most-once and fire-and-forget: publishing never blocks the
//! merge, a full subscriber channel drops the event, and a closed
//! subscriber is removed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Classification of a merged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// No entry existed for the key.
    Created,
    /// An existing entry was replaced.
    Updated,
    /// An existing entry was removed (soft delete).
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Event published for one merged record.
#[derive(Debug)]
pub struct CacheEvent<R> {
    /// Classification.
    pub kind: ChangeKind,
    /// Previous value, `None` for [`ChangeKind::Created`].
    pub old: Option<Arc<R>>,
    /// Record as pulled from the store (invalid for [`ChangeKind::Deleted`]).
    pub new: Arc<R>,
}

impl<R> Clone for CacheEvent<R> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            old: self.old.clone(),
            new: Arc::clone(&self.new),
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value of this id.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving side of a subscription to one cache's topic.
#[derive(Debug)]
pub struct Subscription<R> {
    id: SubscriptionId,
    topic: String,
    receiver: mpsc::Receiver<CacheEvent<R>>,
}

impl<R> Subscription<R> {
    /// Get the subscription id.
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic (cache name) this subscription listens to.
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<CacheEvent<R>> {
        self.receiver.recv().await
    }

    /// Receive an event without waiting.
    pub fn try_recv(&mut self) -> Result<CacheEvent<R>, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every event currently buffered.
    pub fn drain(&mut self) -> Vec<CacheEvent<R>> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Debug)]
struct Subscriber<R> {
    id: SubscriptionId,
    sender: mpsc::Sender<CacheEvent<R>>,
}

/// Topic hub for one resource kind.
#[derive(Debug)]
pub struct EventHub<R> {
    topic: String,
    subscribers: Mutex<Vec<Subscriber<R>>>,
    buffer: usize,
    dropped: AtomicU64,
}

impl<R> EventHub<R> {
    /// Create a hub whose subscribers buffer up to `buffer` events each.
    pub fn new(topic: impl Into<String>, buffer: usize) -> Self {
        Self {
            topic: topic.into(),
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Topic name.
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<R> {
        let id = SubscriptionId::next();
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .push(Subscriber { id, sender });

        debug!(subscription = %id, topic = %self.topic, "subscribed");

        Subscription {
            id,
            topic: self.topic.clone(),
            receiver,
        }
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().expect("event hub lock poisoned");
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            subscribers.swap_remove(pos);
            debug!(subscription = %id, topic = %self.topic, "unsubscribed");
            return;
        }
        warn!(subscription = %id, topic = %self.topic, "attempted to remove unknown subscription");
    }

    /// Drop every subscriber; their receivers observe end-of-stream.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .clear();
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .len()
    }

    /// Events dropped because a subscriber's channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Publish an event to every subscriber without blocking.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn publish(&self, event: CacheEvent<R>) -> usize {
        let mut subscribers = self.subscribers.lock().expect("event hub lock poisoned");
        if subscribers.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(subscription = %subscriber.id, "subscriber channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscription = %subscriber.id, "removing closed subscriber");
                false
            }
        });

        trace!(topic = %self.topic, kind = %event.kind, delivered, "published event");
        delivered
    }
}
