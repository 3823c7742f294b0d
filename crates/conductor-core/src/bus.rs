//! Asynchronous publish/subscribe hub with bounded history.
//!
//! Published messages are appended to a circular history buffer and pushed
//! onto a FIFO delivery queue. A single drain worker (one tokio task per bus)
//! pops messages strictly in publish order and runs every matching handler to
//! completion before moving to the next message.

use crate::error::{ConductorError, ConductorResult};
use crate::message::{BusMessage, MessageType, Recipient};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reserved subscriber id for broadcast-only handlers.
pub const BROADCAST_SUBSCRIBER: &str = "__broadcast__";

/// Callback invoked for every message delivered to a subscriber.
///
/// Returning an error (or panicking) is logged and isolated to this handler.
pub type Handler = Arc<dyn Fn(&BusMessage) -> ConductorResult<()> + Send + Sync>;

/// Bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of messages retained in history before the oldest is evicted.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
        }
    }
}

/// Read-only query over retained history. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only messages from this sender.
    pub from: Option<String>,
    /// Only messages addressed to this recipient.
    pub to: Option<Recipient>,
    /// Only messages of this type.
    pub kind: Option<MessageType>,
    /// Only messages stamped at or after this time.
    pub since: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    /// Filter that matches every message.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one sender.
    pub fn from(mut self, sender: impl Into<String>) -> Self {
        self.from = Some(sender.into());
        self
    }

    /// Restrict to one recipient.
    pub fn to(mut self, recipient: impl Into<Recipient>) -> Self {
        self.to = Some(recipient.into());
        self
    }

    /// Restrict to one message type.
    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to messages at or after `since`.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, message: &BusMessage) -> bool {
        self.from.as_ref().map_or(true, |f| &message.from == f)
            && self.to.as_ref().map_or(true, |t| &message.to == t)
            && self.kind.map_or(true, |k| message.kind == k)
            && self.since.map_or(true, |s| message.timestamp >= s)
    }
}

struct Subscriber {
    id: u64,
    handler: Handler,
}

struct BusInner {
    max_history: usize,
    running: AtomicBool,
    subscribers: Mutex<BTreeMap<String, Vec<Subscriber>>>,
    history: Mutex<VecDeque<BusMessage>>,
    queue: Mutex<VecDeque<BusMessage>>,
    /// Messages accepted but not yet fully delivered (queued or in flight).
    pending: AtomicUsize,
    wake: Arc<Notify>,
    idle: Notify,
    next_subscriber: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn record(&self, message: &BusMessage) {
        let mut history = self.history.lock();
        history.push_back(message.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    fn settle(&self, delivered: usize) {
        if delivered > 0 && self.pending.fetch_sub(delivered, Ordering::SeqCst) == delivered {
            self.idle.notify_waiters();
        }
    }

    fn drain(&self) {
        while self.running.load(Ordering::SeqCst) {
            let next = self.queue.lock().pop_front();
            let Some(message) = next else {
                break;
            };
            self.deliver(&message);
            self.settle(1);
        }
    }

    fn targets(&self, message: &BusMessage) -> Vec<(String, Handler)> {
        let subscribers = self.subscribers.lock();
        let collect = |id: &String, handlers: &Vec<Subscriber>| {
            handlers
                .iter()
                .map(|s| (id.clone(), Arc::clone(&s.handler)))
                .collect::<Vec<_>>()
        };

        match &message.to {
            Recipient::Broadcast => {
                let mut targets = Vec::new();
                for (id, handlers) in &*subscribers {
                    if id == BROADCAST_SUBSCRIBER || *id == message.from {
                        continue;
                    }
                    targets.extend(collect(id, handlers));
                }
                if let Some((id, handlers)) = subscribers.get_key_value(BROADCAST_SUBSCRIBER) {
                    targets.extend(collect(id, handlers));
                }
                targets
            }
            Recipient::Agent(recipient) => subscribers
                .get_key_value(recipient)
                .map(|(id, handlers)| collect(id, handlers))
                .unwrap_or_default(),
        }
    }

    fn deliver(&self, message: &BusMessage) {
        // Handlers run without any bus lock held so they can publish or
        // (un)subscribe from inside a callback.
        let targets = self.targets(message);
        if targets.is_empty() {
            debug!(message_id = %message.id, kind = %message.kind, to = %message.to, "No subscribers for message");
            return;
        }

        for (subscriber, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        subscriber = %subscriber,
                        message_id = %message.id,
                        kind = %message.kind,
                        error = %e,
                        "Message handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        subscriber = %subscriber,
                        message_id = %message.id,
                        kind = %message.kind,
                        "Message handler panicked"
                    );
                }
            }
        }
    }

    fn remove(&self, subscriber: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(handlers) = subscribers.get_mut(subscriber) {
            handlers.retain(|s| s.id != id);
            if handlers.is_empty() {
                subscribers.remove(subscriber);
            }
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

async fn run_worker(bus: Weak<BusInner>, wake: Arc<Notify>) {
    loop {
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match bus.upgrade() {
            Some(inner) => inner.drain(),
            None => return,
        }

        notified.await;
    }
}

/// Handle returned by [`MessageBus::subscribe`].
///
/// Dropping the handle leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the Subscription to be able to unsubscribe later"]
pub struct Subscription {
    bus: Weak<BusInner>,
    subscriber: String,
    id: u64,
}

impl Subscription {
    /// The subscriber id this handler was registered under.
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Removes the handler. The subscriber id disappears with its last handler.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.subscriber, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber", &self.subscriber)
            .field("id", &self.id)
            .finish()
    }
}

/// Publish/subscribe hub decoupling the orchestrator from its agents.
///
/// Cloning is cheap; every clone refers to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a stopped bus with the given settings.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                max_history: config.max_history,
                running: AtomicBool::new(false),
                subscribers: Mutex::new(BTreeMap::new()),
                history: Mutex::new(VecDeque::new()),
                queue: Mutex::new(VecDeque::new()),
                pending: AtomicUsize::new(0),
                wake: Arc::new(Notify::new()),
                idle: Notify::new(),
                next_subscriber: AtomicU64::new(0),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Create a stopped bus retaining at most `max_history` messages.
    pub fn with_history(max_history: usize) -> Self {
        Self::new(BusConfig { max_history })
    }

    /// Start accepting messages and spawn the drain worker if needed.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);

        let mut worker = self.inner.worker.lock();
        if worker.as_ref().map_or(true, JoinHandle::is_finished) {
            let bus = Arc::downgrade(&self.inner);
            let wake = Arc::clone(&self.inner.wake);
            *worker = Some(tokio::spawn(run_worker(bus, wake)));
        }
        drop(worker);

        self.inner.wake.notify_one();
        info!("Message bus started");
    }

    /// Stop accepting messages and drop everything still queued for delivery.
    pub fn stop(&self) {
        let dropped = {
            let mut queue = self.inner.queue.lock();
            self.inner.running.store(false, Ordering::SeqCst);
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.inner.settle(dropped);

        if dropped > 0 {
            warn!(dropped, "Message bus stopped with undelivered messages");
        }
        info!("Message bus stopped");
    }

    /// Whether the bus currently accepts messages.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register `handler` under `subscriber`. Several handlers may share an id.
    pub fn subscribe<F>(&self, subscriber: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&BusMessage) -> ConductorResult<()> + Send + Sync + 'static,
    {
        let subscriber = subscriber.into();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .lock()
            .entry(subscriber.clone())
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });

        debug!(subscriber = %subscriber, "Handler subscribed");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            subscriber,
            id,
        }
    }

    /// Register a handler invoked for every broadcast message.
    pub fn subscribe_to_broadcast<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BusMessage) -> ConductorResult<()> + Send + Sync + 'static,
    {
        self.subscribe(BROADCAST_SUBSCRIBER, handler)
    }

    /// Record `message` in history and queue it for delivery.
    ///
    /// Returns [`ConductorError::BusStopped`] (after logging a warning) when the
    /// bus is not running; the message is then neither recorded nor delivered.
    pub fn publish(&self, message: BusMessage) -> ConductorResult<()> {
        let mut queue = self.inner.queue.lock();
        if !self.inner.running.load(Ordering::SeqCst) {
            drop(queue);
            warn!(
                message_id = %message.id,
                kind = %message.kind,
                from = %message.from,
                "Cannot publish - bus not running"
            );
            return Err(ConductorError::BusStopped);
        }

        self.inner.record(&message);
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        queue.push_back(message);
        drop(queue);

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Wait until every accepted message has been delivered.
    ///
    /// Must not be awaited from inside a handler.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Messages in retained history matching `filter`, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<BusMessage> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    /// Drop all retained history.
    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Number of distinct subscriber ids (the broadcast-only id included).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Whether at least one handler is registered under `subscriber`.
    pub fn is_subscribed(&self, subscriber: &str) -> bool {
        self.inner.subscribers.lock().contains_key(subscriber)
    }

    /// A handle that does not keep the bus alive.
    ///
    /// Handlers that publish back onto their own bus should capture this
    /// instead of a clone, otherwise the bus and its handlers form a cycle.
    pub fn downgrade(&self) -> WeakMessageBus {
        WeakMessageBus {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference to a [`MessageBus`].
#[derive(Clone)]
pub struct WeakMessageBus {
    inner: Weak<BusInner>,
}

impl WeakMessageBus {
    /// The bus, if it is still alive.
    pub fn upgrade(&self) -> Option<MessageBus> {
        self.inner.upgrade().map(|inner| MessageBus { inner })
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("running", &self.is_running())
            .field("max_history", &self.inner.max_history)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
