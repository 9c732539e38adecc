//! # In-process event bus
//!
//! Topic-based publish/subscribe with two delivery modes:
//!
//! - [`EventBus::publish`] enqueues the event on every matching subscriber's queue and
//!   returns immediately. Each subscriber owns a worker task that drains its queue in
//!   FIFO order, so a slow or failing handler never stalls the publisher and events
//!   published in sequence reach each subscriber in that sequence.
//! - [`EventBus::publish_sync`] runs every matching handler inline and reports the
//!   first failure. It bypasses the subscriber queues.
//!
//! ```text
//! publish(event)
//!     │
//!     ├──► [queue 1] ──► worker 1 ──► handler1.handle()
//!     ├──► [queue 2] ──► worker 2 ──► handler2.handle()
//!     └──► broadcast ──► stream receivers (waiters)
//! ```
//!
//! The subscription table is copy-on-write: publishers clone an `Arc<[Subscription]>`
//! under a short read lock and never block on subscribe/unsubscribe.

use super::types::Event;
use crate::error::EventError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

/// Receives events for the topics it is subscribed to
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and error reports
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn handle(&self, event: Arc<Event>) -> Result<(), EventError>;
}

type HandlerFn = dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<(), EventError>> + Send + Sync;

/// Adapts an async closure into an [`EventHandler`]
pub struct FnHandler {
    name: String,
    f: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EventError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |event| f(event).boxed()),
        }
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<Event>) -> Result<(), EventError> {
        (self.f)(event).await
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bus tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Per-subscriber queue bound; `None` for unbounded queues
    pub subscriber_queue_capacity: Option<usize>,
    /// Ring size of the broadcast stream used by [`EventBus::stream`]
    pub stream_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: None,
            stream_capacity: 1024,
        }
    }
}

#[derive(Clone)]
enum SubscriberQueue {
    Unbounded(mpsc::UnboundedSender<Arc<Event>>),
    Bounded(mpsc::Sender<Arc<Event>>),
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn EventHandler>,
    queue: SubscriberQueue,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub published: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    handler_failures: Arc<AtomicU64>,
}

/// Topic-routed publish/subscribe bus; share it behind an `Arc`
pub struct EventBus {
    config: EventBusConfig,
    subscriptions: RwLock<HashMap<String, Arc<[Subscription]>>>,
    workers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    stream: broadcast::Sender<Arc<Event>>,
    counters: Counters,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (stream, _) = broadcast::channel(config.stream_capacity.max(1));
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            stream,
            counters: Counters::default(),
        }
    }

    /// Register `handler` for `topic` and spawn its worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let name = handler.name().to_string();

        let (queue, worker) = match self.config.subscriber_queue_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let worker = spawn_bounded_worker(rx, Arc::clone(&handler), self.failures());
                (SubscriberQueue::Bounded(tx), worker)
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = spawn_unbounded_worker(rx, Arc::clone(&handler), self.failures());
                (SubscriberQueue::Unbounded(tx), worker)
            }
        };

        let subscription = Subscription {
            id,
            name: name.clone(),
            handler,
            queue,
        };

        {
            let mut table = self.subscriptions.write();
            let mut next = table.get(topic).map(|subs| subs.to_vec()).unwrap_or_default();
            next.push(subscription);
            table.insert(topic.to_string(), next.into());
        }
        self.workers.lock().insert(id, worker);

        debug!(topic, subscriber = %name, subscription_id = %id, "Subscribed to topic");
        id
    }

    /// Convenience wrapper around [`subscribe`](Self::subscribe) for async closures
    pub fn subscribe_fn<F, Fut>(&self, topic: &str, name: &str, f: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EventError>> + Send + 'static,
    {
        self.subscribe(topic, Arc::new(FnHandler::new(name, f)))
    }

    /// Remove a subscription. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        {
            let mut table = self.subscriptions.write();
            for subs in table.values_mut() {
                if subs.iter().any(|s| s.id == id) {
                    let next: Vec<Subscription> =
                        subs.iter().filter(|s| s.id != id).cloned().collect();
                    *subs = next.into();
                    removed = true;
                }
            }
            table.retain(|_, subs| !subs.is_empty());
        }
        // Dropping the last sender lets the worker drain and exit on its own
        self.workers.lock().remove(&id);
        removed
    }

    fn matching(&self, topic: &str) -> Option<Arc<[Subscription]>> {
        self.subscriptions.read().get(topic).cloned()
    }

    fn failures(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counters.handler_failures)
    }

    /// Fire-and-forget publish. Returns the number of subscriber queues that accepted it.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.stream.send(Arc::clone(&event));

        let Some(subs) = self.matching(&event.event_type) else {
            return 0;
        };

        let mut accepted = 0;
        for sub in subs.iter() {
            let outcome = match &sub.queue {
                SubscriberQueue::Unbounded(tx) => tx
                    .send(Arc::clone(&event))
                    .map_err(|_| "closed"),
                SubscriberQueue::Bounded(tx) => {
                    tx.try_send(Arc::clone(&event)).map_err(|err| match err {
                        mpsc::error::TrySendError::Full(_) => "full",
                        mpsc::error::TrySendError::Closed(_) => "closed",
                    })
                }
            };
            match outcome {
                Ok(()) => accepted += 1,
                Err(reason) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %event.event_type,
                        subscriber = %sub.name,
                        reason,
                        "Dropped event for subscriber"
                    );
                }
            }
        }
        self.counters
            .enqueued
            .fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    /// Deliver to every matching handler inline, in subscription order
    pub async fn publish_sync(&self, event: Event) -> Result<(), EventError> {
        let event = Arc::new(event);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.stream.send(Arc::clone(&event));

        let Some(subs) = self.matching(&event.event_type) else {
            return Ok(());
        };

        let mut first_error = None;
        for sub in subs.iter() {
            if let Err(err) = sub.handler.handle(Arc::clone(&event)).await {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %event.event_type, subscriber = %sub.name, error = %err, "Event handler failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Every event published after this call, across all topics. Slow receivers lag
    /// and skip events; callers needing certainty must re-read the store.
    pub fn stream(&self) -> broadcast::Receiver<Arc<Event>> {
        self.stream.subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.matching(topic).map_or(0, |subs| subs.len())
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            subscribers: self.subscriptions.read().values().map(|s| s.len()).sum(),
        }
    }

    /// Drop every subscription and wait for workers to drain their queues
    pub async fn shutdown(&self) {
        self.subscriptions.write().clear();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain().map(|(_, h)| h).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn deliver(handler: &Arc<dyn EventHandler>, event: Arc<Event>, failures: &AtomicU64) {
    let topic = event.event_type.clone();
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %topic, subscriber = handler.name(), error = %err, "Event handler failed");
        }
        Err(panic) => {
            failures.fetch_add(1, Ordering::Relaxed);
            let reason = panic
                .downcast_ref::<&'static str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(topic = %topic, subscriber = handler.name(), reason = %reason, "Event handler panicked");
        }
    }
}

fn spawn_unbounded_worker(
    mut rx: mpsc::UnboundedReceiver<Arc<Event>>,
    handler: Arc<dyn EventHandler>,
    failures: Arc<AtomicU64>,
) -> JoinHandle<()> {
    let span = info_span!("event_subscriber", subscriber = %handler.name());
    tokio::spawn(
        async move {
            while let Some(event) = rx.recv().await {
                deliver(&handler, event, &failures).await;
            }
        }
        .instrument(span),
    )
}

fn spawn_bounded_worker(
    mut rx: mpsc::Receiver<Arc<Event>>,
    handler: Arc<dyn EventHandler>,
    failures: Arc<AtomicU64>,
) -> JoinHandle<()> {
    let span = info_span!("event_subscriber", subscriber = %handler.name());
    tokio::spawn(
        async move {
            while let Some(event) = rx.recv().await {
                deliver(&handler, event, &failures).await;
            }
        }
        .instrument(span),
    )
}
