//! In-process topic pub/sub with asynchronous, best-effort delivery.
//!
//! Every subscriber owns a queue drained by its own task, so one subscriber
//! observes publications in publish order while distinct subscribers run
//! concurrently. Nothing is durable; `release` drains in-flight handlers on
//! shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionId(u64);

pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

struct BusInner<E> {
    topics: Mutex<HashMap<&'static str, Vec<Subscriber<E>>>>,
    handlers: TaskTracker,
    next_id: AtomicU64,
}

struct Subscriber<E> {
    id: SubscriptionId,
    events: mpsc::UnboundedSender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                handlers: TaskTracker::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `handler` for every future publication on `topic`. The
    /// handler runs on its own task and sees events in publish order.
    pub fn subscribe<F, Fut>(&self, topic: &'static str, handler: F) -> SubscriptionId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (events, mut queue) = mpsc::unbounded_channel::<E>();
        self.inner.handlers.spawn(async move {
            while let Some(event) = queue.recv().await {
                handler(event).await;
            }
        });
        self.topics()
            .entry(topic)
            .or_default()
            .push(Subscriber { id, events });
        id
    }

    /// Queue `event` for every subscriber of `topic`. Never blocks.
    pub fn publish(&self, topic: &'static str, event: E) {
        debug!(topic, "publishing event");
        let topics = self.topics();
        let Some(subscribers) = topics.get(topic) else {
            return;
        };
        for subscriber in subscribers {
            let _ = subscriber.events.send(event.clone());
        }
    }

    /// Remove exactly the handler registered under `id`. Events already
    /// queued for it are still delivered.
    pub fn unsubscribe(&self, topic: &'static str, id: SubscriptionId) {
        if let Some(subscribers) = self.topics().get_mut(topic) {
            subscribers.retain(|subscriber| subscriber.id != id);
        }
    }

    /// Drop every subscription and wait for in-flight handlers to complete.
    pub async fn release(&self) {
        self.topics().clear();
        self.inner.handlers.close();
        self.inner.handlers.wait().await;
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, Vec<Subscriber<E>>>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
