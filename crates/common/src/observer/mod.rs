//! In-process topic fan-out.
//!
//! An [`Observer`] delivers every published value to each subscriber of the
//! topic independently and concurrently. Nothing is promised about the order
//! in which different subscribers see a value, nor about the relative order
//! of two successive publishes as seen by one subscriber.
//!
//! Each subscription carries its own liveness flag. Unsubscribing flips the
//! flag while holding the topic table's write lock, and a delivery only
//! hands its value over while holding the read lock after checking the flag.
//! Once an unsubscribe returns, nothing more lands in that subscriber. A
//! publish racing an unsubscribe therefore either lands or is dropped for
//! that subscriber; it never fails the publisher.
//!
//! A delivery to a full subscriber retries with backoff until there is room
//! or the subscription goes away. Values are never left parked on the
//! channel's sender side.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How long a delivery may stall before a warning is logged
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Capacity of channels created by [`Observer::subscribe_channel`]
pub const SUBSCRIPTION_CAPACITY: usize = 16;

/// Bounds of the retry interval for a subscriber with no room
const RETRY_MIN: Duration = Duration::from_millis(1);
const RETRY_MAX: Duration = Duration::from_millis(50);

/// Handle identifying one subscription within an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of [`Observer::publish_timeout`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct Liveness {
    removed: AtomicBool,
    notify: Notify,
}

impl Liveness {
    fn remove(&self) {
        self.removed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Resolves once the subscription has been removed
    async fn removed(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before checking so a concurrent remove can't slip between
        notified.as_mut().enable();
        if self.is_removed() {
            return;
        }
        notified.await;
    }
}

struct Subscriber<T> {
    id: SubscriptionId,
    tx: flume::Sender<T>,
    liveness: Arc<Liveness>,
}

struct ObserverInner<T> {
    name: String,
    topics: RwLock<HashMap<String, Vec<Subscriber<T>>>>,
    next_id: AtomicU64,
    stall_timeout: Duration,
}

/// Topic-keyed publish/subscribe bus. Cheap to clone; clones share topics.
pub struct Observer<T> {
    inner: Arc<ObserverInner<T>>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.inner.topics.read();
        f.debug_struct("Observer")
            .field("name", &self.inner.name)
            .field("topics", &topics.len())
            .field(
                "subscribers",
                &topics.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl<T> fmt::Display for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer({})", self.inner.name)
    }
}

impl<T: Clone + Send + 'static> Observer<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stall_timeout(name, DEFAULT_STALL_TIMEOUT)
    }

    pub fn with_stall_timeout(name: impl Into<String>, stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                name: name.into(),
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                stall_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register `tx` to receive every value published on `topic`
    pub fn subscribe(&self, topic: &str, tx: flume::Sender<T>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                liveness: Arc::new(Liveness::default()),
            });
        tracing::trace!(observer = %self.inner.name, topic, ?id, "subscribed");
        id
    }

    /// Subscribe through a fresh bounded channel owned by the observer.
    ///
    /// Nothing is delivered into the receiver after the subscription is
    ///  removed. It disconnects once the pending deliveries have noticed.
    pub fn subscribe_channel(&self, topic: &str) -> (SubscriptionId, flume::Receiver<T>) {
        let (tx, rx) = flume::bounded(SUBSCRIPTION_CAPACITY);
        (self.subscribe(topic, tx), rx)
    }

    /// Remove one subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        self.remove_where(topic, |sub| sub.id == id)
    }

    /// Remove every subscription on `topic` that delivers into `tx`'s channel
    pub fn unsubscribe_channel(&self, topic: &str, tx: &flume::Sender<T>) -> bool {
        self.remove_where(topic, |sub| sub.tx.same_channel(tx))
    }

    /// Tear down a whole topic
    pub fn unsubscribe_all(&self, topic: &str) -> usize {
        let mut topics = self.inner.topics.write();
        let removed = topics.remove(topic).unwrap_or_default();
        for sub in &removed {
            sub.liveness.remove();
        }
        removed.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Fan `data` out to every current subscriber of `topic`.
    ///
    /// Each delivery runs as its own task and blocks for as long as its
    ///  subscriber does, logging a warning once it has stalled past the stall
    ///  timeout. Returns the number of deliveries started. Must be called
    ///  from within a tokio runtime.
    pub fn publish(&self, topic: &str, data: T) -> usize {
        let targets = self.targets(topic);
        let count = targets.len();
        for (tx, liveness) in targets {
            let data = data.clone();
            let inner = self.inner.clone();
            let stall = inner.stall_timeout;
            let topic = topic.to_string();
            tokio::spawn(async move {
                deliver(&inner, &topic, tx, liveness, data, Some(stall)).await;
            });
        }
        count
    }

    /// Like [`Self::publish`], but gives up on any subscriber that has not
    ///  accepted the value within `timeout`, and waits for every delivery to
    ///  either land or be dropped.
    pub async fn publish_timeout(&self, topic: &str, data: T, timeout: Duration) -> PublishReport {
        let targets = self.targets(topic);
        let deliveries = targets.into_iter().map(|(tx, liveness)| {
            let data = data.clone();
            let inner = &self.inner;
            async move {
                tokio::time::timeout(timeout, deliver(inner, topic, tx, liveness, data, None))
                    .await
                    .unwrap_or(false)
            }
        });

        let mut report = PublishReport::default();
        for delivered in futures::future::join_all(deliveries).await {
            if delivered {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }
        if report.dropped > 0 {
            tracing::debug!(
                observer = %self.inner.name,
                topic,
                dropped = report.dropped,
                "publish timed out for some subscribers"
            );
        }
        report
    }

    fn targets(&self, topic: &str) -> Vec<(flume::Sender<T>, Arc<Liveness>)> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .map(|sub| (sub.tx.clone(), sub.liveness.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_where(&self, topic: &str, matches: impl Fn(&Subscriber<T>) -> bool) -> bool {
        let mut topics = self.inner.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| {
            if matches(sub) {
                sub.liveness.remove();
                false
            } else {
                true
            }
        });
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

enum Attempt<T> {
    Delivered,
    Abandoned,
    Full(T),
}

impl<T> ObserverInner<T> {
    /// One non-blocking hand-over, serialized against unsubscribes
    fn try_deliver(&self, tx: &flume::Sender<T>, liveness: &Liveness, data: T) -> Attempt<T> {
        let _topics = self.topics.read();
        if liveness.is_removed() {
            return Attempt::Abandoned;
        }
        match tx.try_send(data) {
            Ok(()) => Attempt::Delivered,
            Err(flume::TrySendError::Full(data)) => Attempt::Full(data),
            Err(flume::TrySendError::Disconnected(_)) => Attempt::Abandoned,
        }
    }
}

/// Push one value into one subscriber. Returns whether it was accepted.
async fn deliver<T>(
    inner: &ObserverInner<T>,
    topic: &str,
    tx: flume::Sender<T>,
    liveness: Arc<Liveness>,
    mut data: T,
    stall: Option<Duration>,
) -> bool {
    let started = Instant::now();
    let mut warned = stall.is_none();
    let stall = stall.unwrap_or(DEFAULT_STALL_TIMEOUT);
    let mut wait = RETRY_MIN;

    loop {
        data = match inner.try_deliver(&tx, &liveness, data) {
            Attempt::Delivered => return true,
            Attempt::Abandoned => return false,
            Attempt::Full(data) => data,
        };
        if !warned && started.elapsed() >= stall {
            tracing::warn!(
                observer = %inner.name,
                topic,
                stalled_for = ?started.elapsed(),
                "subscriber is not keeping up, still blocking on delivery"
            );
            warned = true;
        }
        tokio::select! {
            _ = liveness.removed() => return false,
            _ = tokio::time::sleep(wait) => {}
        }
        wait = (wait * 2).min(RETRY_MAX);
    }
}
