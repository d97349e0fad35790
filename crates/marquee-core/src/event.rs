//! Typed publish/subscribe events.
//!
//! Three variants: `Event<T>` (unkeyed), `Keyed<K, T>` (notifications carry a
//! key and only reach subscribers of that key) and `NoArgEvent`. Every
//! subscription declares a [`BufferingGuarantee`]:
//!
//! - `None`: the receiver only gets notifications that arrive while it is
//!   actively polling; they are dropped otherwise.
//! - `BufferFirst`: queue of depth 1; new notifications coalesce into the
//!   pending slot.
//! - `BufferAll`: unbounded FIFO queue.
//! - `AtLeastOnce`: never dropped while subscribed; [`Event::notify_blocking`]
//!   waits until each subscriber has observed the value or unsubscribed.
//!
//! Per-subscriber publish order is preserved. Unsubscription is a drop guard;
//! after it runs no further values are delivered and pending ones are
//! discarded.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, oneshot};

/// Delivery guarantee for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingGuarantee {
    /// Deliver only while the receiver is parked in `recv`.
    None,
    /// Keep at most one pending value, newest wins.
    BufferFirst,
    /// Keep every value, FIFO.
    BufferAll,
    /// Keep every value; blocking notifiers wait for observation.
    AtLeastOnce,
}

struct Pending<T> {
    value: T,
    ack: Option<oneshot::Sender<()>>,
}

struct SubscriberShared<T> {
    guarantee: BufferingGuarantee,
    queue: Mutex<VecDeque<Pending<T>>>,
    notify: Notify,
    closed: AtomicBool,
    polling: AtomicBool,
}

impl<T> SubscriberShared<T> {
    fn new(guarantee: BufferingGuarantee) -> Self {
        Self {
            guarantee,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            polling: AtomicBool::new(false),
        }
    }

    /// Enqueue a value per the guarantee. Dropping `ack` (either here or when
    /// the subscription closes) counts as completion for blocking notifiers.
    fn push(&self, value: T, ack: Option<oneshot::Sender<()>>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("subscriber queue poisoned");
            match self.guarantee {
                BufferingGuarantee::None => {
                    if !(self.polling.load(Ordering::Acquire) && queue.is_empty()) {
                        return;
                    }
                    queue.push_back(Pending { value, ack });
                }
                BufferingGuarantee::BufferFirst => {
                    queue.clear();
                    queue.push_back(Pending { value, ack });
                }
                BufferingGuarantee::BufferAll | BufferingGuarantee::AtLeastOnce => {
                    queue.push_back(Pending { value, ack });
                }
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue
            .lock()
            .expect("subscriber queue poisoned")
            .clear();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

enum Subscriber<T> {
    Queue(Arc<SubscriberShared<T>>),
    /// `None`-guarantee callback, invoked on the notifier's execution.
    InlineCallback(Arc<dyn Fn(T) + Send + Sync>),
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Queue(q) => Self::Queue(Arc::clone(q)),
            Self::InlineCallback(cb) => Self::InlineCallback(Arc::clone(cb)),
        }
    }
}

struct Entry<T> {
    id: u64,
    subscriber: Subscriber<T>,
}

struct Inner<T> {
    subscribers: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// An unkeyed typed event.
pub struct Event<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Event<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Event<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn register(&self, subscriber: Subscriber<T>) -> (u64, SubscriptionHandle) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = match &subscriber {
            Subscriber::Queue(q) => Some(Arc::clone(q)),
            Subscriber::InlineCallback(_) => None,
        };
        self.inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Entry { id, subscriber });

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let handle = SubscriptionHandle {
            unsub: Some(Box::new(move || {
                if let Some(shared) = &shared {
                    shared.close();
                }
                if let Some(inner) = weak.upgrade() {
                    inner
                        .subscribers
                        .lock()
                        .expect("subscriber list poisoned")
                        .retain(|e| e.id != id);
                }
            })),
        };
        (id, handle)
    }

    /// Subscribe with the given guarantee. The returned subscription
    /// unsubscribes when dropped.
    pub fn subscribe(&self, guarantee: BufferingGuarantee) -> EventSubscription<T> {
        let shared = Arc::new(SubscriberShared::new(guarantee));
        let (_, guard) = self.register(Subscriber::Queue(Arc::clone(&shared)));
        EventSubscription {
            shared,
            _guard: guard,
        }
    }

    /// Subscribe with a callback. For the `None` guarantee the callback runs
    /// on the notifier's execution; buffered guarantees get a dedicated drain
    /// task. Must be called within a tokio runtime for buffered guarantees.
    pub fn subscribe_using_callback(
        &self,
        guarantee: BufferingGuarantee,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        if guarantee == BufferingGuarantee::None {
            let (_, guard) = self.register(Subscriber::InlineCallback(Arc::new(callback)));
            return guard;
        }

        let mut subscription = self.subscribe(guarantee);
        let shared = Arc::clone(&subscription.shared);
        tokio::spawn(async move {
            while let Some(value) = recv_on(&shared).await {
                callback(value);
            }
        });
        // The drain task ends when the guard closes the shared state.
        SubscriptionHandle {
            unsub: subscription._guard.unsub.take(),
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, value: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let subscribers: Vec<Subscriber<T>> = {
            let subs = self
                .inner
                .subscribers
                .lock()
                .expect("subscriber list poisoned");
            subs.iter().map(|e| e.subscriber.clone()).collect()
        };
        for subscriber in subscribers {
            match subscriber {
                Subscriber::Queue(q) => q.push(value.clone(), None),
                Subscriber::InlineCallback(cb) => cb(value.clone()),
            }
        }
    }

    /// Notify and wait until every live subscriber has dequeued the value (or
    /// unsubscribed). `None`-guarantee subscribers that are not polling do not
    /// hold this up.
    pub async fn notify_blocking(&self, value: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let subscribers: Vec<Subscriber<T>> = {
            let subs = self
                .inner
                .subscribers
                .lock()
                .expect("subscriber list poisoned");
            subs.iter().map(|e| e.subscriber.clone()).collect()
        };
        let mut acks = Vec::new();
        for subscriber in subscribers {
            match subscriber {
                Subscriber::Queue(q) => {
                    let (tx, rx) = oneshot::channel();
                    q.push(value.clone(), Some(tx));
                    acks.push(rx);
                }
                Subscriber::InlineCallback(cb) => cb(value.clone()),
            }
        }
        for ack in acks {
            // Err means the subscription closed without observing; both count
            // as release for the notifier.
            let _ = ack.await;
        }
    }

    /// Permanently close the event; subscribers see end-of-stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let subs = std::mem::take(
            &mut *self
                .inner
                .subscribers
                .lock()
                .expect("subscriber list poisoned"),
        );
        for entry in subs {
            if let Subscriber::Queue(q) = entry.subscriber {
                q.close();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .len()
    }
}

async fn recv_on<T>(shared: &SubscriberShared<T>) -> Option<T> {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return None;
        }
        {
            let mut queue = shared.queue.lock().expect("subscriber queue poisoned");
            if let Some(pending) = queue.pop_front() {
                if let Some(ack) = pending.ack {
                    let _ = ack.send(());
                }
                return Some(pending.value);
            }
        }
        shared.polling.store(true, Ordering::Release);
        shared.notify.notified().await;
        shared.polling.store(false, Ordering::Release);
    }
}

/// A live subscription; `recv` yields values in publish order.
pub struct EventSubscription<T> {
    shared: Arc<SubscriberShared<T>>,
    _guard: SubscriptionHandle,
}

impl<T> EventSubscription<T> {
    /// Receive the next value; `None` after the event closes or the
    /// subscription is cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        recv_on(&self.shared).await
    }

    /// Take the pending value without waiting, if any.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut queue = self.shared.queue.lock().expect("subscriber queue poisoned");
        queue.pop_front().map(|pending| {
            if let Some(ack) = pending.ack {
                let _ = ack.send(());
            }
            pending.value
        })
    }

    /// Explicitly unsubscribe; equivalent to dropping.
    pub fn unsubscribe(self) {}
}

/// Drop guard for a subscription without a receiving end.
pub struct SubscriptionHandle {
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Explicitly unsubscribe; equivalent to dropping. Idempotent.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsub.take() {
            f();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unsub.take() {
            f();
        }
    }
}

/// A keyed event; notifications only reach subscribers of the same key.
pub struct Keyed<K, T> {
    events: Arc<Mutex<HashMap<K, Event<T>>>>,
}

impl<K, T> Clone for Keyed<K, T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<K, T> Default for Keyed<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Keyed<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn event_for(&self, key: &K) -> Event<T> {
        let mut events = self.events.lock().expect("keyed event map poisoned");
        events.entry(key.clone()).or_insert_with(Event::new).clone()
    }

    pub fn subscribe(&self, key: &K, guarantee: BufferingGuarantee) -> EventSubscription<T> {
        self.event_for(key).subscribe(guarantee)
    }

    pub fn subscribe_using_callback(
        &self,
        key: &K,
        guarantee: BufferingGuarantee,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.event_for(key).subscribe_using_callback(guarantee, callback)
    }

    pub fn notify(&self, key: &K, value: T) {
        let event = {
            let events = self.events.lock().expect("keyed event map poisoned");
            events.get(key).cloned()
        };
        if let Some(event) = event {
            event.notify(value);
            self.collect(key, &event);
        }
    }

    pub async fn notify_blocking(&self, key: &K, value: T) {
        let event = {
            let events = self.events.lock().expect("keyed event map poisoned");
            events.get(key).cloned()
        };
        if let Some(event) = event {
            event.notify_blocking(value).await;
            self.collect(key, &event);
        }
    }

    fn collect(&self, key: &K, event: &Event<T>) {
        if event.subscriber_count() == 0 {
            let mut events = self.events.lock().expect("keyed event map poisoned");
            if events
                .get(key)
                .is_some_and(|e| e.subscriber_count() == 0)
            {
                events.remove(key);
            }
        }
    }
}

/// An event that carries no payload.
#[derive(Clone, Default)]
pub struct NoArgEvent(Event<()>);

impl NoArgEvent {
    pub fn new() -> Self {
        Self(Event::new())
    }

    pub fn subscribe(&self, guarantee: BufferingGuarantee) -> EventSubscription<()> {
        self.0.subscribe(guarantee)
    }

    pub fn subscribe_using_callback(
        &self,
        guarantee: BufferingGuarantee,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.0.subscribe_using_callback(guarantee, move |()| callback())
    }

    pub fn notify(&self) {
        self.0.notify(());
    }

    pub async fn notify_blocking(&self) {
        self.0.notify_blocking(()).await;
    }

    pub fn close(&self) {
        self.0.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn buffer_all_preserves_order() {
        let event = Event::new();
        let mut sub = event.subscribe(BufferingGuarantee::BufferAll);

        for i in 0..5 {
            event.notify(i);
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn buffer_first_coalesces() {
        let event = Event::new();
        let mut sub = event.subscribe(BufferingGuarantee::BufferFirst);

        event.notify(1);
        event.notify(2);
        event.notify(3);

        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn none_guarantee_drops_when_not_polling() {
        let event = Event::new();
        let mut sub = event.subscribe(BufferingGuarantee::None);

        event.notify(1);
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn at_least_once_blocking_waits_for_observation() {
        let event = Event::new();
        let mut sub = event.subscribe(BufferingGuarantee::AtLeastOnce);

        let reader = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.notify_blocking(42).await;
        assert_eq!(reader.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn blocking_notify_released_by_unsubscribe() {
        let event = Event::new();
        let sub = event.subscribe(BufferingGuarantee::AtLeastOnce);

        let ev = event.clone();
        let notifier = tokio::spawn(async move { ev.notify_blocking(7).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sub.unsubscribe();
        notifier.await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_callback_never_fires() {
        let event: Event<i32> = Event::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = event.subscribe_using_callback(BufferingGuarantee::None, move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        handle.unsubscribe();
        event.notify(1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_with_buffering_drains() {
        let event = Event::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let _handle = event.subscribe_using_callback(BufferingGuarantee::BufferAll, move |v: usize| {
            seen_clone.fetch_add(v, Ordering::SeqCst);
        });

        event.notify(2);
        event.notify(3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn keyed_events_only_reach_their_key() {
        let keyed: Keyed<String, i32> = Keyed::new();
        let mut a = keyed.subscribe(&"a".to_string(), BufferingGuarantee::BufferAll);
        let mut b = keyed.subscribe(&"b".to_string(), BufferingGuarantee::BufferAll);

        keyed.notify(&"a".to_string(), 1);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.try_recv(), None);
    }

    #[tokio::test]
    async fn closed_event_ends_subscriptions() {
        let event: Event<i32> = Event::new();
        let mut sub = event.subscribe(BufferingGuarantee::BufferAll);
        event.close();
        assert_eq!(sub.recv().await, None);
    }
}
