//! Typed in-process publish/subscribe bus.
//!
//! Components register under a fixed set of client names and create typed
//! publishers and subscribers from their client handle. Every subscriber has
//! its own bounded FIFO queue; publishing never blocks. When a queue is full
//! the event is dropped for that subscriber only and a bus-wide counter is
//! incremented. State updates are snapshot-idempotent, so a dropped delta
//! only delays convergence until the next update (or the liveness
//! supervisor's periodic status fetch) arrives.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default bound of each subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub const CLIENT_PLUG_MANAGER: &str = "plugmanager";
pub const CLIENT_MQTT: &str = "mqtt";
pub const CLIENT_WEB: &str = "web";
pub const CLIENT_HAP: &str = "hap";
pub const CLIENT_METRICS: &str = "metrics";

const KNOWN_CLIENTS: [&str; 5] = [
    CLIENT_PLUG_MANAGER,
    CLIENT_MQTT,
    CLIENT_WEB,
    CLIENT_HAP,
    CLIENT_METRICS,
];

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown bus client {0:?}")]
    UnknownClient(String),
    #[error("bus client {0:?} already registered")]
    DuplicateClient(String),
}

/// Marker for types that can travel on the bus.
pub trait BusMessage: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> BusMessage for T {}

struct TopicSubs<T> {
    senders: Vec<mpsc::Sender<T>>,
}

struct Inner {
    topics: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
    clients: Mutex<HashSet<String>>,
    queue_capacity: usize,
    dropped: AtomicU64,
    shutdown: CancellationToken,
}

/// Process-local event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Bus {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashSet::new()),
                queue_capacity,
                dropped: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers a named client. Names come from the closed set of bridge
    /// components; registering twice is a programming error and fails.
    pub fn client(&self, name: &str) -> Result<Client, BusError> {
        if !KNOWN_CLIENTS.contains(&name) {
            return Err(BusError::UnknownClient(name.to_string()));
        }
        let mut clients = self.inner.clients.lock();
        if !clients.insert(name.to_string()) {
            return Err(BusError::DuplicateClient(name.to_string()));
        }
        Ok(Client {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Total events dropped across all subscribers because a queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Closes every subscriber. Pending events are discarded; publishing
    /// afterwards is a no-op and new subscribers start out closed.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.topics.lock().clear();
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A named handle onto the bus from which typed endpoints are created.
pub struct Client {
    name: String,
    inner: Arc<Inner>,
}

impl Client {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher<T: BusMessage>(&self) -> Publisher<T> {
        Publisher {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }

    pub fn subscriber<T: BusMessage>(&self) -> Subscriber<T> {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        if !self.inner.shutdown.is_cancelled() {
            let mut topics = self.inner.topics.lock();
            let entry = topics
                .entry(TypeId::of::<T>())
                .or_insert_with(|| Box::new(TopicSubs::<T> { senders: Vec::new() }));
            if let Some(subs) = entry.downcast_mut::<TopicSubs<T>>() {
                subs.senders.push(tx);
            }
        }
        Subscriber {
            rx,
            shutdown: self.inner.shutdown.clone(),
        }
    }
}

/// Typed publishing endpoint. Publishing never blocks and never fails.
pub struct Publisher<T> {
    inner: Arc<Inner>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Publisher {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: BusMessage> Publisher<T> {
    pub fn publish(&self, event: T) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut topics = self.inner.topics.lock();
        let Some(entry) = topics.get_mut(&TypeId::of::<T>()) else {
            return;
        };
        let Some(subs) = entry.downcast_mut::<TopicSubs<T>>() else {
            return;
        };
        subs.senders.retain(|tx| !tx.is_closed());
        for tx in &subs.senders {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Typed subscription endpoint with a bounded FIFO queue.
pub struct Subscriber<T> {
    rx: mpsc::Receiver<T>,
    shutdown: CancellationToken,
}

impl<T: BusMessage> Subscriber<T> {
    /// Next event, or `None` once the bus is closed. Events still queued at
    /// close time are discarded.
    pub async fn recv(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<T> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Releases the queue. Publishers prune closed subscribers lazily.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Pong(&'static str);

    #[test]
    fn duplicate_client_fails() {
        let bus = Bus::new();
        bus.client(CLIENT_WEB).unwrap();
        assert!(matches!(
            bus.client(CLIENT_WEB),
            Err(BusError::DuplicateClient(_))
        ));
    }

    #[test]
    fn unknown_client_fails() {
        let bus = Bus::new();
        assert!(matches!(
            bus.client("dashboard"),
            Err(BusError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let bus = Bus::new();
        let publisher = bus.client(CLIENT_PLUG_MANAGER).unwrap().publisher::<Ping>();
        let web = bus.client(CLIENT_WEB).unwrap();
        let hap = bus.client(CLIENT_HAP).unwrap();
        let mut sub_a = web.subscriber::<Ping>();
        let mut sub_b = hap.subscriber::<Ping>();

        for i in 0..10 {
            publisher.publish(Ping(i));
        }

        for i in 0..10 {
            assert_eq!(sub_a.recv().await, Some(Ping(i)));
            assert_eq!(sub_b.recv().await, Some(Ping(i)));
        }
    }

    #[tokio::test]
    async fn types_are_isolated() {
        let bus = Bus::new();
        let client = bus.client(CLIENT_PLUG_MANAGER).unwrap();
        let web = bus.client(CLIENT_WEB).unwrap();
        let mut pings = web.subscriber::<Ping>();
        let mut pongs = web.subscriber::<Pong>();

        client.publisher::<Ping>().publish(Ping(1));
        client.publisher::<Pong>().publish(Pong("hello"));

        assert_eq!(pings.recv().await, Some(Ping(1)));
        assert_eq!(pongs.recv().await, Some(Pong("hello")));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_others() {
        let bus = Bus::with_queue_capacity(8);
        let publisher = bus.client(CLIENT_PLUG_MANAGER).unwrap().publisher::<Ping>();
        let web = bus.client(CLIENT_WEB).unwrap();
        let hap = bus.client(CLIENT_HAP).unwrap();
        let _stuck = web.subscriber::<Ping>();
        let mut live = hap.subscriber::<Ping>();

        // Interleave publishing with draining the live subscriber so its
        // queue never fills; the stuck one overflows after 8 events.
        for i in 0..1000u32 {
            publisher.publish(Ping(i));
            assert_eq!(live.recv().await, Some(Ping(i)));
        }

        assert_eq!(bus.dropped(), 1000 - 8);
    }

    #[tokio::test]
    async fn close_discards_pending_events() {
        let bus = Bus::new();
        let publisher = bus.client(CLIENT_PLUG_MANAGER).unwrap().publisher::<Ping>();
        let mut sub = bus.client(CLIENT_WEB).unwrap().subscriber::<Ping>();

        publisher.publish(Ping(1));
        bus.close();

        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn publish_after_close_is_noop() {
        let bus = Bus::new();
        let publisher = bus.client(CLIENT_PLUG_MANAGER).unwrap().publisher::<Ping>();
        bus.close();
        publisher.publish(Ping(1));
        assert_eq!(bus.dropped(), 0);
    }

    #[tokio::test]
    async fn subscribe_after_close_yields_closed_subscriber() {
        let bus = Bus::new();
        let client = bus.client(CLIENT_WEB).unwrap();
        bus.close();
        let mut sub = client.subscriber::<Ping>();
        let got = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("recv should resolve immediately on a closed bus");
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = Bus::new();
        let publisher = bus.client(CLIENT_PLUG_MANAGER).unwrap().publisher::<Ping>();
        let web = bus.client(CLIENT_WEB).unwrap();
        {
            let _sub = web.subscriber::<Ping>();
        }
        // Publishing into a topic whose only subscriber is gone must not
        // count drops.
        publisher.publish(Ping(1));
        assert_eq!(bus.dropped(), 0);
    }
}
