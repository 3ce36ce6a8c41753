//! Ordered fan-out of lifecycle events.
//!
//! Producers never block: each subscriber owns a bounded queue; when it
//! overflows, the oldest events are dropped and a single `EventsDropped`
//! marker is injected into that subscriber's stream until it drains.
//! Registered [`EventSink`] adapters receive every event from a dedicated
//! forwarding task so a slow exporter cannot stall the core.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Event, EventKind, EventPayload};

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
const HISTORY_LIMIT: usize = 1_024;

/// Pluggable observability adapter; one method, fanned to on publish.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &Event);
}

struct SubscriberQueue {
    events: VecDeque<Event>,
    capacity: usize,
    /// Set while an overflow burst is in progress so only one marker
    /// is injected per burst.
    overflowed: bool,
    dropped_total: u64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            overflowed: false,
            dropped_total: 0,
        }
    }

    fn push(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            // Evict the oldest real event; an injected marker stays at the head.
            let marker_at_head = self
                .events
                .front()
                .map(|e| e.kind == EventKind::EventsDropped)
                .unwrap_or(false);
            self.events.remove(usize::from(marker_at_head));
            self.dropped_total += 1;

            if self.overflowed {
                if let Some(front) = self.events.front_mut() {
                    if let EventPayload::Dropped { dropped } = &mut front.payload {
                        *dropped += 1;
                    }
                }
            } else {
                self.overflowed = true;
                let marker = Event::new(
                    EventKind::EventsDropped,
                    "bus",
                    EventPayload::Dropped { dropped: 1 },
                );
                self.events.push_front(marker);
            }
        }
        self.events.push_back(event);
    }

    fn pop(&mut self) -> Option<Event> {
        let event = self.events.pop_front();
        if self.events.is_empty() {
            self.overflowed = false;
        }
        event
    }
}

struct SubscriberEntry {
    filter: Option<HashSet<EventKind>>,
    queue: Arc<Mutex<SubscriberQueue>>,
    notify: Arc<Notify>,
}

impl SubscriberEntry {
    fn wants(&self, kind: EventKind) -> bool {
        // The overflow marker always passes the filter.
        kind == EventKind::EventsDropped
            || self.filter.as_ref().map(|f| f.contains(&kind)).unwrap_or(true)
    }
}

/// Handle for receiving events.
pub struct Subscription {
    id: u64,
    queue: Arc<Mutex<SubscriberQueue>>,
    notify: Arc<Notify>,
}

impl Subscription {
    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.lock().pop()
    }

    /// Await the next event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Drain everything currently pending, in order.
    pub fn recv_all(&self) -> Vec<Event> {
        let mut queue = self.queue.lock();
        let mut events = Vec::with_capacity(queue.events.len());
        while let Some(event) = queue.pop() {
            events.push(event);
        }
        events
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().events.len()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Bus statistics for introspection.
#[derive(Debug, Clone)]
pub struct BusStats {
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_dropped: u64,
    pub history_size: usize,
}

/// Ordered, non-blocking event fan-out.
pub struct EventBus {
    subscribers: RwLock<HashMap<u64, SubscriberEntry>>,
    next_subscriber_id: AtomicU64,
    sequence: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    sink_tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    sink_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            sequence: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
            sinks: RwLock::new(Vec::new()),
            sink_tx: Mutex::new(Some(tx)),
            sink_rx: Mutex::new(Some(rx)),
        }
    }

    /// Subscribe to all kinds, or to a filtered subset.
    pub fn subscribe(&self, kinds: Option<&[EventKind]>) -> Subscription {
        self.subscribe_with_capacity(kinds, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        kinds: Option<&[EventKind]>,
        capacity: usize,
    ) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(Mutex::new(SubscriberQueue::new(capacity.max(2))));
        let notify = Arc::new(Notify::new());

        self.subscribers.write().insert(
            id,
            SubscriberEntry {
                filter: kinds.map(|k| k.iter().copied().collect()),
                queue: Arc::clone(&queue),
                notify: Arc::clone(&notify),
            },
        );

        debug!(subscriber_id = id, "Event subscriber registered");
        Subscription { id, queue, notify }
    }

    /// Subscribe and replay history newer than `after_sequence` first.
    pub fn subscribe_from(
        &self,
        kinds: Option<&[EventKind]>,
        after_sequence: u64,
    ) -> Subscription {
        let subscription = self.subscribe(kinds);
        let history = self.history.lock();
        let mut queue = subscription.queue.lock();
        for event in history.iter().filter(|e| e.sequence > after_sequence) {
            let wanted = kinds
                .map(|k| k.contains(&event.kind))
                .unwrap_or(true);
            if wanted {
                queue.push(event.clone());
            }
        }
        drop(queue);
        subscription.notify.notify_one();
        subscription
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    /// Register an export adapter. Delivery starts once the forwarder runs.
    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Publish an event to every subscriber and sink. Never blocks.
    ///
    /// Returns the sequence number assigned to the event.
    pub fn publish(&self, mut event: Event) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        event.sequence = sequence;

        {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        let subscribers = self.subscribers.read();
        for entry in subscribers.values() {
            if entry.wants(event.kind) {
                entry.queue.lock().push(event.clone());
                entry.notify.notify_one();
            }
        }
        drop(subscribers);

        if !self.sinks.read().is_empty() {
            if let Some(tx) = self.sink_tx.lock().as_ref() {
                let _ = tx.send(event);
            }
        }

        sequence
    }

    /// Run the sink forwarding loop. Called once by the orchestrator engine;
    /// returns immediately if the forwarder was already taken.
    pub fn spawn_sink_forwarder(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.sink_rx.lock().take()?;
        let bus = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let sinks: Vec<_> = bus.sinks.read().iter().cloned().collect();
                for sink in sinks {
                    sink.emit(&event).await;
                }
            }
        }))
    }

    /// Drain pending sink deliveries on shutdown by closing the channel.
    pub fn close_sinks(&self) {
        if self.sink_tx.lock().take().is_some() {
            warn!("Event sink channel closed");
        }
    }

    /// Most recent sequence number handed out.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst).saturating_sub(1)
    }

    pub fn stats(&self) -> BusStats {
        let subscribers = self.subscribers.read();
        let total_dropped = subscribers
            .values()
            .map(|s| s.queue.lock().dropped_total)
            .sum();
        BusStats {
            subscriber_count: subscribers.len(),
            total_published: self.last_sequence(),
            total_dropped,
            history_size: self.history.lock().len(),
        }
    }
}
