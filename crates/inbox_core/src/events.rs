use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::record::NotificationRecord;

pub const DEFAULT_DELIVERY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Update,
    RecordReceived,
    RecordRead,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::Update,
        EventKind::RecordReceived,
        EventKind::RecordRead,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::RecordReceived => "record-received",
            EventKind::RecordRead => "record-readed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Payload-free; observers should re-read everything.
    Update,
    RecordReceived(NotificationRecord),
    RecordRead(NotificationRecord),
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StoreEvent::Update => EventKind::Update,
            StoreEvent::RecordReceived(_) => EventKind::RecordReceived,
            StoreEvent::RecordRead(_) => EventKind::RecordRead,
        }
    }

    pub fn record(&self) -> Option<&NotificationRecord> {
        match self {
            StoreEvent::Update => None,
            StoreEvent::RecordReceived(record) | StoreEvent::RecordRead(record) => Some(record),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventCallback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

struct QueuedEvent {
    due: Instant,
    event: StoreEvent,
}

struct BusInner {
    delay: Duration,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventCallback)>>>,
    queue: Mutex<VecDeque<QueuedEvent>>,
}

/// In-process publish/subscribe bus for store events.
///
/// Publishing only queues; the host drives delivery from its main loop with
/// [`EventBus::dispatch_due`] (or [`EventBus::dispatch_all`]), so observers
/// never run inside the mutation that produced the event. Only topics with at
/// least one subscriber are queued.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_delay(DEFAULT_DELIVERY_DELAY)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("delay", &self.inner.delay)
            .field("pending", &self.pending())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                delay,
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        tracing::trace!(topic = %kind, ?id, "subscribed");
        id
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(candidate, _)| *candidate == id) {
                list.remove(pos);
                tracing::trace!(?id, "unsubscribed");
                return true;
            }
        }
        false
    }

    pub fn unsubscribe_all(&self, ids: &[SubscriptionId]) -> usize {
        ids.iter().filter(|id| self.unsubscribe(**id)).count()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&kind)
            .map_or(0, |list| list.len())
    }

    /// Queues `event` for delivery. Events on a topic nobody listens to are
    /// dropped here, so a bus that is never pumped stays empty.
    pub fn publish(&self, event: StoreEvent) {
        let kind = event.kind();
        if self.subscriber_count(kind) == 0 {
            tracing::trace!(topic = %kind, "no observers, dropping store event");
            return;
        }
        let due = Instant::now() + self.inner.delay;
        tracing::debug!(topic = %kind, "queued store event");
        self.inner.queue.lock().push_back(QueuedEvent { due, event });
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// When the earliest queued event becomes deliverable.
    pub fn next_due(&self) -> Option<Instant> {
        self.inner.queue.lock().front().map(|queued| queued.due)
    }

    /// Delivers every queued event whose delay has elapsed. Returns the number delivered.
    pub fn dispatch_due(&self) -> usize {
        self.dispatch_until(Instant::now())
    }

    /// Delivers every queued event regardless of its delay.
    pub fn dispatch_all(&self) -> usize {
        let drained: Vec<StoreEvent> = {
            let mut queue = self.inner.queue.lock();
            queue.drain(..).map(|queued| queued.event).collect()
        };
        self.deliver(drained)
    }

    fn dispatch_until(&self, now: Instant) -> usize {
        let ready: Vec<StoreEvent> = {
            let mut queue = self.inner.queue.lock();
            let mut ready = Vec::new();
            // The delay is uniform, so queue order is due order.
            while queue.front().is_some_and(|queued| queued.due <= now) {
                if let Some(queued) = queue.pop_front() {
                    ready.push(queued.event);
                }
            }
            ready
        };
        self.deliver(ready)
    }

    fn deliver(&self, events: Vec<StoreEvent>) -> usize {
        let count = events.len();
        for event in events {
            let callbacks: Vec<EventCallback> = self
                .inner
                .subscribers
                .read()
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            tracing::debug!(
                topic = %event.kind(),
                observers = callbacks.len(),
                "delivering store event"
            );
            for callback in callbacks {
                callback(&event);
            }
        }
        count
    }
}
