//! In-process publish/subscribe for stage events.
//!
//! Single topic, per-subscriber bounded FIFO queue. Publication never
//! blocks the producer: on overflow the oldest queued event is dropped and
//! the subscriber's drop counter is incremented.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::StageEvent;
use crate::error::{FlowError, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct SubscriberQueue {
    events: Mutex<VecDeque<StageEvent>>,
    dropped: AtomicU64,
    capacity: usize,
    notify: Notify,
}

impl SubscriberQueue {
    fn push(&self, event: StageEvent) {
        {
            let mut events = self.events.lock();
            if events.len() == self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

struct BusState {
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    next_id: u64,
    closed: bool,
}

/// Fan-out bus for all stage events.
pub struct EventBus {
    state: RwLock<BusState>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(BusState {
                subscribers: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber. Fails with [`FlowError::BusClosed`] once the
    /// bus has been closed.
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
        let mut state = self.state.write();
        if state.closed {
            return Err(FlowError::BusClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::with_capacity(self.capacity)),
            dropped: AtomicU64::new(0),
            capacity: self.capacity,
            notify: Notify::new(),
        });
        state.subscribers.insert(id, Arc::clone(&queue));
        Ok(Subscription {
            id,
            queue,
            bus: Arc::clone(self),
        })
    }

    /// Deliver an event to every subscriber. Non-blocking; a no-op on a
    /// closed bus.
    pub fn publish(&self, event: StageEvent) {
        let state = self.state.read();
        if state.closed {
            return;
        }
        for queue in state.subscribers.values() {
            queue.push(event.clone());
        }
    }

    /// Close the bus: further publishes are dropped, pending `recv` calls
    /// drain their queues and then observe end-of-stream.
    pub fn close(&self) {
        let mut state = self.state.write();
        state.closed = true;
        for queue in state.subscribers.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.state.write().subscribers.remove(&id);
    }
}

/// Subscriber handle. Dropping it releases the queue; explicit
/// [`Subscription::unsubscribe`] is idempotent.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Pop the next queued event without waiting.
    pub fn try_recv(&self) -> Option<StageEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Wait for the next event. Returns `None` once the bus is closed and
    /// the queue is drained.
    pub async fn recv(&self) -> Option<StageEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.bus.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Drain everything currently queued, in publication order.
    pub fn drain(&self) -> Vec<StageEvent> {
        let mut events = self.queue.events.lock();
        events.drain(..).collect()
    }

    /// Events lost to overflow since subscription.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.events.lock().len()
    }

    pub fn unsubscribe(&self) {
        self.bus.unsubscribe(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::{Stage, StageStatus};

    fn event(n: usize) -> StageEvent {
        StageEvent::ticket(Uuid::new_v4(), Uuid::new_v4(), Stage::SpamFilter)
            .with_status(StageStatus::Completed)
            .with_message(format!("event-{n}"))
    }

    #[test]
    fn test_per_subscriber_order_matches_publication() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe().unwrap();
        for n in 0..5 {
            bus.publish(event(n));
        }
        let got: Vec<_> = sub
            .drain()
            .into_iter()
            .map(|e| e.message.unwrap())
            .collect();
        assert_eq!(got, vec!["event-0", "event-1", "event-2", "event-3", "event-4"]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let bus = Arc::new(EventBus::new(3));
        let sub = bus.subscribe().unwrap();
        for n in 0..5 {
            bus.publish(event(n));
        }
        assert_eq!(sub.dropped(), 2);
        let got: Vec<_> = sub
            .drain()
            .into_iter()
            .map(|e| e.message.unwrap())
            .collect();
        assert_eq!(got, vec!["event-2", "event-3", "event-4"]);
    }

    #[test]
    fn test_closed_bus_behaviour() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe().unwrap();
        bus.close();
        bus.publish(event(0));
        assert_eq!(sub.pending(), 0);
        assert!(matches!(bus.subscribe(), Err(FlowError::BusClosed)));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe().unwrap();
        bus.publish(event(0));
        bus.close();
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe().unwrap();
        let publisher = Arc::clone(&bus);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.publish(event(7));
        });
        let got = sub.recv().await.unwrap();
        assert_eq!(got.message.as_deref(), Some("event-7"));
        handle.await.unwrap();
    }
}
