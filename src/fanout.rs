use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::pipeline::record::OomEvent;
use crate::telemetry::{DropReason, PipelineMetrics, SubscriberStats};

struct Shared {
    name: String,
    delivered: AtomicU64,
    dropped: AtomicU64,
    /// Handle was dropped; the slot gets pruned on the next delivery.
    detached: AtomicBool,
    /// No more events will ever arrive.
    closed: AtomicBool,
    notify: Notify,
}

struct Slot {
    shared: Arc<Shared>,
    queue: HeapProd<OomEvent>,
}

/// Result of a non-blocking read from a subscriber queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consume {
    Event(OomEvent),
    WouldBlock,
    Closed,
}

/// Delivers each event to every registered subscriber.
///
/// Every subscriber has its own bounded SPSC queue. A full queue loses the
/// event for that subscriber only; delivery never waits.
pub struct Fanout {
    slots: Mutex<Vec<Slot>>,
    metrics: Arc<PipelineMetrics>,
    closed: AtomicBool,
}

impl Fanout {
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// `capacity` is clamped to at least 1; a zero-slot queue could never
    /// receive anything.
    pub fn register(&self, name: impl Into<String>, capacity: usize) -> SubscriberHandle {
        let name = name.into();
        let (producer, consumer) = HeapRb::<OomEvent>::new(capacity.max(1)).split();

        // Read the closed flag under the lock so a concurrent close() cannot miss this slot.
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let shared = Arc::new(Shared {
            name: name.clone(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
            notify: Notify::new(),
        });
        slots.push(Slot {
            shared: Arc::clone(&shared),
            queue: producer,
        });
        drop(slots);
        info!(subscriber = %name, capacity, "subscriber registered");

        SubscriberHandle {
            shared,
            queue: consumer,
        }
    }

    /// Returns how many subscribers accepted the event.
    pub fn deliver(&self, event: &OomEvent) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.retain(|slot| !slot.shared.detached.load(Ordering::Relaxed));

        let mut accepted = 0;
        for slot in slots.iter_mut() {
            match slot.queue.try_push(event.clone()) {
                Ok(()) => {
                    accepted += 1;
                    slot.shared.delivered.fetch_add(1, Ordering::Relaxed);
                    slot.shared.notify.notify_one();
                }
                Err(_) => {
                    slot.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_drop(DropReason::Subscriber);
                    debug!(subscriber = %slot.shared.name, pid = event.victim_pid, "subscriber queue full, event dropped");
                }
            }
        }
        accepted
    }

    /// Mark every queue closed. Subscribers still drain what is buffered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for slot in slots.iter() {
            slot.shared.closed.store(true, Ordering::Release);
            slot.shared.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .iter()
            .map(|slot| SubscriberStats {
                name: slot.shared.name.clone(),
                delivered: slot.shared.delivered.load(Ordering::Relaxed),
                dropped: slot.shared.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Read end of one subscriber queue.
pub struct SubscriberHandle {
    shared: Arc<Shared>,
    queue: HeapCons<OomEvent>,
}

impl SubscriberHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn consume(&mut self) -> Consume {
        if let Some(event) = self.queue.try_pop() {
            return Consume::Event(event);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            // Pushes before close are visible once we have seen the flag.
            return match self.queue.try_pop() {
                Some(event) => Consume::Event(event),
                None => Consume::Closed,
            };
        }
        Consume::WouldBlock
    }

    /// Wait for the next event; `None` once the watcher has stopped and the queue is empty.
    pub async fn recv(&mut self) -> Option<OomEvent> {
        loop {
            match self.consume() {
                Consume::Event(event) => return Some(event),
                Consume::Closed => return None,
                Consume::WouldBlock => self.shared.notify.notified().await,
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::Relaxed);
    }
}
