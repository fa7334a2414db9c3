use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline-wide counters. Every loss the pipeline suffers lands in exactly one `drops_*` bucket.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_total: AtomicU64,
    drops_overflow: AtomicU64,
    drops_corruption: AtomicU64,
    drops_subscriber: AtomicU64,
    enrichment_partial_total: AtomicU64,
    gaps_detected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Overflow,
    Corruption,
    Subscriber,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Overflow => &self.drops_overflow,
            DropReason::Corruption => &self.drops_corruption,
            DropReason::Subscriber => &self.drops_subscriber,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_enrichment(&self) {
        self.enrichment_partial_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::Overflow => self.drops_overflow.load(Ordering::Relaxed),
            DropReason::Corruption => self.drops_corruption.load(Ordering::Relaxed),
            DropReason::Subscriber => self.drops_subscriber.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let drops_overflow = self.drops(DropReason::Overflow);
        let drops_corruption = self.drops(DropReason::Corruption);
        let drops_subscriber = self.drops(DropReason::Subscriber);
        MetricsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            drops_overflow,
            drops_corruption,
            drops_subscriber,
            drops_total: drops_overflow + drops_corruption + drops_subscriber,
            enrichment_partial_total: self.enrichment_partial_total.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            subscribers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_total: u64,
    pub drops_overflow: u64,
    pub drops_corruption: u64,
    pub drops_subscriber: u64,
    pub drops_total: u64,
    pub enrichment_partial_total: u64,
    pub gaps_detected: u64,
    pub subscribers: Vec<SubscriberStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
}
