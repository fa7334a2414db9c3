use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::record::OomEvent;
use super::transport::{RawRecord, Transport};
use crate::enrich::Enricher;
use crate::telemetry::{DropReason, PipelineMetrics, PipelineSignal, SignalRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

/// An event handed to the enrichment pool, in consumption order.
/// `raw` is the fallback if the enrichment task itself dies.
pub struct Pending {
    pub raw: OomEvent,
    pub enrichment: JoinHandle<OomEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub consumed: u64,
    pub corrupted: u64,
    pub gaps: u64,
    /// Records still buffered when the drain deadline expired.
    pub abandoned: usize,
}

pub struct ConsumerLoop {
    transport: Arc<Transport>,
    enricher: Enricher,
    downstream: mpsc::Sender<Pending>,
    metrics: Arc<PipelineMetrics>,
    signals: Arc<Mutex<SignalRecorder>>,
    state: watch::Sender<LoopState>,
    // producer id -> next expected sequence
    cursors: HashMap<u16, u64>,
    drops_seen: u64,
    poll_interval: Duration,
    drain_deadline: Duration,
    report: ConsumerReport,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<Transport>,
        enricher: Enricher,
        downstream: mpsc::Sender<Pending>,
        metrics: Arc<PipelineMetrics>,
        signals: Arc<Mutex<SignalRecorder>>,
        state: watch::Sender<LoopState>,
        poll_interval: Duration,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            transport,
            enricher,
            downstream,
            metrics,
            signals,
            state,
            cursors: HashMap::new(),
            drops_seen: 0,
            poll_interval,
            drain_deadline,
            report: ConsumerReport::default(),
        }
    }

    /// Poll until `shutdown` fires, then drain what is left up to the deadline.
    pub async fn run(mut self, shutdown: CancellationToken) -> ConsumerReport {
        info!(
            capacity = self.transport.capacity(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "consumer loop started"
        );

        let mut cadence = interval(self.poll_interval);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = cadence.tick() => {
                    self.drain_available();
                }
            }
        }

        self.transition(LoopState::Draining);
        let deadline = Instant::now() + self.drain_deadline;
        while !self.transport.is_empty() {
            if Instant::now() >= deadline {
                let remaining = self.transport.len();
                warn!(remaining, "drain deadline expired, abandoning buffered records");
                self.report.abandoned = remaining;
                self.signal(PipelineSignal::DrainAbandoned { remaining });
                break;
            }
            self.drain_available();
            tokio::task::yield_now().await;
        }
        self.transition(LoopState::Stopped);

        info!(
            consumed = self.report.consumed,
            corrupted = self.report.corrupted,
            gaps = self.report.gaps,
            "consumer loop stopped"
        );
        self.report
    }

    /// Pop whatever is buffered right now, at most one ring's worth so a
    /// flood of producers cannot starve the shutdown check.
    ///
    /// Stops early while the enrichment backlog is full; the remaining
    /// records wait in the transport, where overflow is accounted.
    pub fn drain_available(&mut self) -> usize {
        let budget = self.transport.capacity();
        let mut drained = 0;
        while drained < budget {
            let slot = match self.downstream.clone().try_reserve_owned() {
                Ok(permit) => Some(permit),
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => None,
            };
            let Some(raw) = self.transport.pop() else { break };
            self.process(raw, slot);
            drained += 1;
        }
        drained
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    fn process(&mut self, raw: RawRecord, slot: Option<OwnedPermit<Pending>>) {
        let event = match raw.decode() {
            Ok(event) => event,
            Err(reason) => {
                self.metrics.record_drop(DropReason::Corruption);
                self.report.corrupted += 1;
                warn!(%reason, len = raw.len(), "discarding corrupt record");
                self.signal(PipelineSignal::Corruption {
                    reason,
                    len: raw.len(),
                });
                return;
            }
        };

        self.track_sequence(&event);
        self.metrics.record_event();
        self.report.consumed += 1;

        match slot {
            Some(permit) => {
                permit.send(Pending {
                    enrichment: self.enricher.dispatch(event.clone()),
                    raw: event,
                });
            }
            None => warn!(pid = event.victim_pid, "delivery stage is gone, event not forwarded"),
        }
    }

    fn track_sequence(&mut self, event: &OomEvent) {
        let expected = self.cursors.get(&event.producer).copied().unwrap_or(0);

        // Behind the cursor means the producer restarted; just follow it.
        if event.seq > expected {
            let missing = event.seq - expected;
            let dropped = self.transport.dropped();
            let estimated_lost = dropped.saturating_sub(self.drops_seen);
            self.drops_seen = dropped;

            self.metrics.record_gap();
            self.report.gaps += 1;
            warn!(producer = event.producer, missing, estimated_lost, "sequence gap detected");
            self.signal(PipelineSignal::DropDetected {
                producer: event.producer,
                missing,
                estimated_lost,
            });
        }

        self.cursors.insert(event.producer, event.seq + 1);
    }

    fn transition(&mut self, to: LoopState) {
        let from = *self.state.borrow();
        if from == to {
            return;
        }
        self.state.send_replace(to);
        info!(?from, ?to, "consumer loop state change");
        self.signal(PipelineSignal::StateChange { from, to });
    }

    fn signal(&self, signal: PipelineSignal) {
        self.signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(signal);
    }
}
