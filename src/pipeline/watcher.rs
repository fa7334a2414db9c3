use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::consumer::{ConsumerLoop, ConsumerReport, LoopState, Pending};
use super::record::EnrichmentStatus;
use super::transport::{RecordProducer, Transport, TransportError};
use crate::config::{ConfigError, WatcherConfig};
use crate::enrich::{Enricher, MetadataSource};
use crate::fanout::{Fanout, SubscriberHandle};
use crate::telemetry::{MetricsSnapshot, PipelineMetrics, PipelineSignal, SignalRecorder, SignalSummary};

/// Failures that stop the pipeline before any event flows.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no tokio runtime available to host the consumer loop")]
    NoRuntime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub consumer: ConsumerReport,
    pub metrics: MetricsSnapshot,
    pub signals: SignalSummary,
}

/// Cloneable read side of the pipeline counters, for reporters that run
/// alongside the watcher.
#[derive(Clone)]
pub struct MetricsView {
    metrics: Arc<PipelineMetrics>,
    fanout: Arc<Fanout>,
}

impl MetricsView {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.subscribers = self.fanout.stats();
        snapshot
    }
}

/// Owns the whole OOM event pipeline:
/// producers -> transport -> consumer loop -> enrichment -> fan-out.
pub struct OomWatcher {
    config: WatcherConfig,
    transport: Arc<Transport>,
    fanout: Arc<Fanout>,
    metrics: Arc<PipelineMetrics>,
    signals: Arc<Mutex<SignalRecorder>>,
    state: watch::Receiver<LoopState>,
    shutdown: CancellationToken,
    consumer: Option<JoinHandle<ConsumerReport>>,
    delivery: Option<JoinHandle<()>>,
    next_producer: AtomicU16,
}

impl OomWatcher {
    /// Must be called from within a tokio runtime.
    pub fn start(config: WatcherConfig, source: Arc<dyn MetadataSource>) -> Result<Self, StartupError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| StartupError::NoRuntime)?;

        let metrics = Arc::new(PipelineMetrics::new());
        let transport = Arc::new(Transport::new(
            config.ring_buffer_capacity,
            config.overflow_policy,
            Arc::clone(&metrics),
        )?);
        let fanout = Arc::new(Fanout::new(Arc::clone(&metrics)));
        let signals = Arc::new(Mutex::new(SignalRecorder::with_limit(config.signal_history)));
        let enricher = Enricher::new(
            source,
            config.enrichment_workers,
            config.enrichment_timeout(),
            Arc::clone(&metrics),
        );

        let (state_tx, state_rx) = watch::channel(LoopState::Running);
        // Enrichments in flight are bounded like the ring; a full backlog
        // leaves records in the transport.
        let (pending_tx, pending_rx) = mpsc::channel(config.ring_buffer_capacity);
        let shutdown = CancellationToken::new();

        let consumer_loop = ConsumerLoop::new(
            Arc::clone(&transport),
            enricher,
            pending_tx,
            Arc::clone(&metrics),
            Arc::clone(&signals),
            state_tx,
            config.poll_interval(),
            config.drain_deadline(),
        );
        let consumer = runtime.spawn(consumer_loop.run(shutdown.clone()));
        let delivery = runtime.spawn(deliver_in_order(
            pending_rx,
            Arc::clone(&fanout),
            Arc::clone(&metrics),
        ));

        info!(
            capacity = config.ring_buffer_capacity,
            policy = ?config.overflow_policy,
            workers = config.enrichment_workers,
            enrichment_timeout_ms = config.enrichment_timeout_ms,
            "oom watcher started"
        );

        Ok(Self {
            config,
            transport,
            fanout,
            metrics,
            signals,
            state: state_rx,
            shutdown,
            consumer: Some(consumer),
            delivery: Some(delivery),
            next_producer: AtomicU16::new(0),
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Mint a write end for one instrumentation context.
    pub fn producer(&self) -> RecordProducer {
        let id = self.next_producer.fetch_add(1, Ordering::Relaxed);
        RecordProducer::new(id, Arc::clone(&self.transport))
    }

    /// A `queue_capacity` of 0 is raised to 1.
    pub fn register(&self, name: impl Into<String>, queue_capacity: usize) -> SubscriberHandle {
        self.fanout.register(name, queue_capacity)
    }

    /// Register with the configured default backlog.
    pub fn subscribe(&self, name: impl Into<String>) -> SubscriberHandle {
        self.fanout.register(name, self.config.subscriber_queue_capacity)
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_view().snapshot()
    }

    pub fn metrics_view(&self) -> MetricsView {
        MetricsView {
            metrics: Arc::clone(&self.metrics),
            fanout: Arc::clone(&self.fanout),
        }
    }

    pub fn signals(&self) -> Vec<PipelineSignal> {
        self.signals
            .lock()
            .map(|recorder| recorder.recent())
            .unwrap_or_default()
    }

    pub fn signal_summary(&self) -> SignalSummary {
        self.signals
            .lock()
            .map(|recorder| recorder.summary())
            .unwrap_or_default()
    }

    /// Stop polling, drain the transport up to the deadline, flush every
    /// in-flight enrichment to subscribers, then close their queues.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.shutdown.cancel();

        let consumer = match self.consumer.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!(error = %e, "consumer loop ended abnormally");
                ConsumerReport::default()
            }),
            None => ConsumerReport::default(),
        };
        if let Some(handle) = self.delivery.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "delivery stage ended abnormally");
                self.fanout.close();
            }
        }

        let report = ShutdownReport {
            consumer,
            metrics: self.metrics(),
            signals: self.signal_summary(),
        };
        info!(
            events = report.metrics.events_total,
            drops = report.metrics.drops_total,
            partial = report.metrics.enrichment_partial_total,
            "oom watcher stopped"
        );
        report
    }
}

impl Drop for OomWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Await enrichments in consumption order and hand each result to fan-out.
async fn deliver_in_order(
    mut pending: mpsc::Receiver<Pending>,
    fanout: Arc<Fanout>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(Pending { raw, enrichment }) = pending.recv().await {
        let event = match enrichment.await {
            Ok(event) => event,
            Err(e) => {
                warn!(pid = raw.victim_pid, error = %e, "enrichment task failed, forwarding raw event");
                metrics.record_partial_enrichment();
                let mut event = raw;
                event.enrichment_status = EnrichmentStatus::Partial;
                event
            }
        };
        fanout.deliver(&event);
    }
    fanout.close();
}
