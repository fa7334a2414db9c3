//! Counters and signals describing the pipeline itself.
//!
//! Telemetry is a side channel: nothing in the pipeline reads it back to make
//! a decision, and it never carries OOM event payloads.

pub mod event;
pub mod metrics;
pub mod recorder;

pub use event::PipelineSignal;
pub use metrics::{DropReason, MetricsSnapshot, PipelineMetrics, SubscriberStats};
pub use recorder::{SignalRecorder, SignalSummary};
