//! The OOM event path, from the instrumentation hook to the enrichment hand-off.
//!
//! # HOT PATH INVARIANT
//! `record::encode` and `RecordProducer::submit` run inside the kernel's
//! victim-selection context. They must never allocate, lock, log or yield.

pub mod consumer;
pub mod record;
pub mod time;
pub mod transport;
pub mod watcher;
