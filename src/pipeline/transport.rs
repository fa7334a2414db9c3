use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::{decode, encode, DecodeError, EncodingError, OomDecision, OomEvent, RECORD_SIZE};
use super::time::monotonic_ns;
use crate::telemetry::{DropReason, PipelineMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming record.
    #[default]
    DropNewest,
    /// Evict the oldest buffered record to make room.
    OverwriteOldest,
}

/// Outcome of handing a record to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Accepted, but an older record was evicted.
    Displaced,
    Rejected,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport capacity must be non-zero")]
    ZeroCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("transport full, record dropped")]
    Overflow,
}

/// Fixed-size slot payload. `len` is what the writer claimed to hand over,
/// which may differ from `RECORD_SIZE` for malformed input.
#[derive(Clone, Copy)]
pub struct RawRecord {
    len: usize,
    bytes: [u8; RECORD_SIZE],
}

impl RawRecord {
    pub fn from_encoded(buf: &[u8; RECORD_SIZE]) -> Self {
        Self {
            len: RECORD_SIZE,
            bytes: *buf,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut bytes = [0u8; RECORD_SIZE];
        let copied = data.len().min(RECORD_SIZE);
        bytes[..copied].copy_from_slice(&data[..copied]);
        Self {
            len: data.len(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn decode(&self) -> Result<OomEvent, DecodeError> {
        if self.len != RECORD_SIZE {
            return Err(DecodeError::Length(self.len));
        }
        decode(&self.bytes)
    }
}

/// Bounded multi-producer / single-consumer channel between the
/// instrumentation contexts and the consumer loop.
///
/// Slots are preallocated; `push` never allocates or blocks.
pub struct Transport {
    queue: ArrayQueue<RawRecord>,
    policy: OverflowPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl Transport {
    pub fn new(
        capacity: usize,
        policy: OverflowPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, TransportError> {
        if capacity == 0 {
            return Err(TransportError::ZeroCapacity);
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
            policy,
            metrics,
        })
    }

    pub fn push(&self, record: RawRecord) -> Admission {
        match self.policy {
            OverflowPolicy::DropNewest => match self.queue.push(record) {
                Ok(()) => Admission::Accepted,
                Err(_) => {
                    self.metrics.record_drop(DropReason::Overflow);
                    Admission::Rejected
                }
            },
            OverflowPolicy::OverwriteOldest => match self.queue.force_push(record) {
                None => Admission::Accepted,
                Some(_) => {
                    self.metrics.record_drop(DropReason::Overflow);
                    Admission::Displaced
                }
            },
        }
    }

    /// Consumer side. Only the consumer loop should call this.
    pub fn pop(&self) -> Option<RawRecord> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Monotonic count of records lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.metrics.drops(DropReason::Overflow)
    }
}

/// Write end owned by one execution context (one per CPU in a kernel hook).
///
/// Sequence numbers are per producer and advance for every record handed to
/// the transport, including rejected ones, so the consumer can see the hole.
pub struct RecordProducer {
    id: u16,
    next_seq: u64,
    transport: Arc<Transport>,
}

impl RecordProducer {
    pub fn new(id: u16, transport: Arc<Transport>) -> Self {
        Self {
            id,
            next_seq: 0,
            transport,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Encode and enqueue. A decision without a capture time is stamped here.
    pub fn submit(&mut self, decision: &OomDecision) -> Result<Admission, SubmitError> {
        let stamped;
        let decision = if decision.timestamp_ns == 0 {
            stamped = OomDecision {
                timestamp_ns: monotonic_ns(),
                ..*decision
            };
            &stamped
        } else {
            decision
        };

        let mut buf = [0u8; RECORD_SIZE];
        encode(decision, self.id, self.next_seq, &mut buf)?;
        self.next_seq += 1;

        match self.transport.push(RawRecord::from_encoded(&buf)) {
            Admission::Rejected => Err(SubmitError::Overflow),
            admitted => Ok(admitted),
        }
    }

    /// Pass through bytes a foreign encoder already produced.
    pub fn submit_raw(&self, data: &[u8]) -> Admission {
        self.transport.push(RawRecord::from_slice(data))
    }
}
