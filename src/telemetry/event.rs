use serde::Serialize;

use crate::pipeline::consumer::LoopState;
use crate::pipeline::record::DecodeError;

// Allowed: producer ids, sequence numbers, counts, enums.
// Never the event payload itself; that travels through fan-out.

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineSignal {
    /// A producer's sequence jumped ahead of the consumer cursor.
    DropDetected {
        producer: u16,
        /// Size of the sequence gap.
        missing: u64,
        /// Overflow drop-counter delta since the previous signal.
        estimated_lost: u64,
    },

    Corruption {
        #[serde(serialize_with = "display")]
        reason: DecodeError,
        len: usize,
    },

    StateChange {
        from: LoopState,
        to: LoopState,
    },

    /// Shutdown deadline expired with records still buffered.
    DrainAbandoned {
        remaining: usize,
    },
}

fn display<S: serde::Serializer>(reason: &DecodeError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(reason)
}
