use std::collections::VecDeque;

use serde::Serialize;

use super::event::PipelineSignal;

const DEFAULT_HISTORY: usize = 1024;

/// Bounded history of pipeline signals. Oldest entries fall off first.
#[derive(Debug)]
pub struct SignalRecorder {
    buffer: VecDeque<PipelineSignal>,
    limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignalSummary {
    pub drop_signals: u64,
    pub missing_records: u64,
    pub estimated_lost: u64,
    pub corruptions: u64,
    pub state_changes: u64,
    pub abandoned_on_drain: u64,
}

impl SignalRecorder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_HISTORY)
    }

    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            buffer: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn record(&mut self, signal: PipelineSignal) {
        if self.buffer.len() >= self.limit {
            self.buffer.pop_front();
        }
        self.buffer.push_back(signal);
    }

    pub fn recent(&self) -> Vec<PipelineSignal> {
        self.buffer.iter().cloned().collect()
    }

    pub fn summary(&self) -> SignalSummary {
        summarize(&self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for SignalRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn summarize(signals: &VecDeque<PipelineSignal>) -> SignalSummary {
    let mut summary = SignalSummary::default();

    for signal in signals {
        match signal {
            PipelineSignal::DropDetected {
                missing,
                estimated_lost,
                ..
            } => {
                summary.drop_signals += 1;
                summary.missing_records += missing;
                summary.estimated_lost += estimated_lost;
            }
            PipelineSignal::Corruption { .. } => summary.corruptions += 1,
            PipelineSignal::StateChange { .. } => summary.state_changes += 1,
            PipelineSignal::DrainAbandoned { remaining } => {
                summary.abandoned_on_drain += *remaining as u64;
            }
        }
    }

    summary
}
