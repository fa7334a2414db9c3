use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds on a process-wide monotonic clock, never zero.
/// The first call pins the epoch, so values are only comparable within one process.
pub fn monotonic_ns() -> u64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    (anchor.elapsed().as_nanos() as u64).saturating_add(1)
}
