use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fanout::SubscriberHandle;
use crate::pipeline::record::{MemoryUsage, OomEvent};
use crate::pipeline::watcher::MetricsView;

/// Emit one structured log line per kill until the watcher stops.
pub async fn run_log_sink(mut handle: SubscriberHandle, page_size: u64) {
    while let Some(event) = handle.recv().await {
        log_event(&event, page_size);
    }
    info!(subscriber = handle.name(), dropped = handle.dropped(), "log sink finished");
}

pub fn log_event(event: &OomEvent, page_size: u64) {
    info!(
        pid = event.victim_pid,
        tgid = event.victim_tgid,
        comm = %event.comm_lossy(),
        uid = event.uid,
        constraint = ?event.constraint,
        memcg_id = event.memcg_id,
        cgroup = event.cgroup_path.as_deref().unwrap_or("-"),
        container = event.container_id.as_deref().unwrap_or("-"),
        rss_bytes = event.rss_bytes(page_size),
        total_vm_bytes = event.total_vm_bytes(page_size),
        anon_rss_bytes = event.anon_rss.saturating_mul(page_size),
        file_rss_bytes = event.file_rss.saturating_mul(page_size),
        shmem_rss_bytes = event.shmem_rss.saturating_mul(page_size),
        pgtables_bytes = event.pgtables_bytes,
        oom_score_adj = event.oom_score_adj,
        order = event.order,
        points = ?event.chosen_points,
        sysrq = event.is_sysrq(),
        enrichment = ?event.enrichment_status,
        "oom kill"
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeTally {
    pub kills: u64,
    pub sysrq_kills: u64,
    pub last_pid: u32,
    pub last_comm: String,
    pub last_timestamp_ns: u64,
    /// Memory of the most recent victim in this scope.
    pub last_memory: MemoryUsage,
}

/// Kill counts per workload scope: container, else cgroup, else global.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KillTally {
    by_scope: BTreeMap<String, ScopeTally>,
}

impl KillTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope_key(event: &OomEvent) -> String {
        if let Some(container) = &event.container_id {
            return format!("container:{container}");
        }
        if let Some(path) = &event.cgroup_path {
            return path.clone();
        }
        match event.memcg_id {
            0 => "global".to_string(),
            id => format!("memcg:{id}"),
        }
    }

    pub fn record(&mut self, event: &OomEvent) {
        let entry = self.by_scope.entry(Self::scope_key(event)).or_default();
        entry.kills += 1;
        if event.is_sysrq() {
            entry.sysrq_kills += 1;
        }
        entry.last_pid = event.victim_pid;
        entry.last_comm = event.comm_lossy().into_owned();
        entry.last_timestamp_ns = event.timestamp_ns;
        entry.last_memory = event.memory();
    }

    pub fn get(&self, scope: &str) -> Option<&ScopeTally> {
        self.by_scope.get(scope)
    }

    pub fn total(&self) -> u64 {
        self.by_scope.values().map(|s| s.kills).sum()
    }

    pub fn scopes(&self) -> impl Iterator<Item = (&String, &ScopeTally)> {
        self.by_scope.iter()
    }
}

pub async fn run_tally(mut handle: SubscriberHandle, tally: Arc<Mutex<KillTally>>) {
    while let Some(event) = handle.recv().await {
        tally
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(&event);
    }
    info!(subscriber = handle.name(), dropped = handle.dropped(), "kill tally finished");
}

/// Log the live counters every `every` until `shutdown` fires.
/// Returns how many reports went out.
pub async fn run_metrics_reporter(
    view: MetricsView,
    tally: Arc<Mutex<KillTally>>,
    every: Duration,
    shutdown: CancellationToken,
) -> u64 {
    let mut cadence = interval(every);
    cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reports = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = cadence.tick() => {
                let snapshot = view.snapshot();
                let (kills, scopes) = {
                    let tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    (tally.total(), tally.scopes().count())
                };
                info!(
                    events_total = snapshot.events_total,
                    drops_overflow = snapshot.drops_overflow,
                    drops_corruption = snapshot.drops_corruption,
                    drops_subscriber = snapshot.drops_subscriber,
                    drops_total = snapshot.drops_total,
                    enrichment_partial_total = snapshot.enrichment_partial_total,
                    gaps_detected = snapshot.gaps_detected,
                    subscribers = snapshot.subscribers.len(),
                    kills,
                    scopes,
                    "pipeline metrics"
                );
                reports += 1;
            }
        }
    }
    reports
}

/// Wait for a sink task, reporting a panic or cancellation instead of discarding it.
pub async fn finish(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(sink = name, error = %e, "sink task ended abnormally");
            false
        }
    }
}
