//! Best-effort enrichment of decoded events.
//!
//! Lookups run on a bounded pool of blocking workers so a slow cgroupfs walk
//! or a hung procfs read never stalls the consumer loop. Whatever happens,
//! the event comes back: `Complete` when every applicable lookup succeeded,
//! `Partial` otherwise.

pub mod cache;
pub mod host;
pub mod table;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::pipeline::record::{EnrichmentStatus, OomEvent};
use crate::telemetry::PipelineMetrics;

pub use cache::CgroupCache;
pub use host::HostCgroups;
pub use table::StaticTable;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("memory cgroup {0} not found")]
    UnknownCgroup(u64),
    #[error("process {0} is gone")]
    ProcessGone(u32),
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("enrichment pool closed")]
    PoolClosed,
    #[error("lookup worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where identifiers get resolved. Implementations may block; they are only
/// ever called from the enrichment pool.
pub trait MetadataSource: Send + Sync + 'static {
    /// Path of the memory cgroup with this id. Never called for id 0.
    fn cgroup_path(&self, memcg_id: u64) -> Result<String, EnrichmentError>;

    /// Container owning `pid`; `Ok(None)` for processes outside any container.
    fn container_id(&self, pid: u32) -> Result<Option<String>, EnrichmentError>;
}

struct Lookup {
    cgroup_path: Result<Option<String>, EnrichmentError>,
    container_id: Result<Option<String>, EnrichmentError>,
}

impl Lookup {
    fn apply(self, event: &mut OomEvent) {
        let mut complete = true;

        match self.cgroup_path {
            Ok(path) => event.cgroup_path = path,
            Err(e) => {
                debug!(memcg_id = event.memcg_id, error = %e, "cgroup lookup failed");
                complete = false;
            }
        }
        match self.container_id {
            Ok(id) => event.container_id = id,
            Err(e) => {
                debug!(pid = event.victim_pid, error = %e, "container lookup failed");
                complete = false;
            }
        }

        event.enrichment_status = if complete {
            EnrichmentStatus::Complete
        } else {
            EnrichmentStatus::Partial
        };
    }
}

#[derive(Clone)]
pub struct Enricher {
    source: Arc<dyn MetadataSource>,
    cache: Arc<CgroupCache>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl Enricher {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        workers: usize,
        timeout: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            source,
            cache: Arc::new(CgroupCache::new()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
            metrics,
        }
    }

    pub fn cache(&self) -> &CgroupCache {
        &self.cache
    }

    /// Enrich on a separate task. Must be called from within a tokio runtime.
    pub fn dispatch(&self, event: OomEvent) -> JoinHandle<OomEvent> {
        let enricher = self.clone();
        tokio::spawn(async move { enricher.enrich(event).await })
    }

    /// Resolves at the latest after the configured timeout.
    pub async fn enrich(&self, mut event: OomEvent) -> OomEvent {
        let outcome = match tokio::time::timeout(self.timeout, self.lookup(&event)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EnrichmentError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(lookup) => lookup.apply(&mut event),
            Err(e) => {
                debug!(pid = event.victim_pid, error = %e, "enrichment abandoned");
                event.enrichment_status = EnrichmentStatus::Partial;
            }
        }

        if event.enrichment_status == EnrichmentStatus::Partial {
            self.metrics.record_partial_enrichment();
        }
        event
    }

    async fn lookup(&self, event: &OomEvent) -> Result<Lookup, EnrichmentError> {
        let memcg_id = event.memcg_id;
        let pid = event.victim_pid;
        let cached = match memcg_id {
            0 => None,
            id => self.cache.get(id),
        };

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EnrichmentError::PoolClosed)?;
        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);

        tokio::task::spawn_blocking(move || {
            // A hung lookup keeps its worker; the pool stays bounded.
            let _permit = permit;

            let cgroup_path = match (memcg_id, cached) {
                (0, _) => Ok(None),
                (_, Some(path)) => Ok(Some(path)),
                (id, None) => source.cgroup_path(id).map(|path| {
                    cache.insert(id, path.clone());
                    Some(path)
                }),
            };
            let container_id = source.container_id(pid);

            Lookup {
                cgroup_path,
                container_id,
            }
        })
        .await
        .map_err(|e| EnrichmentError::Worker(e.to_string()))
    }
}
