use std::collections::HashMap;

use super::{EnrichmentError, MetadataSource};

/// Fixed lookup tables, for replay setups and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTable {
    cgroups: HashMap<u64, String>,
    containers: HashMap<u32, String>,
}

impl StaticTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cgroup(mut self, memcg_id: u64, path: impl Into<String>) -> Self {
        self.cgroups.insert(memcg_id, path.into());
        self
    }

    pub fn with_container(mut self, pid: u32, container_id: impl Into<String>) -> Self {
        self.containers.insert(pid, container_id.into());
        self
    }
}

impl MetadataSource for StaticTable {
    fn cgroup_path(&self, memcg_id: u64) -> Result<String, EnrichmentError> {
        self.cgroups
            .get(&memcg_id)
            .cloned()
            .ok_or(EnrichmentError::UnknownCgroup(memcg_id))
    }

    fn container_id(&self, pid: u32) -> Result<Option<String>, EnrichmentError> {
        Ok(self.containers.get(&pid).cloned())
    }
}
