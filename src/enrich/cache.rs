use std::collections::HashMap;
use std::sync::RwLock;

/// memcg id -> cgroup path. Read-mostly; a poisoned lock degrades to a miss.
#[derive(Debug, Default)]
pub struct CgroupCache {
    paths: RwLock<HashMap<u64, String>>,
}

impl CgroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, memcg_id: u64) -> Option<String> {
        self.paths.read().ok()?.get(&memcg_id).cloned()
    }

    pub fn insert(&self, memcg_id: u64, path: String) {
        if let Ok(mut paths) = self.paths.write() {
            paths.insert(memcg_id, path);
        }
    }

    /// Cgroups get removed and their ids recycled; callers drop stale entries here.
    pub fn invalidate(&self, memcg_id: u64) {
        if let Ok(mut paths) = self.paths.write() {
            paths.remove(&memcg_id);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
