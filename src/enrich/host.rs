use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use super::{EnrichmentError, MetadataSource};

// Container runtimes name the leaf cgroup differently.
const CONTAINER_PATTERNS: &[&str] = &[
    r"/docker/([a-f0-9]{64})",
    r"docker-([a-f0-9]{64})\.scope",
    r"/kubepods/[^/]*/pod[^/]*/([a-f0-9]{64})",
    r"cri-containerd-([a-f0-9]{64})",
    r"crio-([a-f0-9]{64})",
];

/// Resolves against the live host: cgroup v2 hierarchy and procfs.
pub struct HostCgroups {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
    patterns: Vec<Regex>,
}

impl HostCgroups {
    pub fn new(cgroup_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Result<Self, regex::Error> {
        let patterns = CONTAINER_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
            patterns,
        })
    }

    /// Pull a container id out of `/proc/<pid>/cgroup` contents.
    pub fn parse_container_id(&self, cgroup_file: &str) -> Option<String> {
        self.patterns
            .iter()
            .find_map(|re| re.captures(cgroup_file))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl MetadataSource for HostCgroups {
    /// On cgroup v2 the cgroup id is the inode number of its directory.
    fn cgroup_path(&self, memcg_id: u64) -> Result<String, EnrichmentError> {
        let mut pending = vec![self.cgroup_root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if dir == self.cgroup_root => return Err(e.into()),
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "skipping unreadable cgroup");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_dir() {
                    continue;
                }
                if meta.ino() == memcg_id {
                    return Ok(display_path(&entry.path()));
                }
                pending.push(entry.path());
            }
        }

        Err(EnrichmentError::UnknownCgroup(memcg_id))
    }

    fn container_id(&self, pid: u32) -> Result<Option<String>, EnrichmentError> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EnrichmentError::ProcessGone(pid));
            }
            Err(e) => return Err(e.into()),
        };

        let found = self.parse_container_id(&content);
        if found.is_none() {
            debug!(pid, "no container id in cgroup membership");
        }
        Ok(found)
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
