//! Concurrent correlation caches shared by the pipeline consumers.
//!
//! Each cache is a thin wrapper over `DashMap`, so readers and writers on
//! different keys never contend on a global lock. Entries have no TTL:
//! staleness is fixed by an explicit overwrite (mount polling, metrics
//! sampling, repeated task events) or an explicit delete (container removal).
//! Lookups return `None` for keys that have not been observed yet, and
//! callers treat that as "not seen" rather than an error.
//!
//! The caches are constructed once in [`Caches::new`] and handed to every
//! component that needs them; there are no process-wide singletons.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::mountinfo::MountRecord;

#[derive(Debug)]
pub struct Cache<K: Eq + Hash, V> {
    entries: DashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store `value`, replacing and returning any previous entry.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mount id to mount record, refreshed wholesale by the mount monitor.
pub type MountCache = Cache<String, MountRecord>;

impl MountCache {
    /// Converge the cache onto `records`: every record is upserted and any
    /// id not present in `records` is evicted.
    ///
    /// Readers may briefly observe a mix of the old and new snapshot while
    /// this runs, but never a torn entry.
    pub fn replace_all(&self, records: &[MountRecord]) {
        let live: HashSet<&str> = records.iter().map(|r| r.mount_id.as_str()).collect();
        for record in records {
            self.insert(record.mount_id.clone(), record.clone());
        }
        self.entries.retain(|id, _| live.contains(id.as_str()));
    }
}

/// What is known about a file, joined from a task event and the mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    pub mount_path: String,
    pub remote_nfs_addr: String,
    pub file_path: String,
    pub pod: String,
    pub container: String,
}

/// FileKey to file identity, last writer wins.
pub type FileIdentityCache = Cache<u64, FileIdentity>;

/// Snapshot of the kernel's running counters for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_latency: u64,
    pub write_latency: u64,
}

/// FileKey to the latest sampled counters.
pub type IoMetricsCache = Cache<u64, IoMetrics>;

/// Container id to the pid written into the kernel identity table.
pub type ContainerPidCache = Cache<String, u64>;

/// FileKey to the path rebuilt from kernel path segments.
pub type PathCache = Cache<u64, String>;

/// Pod and container a process belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PodIdentity {
    pub pod: String,
    pub container: String,
}

/// Pid to pod identity, mirroring what is written into the kernel table.
pub type PidIdentityCache = Cache<u64, PodIdentity>;

/// Every cache the tracer shares between tasks.
#[derive(Debug, Clone, Default)]
pub struct Caches {
    pub mounts: Arc<MountCache>,
    pub files: Arc<FileIdentityCache>,
    pub metrics: Arc<IoMetricsCache>,
    pub container_pids: Arc<ContainerPidCache>,
    pub paths: Arc<PathCache>,
    pub pid_identity: Arc<PidIdentityCache>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }
}
