//! Periodic sampling of the kernel's per-file I/O counters.
//!
//! The kernel keeps running totals in an LRU hash keyed by FileKey. Every
//! tick the whole table is scanned, the counters are copied into the
//! [`IoMetricsCache`](crate::cache::IoMetricsCache) and one
//! [`Fact::IoMetrics`] per file is published, labelled with whatever the
//! task-event and path consumers have learned about the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use libbpf_rs::{MapCore, MapFlags, MapHandle};

use crate::cache::{Caches, IoMetrics};
use crate::events::{decode, RawMetrics};
use crate::shutdown::Shutdown;
use crate::sink::{Exposition, Fact, Sink};

/// A key/value table holding one [`RawMetrics`] per FileKey.
pub trait MetricsTable {
    fn entries(&self) -> Result<Vec<(u64, RawMetrics)>>;
}

impl MetricsTable for MapHandle {
    fn entries(&self) -> Result<Vec<(u64, RawMetrics)>> {
        let mut entries = Vec::new();
        for key in self.keys() {
            let Ok(key_bytes) = <[u8; 8]>::try_from(key.as_slice()) else {
                tracing::warn!("Unexpected io_metrics key size {}", key.len());
                continue;
            };
            // LRU entries can be evicted between listing and lookup.
            let Some(value) = self
                .lookup(&key, MapFlags::ANY)
                .context("Failed to look up io_metrics entry")?
            else {
                continue;
            };
            let metrics: RawMetrics =
                decode(&value).context("Failed to decode io_metrics entry")?;
            entries.push((u64::from_ne_bytes(key_bytes), metrics));
        }
        Ok(entries)
    }
}

/// An in-memory table, also usable to script scan failures.
#[derive(Debug, Default)]
pub struct MemoryMetricsTable {
    entries: Mutex<Vec<(u64, RawMetrics)>>,
    fail: Mutex<Option<String>>,
}

impl MemoryMetricsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: u64, metrics: RawMetrics) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = metrics,
            None => entries.push((key, metrics)),
        }
    }

    /// Make the next scan fail with `msg`.
    pub fn fail_next(&self, msg: &str) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = Some(msg.to_string());
        }
    }
}

impl MetricsTable for MemoryMetricsTable {
    fn entries(&self) -> Result<Vec<(u64, RawMetrics)>> {
        if let Some(msg) = self.fail.lock().ok().and_then(|mut f| f.take()) {
            anyhow::bail!(msg);
        }
        match self.entries.lock() {
            Ok(entries) => Ok(entries.clone()),
            Err(poisoned) => Ok(poisoned.into_inner().clone()),
        }
    }
}

impl From<&RawMetrics> for IoMetrics {
    fn from(raw: &RawMetrics) -> Self {
        IoMetrics {
            read_count: raw.read_count,
            write_count: raw.write_count,
            read_bytes: raw.read_size,
            write_bytes: raw.write_size,
            read_latency: raw.read_lat,
            write_latency: raw.write_lat,
        }
    }
}

pub struct MetricsConsumer {
    caches: Caches,
    sink: Arc<dyn Sink>,
    node_name: String,
    interval: Duration,
    textfile: Option<(PathBuf, Exposition)>,
}

impl MetricsConsumer {
    pub fn new(caches: Caches, sink: Arc<dyn Sink>, node_name: &str, interval: Duration) -> Self {
        Self {
            caches,
            sink,
            node_name: node_name.to_string(),
            interval,
            textfile: None,
        }
    }

    /// Also rewrite a Prometheus textfile after every tick.
    pub fn with_textfile(mut self, path: Option<PathBuf>) -> Result<Self> {
        self.textfile = match path {
            Some(path) => Some((path, Exposition::new()?)),
            None => None,
        };
        Ok(self)
    }

    /// Run one sampling pass and return how many files were seen.
    pub fn tick(&self, table: &dyn MetricsTable) -> Result<usize> {
        let entries = table.entries()?;
        for (key, raw) in &entries {
            let metrics = IoMetrics::from(raw);
            self.caches.metrics.insert(*key, metrics);

            let identity = self.caches.files.get(key);
            let file_path = self
                .caches
                .paths
                .get(key)
                .or_else(|| identity.as_ref().map(|i| i.file_path.clone()))
                .filter(|p| !p.is_empty());
            self.sink.publish(&Fact::IoMetrics {
                key: *key,
                dev_id: (key >> 32) as u32,
                file_id: (key & 0xFFFF_FFFF) as u32,
                node_name: self.node_name.clone(),
                metrics,
                file_path,
                remote_nfs_addr: identity.as_ref().map(|i| i.remote_nfs_addr.clone()),
                pod: identity.as_ref().map(|i| i.pod.clone()),
                container: identity.as_ref().map(|i| i.container.clone()),
            });
        }

        if let Some((path, exposition)) = &self.textfile {
            self.write_textfile(path, exposition)?;
        }
        Ok(entries.len())
    }

    fn write_textfile(&self, path: &Path, exposition: &Exposition) -> Result<()> {
        exposition.update(
            &self.caches.metrics,
            &self.caches.files,
            &self.caches.paths,
            &self.node_name,
        );
        let text = exposition.render()?;
        let tmp = path.with_extension("prom.tmp");
        fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename {} to {}", tmp.display(), path.display()))
    }

    pub fn run(&self, table: &dyn MetricsTable, shutdown: &Shutdown) {
        tracing::info!("Starting metrics consumer");
        loop {
            match self.tick(table) {
                Ok(count) => tracing::debug!("Sampled io metrics for {count} files"),
                Err(e) => tracing::error!("Skipping metrics tick: {e:#}"),
            }
            if shutdown.wait_timeout(self.interval) {
                break;
            }
        }
        tracing::info!("metrics consumer stopped");
    }
}
