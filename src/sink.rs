//! Publishing of correlated facts.
//!
//! Consumers hand every fact to a [`Sink`]; the binary uses [`JsonSink`] to
//! write one JSON object per line. [`Exposition`] keeps the metrics caches
//! as Prometheus gauges and renders them for a node exporter textfile.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::cache::{FileIdentityCache, IoMetrics, IoMetricsCache, PathCache};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fact {
    /// An RPC task touched a file on an NFS mount.
    FileAccess {
        pid: i32,
        key: u64,
        caller: String,
        mount_id: String,
        mount_path: String,
        remote_nfs_addr: String,
        file_path: String,
        pod: String,
        container: String,
    },
    /// Latest counters for one file.
    IoMetrics {
        key: u64,
        dev_id: u32,
        file_id: u32,
        node_name: String,
        #[serde(flatten)]
        metrics: IoMetrics,
        file_path: Option<String>,
        remote_nfs_addr: Option<String>,
        pod: Option<String>,
        container: Option<String>,
    },
    /// A DNS query sent by a process.
    Dns {
        pid: u32,
        comm: String,
        domain: String,
        pod: Option<String>,
        container: Option<String>,
    },
}

pub trait Sink: Send + Sync {
    fn publish(&self, fact: &Fact);
}

/// Writes facts as JSON lines.
pub struct JsonSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Append to the file at `path`, creating it if needed.
    pub fn file(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        Ok(Self::new(Box::new(file)))
    }
}

impl Sink for JsonSink {
    fn publish(&self, fact: &Fact) {
        let line = match serde_json::to_string(fact) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize fact: {e}");
                return;
            }
        };
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            tracing::error!("Failed to write fact: {e}");
        }
    }
}

/// Keeps every published fact in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    facts: Mutex<Vec<Fact>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts(&self) -> Vec<Fact> {
        match self.facts.lock() {
            Ok(facts) => facts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sink for MemorySink {
    fn publish(&self, fact: &Fact) {
        match self.facts.lock() {
            Ok(mut facts) => facts.push(fact.clone()),
            Err(poisoned) => poisoned.into_inner().push(fact.clone()),
        }
    }
}

/// Labels of every per-file gauge; unknown values are exported empty.
const LABELS: [&str; 6] = ["dev_id", "file_id", "node_name", "file_path", "pod", "container"];

/// Prometheus gauges for the per-file NFS counters.
pub struct Exposition {
    registry: Registry,
    read_count: GaugeVec,
    write_count: GaugeVec,
    read_size: GaugeVec,
    write_size: GaugeVec,
    read_latencies: GaugeVec,
    write_latencies: GaugeVec,
}

impl Exposition {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help), &LABELS)
                .with_context(|| format!("Failed to create gauge {name}"))?;
            registry
                .register(Box::new(gauge.clone()))
                .with_context(|| format!("Failed to register gauge {name}"))?;
            Ok(gauge)
        };
        let read_count = gauge("nfs_read_count", "NFS read operations per file")?;
        let write_count = gauge("nfs_write_count", "NFS write operations per file")?;
        let read_size = gauge("nfs_read_size", "NFS bytes read per file")?;
        let write_size = gauge("nfs_write_size", "NFS bytes written per file")?;
        let read_latencies = gauge("nfs_read_latencies", "NFS read latency per file")?;
        let write_latencies = gauge("nfs_write_latencies", "NFS write latency per file")?;
        Ok(Self {
            registry,
            read_count,
            write_count,
            read_size,
            write_size,
            read_latencies,
            write_latencies,
        })
    }

    /// Replace every series with the current contents of the caches.
    pub fn update(
        &self,
        metrics: &IoMetricsCache,
        files: &FileIdentityCache,
        paths: &PathCache,
        node_name: &str,
    ) {
        for gauge in [
            &self.read_count,
            &self.write_count,
            &self.read_size,
            &self.write_size,
            &self.read_latencies,
            &self.write_latencies,
        ] {
            gauge.reset();
        }

        for (key, m) in metrics.snapshot() {
            let identity = files.get(&key);
            let file_path = paths
                .get(&key)
                .or_else(|| identity.as_ref().map(|i| i.file_path.clone()))
                .unwrap_or_default();
            let (pod, container) = identity
                .map(|i| (i.pod, i.container))
                .unwrap_or_default();
            let dev_id = (key >> 32).to_string();
            let file_id = (key & 0xFFFF_FFFF).to_string();
            let labels = [
                dev_id.as_str(),
                file_id.as_str(),
                node_name,
                file_path.as_str(),
                pod.as_str(),
                container.as_str(),
            ];
            self.read_count.with_label_values(&labels).set(m.read_count as f64);
            self.write_count.with_label_values(&labels).set(m.write_count as f64);
            self.read_size.with_label_values(&labels).set(m.read_bytes as f64);
            self.write_size.with_label_values(&labels).set(m.write_bytes as f64);
            self.read_latencies
                .with_label_values(&labels)
                .set(m.read_latency as f64);
            self.write_latencies
                .with_label_values(&labels)
                .set(m.write_latency as f64);
        }
    }

    /// Text exposition of the registered gauges.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("Failed to encode metrics")?;
        String::from_utf8(buf).context("Metrics exposition is not UTF-8")
    }
}
