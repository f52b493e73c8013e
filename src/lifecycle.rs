//! Container lifecycle queue.
//!
//! Pod notifications from an external watcher are pushed into a bounded
//! queue. Every interval the queue is drained into a batch which a worker
//! pool applies to the kernel PID table and the container caches. Pushing
//! never blocks: when the queue is full the new event is dropped.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::cache::{ContainerPidCache, PidIdentityCache, PodIdentity};
use crate::cri::{PidLookup, RuntimeError};
use crate::events::PidMetadata;
use crate::pidmap::IdentityTable;
use crate::shutdown::Shutdown;

const RUNTIME_PREFIXES: [&str; 3] = ["docker://", "containerd://", "cri-o://"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[serde(alias = "ADDED")]
    Add,
    #[serde(alias = "MODIFIED")]
    Update,
    #[serde(alias = "del", alias = "DELETED")]
    Delete,
}

/// The subset of a Kubernetes pod object the queue needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: PodMeta,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub container_statuses: Option<Vec<ContainerStatus>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "containerID", default)]
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(alias = "object")]
    pub pod: Option<Pod>,
}

impl PodEvent {
    /// `namespace/name` of the pod, empty when the event carries none.
    fn pod_key(&self) -> String {
        self.pod
            .as_ref()
            .map(|pod| format!("{}/{}", pod.metadata.namespace, pod.metadata.name))
            .unwrap_or_default()
    }
}

/// Split a batch into one run per pod, keeping arrival order within a run.
fn partition_by_pod(batch: Vec<PodEvent>) -> Vec<Vec<PodEvent>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut runs: Vec<Vec<PodEvent>> = Vec::new();
    for event in batch {
        let key = event.pod_key();
        match index.get(&key) {
            Some(&run) => runs[run].push(event),
            None => {
                index.insert(key, runs.len());
                runs.push(vec![event]);
            }
        }
    }
    runs
}

/// Remove the runtime scheme from a `containerID` status field.
pub fn strip_runtime_prefix(id: &str) -> &str {
    RUNTIME_PREFIXES
        .iter()
        .find_map(|prefix| id.strip_prefix(prefix))
        .unwrap_or(id)
}

/// Applies pod events to the PID table and the container caches.
pub struct PodSync {
    table: Arc<dyn IdentityTable>,
    runtime: Arc<dyn PidLookup>,
    container_pids: Arc<ContainerPidCache>,
    pid_identity: Arc<PidIdentityCache>,
}

impl PodSync {
    pub fn new(
        table: Arc<dyn IdentityTable>,
        runtime: Arc<dyn PidLookup>,
        container_pids: Arc<ContainerPidCache>,
        pid_identity: Arc<PidIdentityCache>,
    ) -> Self {
        Self {
            table,
            runtime,
            container_pids,
            pid_identity,
        }
    }

    /// Apply one event. Pods without status information are ignored.
    pub fn apply(&self, event: &PodEvent) -> Result<()> {
        let Some(pod) = &event.pod else {
            tracing::warn!("Pod event without a pod");
            return Ok(());
        };
        let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref())
        else {
            tracing::debug!("Pod {} has no container statuses", pod.metadata.name);
            return Ok(());
        };

        for status in statuses {
            if status.container_id.is_empty() {
                tracing::info!(
                    "Pod {} container {} has no id yet",
                    pod.metadata.name,
                    status.name
                );
                continue;
            }
            let container_id = strip_runtime_prefix(&status.container_id);
            match event.kind {
                EventKind::Add | EventKind::Update => {
                    if pod.metadata.deletion_timestamp.is_some() {
                        tracing::info!("Pod {} is terminating, skipping", pod.metadata.name);
                        return Ok(());
                    }
                    self.update_container(container_id, &pod.metadata.name, &status.name)?;
                }
                EventKind::Delete => self.delete_container(container_id)?,
            }
        }
        Ok(())
    }

    fn update_container(&self, container_id: &str, pod: &str, container: &str) -> Result<()> {
        let pids = self
            .runtime
            .get_pids(container_id)
            .with_context(|| format!("Failed to resolve pid of container {container_id}"))?;
        let Some(&pid) = pids.first() else {
            return Err(RuntimeError::NotFound(container_id.to_string()).into());
        };
        let pid = u64::from(pid);

        self.table.put(pid, &PidMetadata::new(pod, container, pid))?;
        if let Some(old) = self.container_pids.insert(container_id.to_string(), pid) {
            if old != pid {
                tracing::info!("Container {container_id} moved from pid {old} to {pid}");
                if let Err(e) = self.table.delete(old) {
                    tracing::debug!("{e:#}");
                }
                self.pid_identity.remove(&old);
            }
        }
        self.pid_identity.insert(
            pid,
            PodIdentity {
                pod: pod.to_string(),
                container: container.to_string(),
            },
        );
        tracing::info!("Tracking pod {pod} container {container} as pid {pid}");
        Ok(())
    }

    fn delete_container(&self, container_id: &str) -> Result<()> {
        let Some(pid) = self.container_pids.get(&container_id.to_string()) else {
            tracing::debug!("Container {container_id} was never tracked");
            return Ok(());
        };
        match self.table.get(pid)? {
            Some(_) => self.table.delete(pid)?,
            None => tracing::warn!("Pid {pid} of container {container_id} already gone"),
        }
        self.container_pids.remove(&container_id.to_string());
        self.pid_identity.remove(&pid);
        tracing::info!("Stopped tracking container {container_id} (pid {pid})");
        Ok(())
    }

    /// Apply `event`, trying at most `attempts` times.
    pub fn apply_with_retry(&self, event: &PodEvent, attempts: usize) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.apply(event) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!("Pod event failed (attempt {attempt}/{attempts}): {e:#}");
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub capacity: usize,
    pub interval: Duration,
    pub workers: usize,
    pub retries: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            interval: Duration::from_secs(5),
            workers: 10,
            retries: 3,
        }
    }
}

pub struct LifecycleQueue {
    tx: SyncSender<PodEvent>,
    rx: Mutex<Receiver<PodEvent>>,
    sync: Arc<PodSync>,
    settings: QueueSettings,
    dropped: AtomicU64,
}

impl LifecycleQueue {
    pub fn new(settings: QueueSettings, sync: PodSync) -> Self {
        let (tx, rx) = sync_channel(settings.capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            sync: Arc::new(sync),
            settings,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event. Returns false when it had to be dropped.
    pub fn push(&self, event: PodEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Pod event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!("Pod event queue closed, dropping event");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<PodEvent> {
        let rx = match self.rx.lock() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut batch = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    /// Apply a batch on the worker pool and wait for it to finish.
    ///
    /// Pods are processed in parallel; the events of one pod are applied in
    /// the order they were pushed.
    pub fn process(&self, batch: Vec<PodEvent>) {
        if batch.is_empty() {
            return;
        }
        tracing::debug!("Processing {} pod events", batch.len());
        let pool = Pool::<ThunkWorker<()>>::new(self.settings.workers.max(1));
        for run in partition_by_pod(batch) {
            let sync = self.sync.clone();
            let attempts = self.settings.retries.max(1);
            pool.execute(Thunk::of(move || {
                for event in &run {
                    if let Err(e) = sync.apply_with_retry(event, attempts) {
                        tracing::error!(
                            "Giving up on pod event after {attempts} attempts: {e:#}"
                        );
                    }
                }
            }));
        }
        pool.join();
    }

    /// Drain and process on every interval until `shutdown` is cancelled.
    pub fn run(&self, shutdown: &Shutdown) {
        tracing::info!("Starting pod event queue");
        let mut reported = 0;
        while !shutdown.wait_timeout(self.settings.interval) {
            let dropped = self.dropped();
            if dropped > reported {
                tracing::warn!(
                    "Dropped {} pod events since the last drain ({dropped} total)",
                    dropped - reported
                );
                reported = dropped;
            }
            self.process(self.drain());
        }
        tracing::info!("pod event queue stopped");
    }

    /// Push one event per JSON line read from `reader`, until EOF or
    /// cancellation. Malformed lines are skipped.
    pub fn feed(&self, reader: impl BufRead, shutdown: &Shutdown) -> Result<()> {
        for line in reader.lines() {
            if shutdown.is_cancelled() {
                break;
            }
            let line = line.context("Failed to read pod events")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PodEvent>(&line) {
                Ok(event) => {
                    self.push(event);
                }
                Err(e) => tracing::warn!("Skipping malformed pod event: {e}"),
            }
        }
        Ok(())
    }
}
