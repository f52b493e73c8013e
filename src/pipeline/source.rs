use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use libbpf_rs::{MapCore, PerfBuffer, PerfBufferBuilder};

use crate::shutdown::Shutdown;

/// How long a consumer blocks on its buffer before rechecking cancellation.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay before polling again after a read error.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// A kernel-to-userspace record stream, read in emission order.
pub trait RecordSource {
    /// Wait up to `timeout` for records and pass each one to `handle`.
    fn poll(&mut self, timeout: Duration, handle: &mut dyn FnMut(&[u8])) -> Result<()>;
}

/// Drive `source` until `shutdown` is cancelled.
///
/// Read errors never end the loop; they are logged and the source is polled
/// again after [`RETRY_BACKOFF`].
pub fn consume(
    name: &str,
    source: &mut dyn RecordSource,
    shutdown: &Shutdown,
    handle: &mut dyn FnMut(&[u8]),
) {
    tracing::info!("Starting {name} consumer");
    while !shutdown.is_cancelled() {
        if let Err(e) = source.poll(POLL_TIMEOUT, handle) {
            tracing::error!("{name}: failed to read records: {e:#}");
            if shutdown.wait_timeout(RETRY_BACKOFF) {
                break;
            }
        }
    }
    tracing::info!("{name} consumer stopped");
}

/// Records from a `BPF_MAP_TYPE_PERF_EVENT_ARRAY` map.
///
/// The perf buffer is not `Send`, so a source must be opened on the thread
/// that polls it.
pub struct PerfSource {
    name: String,
    buffer: PerfBuffer<'static>,
    pending: Rc<RefCell<VecDeque<Vec<u8>>>>,
    lost: Rc<RefCell<u64>>,
}

impl PerfSource {
    pub fn open<M: MapCore>(name: &str, map: &M) -> Result<Self> {
        let pending: Rc<RefCell<VecDeque<Vec<u8>>>> = Rc::default();
        let lost: Rc<RefCell<u64>> = Rc::default();
        let sample_pending = pending.clone();
        let lost_count = lost.clone();
        let buffer = PerfBufferBuilder::new(map)
            .sample_cb(move |_cpu: i32, data: &[u8]| {
                sample_pending.borrow_mut().push_back(data.to_vec());
            })
            .lost_cb(move |_cpu: i32, count: u64| {
                *lost_count.borrow_mut() += count;
            })
            .build()
            .map_err(|e| anyhow!("Failed to open perf buffer {name}: {e}"))?;
        Ok(Self {
            name: name.to_string(),
            buffer,
            pending,
            lost,
        })
    }
}

impl RecordSource for PerfSource {
    fn poll(&mut self, timeout: Duration, handle: &mut dyn FnMut(&[u8])) -> Result<()> {
        if let Err(e) = self.buffer.poll(timeout) {
            if e.kind() != libbpf_rs::ErrorKind::Interrupted {
                return Err(anyhow!(e));
            }
        }
        let lost = std::mem::take(&mut *self.lost.borrow_mut());
        if lost > 0 {
            tracing::warn!("{}: lost {lost} samples", self.name);
        }
        loop {
            // Release the borrow before running the handler.
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(record) => handle(&record),
                None => break,
            }
        }
        Ok(())
    }
}

/// One step of a [`MemorySource`] script.
#[derive(Debug, Clone)]
pub enum Scripted {
    Record(Vec<u8>),
    Error(String),
}

/// A scripted in-memory source that cancels `shutdown` once drained.
pub struct MemorySource {
    script: VecDeque<Scripted>,
    shutdown: Shutdown,
}

impl MemorySource {
    pub fn new(script: impl IntoIterator<Item = Scripted>, shutdown: Shutdown) -> Self {
        Self {
            script: script.into_iter().collect(),
            shutdown,
        }
    }

    pub fn records(records: impl IntoIterator<Item = Vec<u8>>, shutdown: Shutdown) -> Self {
        Self::new(records.into_iter().map(Scripted::Record), shutdown)
    }
}

impl RecordSource for MemorySource {
    fn poll(&mut self, _timeout: Duration, handle: &mut dyn FnMut(&[u8])) -> Result<()> {
        match self.script.pop_front() {
            Some(Scripted::Record(record)) => {
                handle(&record);
                Ok(())
            }
            Some(Scripted::Error(msg)) => Err(anyhow!(msg)),
            None => {
                self.shutdown.cancel();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_survives_errors_and_keeps_order() {
        let shutdown = Shutdown::new();
        let mut source = MemorySource::new(
            vec![
                Scripted::Record(vec![1]),
                Scripted::Error("transient".into()),
                Scripted::Record(vec![2]),
                Scripted::Record(vec![3]),
            ],
            shutdown.clone(),
        );
        let mut seen = Vec::new();
        consume("test", &mut source, &shutdown, &mut |data: &[u8]| seen.push(data[0]));
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(shutdown.is_cancelled());
    }

    #[test]
    fn test_consume_exits_when_already_cancelled() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let mut source = MemorySource::records(vec![vec![1]], Shutdown::new());
        let mut count = 0;
        consume("test", &mut source, &shutdown, &mut |_: &[u8]| count += 1);
        assert_eq!(count, 0);
    }
}
