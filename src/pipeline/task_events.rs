use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{Caches, FileIdentity};
use crate::events::{decode, DecodeError, TaskEvent};
use crate::kallsyms::SymbolCatalog;
use crate::mountinfo::{read_process_mounts, MountRecord};
use crate::pipeline::source::{consume, RecordSource};
use crate::shutdown::Shutdown;
use crate::sink::{Fact, Sink};

/// Joins RPC task events with mount and path information.
pub struct TaskEventConsumer {
    proc_root: PathBuf,
    symbols: Arc<SymbolCatalog>,
    caches: Caches,
    sink: Arc<dyn Sink>,
}

impl TaskEventConsumer {
    pub fn new(
        proc_root: PathBuf,
        symbols: Arc<SymbolCatalog>,
        caches: Caches,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            proc_root,
            symbols,
            caches,
            sink,
        }
    }

    /// Find the mount an event refers to in the process's own mount table,
    /// read fresh for every event. Mount ids are only meaningful inside the
    /// process's mount namespace, so an unreadable table (usually an exited
    /// process) resolves nothing.
    fn resolve_mount(&self, event: &TaskEvent) -> Option<MountRecord> {
        let mount_id = event.mount_id.to_string();
        match read_process_mounts(&self.proc_root, event.pid) {
            Ok(mounts) => mounts.into_iter().find(|m| m.mount_id == mount_id),
            Err(e) => {
                tracing::debug!("{e:#}");
                None
            }
        }
    }

    /// Process one raw record. Returns the identity stored, if any.
    pub fn handle(&self, data: &[u8]) -> Option<FileIdentity> {
        let event: TaskEvent = match decode(data) {
            Ok(event) => event,
            Err(DecodeError::Empty) => return None,
            Err(e) => {
                tracing::warn!("Dropping task event: {e}");
                return None;
            }
        };

        let Some(mount) = self.resolve_mount(&event) else {
            tracing::warn!(
                "No mount {} for pid {}, dropping event",
                event.mount_id,
                event.pid
            );
            return None;
        };

        let key = event.file_key();
        let caller = self.symbols.find_nearest(event.caller_addr).to_string();
        let identity = FileIdentity {
            mount_path: mount.local_dir.clone(),
            remote_nfs_addr: mount.remote_nfs_addr.clone(),
            file_path: self.caches.paths.get(&key).unwrap_or_default(),
            pod: event.pod(),
            container: event.container(),
        };
        tracing::trace!("{event:?} -> {identity:?}");
        self.caches.files.insert(key, identity.clone());

        self.sink.publish(&Fact::FileAccess {
            pid: event.pid,
            key,
            caller,
            mount_id: mount.mount_id,
            mount_path: identity.mount_path.clone(),
            remote_nfs_addr: identity.remote_nfs_addr.clone(),
            file_path: identity.file_path.clone(),
            pod: identity.pod.clone(),
            container: identity.container.clone(),
        });
        Some(identity)
    }

    pub fn run(&self, source: &mut dyn RecordSource, shutdown: &Shutdown) {
        consume("task events", source, shutdown, &mut |data: &[u8]| {
            self.handle(data);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{fill_cstr, TaskEvent};
    use crate::kallsyms::Symbol;
    use crate::sink::MemorySink;
    use std::fs;

    const MOUNTS: &str = "\
22 1 0:50 / /mnt/nfs rw,relatime shared:1 - nfs4 10.0.0.1:/export rw,vers=4.2
23 1 0:51 / /home rw,relatime - ext4 /dev/sda2 rw
";

    fn raw_event(pid: i32, mount_id: i32, key: u64) -> Vec<u8> {
        let mut event = TaskEvent {
            pid,
            mount_id,
            caller_addr: 0x1010,
            key,
            ..Default::default()
        };
        fill_cstr(&mut event.pod, "web-0");
        fill_cstr(&mut event.container, "app");
        crate::events::as_bytes(&event).to_vec()
    }

    fn consumer(proc_root: PathBuf) -> (TaskEventConsumer, Caches, Arc<MemorySink>) {
        let caches = Caches::new();
        let sink = Arc::new(MemorySink::new());
        let symbols = Arc::new(SymbolCatalog::from_symbols(vec![Symbol {
            name: "nfs_initiate_read".into(),
            address: 0x1000,
        }]));
        (
            TaskEventConsumer::new(proc_root, symbols, caches.clone(), sink.clone()),
            caches,
            sink,
        )
    }

    #[test]
    fn test_event_joins_mount() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("100")).unwrap();
        fs::write(root.path().join("100/mountinfo"), MOUNTS).unwrap();
        let (consumer, caches, sink) = consumer(root.path().to_path_buf());
        caches.paths.insert(1, "/mnt/nfs/data.bin".into());

        let identity = consumer.handle(&raw_event(100, 22, 1)).unwrap();
        assert_eq!(identity.mount_path, "/mnt/nfs");
        assert_eq!(identity.remote_nfs_addr, "10.0.0.1:/export");
        assert_eq!(identity.file_path, "/mnt/nfs/data.bin");
        assert_eq!(caches.files.get(&1), Some(identity));

        match &sink.facts()[0] {
            Fact::FileAccess { caller, pod, .. } => {
                assert_eq!(caller, "nfs_initiate_read");
                assert_eq!(pod, "web-0");
            }
            other => panic!("unexpected fact {other:?}"),
        }
    }

    #[test]
    fn test_missing_mount_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("100")).unwrap();
        fs::write(root.path().join("100/mountinfo"), MOUNTS).unwrap();
        let (consumer, caches, sink) = consumer(root.path().to_path_buf());

        assert!(consumer.handle(&raw_event(100, 99, 1)).is_none());
        assert!(caches.files.is_empty());
        assert!(sink.facts().is_empty());
    }

    #[test]
    fn test_exited_process_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        let (consumer, caches, sink) = consumer(root.path().to_path_buf());
        // The tracer's own mount table knows mount 22, the process is gone.
        caches.mounts.replace_all(&crate::mountinfo::parse(MOUNTS));

        assert!(consumer.handle(&raw_event(555, 22, 1)).is_none());
        assert!(caches.files.get(&1).is_none());
        assert!(sink.facts().is_empty());

        // The consumer keeps going with the next record.
        fs::create_dir(root.path().join("100")).unwrap();
        fs::write(root.path().join("100/mountinfo"), MOUNTS).unwrap();
        assert!(consumer.handle(&raw_event(100, 22, 1)).is_some());
    }

    #[test]
    fn test_bad_records_are_dropped() {
        let root = tempfile::tempdir().unwrap();
        let (consumer, caches, _sink) = consumer(root.path().to_path_buf());
        assert!(consumer.handle(&[]).is_none());
        assert!(consumer.handle(&[0u8; 10]).is_none());
        assert!(caches.files.is_empty());
    }
}
