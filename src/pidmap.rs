//! The PID to pod identity table read by the kernel-side programs.
//!
//! The lifecycle queue writes one [`PidMetadata`] per container process so
//! that in-kernel events can be tagged with pod and container names.

use anyhow::{Context, Result};
use dashmap::DashMap;
use libbpf_rs::{MapCore, MapFlags, MapHandle};

use crate::events::{as_bytes, decode, PidMetadata};

pub trait IdentityTable: Send + Sync {
    fn put(&self, pid: u64, metadata: &PidMetadata) -> Result<()>;
    fn get(&self, pid: u64) -> Result<Option<PidMetadata>>;
    fn delete(&self, pid: u64) -> Result<()>;
}

/// `pid_cgroup_map` in the loaded collection.
pub struct BpfIdentityTable {
    map: MapHandle,
}

impl BpfIdentityTable {
    pub fn new(map: MapHandle) -> Self {
        Self { map }
    }
}

impl IdentityTable for BpfIdentityTable {
    fn put(&self, pid: u64, metadata: &PidMetadata) -> Result<()> {
        self.map
            .update(&pid.to_ne_bytes(), as_bytes(metadata), MapFlags::ANY)
            .with_context(|| format!("Failed to store identity for pid {pid}"))
    }

    fn get(&self, pid: u64) -> Result<Option<PidMetadata>> {
        let value = self
            .map
            .lookup(&pid.to_ne_bytes(), MapFlags::ANY)
            .with_context(|| format!("Failed to look up identity for pid {pid}"))?;
        match value {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, pid: u64) -> Result<()> {
        self.map
            .delete(&pid.to_ne_bytes())
            .with_context(|| format!("Failed to delete identity for pid {pid}"))
    }
}

/// An in-process table with the same semantics as the kernel map.
#[derive(Debug, Default)]
pub struct MemoryIdentityTable {
    entries: DashMap<u64, PidMetadata>,
}

impl MemoryIdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityTable for MemoryIdentityTable {
    fn put(&self, pid: u64, metadata: &PidMetadata) -> Result<()> {
        self.entries.insert(pid, *metadata);
        Ok(())
    }

    fn get(&self, pid: u64) -> Result<Option<PidMetadata>> {
        Ok(self.entries.get(&pid).map(|e| *e.value()))
    }

    fn delete(&self, pid: u64) -> Result<()> {
        match self.entries.remove(&pid) {
            Some(_) => Ok(()),
            None => anyhow::bail!("No identity for pid {pid}"),
        }
    }
}
