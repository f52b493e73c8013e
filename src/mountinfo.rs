//! Parsing of `/proc/<pid>/mountinfo` and the mount table monitor.
//!
//! A mountinfo line looks like:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt/nfs rw,noatime master:1 - nfs4 10.0.0.1:/export rw,vers=4.2
//! (0)(1) (2)   (3)    (4)       (5)      (6)     (7) (8)     (9)            (10)
//! ```
//!
//! Field 6 (optional fields) may be empty or repeat, so the filesystem type
//! and source are located relative to the `-` separator rather than by fixed
//! index.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cache::MountCache;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    pub mount_id: String,
    pub local_dir: String,
    /// Only set for `nfs`/`nfs4` mounts.
    pub remote_nfs_addr: String,
}

/// Parse one mountinfo line. Returns `None` for malformed lines.
pub fn parse_line(line: &str) -> Option<MountRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let sep = fields.iter().skip(6).position(|f| *f == "-")? + 6;
    let fstype = fields.get(sep + 1)?;
    let remote_nfs_addr = if matches!(*fstype, "nfs" | "nfs4") {
        fields.get(sep + 2).map(|s| s.to_string()).unwrap_or_default()
    } else {
        String::new()
    };

    Some(MountRecord {
        mount_id: fields[0].to_string(),
        local_dir: fields[4].to_string(),
        remote_nfs_addr,
    })
}

pub fn parse(contents: &str) -> Vec<MountRecord> {
    contents.lines().filter_map(parse_line).collect()
}

pub fn read_mountinfo(path: &Path) -> Result<Vec<MountRecord>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read mount table {}", path.display()))?;
    Ok(parse(&contents))
}

/// Mount table of process `pid` under `proc_root`.
pub fn read_process_mounts(proc_root: &Path, pid: i32) -> Result<Vec<MountRecord>> {
    read_mountinfo(&proc_root.join(pid.to_string()).join("mountinfo"))
}

/// Polls a mount table and publishes changes into a [`MountCache`].
pub struct MountMonitor {
    path: PathBuf,
    interval: Duration,
    cache: Arc<MountCache>,
    last: Option<Vec<MountRecord>>,
}

impl MountMonitor {
    pub fn new(path: PathBuf, interval: Duration, cache: Arc<MountCache>) -> Self {
        Self {
            path,
            interval,
            cache,
            last: None,
        }
    }

    /// Re-read the table once. Returns whether the cache was refreshed.
    pub fn poll_once(&mut self) -> Result<bool> {
        let mounts = read_mountinfo(&self.path)?;
        if self.last.as_ref() == Some(&mounts) {
            return Ok(false);
        }
        tracing::info!(
            "Mount table {} changed, {} entries",
            self.path.display(),
            mounts.len()
        );
        self.cache.replace_all(&mounts);
        self.last = Some(mounts);
        Ok(true)
    }

    /// Poll until `shutdown` is cancelled. Read errors skip a single poll.
    pub fn run(mut self, shutdown: Shutdown) {
        loop {
            if let Err(e) = self.poll_once() {
                tracing::error!("Failed to refresh mount table: {e:#}");
            }
            if shutdown.wait_timeout(self.interval) {
                break;
            }
        }
        tracing::debug!("Mount monitor for {} stopped", self.path.display());
    }
}
