use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::btf_funcs::{parse_func_list, ProbeTarget};
use crate::lifecycle::QueueSettings;
use crate::probes::Features;

/// Environment variable overriding the default proc root.
pub const PROC_PATH_ENV: &str = "PROC_PATH";

fn default_proc_root() -> PathBuf {
    std::env::var_os(PROC_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/proc"))
}

/// Runtime options for the tracer, independent of how they were parsed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// Regex a kernel function name must fully match to be probed
    pub filter_func: String,
    /// Struct a probed function must take a pointer to
    pub filter_struct: String,
    /// Kernel BTF, `/sys/kernel/btf/vmlinux` when unset
    pub kernel_btf: Option<PathBuf>,
    /// Directory holding split BTF for kernel modules
    pub module_btf_dir: PathBuf,
    /// Search every module's BTF
    pub all_kmods: bool,
    /// Modules to search in addition to the kernel
    pub kmods: Vec<String>,
    /// Extra functions as `name:position[,name:position]`
    pub add_funcs: String,
    /// Select functions and exit without attaching
    pub skip_attach: bool,
    /// Compiled kernel-side collection
    pub bpf_object: Option<PathBuf>,
    pub kallsyms_path: PathBuf,
    pub proc_root: PathBuf,
    pub tracefs_root: PathBuf,
    pub enable_dns: bool,
    pub enable_nfs_metrics: bool,
    /// Turn on debug output of the kernel-side programs
    pub enable_debug: bool,
    /// `stdout` or a file receiving JSON lines
    pub output: String,
    /// Node label on metrics, the host name when unset
    pub node_name: Option<String>,
    /// Prometheus textfile rewritten on every metrics tick
    pub metrics_textfile: Option<PathBuf>,
    /// JSON-lines file or FIFO with pod notifications
    pub pod_events: Option<PathBuf>,
    pub queue_capacity: usize,
    pub queue_interval_secs: u64,
    pub queue_workers: usize,
    pub queue_retries: usize,
    pub metrics_interval_secs: u64,
    pub mount_poll_secs: u64,
    pub max_inflight_paths: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            filter_func: ".*".to_string(),
            filter_struct: "nfs_pgio_header".to_string(),
            kernel_btf: None,
            module_btf_dir: PathBuf::from("/sys/kernel/btf"),
            all_kmods: false,
            kmods: Vec::new(),
            add_funcs: String::new(),
            skip_attach: false,
            bpf_object: None,
            kallsyms_path: PathBuf::from("/proc/kallsyms"),
            proc_root: default_proc_root(),
            tracefs_root: PathBuf::from("/sys/kernel/debug/tracing"),
            enable_dns: false,
            enable_nfs_metrics: false,
            enable_debug: false,
            output: "stdout".to_string(),
            node_name: None,
            metrics_textfile: None,
            pod_events: None,
            queue_capacity: 10_000,
            queue_interval_secs: 5,
            queue_workers: 10,
            queue_retries: 3,
            metrics_interval_secs: 1,
            mount_poll_secs: 5,
            max_inflight_paths: 4096,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Reject settings that would only fail after kernel work has started.
    pub fn validate(&self) -> Result<()> {
        if !self.skip_attach && self.bpf_object.is_none() {
            bail!("A BPF object is required unless attaching is skipped");
        }
        if self.queue_workers == 0 {
            bail!("queue_workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.metrics_interval_secs == 0 || self.queue_interval_secs == 0 {
            bail!("Intervals must be at least one second");
        }
        if self.max_inflight_paths == 0 {
            bail!("max_inflight_paths must be at least 1");
        }
        self.extra_funcs()?;
        Ok(())
    }

    pub fn extra_funcs(&self) -> Result<Vec<ProbeTarget>> {
        parse_func_list(&self.add_funcs)
            .with_context(|| format!("Invalid function list '{}'", self.add_funcs))
    }

    pub fn kernel_btf_path(&self) -> PathBuf {
        self.kernel_btf
            .clone()
            .unwrap_or_else(|| self.module_btf_dir.join("vmlinux"))
    }

    pub fn features(&self) -> Features {
        Features {
            nfs_metrics: self.enable_nfs_metrics,
            dns: self.enable_dns,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.queue_capacity,
            interval: Duration::from_secs(self.queue_interval_secs),
            workers: self.queue_workers,
            retries: self.queue_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachable() -> Config {
        Config {
            bpf_object: Some(PathBuf::from("nfstrace.bpf.o")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.queue_workers, 10);
        assert_eq!(config.queue_retries, 3);
        assert_eq!(config.max_inflight_paths, 4096);
        assert_eq!(
            config.kernel_btf_path(),
            PathBuf::from("/sys/kernel/btf/vmlinux")
        );
        assert_eq!(config.queue_settings().interval, Duration::from_secs(5));
    }

    #[test]
    fn test_validate() {
        assert!(attachable().validate().is_ok());
        assert!(Config::default().validate().is_err());
        assert!(Config {
            skip_attach: true,
            ..Default::default()
        }
        .validate()
        .is_ok());
        assert!(Config {
            queue_workers: 0,
            ..attachable()
        }
        .validate()
        .is_err());
        assert!(Config {
            add_funcs: "nfs_read:9".into(),
            ..attachable()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_extra_funcs() {
        let config = Config {
            add_funcs: "nfs_file_read:1,nfs_file_write:2".into(),
            ..attachable()
        };
        let funcs = config.extra_funcs().unwrap();
        assert_eq!(funcs.len(), 2);
        assert_eq!(funcs[1].function, "nfs_file_write");
        assert_eq!(funcs[1].arg_position, 2);
    }

    #[test]
    fn test_from_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfstrace.json");
        fs::write(
            &path,
            r#"{"enable_dns": true, "kmods": ["nfs", "sunrpc"], "queue_workers": 4}"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.enable_dns);
        assert_eq!(config.kmods, vec!["nfs", "sunrpc"]);
        assert_eq!(config.queue_workers, 4);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.filter_struct, "nfs_pgio_header");

        fs::write(&path, "{not json").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
