//! Startup and supervision of the tracer.
//!
//! [`run`] loads kernel type information, selects functions, loads the BPF
//! collection, attaches probes and then hands every kernel buffer to its
//! consumer under a [`TaskManager`] until the shared [`Shutdown`] token is
//! cancelled. Probe links detach before the collection is released.

use std::ffi::OsStr;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use libbpf_rs::{MapCore, MapHandle, Object, ObjectBuilder};
use sysinfo::System;

use crate::btf_funcs::{
    list_modules, merge_funcs, select_functions, BtfSource, FunctionSource, SelectedFuncs,
};
use crate::cache::Caches;
use crate::config::Config;
use crate::cri::Runtime;
use crate::kallsyms::SymbolCatalog;
use crate::lifecycle::{LifecycleQueue, PodSync};
use crate::mountinfo::MountMonitor;
use crate::pidmap::BpfIdentityTable;
use crate::pipeline::{
    DnsConsumer, MetricsConsumer, PathConsumer, PerfSource, TaskEventConsumer,
};
use crate::probes::{
    attach_kprobes, attach_tracepoint_group, disabled_programs, feature_kprobes,
    selected_kprobes, Attach, TracingSet, NFS_TRACEPOINTS, RPC_TRACEPOINTS,
};
use crate::shutdown::Shutdown;
use crate::sink::{JsonSink, Sink};
use crate::task::TaskManager;

const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;
const NOFILE_RLIMIT: u64 = 8192;

const TASK_EVENTS_MAP: &str = "nfs_trace_map";
const PATH_MAP: &str = "path_ringbuf";
const METRICS_MAP: &str = "io_metrics";
const DNS_MAP: &str = "dns_events";
const PID_MAP: &str = "pid_cgroup_map";

/// Bump the memory lock rlimit for BPF programs.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} bytes ({} MiB). This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES,
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }

    Ok(())
}

/// Every perf buffer holds one fd per CPU.
fn bump_nofile_rlimit() {
    let rlimit = libc::rlimit {
        rlim_cur: NOFILE_RLIMIT,
        rlim_max: NOFILE_RLIMIT,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit) } != 0 {
        tracing::warn!(
            "Failed to raise RLIMIT_NOFILE to {NOFILE_RLIMIT}: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Run the function selector and merge the operator's extra functions.
pub fn select_targets(
    config: &Config,
    source: &dyn FunctionSource,
    modules: &[String],
) -> Result<SelectedFuncs> {
    let mut selected = select_functions(
        source,
        &config.filter_func,
        &config.filter_struct,
        modules,
    )
    .context("Failed to select kernel functions")?;
    merge_funcs(&mut selected, config.extra_funcs()?);

    tracing::info!("Selected {} functions to probe", selected.len());
    for target in selected.values() {
        tracing::debug!("  {} (arg {})", target.key(), target.arg_position);
    }
    Ok(selected)
}

fn load_targets(config: &Config) -> Result<SelectedFuncs> {
    let btf_path = config.kernel_btf_path();
    let source = BtfSource::new(&btf_path, &config.module_btf_dir)
        .with_context(|| format!("Failed to load kernel BTF {}", btf_path.display()))?;
    let modules = if config.all_kmods {
        list_modules(&config.module_btf_dir)?
    } else {
        config.kmods.clone()
    };
    select_targets(config, &source, &modules)
}

/// Attach tracepoints and kprobes for `selected` and the enabled features.
///
/// A degraded RPC tracepoint group is dropped entirely and its kprobe
/// fallbacks are attached instead.
pub fn attach_probes(
    attacher: &mut dyn Attach,
    config: &Config,
    selected: &SelectedFuncs,
) -> TracingSet {
    let features = config.features();
    let probes = TracingSet::new();
    let mut rpc_attached = false;

    if features.nfs_metrics {
        let nfs = attach_tracepoint_group(attacher, &config.tracefs_root, "nfs", &NFS_TRACEPOINTS);
        let rpc =
            attach_tracepoint_group(attacher, &config.tracefs_root, "sunrpc", &RPC_TRACEPOINTS);
        if nfs.degraded {
            tracing::warn!("Some nfs tracepoints are unavailable");
        }
        if rpc.degraded {
            tracing::warn!("sunrpc tracepoints unavailable, using kprobe fallback");
            rpc.set.detach();
            probes.merge([nfs.set]);
        } else {
            rpc_attached = true;
            probes.merge([nfs.set, rpc.set]);
        }
    }

    let mut plans = selected_kprobes(selected);
    plans.extend(feature_kprobes(features, rpc_attached));
    probes.merge([attach_kprobes(attacher, &plans)]);
    probes
}

fn open_object(config: &Config, path: &Path) -> Result<Object> {
    let mut open_obj = ObjectBuilder::default()
        .open_file(path)
        .with_context(|| format!("Failed to open BPF object {}", path.display()))?;

    let disabled = disabled_programs(config.features());
    for mut prog in open_obj.progs_mut() {
        let name = prog.name().to_string_lossy().into_owned();
        if disabled.contains(&name.as_str()) {
            tracing::debug!("Disabling program {name}");
            prog.set_autoload(false);
        }
    }

    if config.enable_debug {
        // The read-only config section holds a single `debug_log` byte.
        let mut switched = false;
        if let Some(mut rodata) = open_obj
            .maps_mut()
            .find(|m| m.name().to_string_lossy().ends_with(".rodata"))
        {
            if let Some(data) = rodata.initial_value_mut() {
                if data.len() == 1 {
                    data[0] = 1;
                    switched = true;
                }
            }
        }
        if switched {
            tracing::info!("Enabled kernel-side debug output");
        } else {
            tracing::warn!("BPF object has no debug switch, ignoring enable_debug");
        }
    }

    open_obj
        .load()
        .with_context(|| format!("Failed to load BPF object {}", path.display()))
}

fn map_handle(obj: &Object, name: &str) -> Result<MapHandle> {
    let map = obj
        .maps()
        .find(|m| m.name() == OsStr::new(name))
        .ok_or_else(|| anyhow!("Map '{name}' not found in BPF object"))?;
    MapHandle::try_from(&map).with_context(|| format!("Failed to get a handle to map '{name}'"))
}

fn node_name(config: &Config) -> String {
    config
        .node_name
        .clone()
        .or_else(System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

fn open_sink(config: &Config) -> Result<Arc<dyn Sink>> {
    if config.output == "stdout" || config.output.is_empty() {
        Ok(Arc::new(JsonSink::stdout()))
    } else {
        Ok(Arc::new(JsonSink::file(Path::new(&config.output))?))
    }
}

fn spawn_pod_feed(path: PathBuf, queue: Arc<LifecycleQueue>, shutdown: Shutdown) -> Result<()> {
    // Reads from a FIFO block without a timeout, so this thread is not joined.
    thread::Builder::new()
        .name("pod_events".to_string())
        .spawn(move || {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!("Failed to open pod events {}: {e}", path.display());
                    return;
                }
            };
            if let Err(e) = queue.feed(BufReader::new(file), &shutdown) {
                tracing::error!("{e:#}");
            }
            tracing::info!("Pod event feed {} closed", path.display());
        })?;
    Ok(())
}

/// Run the tracer until `shutdown` is cancelled.
pub fn run(config: &Config, shutdown: Shutdown) -> Result<()> {
    config.validate()?;
    bump_memlock_rlimit()?;
    bump_nofile_rlimit();

    let caches = Caches::new();
    let mut threads = Vec::new();
    {
        let monitor = MountMonitor::new(
            config.proc_root.join("self").join("mountinfo"),
            Duration::from_secs(config.mount_poll_secs),
            caches.mounts.clone(),
        );
        let shutdown = shutdown.clone();
        threads.push(
            thread::Builder::new()
                .name("mount_monitor".to_string())
                .spawn(move || monitor.run(shutdown))?,
        );
    }

    let result = trace(config, &caches, &shutdown, &mut threads);

    shutdown.cancel();
    for thread in threads {
        if thread.join().is_err() {
            tracing::error!("A helper thread panicked");
        }
    }
    result
}

fn trace(
    config: &Config,
    caches: &Caches,
    shutdown: &Shutdown,
    threads: &mut Vec<thread::JoinHandle<()>>,
) -> Result<()> {
    let selected = load_targets(config)?;
    if config.skip_attach {
        tracing::info!("Skipping attach, {} functions selected", selected.len());
        return Ok(());
    }

    let bpf_object = config
        .bpf_object
        .as_deref()
        .ok_or_else(|| anyhow!("No BPF object configured"))?;
    let symbols = Arc::new(
        SymbolCatalog::load(&config.kallsyms_path).context("Failed to load kernel symbols")?,
    );
    tracing::info!("Loaded {} kernel symbols", symbols.len());

    let mut obj = open_object(config, bpf_object)?;
    let probes = attach_probes(&mut obj, config, &selected);
    tracing::info!("Attached {} probes", probes.len());

    let task_map = map_handle(&obj, TASK_EVENTS_MAP)?;
    let path_map = map_handle(&obj, PATH_MAP)?;
    let metrics_map = if config.enable_nfs_metrics {
        Some(map_handle(&obj, METRICS_MAP)?)
    } else {
        None
    };
    let dns_map = if config.enable_dns {
        Some(map_handle(&obj, DNS_MAP)?)
    } else {
        None
    };
    let pid_map = map_handle(&obj, PID_MAP)?;
    probes.own(Box::new(obj));

    match Runtime::detect(&config.proc_root) {
        Ok(runtime) => {
            tracing::info!("Using {} for container lookups", runtime.name());
            let queue = Arc::new(LifecycleQueue::new(
                config.queue_settings(),
                PodSync::new(
                    Arc::new(BpfIdentityTable::new(pid_map)),
                    Arc::new(runtime),
                    caches.container_pids.clone(),
                    caches.pid_identity.clone(),
                ),
            ));
            {
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                threads.push(
                    thread::Builder::new()
                        .name("pod_queue".to_string())
                        .spawn(move || queue.run(&shutdown))?,
                );
            }
            if let Some(path) = &config.pod_events {
                spawn_pod_feed(path.clone(), queue, shutdown.clone())?;
            }
        }
        Err(e) => tracing::warn!("Pod identities disabled: {e}"),
    }

    let sink = open_sink(config)?;
    let mut tm = TaskManager::new();
    {
        let consumer = TaskEventConsumer::new(
            config.proc_root.clone(),
            symbols,
            caches.clone(),
            sink.clone(),
        );
        let shutdown = shutdown.clone();
        tm.add("events", move || {
            let mut source = PerfSource::open(TASK_EVENTS_MAP, &task_map)?;
            consumer.run(&mut source, &shutdown);
            Ok(())
        });
    }
    {
        let mut consumer = PathConsumer::new(caches.paths.clone(), config.max_inflight_paths);
        let shutdown = shutdown.clone();
        tm.add("files", move || {
            let mut source = PerfSource::open(PATH_MAP, &path_map)?;
            consumer.run(&mut source, &shutdown);
            Ok(())
        });
    }
    if let Some(map) = metrics_map {
        let consumer = MetricsConsumer::new(
            caches.clone(),
            sink.clone(),
            &node_name(config),
            Duration::from_secs(config.metrics_interval_secs),
        )
        .with_textfile(config.metrics_textfile.clone())?;
        let shutdown = shutdown.clone();
        tm.add("metrics", move || {
            consumer.run(&map, &shutdown);
            Ok(())
        });
    }
    if let Some(map) = dns_map {
        let consumer = DnsConsumer::new(caches.pid_identity.clone(), sink.clone());
        let shutdown = shutdown.clone();
        tm.add("dns", move || {
            let mut source = PerfSource::open(DNS_MAP, &map)?;
            consumer.run(&mut source, &shutdown);
            Ok(())
        });
    }

    tracing::info!("Tracing started, running tasks: {}", tm.list().join(", "));
    let result = tm.run();
    tracing::info!("Detaching probes");
    probes.detach();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btf_funcs::{FuncSignature, SelectError};
    use crate::probes::ProbeLink;
    use regex::Regex;
    use std::fs;

    struct OneFunc;

    impl FunctionSource for OneFunc {
        fn kernel_functions(&self, _pattern: &Regex) -> Result<Vec<FuncSignature>, SelectError> {
            Ok(vec![
                FuncSignature {
                    name: "nfs_initiate_pgio".into(),
                    params: vec![None, Some("nfs_pgio_header".into())],
                },
                FuncSignature {
                    name: "nfs_commit_done".into(),
                    params: vec![Some("rpc_task".into())],
                },
            ])
        }

        fn module_functions(
            &self,
            _module: &str,
            _pattern: &Regex,
        ) -> Result<Vec<FuncSignature>, SelectError> {
            Ok(Vec::new())
        }
    }

    struct NoopLink;

    impl ProbeLink for NoopLink {
        fn detach(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        kprobes: Vec<(String, String)>,
        failing_tracepoints: Vec<&'static str>,
    }

    impl Attach for Recorder {
        fn attach_kprobe(&mut self, program: &str, function: &str) -> Result<Box<dyn ProbeLink>> {
            self.kprobes.push((program.into(), function.into()));
            Ok(Box::new(NoopLink))
        }

        fn attach_tracepoint(
            &mut self,
            _program: &str,
            _subsystem: &str,
            event: &str,
        ) -> Result<Box<dyn ProbeLink>> {
            if self.failing_tracepoints.contains(&event) {
                bail!("tracepoint {event} rejected");
            }
            Ok(Box::new(NoopLink))
        }
    }

    fn tracefs_with(events: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (group, name) in events {
            let path = dir.path().join("events").join(group).join(name);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join("enable"), "0").unwrap();
        }
        dir
    }

    #[test]
    fn test_select_targets_merges_extra_funcs() {
        let config = Config {
            filter_func: "nfs_.*".into(),
            add_funcs: "nfs_file_read:3".into(),
            skip_attach: true,
            ..Default::default()
        };
        let selected = select_targets(&config, &OneFunc, &[]).unwrap();
        let names: Vec<_> = selected.keys().cloned().collect();
        assert_eq!(names, vec!["nfs_file_read", "nfs_initiate_pgio"]);
        assert_eq!(selected["nfs_initiate_pgio"].arg_position, 2);
    }

    #[test]
    fn test_attach_with_rpc_tracepoints() {
        let tracefs = tracefs_with(&[
            ("nfs", "nfs_initiate_read"),
            ("nfs", "nfs_initiate_write"),
            ("sunrpc", "rpc_task_begin"),
            ("sunrpc", "rpc_task_end"),
        ]);
        let config = Config {
            tracefs_root: tracefs.path().to_path_buf(),
            enable_nfs_metrics: true,
            skip_attach: true,
            ..Default::default()
        };
        let selected = select_targets(&config, &OneFunc, &[]).unwrap();
        let mut recorder = Recorder::default();
        let probes = attach_probes(&mut recorder, &config, &selected);

        let functions: Vec<&str> = recorder.kprobes.iter().map(|(_, f)| f.as_str()).collect();
        assert!(functions.contains(&"nfs_initiate_pgio"));
        assert!(functions.contains(&"nfs_writeback_done"));
        assert!(!functions.contains(&"rpc_exit_task"));
        assert!(!functions.contains(&"rpc_make_runnable"));
        assert!(probes.names().contains(&"sunrpc:rpc_task_end".to_string()));
        assert!(recorder
            .kprobes
            .contains(&("kprobe_skb_2".to_string(), "nfs_initiate_pgio".to_string())));
    }

    #[test]
    fn test_attach_falls_back_when_rpc_degraded() {
        let tracefs = tracefs_with(&[
            ("nfs", "nfs_initiate_read"),
            ("nfs", "nfs_initiate_write"),
            ("sunrpc", "rpc_task_begin"),
            ("sunrpc", "rpc_task_end"),
        ]);
        let config = Config {
            tracefs_root: tracefs.path().to_path_buf(),
            enable_nfs_metrics: true,
            enable_dns: true,
            skip_attach: true,
            ..Default::default()
        };
        let mut recorder = Recorder {
            failing_tracepoints: vec!["rpc_task_end"],
            ..Default::default()
        };
        let probes = attach_probes(&mut recorder, &config, &SelectedFuncs::new());

        let functions: Vec<&str> = recorder.kprobes.iter().map(|(_, f)| f.as_str()).collect();
        assert!(functions.contains(&"rpc_exit_task"));
        assert!(functions.contains(&"rpc_make_runnable"));
        assert!(functions.contains(&"udp_sendmsg"));
        let names = probes.names();
        assert!(names.contains(&"nfs:nfs_initiate_read".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("sunrpc:")));
    }

    #[test]
    fn test_attach_without_features() {
        let config = Config {
            skip_attach: true,
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        let probes = attach_probes(&mut recorder, &config, &SelectedFuncs::new());
        assert!(probes.is_empty());
        assert!(recorder.kprobes.is_empty());
    }
}
