//! Attach and detach lifecycle for kprobes and tracepoints.
//!
//! A probe moves from a [`KprobePlan`] (or a tracepoint group entry) to an
//! attached link held by a [`TracingSet`], and from there to detached once the
//! set is torn down. Attachment goes through [`Attach`] so the planning and
//! conflict rules can be exercised without a kernel; the production
//! implementation is `libbpf_rs::Object`.
//!
//! The RPC begin/end tracepoints and the `rpc_exit_task`/`rpc_make_runnable`
//! kprobes observe the same task transitions. When the tracepoint group
//! attaches cleanly the fallback kprobes are left out of the plan, otherwise
//! both would feed the same counters.

use std::any::Any;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use libbpf_rs::{Link, Object, TracepointCategory, TracepointOpts};

use crate::btf_funcs::SelectedFuncs;

/// NFS tracepoints: program name to tracepoint event.
pub const NFS_TRACEPOINTS: [(&str, &str); 2] = [
    ("nfs_init_read", "nfs_initiate_read"),
    ("nfs_init_write", "nfs_initiate_write"),
];

/// SUNRPC task begin/end tracepoints: program name to tracepoint event.
pub const RPC_TRACEPOINTS: [(&str, &str); 2] = [
    ("rpc_task_begin", "rpc_task_begin"),
    ("rpc_task_done", "rpc_task_end"),
];

/// Kprobe programs standing in for [`RPC_TRACEPOINTS`] on older kernels.
pub const RPC_FALLBACK_PROGRAMS: [&str; 2] = ["rpc_exit_task", "rpc_execute"];

const NFS_METRICS_KPROBES: [(&str, &str); 4] = [
    ("kb_nfs_write_d", "nfs_writeback_done"),
    ("kb_nfs_read_d", "nfs_readpage_done"),
    ("rpc_exit_task", "rpc_exit_task"),
    ("rpc_execute", "rpc_make_runnable"),
];

const DNS_KPROBES: [(&str, &str); 1] = [("kprobe_udp_recvmsg", "udp_sendmsg")];

/// Optional instrumentation groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub nfs_metrics: bool,
    pub dns: bool,
}

/// Programs that must not be loaded because their feature is off.
pub fn disabled_programs(features: Features) -> Vec<&'static str> {
    let mut disabled = Vec::new();
    if !features.nfs_metrics {
        disabled.extend(NFS_METRICS_KPROBES.iter().map(|(prog, _)| *prog));
        disabled.extend(NFS_TRACEPOINTS.iter().map(|(prog, _)| *prog));
        disabled.extend(RPC_TRACEPOINTS.iter().map(|(prog, _)| *prog));
    }
    if !features.dns {
        disabled.extend(DNS_KPROBES.iter().map(|(prog, _)| *prog));
    }
    disabled
}

/// A kprobe that has been decided on but not attached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KprobePlan {
    pub program: String,
    pub function: String,
}

impl KprobePlan {
    fn new(program: &str, function: &str) -> Self {
        Self {
            program: program.to_string(),
            function: function.to_string(),
        }
    }
}

/// Kprobes for the selected functions. Each argument position has its own
/// program, `kprobe_skb_<pos>`, that reads the structure from that register.
///
/// Kprobes attach by bare symbol name, so a function selected from more than
/// one source is planned once, for the entry that sorts first (a kernel or
/// operator entry before any module one).
pub fn selected_kprobes(selected: &SelectedFuncs) -> Vec<KprobePlan> {
    let mut planned = HashSet::new();
    let mut plans = Vec::new();
    for (key, target) in selected {
        if !planned.insert(target.function.as_str()) {
            tracing::debug!("Skipping {key}, {} is already planned", target.function);
            continue;
        }
        plans.push(KprobePlan {
            program: format!("kprobe_skb_{}", target.arg_position),
            function: target.function.clone(),
        });
    }
    plans
}

/// Fixed kprobes of the enabled features, with the RPC fallback pair removed
/// when `rpc_tracepoints_attached` is set.
pub fn feature_kprobes(features: Features, rpc_tracepoints_attached: bool) -> Vec<KprobePlan> {
    let mut plans = Vec::new();
    if features.nfs_metrics {
        plans.extend(
            NFS_METRICS_KPROBES
                .iter()
                .filter(|(prog, _)| {
                    !(rpc_tracepoints_attached && RPC_FALLBACK_PROGRAMS.contains(prog))
                })
                .map(|(prog, func)| KprobePlan::new(prog, func)),
        );
    }
    if features.dns {
        plans.extend(DNS_KPROBES.iter().map(|(prog, func)| KprobePlan::new(prog, func)));
    }
    plans
}

/// An attachment that can be torn down.
pub trait ProbeLink {
    fn detach(&self) -> Result<()>;
}

impl ProbeLink for Link {
    fn detach(&self) -> Result<()> {
        Link::detach(self).map_err(|e| anyhow!(e))
    }
}

/// Something probes can be attached through.
pub trait Attach {
    fn attach_kprobe(&mut self, program: &str, function: &str) -> Result<Box<dyn ProbeLink>>;

    fn attach_tracepoint(
        &mut self,
        program: &str,
        subsystem: &str,
        event: &str,
    ) -> Result<Box<dyn ProbeLink>>;
}

impl Attach for Object {
    fn attach_kprobe(&mut self, program: &str, function: &str) -> Result<Box<dyn ProbeLink>> {
        let prog = self
            .progs_mut()
            .find(|p| p.name() == OsStr::new(program))
            .ok_or_else(|| anyhow!("Program '{program}' not found in BPF object"))?;
        let link = prog
            .attach_kprobe(false, function)
            .with_context(|| format!("Failed to attach kprobe '{function}' with '{program}'"))?;
        Ok(Box::new(link))
    }

    fn attach_tracepoint(
        &mut self,
        program: &str,
        subsystem: &str,
        event: &str,
    ) -> Result<Box<dyn ProbeLink>> {
        let prog = self
            .progs_mut()
            .find(|p| p.name() == OsStr::new(program))
            .ok_or_else(|| anyhow!("Program '{program}' not found in BPF object"))?;
        let link = prog
            .attach_tracepoint_with_opts(
                TracepointCategory::Custom(subsystem.to_string()),
                event,
                TracepointOpts::default(),
            )
            .with_context(|| format!("Failed to attach tracepoint '{subsystem}:{event}'"))?;
        Ok(Box::new(link))
    }
}

struct AttachedProbe {
    name: String,
    link: Box<dyn ProbeLink>,
}

#[derive(Default)]
struct TracingInner {
    probes: Vec<AttachedProbe>,
    handles: Vec<Box<dyn Any>>,
    detached: bool,
}

/// A group of attached probes with a shared lifetime.
///
/// Dropping the set detaches it. Handles passed to [`TracingSet::own`] (the
/// loaded BPF object) are released only after every link is gone.
#[derive(Default)]
pub struct TracingSet {
    inner: Mutex<TracingInner>,
}

impl TracingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TracingInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, name: impl Into<String>, link: Box<dyn ProbeLink>) {
        self.lock().probes.push(AttachedProbe {
            name: name.into(),
            link,
        });
    }

    /// Keep `handle` alive until after this set detaches.
    pub fn own(&self, handle: Box<dyn Any>) {
        self.lock().handles.push(handle);
    }

    /// Move every probe and handle of `others` into this set.
    pub fn merge(&self, others: impl IntoIterator<Item = TracingSet>) {
        let mut inner = self.lock();
        for other in others {
            let mut theirs = other.lock();
            inner.probes.append(&mut theirs.probes);
            inner.handles.append(&mut theirs.handles);
        }
    }

    /// Names of the probes currently attached.
    pub fn names(&self) -> Vec<String> {
        self.lock().probes.iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().probes.is_empty()
    }

    #[cfg(test)]
    fn is_detached(&self) -> bool {
        self.lock().detached
    }

    /// Detach every link, then release owned handles.
    ///
    /// Each link is detached independently; failures are logged and never
    /// returned. Calling this more than once is a no-op.
    pub fn detach(&self) {
        let mut inner = self.lock();
        if inner.detached {
            return;
        }
        for probe in inner.probes.drain(..) {
            if let Err(e) = probe.link.detach() {
                tracing::warn!("Failed to detach {}: {e:#}", probe.name);
            }
        }
        inner.handles.clear();
        inner.detached = true;
    }
}

impl Drop for TracingSet {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Whether tracefs exposes `group:name` on this kernel.
pub fn tracepoint_exists(tracefs_root: &Path, group: &str, name: &str) -> bool {
    tracefs_root
        .join("events")
        .join(group)
        .join(name)
        .join("enable")
        .exists()
}

/// Result of attaching a tracepoint group.
pub struct TracepointGroup {
    pub set: TracingSet,
    /// At least one tracepoint of the group was missing or failed to attach.
    pub degraded: bool,
}

/// Attach each `(program, event)` of `subsystem`. Missing or failing
/// tracepoints are skipped and flag the group as degraded.
pub fn attach_tracepoint_group(
    attacher: &mut dyn Attach,
    tracefs_root: &Path,
    subsystem: &str,
    progs: &[(&str, &str)],
) -> TracepointGroup {
    tracing::info!("Attaching {subsystem} tracepoints");
    let set = TracingSet::new();
    let mut degraded = false;
    for (program, event) in progs {
        if !tracepoint_exists(tracefs_root, subsystem, event) {
            tracing::warn!("Tracepoint {subsystem}/{event} does not exist, skipping");
            degraded = true;
            continue;
        }
        match attacher.attach_tracepoint(program, subsystem, event) {
            Ok(link) => set.add(format!("{subsystem}:{event}"), link),
            Err(e) => {
                tracing::warn!("{e:#}");
                degraded = true;
            }
        }
    }
    TracepointGroup { set, degraded }
}

/// Attach every plan, logging and skipping the ones that fail.
pub fn attach_kprobes(attacher: &mut dyn Attach, plans: &[KprobePlan]) -> TracingSet {
    let set = TracingSet::new();
    let mut failed = 0;
    for plan in plans {
        match attacher.attach_kprobe(&plan.program, &plan.function) {
            Ok(link) => set.add(plan.function.clone(), link),
            Err(e) => {
                tracing::warn!("{e:#}");
                failed += 1;
            }
        }
    }
    tracing::info!("Attached {} kprobes, {failed} failed", set.len());
    set
}
