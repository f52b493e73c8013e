//! nfstrace library - NFS/RPC tracing with file and pod correlation.
//!
//! Kernel-side programs attached by [`probes`] emit RPC task events, path
//! segments, DNS queries and per-file I/O counters. The [`pipeline`]
//! consumers decode those records, rebuild file paths and join everything
//! against the [`cache`] layer, which [`lifecycle`] keeps in sync with the
//! containers running on the node. Results leave through a [`sink::Sink`].
//!
//! # Modules
//!
//! - [`kallsyms`] - Kernel symbol table and nearest-symbol lookup
//! - [`btf_funcs`] - BTF-driven selection of functions to probe
//! - [`probes`] - Attach/detach lifecycle of kprobes and tracepoints
//! - [`events`] - Fixed-layout kernel records
//! - [`pipeline`] - One consumer per kernel buffer
//! - [`nfstrace_core`] - Startup orchestration, see [`run`]
//!
//! # Example
//!
//! ```no_run
//! use nfstrace::{Config, Shutdown};
//! use std::path::PathBuf;
//!
//! let config = Config {
//!     bpf_object: Some(PathBuf::from("nfstrace.bpf.o")),
//!     enable_nfs_metrics: true,
//!     ..Default::default()
//! };
//! nfstrace::run(&config, Shutdown::new()).expect("tracing failed");
//! ```

pub mod btf_funcs;
pub mod cache;
pub mod config;
pub mod cri;
pub mod events;
pub mod kallsyms;
pub mod lifecycle;
pub mod mountinfo;
pub mod nfstrace_core;
pub mod pidmap;
pub mod pipeline;
pub mod probes;
pub mod shutdown;
pub mod sink;
pub mod task;

pub use cache::{Caches, FileIdentity};
pub use config::Config;
pub use nfstrace_core::run;
pub use shutdown::Shutdown;
