use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use nfstrace::{Config, Shutdown};

/// Trace NFS and SUNRPC activity and correlate it with files and pods.
#[derive(Debug, Parser)]
#[command(name = "nfstrace", version)]
struct Command {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// JSON config file; flags given on the command line override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Compiled BPF object to load
    #[arg(short, long)]
    bpf_object: Option<PathBuf>,
    /// Regex kernel function names must fully match
    #[arg(long)]
    filter_func: Option<String>,
    /// Struct a probed function must take a pointer to
    #[arg(long)]
    filter_struct: Option<String>,
    /// Kernel BTF file
    #[arg(long)]
    kernel_btf: Option<PathBuf>,
    /// Search the BTF of every loaded kernel module
    #[arg(long)]
    all_kmods: bool,
    /// Kernel modules to search
    #[arg(long, value_delimiter = ',')]
    kmods: Vec<String>,
    /// Extra functions to probe, as name:position[,name:position]
    #[arg(long)]
    add_funcs: Option<String>,
    /// Select functions and exit without attaching
    #[arg(long)]
    skip_attach: bool,
    /// Trace DNS queries
    #[arg(long)]
    enable_dns: bool,
    /// Collect per-file NFS I/O metrics
    #[arg(long)]
    enable_nfs_metrics: bool,
    /// Turn on debug output of the BPF programs
    #[arg(long)]
    enable_debug: bool,
    /// Where to write facts: stdout or a file path
    #[arg(short, long)]
    output: Option<String>,
    /// Node label for metrics
    #[arg(long)]
    node_name: Option<String>,
    /// Prometheus textfile to rewrite with current metrics
    #[arg(long)]
    metrics_textfile: Option<PathBuf>,
    /// JSON-lines file or FIFO with pod notifications
    #[arg(long)]
    pod_events: Option<PathBuf>,
}

impl Command {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.verbosity = config.verbosity.max(self.verbose);
        if let Some(v) = self.bpf_object {
            config.bpf_object = Some(v);
        }
        if let Some(v) = self.filter_func {
            config.filter_func = v;
        }
        if let Some(v) = self.filter_struct {
            config.filter_struct = v;
        }
        if let Some(v) = self.kernel_btf {
            config.kernel_btf = Some(v);
        }
        if !self.kmods.is_empty() {
            config.kmods = self.kmods;
        }
        if let Some(v) = self.add_funcs {
            config.add_funcs = v;
        }
        if let Some(v) = self.output {
            config.output = v;
        }
        if let Some(v) = self.node_name {
            config.node_name = Some(v);
        }
        if let Some(v) = self.metrics_textfile {
            config.metrics_textfile = Some(v);
        }
        if let Some(v) = self.pod_events {
            config.pod_events = Some(v);
        }
        config.all_kmods |= self.all_kmods;
        config.skip_attach |= self.skip_attach;
        config.enable_dns |= self.enable_dns;
        config.enable_nfs_metrics |= self.enable_nfs_metrics;
        config.enable_debug |= self.enable_debug;
        Ok(config)
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let config = Command::parse().into_config()?;
    init_logging(config.verbosity);

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Stopping...");
            shutdown.cancel();
        })
        .context("Failed to install signal handler")?;
    }

    nfstrace::run(&config, shutdown)
}
