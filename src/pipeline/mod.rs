//! Event pipeline: one consumer per kernel-shared buffer.
//!
//! Every consumer reads from a [`source::RecordSource`] (or, for I/O
//! metrics, scans a [`metrics::MetricsTable`]) and writes into the shared
//! [`Caches`](crate::cache::Caches). Bad records are dropped and logged;
//! only cancellation ends a consumer.

pub mod dns;
pub mod metrics;
pub mod paths;
pub mod source;
pub mod task_events;

pub use dns::DnsConsumer;
pub use metrics::{MetricsConsumer, MetricsTable};
pub use paths::PathConsumer;
pub use source::{MemorySource, PerfSource, RecordSource};
pub use task_events::TaskEventConsumer;
