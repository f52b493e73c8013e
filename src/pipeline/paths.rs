//! Reassembly of file paths from kernel path segments.
//!
//! The kernel walks a file's dentry chain towards the mount root and emits
//! one segment per component, tagging the last one (the root, or the walk's
//! depth limit) as complete. Segments for a key are buffered until the
//! completing one arrives, then sorted from the completing end and joined.
//!
//! A walk whose completing segment never arrives would otherwise hold its
//! buffer forever, so both the number of in-flight keys and the number of
//! segments per key are bounded. Past the key bound the oldest in-flight key
//! is evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::PathCache;
use crate::events::{decode, DecodeError, PathSegmentEvent};
use crate::pipeline::source::{consume, RecordSource};
use crate::shutdown::Shutdown;

pub const DEFAULT_MAX_INFLIGHT: usize = 4096;
pub const MAX_SEGMENTS_PER_KEY: usize = 32;

/// How often the consumer logs in-flight and evicted walks.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub key: u64,
    pub depth: u8,
    pub name: String,
    pub is_complete: bool,
}

impl From<&PathSegmentEvent> for PathSegment {
    fn from(event: &PathSegmentEvent) -> Self {
        PathSegment {
            key: event.file_key(),
            depth: event.depth,
            name: event.name(),
            is_complete: event.is_complete != 0,
        }
    }
}

/// Join segments into an absolute path. The last segment is the completing
/// one and ends up first.
pub fn rebuild_path(mut segments: Vec<PathSegment>) -> String {
    let Some(last) = segments.last() else {
        return "/".to_string();
    };
    let root_depth = last.depth;
    let root_is_deepest = segments.iter().all(|s| s.depth <= root_depth);
    if root_is_deepest {
        segments.sort_by(|a, b| b.depth.cmp(&a.depth));
    } else {
        segments.sort_by(|a, b| a.depth.cmp(&b.depth));
    }

    let mut path = String::new();
    for seg in &segments {
        if seg.name != "/" {
            path.push('/');
        }
        path.push_str(&seg.name);
    }
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    path
}

#[derive(Debug)]
pub struct PathAssembler {
    partial: HashMap<u64, Vec<PathSegment>>,
    order: VecDeque<u64>,
    max_inflight: usize,
    evicted: u64,
}

impl PathAssembler {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            partial: HashMap::new(),
            order: VecDeque::new(),
            max_inflight: max_inflight.max(1),
            evicted: 0,
        }
    }

    /// Keys with a walk in progress.
    pub fn inflight(&self) -> usize {
        self.partial.len()
    }

    /// Walks dropped because a bound was hit.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn evict_oldest(&mut self) {
        while let Some(key) = self.order.pop_front() {
            if self.partial.remove(&key).is_some() {
                self.evicted += 1;
                tracing::debug!("Evicted incomplete path walk {key:#x}");
                return;
            }
        }
    }

    /// Add a segment. Returns the rebuilt path when it completes a walk.
    pub fn push(&mut self, segment: PathSegment) -> Option<(u64, String)> {
        let key = segment.key;
        if segment.is_complete {
            let mut segments = self.partial.remove(&key).unwrap_or_default();
            segments.push(segment);
            return Some((key, rebuild_path(segments)));
        }

        if !self.partial.contains_key(&key) {
            if self.partial.len() >= self.max_inflight {
                self.evict_oldest();
            }
            self.order.push_back(key);
            // Keys completed earlier leave stale entries behind.
            if self.order.len() > self.max_inflight * 2 {
                let partial = &self.partial;
                self.order.retain(|k| partial.contains_key(k) || *k == key);
            }
        }

        let segments = self.partial.entry(key).or_default();
        segments.push(segment);
        if segments.len() > MAX_SEGMENTS_PER_KEY {
            self.partial.remove(&key);
            self.evicted += 1;
            tracing::warn!("Path walk {key:#x} exceeded {MAX_SEGMENTS_PER_KEY} segments, dropping");
        }
        None
    }
}

/// Feeds path segment records through a [`PathAssembler`] into the path cache.
pub struct PathConsumer {
    assembler: PathAssembler,
    paths: Arc<PathCache>,
    last_report: Instant,
    reported_evictions: u64,
}

impl PathConsumer {
    pub fn new(paths: Arc<PathCache>, max_inflight: usize) -> Self {
        Self {
            assembler: PathAssembler::new(max_inflight),
            paths,
            last_report: Instant::now(),
            reported_evictions: 0,
        }
    }

    /// Log the assembler state at most once per [`REPORT_INTERVAL`].
    fn report(&mut self) {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        let evicted = self.assembler.evicted();
        tracing::debug!(
            "{} path walks in flight, {evicted} evicted",
            self.assembler.inflight()
        );
        if evicted > self.reported_evictions {
            tracing::warn!(
                "Evicted {} incomplete path walks since the last report",
                evicted - self.reported_evictions
            );
            self.reported_evictions = evicted;
        }
    }

    pub fn handle(&mut self, data: &[u8]) {
        let event: PathSegmentEvent = match decode(data) {
            Ok(event) => event,
            Err(DecodeError::Empty) => return,
            Err(e) => {
                tracing::warn!("Dropping path segment: {e}");
                return;
            }
        };
        if let Some((key, path)) = self.assembler.push(PathSegment::from(&event)) {
            tracing::debug!("Rebuilt path {key:#x} -> {path}");
            self.paths.insert(key, path);
        }
        self.report();
    }

    pub fn run(&mut self, source: &mut dyn RecordSource, shutdown: &Shutdown) {
        consume("path", source, shutdown, &mut |data: &[u8]| self.handle(data));
    }
}
