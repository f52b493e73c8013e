//! Fixed-layout records shared with the kernel-side programs.
//!
//! Every struct here mirrors a C struct emitted by (or stored for) the BPF
//! collection, so field order and sizes must not change. Records arrive as
//! raw byte slices from perf buffers or map lookups and are copied into the
//! Rust type with [`decode`].

use std::fmt;

use plain::Plain;
use thiserror::Error;

/// Capacity of the pod and container name fields.
pub const IDENT_LEN: usize = 100;
/// Capacity of a single path component in a [`PathSegmentEvent`].
pub const SEGMENT_NAME_LEN: usize = 100;
/// Capacity of the process name in a [`DnsEvent`].
pub const COMM_LEN: usize = 100;
/// Capacity of the raw query name in a [`DnsEvent`].
pub const DOMAIN_LEN: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The reader handed back a record with no payload.
    #[error("empty record")]
    Empty,
    #[error("record too short: got {got} bytes, need {need}")]
    Short { got: usize, need: usize },
}

/// Composite key joining path, identity and metrics facts for one file.
pub fn file_key(dev_id: u64, file_id: u64) -> u64 {
    (dev_id << 32) | (file_id & 0xFFFF_FFFF)
}

/// Copy a raw record into `T`.
///
/// Buffers longer than `T` are accepted and the tail ignored, since perf
/// samples are padded to 8 bytes. Shorter buffers are an error.
pub fn decode<T: Plain + Default>(data: &[u8]) -> Result<T, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut record = T::default();
    plain::copy_from_bytes(&mut record, data).map_err(|_| DecodeError::Short {
        got: data.len(),
        need: std::mem::size_of::<T>(),
    })?;
    Ok(record)
}

/// View a fixed-size record as raw bytes, for writing into kernel maps.
pub fn as_bytes<T: Plain>(record: &T) -> &[u8] {
    unsafe { plain::as_bytes(record) }
}

/// Read a NUL-terminated string out of a fixed-size buffer.
///
/// Everything after the first NUL is ignored, invalid UTF-8 is replaced and
/// surrounding whitespace is trimmed.
pub fn cstr_field(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

/// Write `value` into a fixed-size buffer, truncating so that a terminating
/// NUL always fits.
pub fn fill_cstr(buf: &mut [u8], value: &str) {
    buf.fill(0);
    let len = value.len().min(buf.len().saturating_sub(1));
    buf[..len].copy_from_slice(&value.as_bytes()[..len]);
}

/// One RPC task observed touching an NFS file (`nfs_trace_map`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaskEvent {
    pub pid: i32,
    pub mount_id: i32,
    pub pod: [u8; IDENT_LEN],
    pub container: [u8; IDENT_LEN],
    pub caller_addr: u64,
    pub dev_id: u32,
    pub file_id: u32,
    pub key: u64,
}

impl Default for TaskEvent {
    fn default() -> Self {
        TaskEvent {
            pid: 0,
            mount_id: 0,
            pod: [0; IDENT_LEN],
            container: [0; IDENT_LEN],
            caller_addr: 0,
            dev_id: 0,
            file_id: 0,
            key: 0,
        }
    }
}

unsafe impl Plain for TaskEvent {}

impl TaskEvent {
    pub fn pod(&self) -> String {
        cstr_field(&self.pod)
    }

    pub fn container(&self) -> String {
        cstr_field(&self.container)
    }

    /// The join key, falling back to the device and file ids when the kernel
    /// left the precomputed key empty.
    pub fn file_key(&self) -> u64 {
        if self.key != 0 {
            self.key
        } else {
            file_key(self.dev_id as u64, self.file_id as u64)
        }
    }
}

impl fmt::Debug for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEvent")
            .field("pid", &self.pid)
            .field("mount_id", &self.mount_id)
            .field("pod", &self.pod())
            .field("container", &self.container())
            .field("caller_addr", &format_args!("{:#x}", self.caller_addr))
            .field("key", &format_args!("{:#x}", self.file_key()))
            .finish()
    }
}

/// One dentry name emitted while the kernel walks a file's path towards the
/// mount root (`path_ringbuf`). Depth 0 is the file itself.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PathSegmentEvent {
    pub file_id: u64,
    pub dev_id: u64,
    pub len: u32,
    pub is_complete: u8,
    pub depth: u8,
    pub name: [u8; SEGMENT_NAME_LEN],
}

impl Default for PathSegmentEvent {
    fn default() -> Self {
        PathSegmentEvent {
            file_id: 0,
            dev_id: 0,
            len: 0,
            is_complete: 0,
            depth: 0,
            name: [0; SEGMENT_NAME_LEN],
        }
    }
}

unsafe impl Plain for PathSegmentEvent {}

impl PathSegmentEvent {
    pub fn file_key(&self) -> u64 {
        file_key(self.dev_id, self.file_id)
    }

    pub fn name(&self) -> String {
        cstr_field(&self.name)
    }
}

impl fmt::Debug for PathSegmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathSegmentEvent")
            .field("key", &format_args!("{:#x}", self.file_key()))
            .field("depth", &self.depth)
            .field("is_complete", &(self.is_complete != 0))
            .field("name", &self.name())
            .finish()
    }
}

/// A DNS query sent over UDP (`dns_events`). `domain` holds the raw
/// length-prefixed label encoding from the wire.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DnsEvent {
    pub pid: u32,
    pub len: u32,
    pub comm: [u8; COMM_LEN],
    pub domain: [u8; DOMAIN_LEN],
}

impl Default for DnsEvent {
    fn default() -> Self {
        DnsEvent {
            pid: 0,
            len: 0,
            comm: [0; COMM_LEN],
            domain: [0; DOMAIN_LEN],
        }
    }
}

unsafe impl Plain for DnsEvent {}

impl fmt::Debug for DnsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsEvent")
            .field("pid", &self.pid)
            .field("len", &self.len)
            .field("comm", &cstr_field(&self.comm))
            .finish()
    }
}

/// Running per-file counters kept by the kernel in `io_metrics`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawMetrics {
    pub read_count: u64,
    pub read_size: u64,
    pub read_lat: u64,
    pub write_count: u64,
    pub write_size: u64,
    pub write_lat: u64,
    pub pod: [u8; IDENT_LEN],
    pub container: [u8; IDENT_LEN],
}

impl Default for RawMetrics {
    fn default() -> Self {
        RawMetrics {
            read_count: 0,
            read_size: 0,
            read_lat: 0,
            write_count: 0,
            write_size: 0,
            write_lat: 0,
            pod: [0; IDENT_LEN],
            container: [0; IDENT_LEN],
        }
    }
}

unsafe impl Plain for RawMetrics {}

impl fmt::Debug for RawMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMetrics")
            .field("read_count", &self.read_count)
            .field("write_count", &self.write_count)
            .field("pod", &cstr_field(&self.pod))
            .field("container", &cstr_field(&self.container))
            .finish()
    }
}

/// Value stored in `pid_cgroup_map` so the kernel side can stamp pod and
/// container identity on the events it emits.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PidMetadata {
    pub pod: [u8; IDENT_LEN],
    pub container: [u8; IDENT_LEN],
    pub pid: u64,
}

impl Default for PidMetadata {
    fn default() -> Self {
        PidMetadata {
            pod: [0; IDENT_LEN],
            container: [0; IDENT_LEN],
            pid: 0,
        }
    }
}

unsafe impl Plain for PidMetadata {}

impl PidMetadata {
    pub fn new(pod: &str, container: &str, pid: u64) -> Self {
        let mut meta = PidMetadata {
            pid,
            ..Default::default()
        };
        fill_cstr(&mut meta.pod, pod);
        fill_cstr(&mut meta.container, container);
        meta
    }

    pub fn pod(&self) -> String {
        cstr_field(&self.pod)
    }

    pub fn container(&self) -> String {
        cstr_field(&self.container)
    }
}

impl fmt::Debug for PidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidMetadata")
            .field("pod", &self.pod())
            .field("container", &self.container())
            .field("pid", &self.pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<TaskEvent>(), 232);
        assert_eq!(size_of::<PathSegmentEvent>(), 128);
        assert_eq!(size_of::<DnsEvent>(), 308);
        assert_eq!(size_of::<RawMetrics>(), 248);
        assert_eq!(size_of::<PidMetadata>(), 208);
    }

    #[test]
    fn test_decode_task_event_offsets() {
        let mut raw = vec![0u8; 232];
        raw[0..4].copy_from_slice(&100i32.to_le_bytes());
        raw[4..8].copy_from_slice(&22i32.to_le_bytes());
        raw[8..11].copy_from_slice(b"web");
        raw[108..111].copy_from_slice(b"abc");
        raw[208..216].copy_from_slice(&0xffff_ffff_8100_0000u64.to_le_bytes());
        raw[216..220].copy_from_slice(&7u32.to_le_bytes());
        raw[220..224].copy_from_slice(&9u32.to_le_bytes());
        raw[224..232].copy_from_slice(&1u64.to_le_bytes());

        let event: TaskEvent = decode(&raw).unwrap();
        assert_eq!(event.pid, 100);
        assert_eq!(event.mount_id, 22);
        assert_eq!(event.pod(), "web");
        assert_eq!(event.container(), "abc");
        assert_eq!(event.caller_addr, 0xffff_ffff_8100_0000);
        assert_eq!(event.dev_id, 7);
        assert_eq!(event.file_id, 9);
        assert_eq!(event.file_key(), 1);
    }

    #[test]
    fn test_task_event_key_fallback() {
        let event = TaskEvent {
            dev_id: 2,
            file_id: 3,
            ..Default::default()
        };
        assert_eq!(event.file_key(), (2 << 32) | 3);
    }

    #[test]
    fn test_decode_path_segment_offsets() {
        let mut raw = vec![0u8; 128];
        raw[0..8].copy_from_slice(&5u64.to_le_bytes());
        raw[8..16].copy_from_slice(&1u64.to_le_bytes());
        raw[16..20].copy_from_slice(&3u32.to_le_bytes());
        raw[20] = 1;
        raw[21] = 4;
        raw[22..25].copy_from_slice(b"bar");

        let seg: PathSegmentEvent = decode(&raw).unwrap();
        assert_eq!(seg.file_key(), (1 << 32) | 5);
        assert_eq!(seg.len, 3);
        assert_eq!(seg.is_complete, 1);
        assert_eq!(seg.depth, 4);
        assert_eq!(seg.name(), "bar");
    }

    #[test]
    fn test_decode_accepts_padding_rejects_short() {
        let padded = vec![0u8; 240];
        assert!(decode::<TaskEvent>(&padded).is_ok());

        let short = vec![0u8; 100];
        assert_eq!(
            decode::<TaskEvent>(&short).unwrap_err(),
            DecodeError::Short {
                got: 100,
                need: 232
            }
        );
        assert_eq!(decode::<TaskEvent>(&[]).unwrap_err(), DecodeError::Empty);
    }

    #[test]
    fn test_cstr_field() {
        assert_eq!(cstr_field(b"pod-a\0garbage"), "pod-a");
        assert_eq!(cstr_field(b"  spaced \0"), "spaced");
        assert_eq!(cstr_field(b"no-terminator"), "no-terminator");
        assert_eq!(cstr_field(&[0xff, b'x', 0]), "\u{fffd}x");
        assert_eq!(cstr_field(&[0; 8]), "");
    }

    #[test]
    fn test_fill_cstr_truncates() {
        let mut buf = [0xaau8; 4];
        fill_cstr(&mut buf, "abcdef");
        assert_eq!(&buf, b"abc\0");

        fill_cstr(&mut buf, "x");
        assert_eq!(&buf, b"x\0\0\0");
    }

    #[test]
    fn test_pid_metadata_bytes() {
        let meta = PidMetadata::new("pod-a", "ctr-1", 4242);
        let bytes = as_bytes(&meta);
        assert_eq!(bytes.len(), 208);
        assert_eq!(&bytes[..5], b"pod-a");
        assert_eq!(&bytes[100..105], b"ctr-1");
        assert_eq!(&bytes[200..208], &4242u64.to_le_bytes());

        let back: PidMetadata = decode(bytes).unwrap();
        assert_eq!(back.pod(), "pod-a");
        assert_eq!(back.container(), "ctr-1");
        assert_eq!(back.pid, 4242);
    }
}
