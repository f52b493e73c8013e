use std::sync::Arc;

use crate::cache::PidIdentityCache;
use crate::events::{cstr_field, decode, DecodeError, DnsEvent};
use crate::pipeline::source::{consume, RecordSource};
use crate::shutdown::Shutdown;
use crate::sink::{Fact, Sink};

/// Decode a domain in DNS wire format (length-prefixed labels).
///
/// Parsing stops at a zero-length label or when a label runs past the end of
/// the buffer; whatever was read up to that point is returned.
pub fn parse_domain(query: &[u8]) -> String {
    let mut domain = String::new();
    let mut rest = query;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || tail.len() < len {
            break;
        }
        domain.push_str(&String::from_utf8_lossy(&tail[..len]));
        domain.push('.');
        rest = &tail[len..];
    }
    if domain.ends_with('.') {
        domain.pop();
    }
    domain
}

/// Turns DNS query records into [`Fact::Dns`].
pub struct DnsConsumer {
    pid_identity: Arc<PidIdentityCache>,
    sink: Arc<dyn Sink>,
}

impl DnsConsumer {
    pub fn new(pid_identity: Arc<PidIdentityCache>, sink: Arc<dyn Sink>) -> Self {
        Self { pid_identity, sink }
    }

    pub fn handle(&self, data: &[u8]) -> Option<Fact> {
        let event: DnsEvent = match decode(data) {
            Ok(event) => event,
            Err(DecodeError::Empty) => return None,
            Err(e) => {
                tracing::warn!("Dropping dns event: {e}");
                return None;
            }
        };

        let domain = parse_domain(&event.domain);
        if domain.is_empty() {
            tracing::trace!("Empty domain from pid {}", event.pid);
            return None;
        }

        let identity = self.pid_identity.get(&u64::from(event.pid));
        let fact = Fact::Dns {
            pid: event.pid,
            comm: cstr_field(&event.comm),
            domain,
            pod: identity.as_ref().map(|i| i.pod.clone()),
            container: identity.map(|i| i.container),
        };
        self.sink.publish(&fact);
        Some(fact)
    }

    pub fn run(&self, source: &mut dyn RecordSource, shutdown: &Shutdown) {
        consume("dns", source, shutdown, &mut |data: &[u8]| {
            self.handle(data);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PodIdentity;
    use crate::events::{as_bytes, fill_cstr};
    use crate::pipeline::source::MemorySource;
    use crate::sink::MemorySink;

    fn dns_event(pid: u32, comm: &str, wire: &[u8]) -> Vec<u8> {
        let mut event = DnsEvent {
            pid,
            len: wire.len() as u32,
            ..Default::default()
        };
        fill_cstr(&mut event.comm, comm);
        event.domain[..wire.len()].copy_from_slice(wire);
        as_bytes(&event).to_vec()
    }

    #[test]
    fn test_parse_domain() {
        assert_eq!(parse_domain(b"\x07example\x03com\x00"), "example.com");
        assert_eq!(parse_domain(b"\x03www\x06google\x03com\x00\x00\x01"), "www.google.com");
        assert_eq!(parse_domain(b""), "");
        assert_eq!(parse_domain(b"\x00\x03com"), "");
    }

    #[test]
    fn test_parse_domain_truncated_label() {
        assert_eq!(parse_domain(b"\x07example\x09com"), "example");
        assert_eq!(parse_domain(b"\x05ab"), "");
    }

    #[test]
    fn test_annotates_known_pid() {
        let identities = Arc::new(PidIdentityCache::new());
        identities.insert(
            42,
            PodIdentity {
                pod: "web-0".into(),
                container: "app".into(),
            },
        );
        let sink = Arc::new(MemorySink::new());
        let consumer = DnsConsumer::new(identities, sink.clone());

        let fact = consumer
            .handle(&dns_event(42, "curl", b"\x07example\x03com\x00"))
            .unwrap();
        assert_eq!(
            fact,
            Fact::Dns {
                pid: 42,
                comm: "curl".into(),
                domain: "example.com".into(),
                pod: Some("web-0".into()),
                container: Some("app".into()),
            }
        );
        assert_eq!(sink.facts().len(), 1);
    }

    #[test]
    fn test_unknown_pid_and_empty_domain() {
        let sink = Arc::new(MemorySink::new());
        let consumer = DnsConsumer::new(Arc::new(PidIdentityCache::new()), sink.clone());

        match consumer.handle(&dns_event(7, "dig", b"\x01a\x00")) {
            Some(Fact::Dns { pod, domain, .. }) => {
                assert_eq!(domain, "a");
                assert!(pod.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(consumer.handle(&dns_event(7, "dig", b"\x00")).is_none());
        assert_eq!(sink.facts().len(), 1);
    }

    #[test]
    fn test_run_drains_source() {
        let sink = Arc::new(MemorySink::new());
        let consumer = DnsConsumer::new(Arc::new(PidIdentityCache::new()), sink.clone());
        let shutdown = Shutdown::new();
        let mut source = MemorySource::records(
            vec![
                dns_event(1, "a", b"\x01x\x00"),
                vec![0u8; 3],
                dns_event(2, "b", b"\x01y\x00"),
            ],
            shutdown.clone(),
        );
        consumer.run(&mut source, &shutdown);
        assert_eq!(sink.facts().len(), 2);
    }
}
