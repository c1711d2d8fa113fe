pub mod cache;
pub mod handler;
pub mod resolver;
pub mod server;

pub use handler::DnsHandler;
pub use server::DnsServer;

use hickory_proto::rr::{DNSClass, RecordType};
use std::net::IpAddr;

/// Address family of an IP-type question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn matches(&self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
        )
    }
}

/// Only `A IN` and `AAAA IN` questions go through the filter pipeline;
/// everything else is forwarded upstream untouched.
pub fn query_family(qtype: RecordType, qclass: DNSClass) -> Option<Family> {
    if qclass != DNSClass::IN {
        return None;
    }
    match qtype {
        RecordType::A => Some(Family::V4),
        RecordType::AAAA => Some(Family::V6),
        _ => None,
    }
}

pub fn strip_fqdn(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
