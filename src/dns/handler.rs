use crate::config::{Config, ResolverConfig};
use crate::dns::cache::{Record, RecordCache};
use crate::dns::resolver::{Resolver, Transport};
use crate::dns::{query_family, strip_fqdn, Family};
use crate::hosts::Hosts;
use crate::stats::Stats;
use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record as DnsRecord};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

/// The decision machine for one DNS message: cache, then hosts, then the
/// upstream race, with sinkhole replies for blocked domains. Runs
/// identically for UDP and TCP.
pub struct DnsHandler {
    config: ResolverConfig,
    resolver: Resolver,
    cache: Arc<RecordCache>,
    hosts: Option<Arc<Hosts>>,
    stats: Arc<Stats>,
}

impl DnsHandler {
    pub fn new(config: &Config, cache: Arc<RecordCache>, stats: Arc<Stats>) -> Self {
        let resolver = Resolver::new(&config.resolver);
        let hosts = config.hosts.enable.then(|| {
            let hosts = Hosts::new(&config.hosts);
            hosts.spawn_refresh_ticker(Duration::from_secs(config.hosts.refresh_interval));
            hosts
        });

        Self {
            config: config.resolver.clone(),
            resolver,
            cache,
            hosts,
            stats,
        }
    }

    async fn process<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        self.stats.add_query();

        // LowerName renders lowercased, so the key only needs the root dot
        // stripped.
        let qname = request.query().name().to_string();
        let key = strip_fqdn(&qname).to_string();
        let family = query_family(request.query().query_type(), request.query().query_class());
        let transport = match request.protocol() {
            Protocol::Udp => Transport::Udp,
            _ => Transport::Tcp,
        };

        if self.stats.active() {
            if let Some(family) = family {
                match self.cache.get(&key) {
                    Ok(record) if !record.is_blocked() => {
                        tracing::debug!(qname = %key, "cache hit");
                        // clone before overwriting the id: the cached
                        // message is shared with concurrent readers
                        let reply = record.msg().clone();
                        return self.write_reply(request, &reply, &mut response_handle).await;
                    }
                    Ok(_) => {
                        tracing::info!(qname = %key, "found in blocklist");
                        let reply = self.sinkhole_reply(request, family);
                        let info = self.write_reply(request, &reply, &mut response_handle).await;
                        self.stats.add_query_blocked();
                        return info;
                    }
                    Err(e) => tracing::debug!(qname = %key, reason = %e, "cache miss"),
                }

                if let Some(hosts) = &self.hosts {
                    if let Some(ips) = hosts.get(&key, family) {
                        tracing::debug!(qname = %key, "found in hosts file");
                        let reply = self.answer_reply(request, family, &ips);
                        let info = self.write_reply(request, &reply, &mut response_handle).await;

                        let ttl = Duration::from_secs(u64::from(self.config.ttl));
                        if let Err(e) = self.cache.set(&key, Record::custom(reply, ttl)) {
                            tracing::warn!(qname = %key, error = %e, "failed to cache hosts answer");
                        }
                        self.stats.add_custom_domain();
                        return info;
                    }
                    tracing::debug!(qname = %key, "not in hosts file");
                }
            }
        }

        let outbound = upstream_query(request);
        let mut reply = match self.resolver.resolve(transport, &outbound).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(qname = %key, error = %e, "upstream resolution failed");
                let failure = response_shell(request, ResponseCode::ServFail);
                return self.write_reply(request, &failure, &mut response_handle).await;
            }
        };

        if reply.header().truncated() && transport == Transport::Udp {
            tracing::debug!(qname = %key, "truncated udp reply, retrying over tcp");
            reply = match self.resolver.resolve(Transport::Tcp, &outbound).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(qname = %key, error = %e, "tcp retry failed");
                    let failure = response_shell(request, ResponseCode::ServFail);
                    return self.write_reply(request, &failure, &mut response_handle).await;
                }
            };
        }

        let info = self.write_reply(request, &reply, &mut response_handle).await;

        if family.is_some() && !reply.answers().is_empty() {
            let ttl = self.cache_ttl(&reply);
            match self.cache.set(&key, Record::resolved(reply, ttl)) {
                Ok(()) => {
                    tracing::debug!(qname = %key, ttl = ttl.as_secs(), "cached upstream answer");
                    self.stats.add_normal_domain();
                }
                Err(e) => tracing::error!(qname = %key, error = %e, "failed to cache upstream answer"),
            }
        }
        info
    }

    /// Caching TTL: the smallest positive answer TTL, capped by the
    /// configured default.
    fn cache_ttl(&self, reply: &Message) -> Duration {
        let mut ttl = Duration::from_secs(u64::from(self.config.ttl));
        for answer in reply.answers() {
            let candidate = Duration::from_secs(u64::from(answer.ttl()));
            if !candidate.is_zero() && candidate < ttl {
                ttl = candidate;
            }
        }
        ttl
    }

    fn sinkhole_reply(&self, request: &Request, family: Family) -> Message {
        if self.config.nxdomain_on_block {
            return response_shell(request, ResponseCode::NXDomain);
        }
        let sinkhole = match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        self.answer_reply(request, family, &[sinkhole])
    }

    /// A NoError reply carrying one A or AAAA record per address.
    fn answer_reply(&self, request: &Request, family: Family, ips: &[IpAddr]) -> Message {
        let name = request.query().original().name().clone();
        let ttl = self.config.ttl;

        let mut reply = response_shell(request, ResponseCode::NoError);
        for ip in ips {
            let rdata = match (family, ip) {
                (Family::V4, IpAddr::V4(v4)) => RData::A(A(*v4)),
                (Family::V6, IpAddr::V6(v6)) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            reply.add_answer(DnsRecord::from_rdata(name.clone(), ttl, rdata));
        }
        reply
    }

    /// Single exit point for every reply. A failed write is logged and the
    /// connection abandoned; it never propagates into the listener.
    async fn write_reply<R: ResponseHandler>(
        &self,
        request: &Request,
        reply: &Message,
        response_handle: &mut R,
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = *reply.header();
        header.set_id(request.id());

        let response = builder.build(
            header,
            reply.answers().iter(),
            reply.name_servers().iter(),
            std::iter::empty(),
            reply.additionals().iter(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(error = %e, "failed to write reply");
                serve_failed()
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        if request.op_code() != OpCode::Query {
            let builder = MessageResponseBuilder::from_message_request(request);
            let response = builder.error_msg(request.header(), ResponseCode::NotImp);
            return match response_handle.send_response(response).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::error!(error = %e, "failed to write reply");
                    serve_failed()
                }
            };
        }

        self.process(request, response_handle).await
    }
}

/// Response header and question copied from the request, no answers.
fn response_shell(request: &Request, rcode: ResponseCode) -> Message {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(rcode);
    header.set_recursion_available(true);
    header.set_authoritative(false);

    let mut msg = Message::new();
    msg.set_header(header);
    msg.add_query(request.query().original().clone());
    msg
}

/// The logical question re-encoded for upstream transmission.
fn upstream_query(request: &Request) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(request.op_code());
    msg.set_recursion_desired(request.recursion_desired());
    msg.add_query(request.query().original().clone());
    msg
}

fn serve_failed() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn handler_with_ttl(ttl: u32) -> DnsHandler {
        let mut config = Config::default();
        config.resolver.ttl = ttl;
        config.hosts.enable = false;
        DnsHandler::new(&config, Arc::new(RecordCache::new()), Stats::new())
    }

    fn reply_with_ttls(ttls: &[u32]) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        let name = Name::from_str("example.com.").unwrap();
        for ttl in ttls {
            msg.add_answer(DnsRecord::from_rdata(
                name.clone(),
                *ttl,
                RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
            ));
        }
        msg
    }

    #[tokio::test]
    async fn test_cache_ttl_uses_minimum_positive_answer_ttl() {
        let handler = handler_with_ttl(600);
        let reply = reply_with_ttls(&[300, 60, 9999]);
        assert_eq!(handler.cache_ttl(&reply), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_cache_ttl_capped_by_config() {
        let handler = handler_with_ttl(600);
        let reply = reply_with_ttls(&[86400, 86400]);
        assert_eq!(handler.cache_ttl(&reply), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_cache_ttl_ignores_zero_ttls() {
        let handler = handler_with_ttl(600);
        let reply = reply_with_ttls(&[0, 0]);
        assert_eq!(handler.cache_ttl(&reply), Duration::from_secs(600));
    }

    #[test]
    fn test_query_family_classification() {
        use hickory_proto::rr::DNSClass;
        assert_eq!(query_family(RecordType::A, DNSClass::IN), Some(Family::V4));
        assert_eq!(
            query_family(RecordType::AAAA, DNSClass::IN),
            Some(Family::V6)
        );
        assert_eq!(query_family(RecordType::TXT, DNSClass::IN), None);
    }
}
