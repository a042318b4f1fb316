//! The request pipeline.
//!
//! Every inbound message, whatever transport it arrived on, passes through
//! here exactly once: decode, identify (device ID, profile, client subnet),
//! rate-limit admission, request-phase filtering, cache lookup, upstream
//! resolution, response-phase filtering, and encoding. Errors short-circuit
//! into FORMERR/REFUSED/SERVFAIL responses with the reason recorded; DDR
//! queries are answered authoritatively from the server group's templates.
//!
//! The cache stores upstream responses unfiltered and both filtering phases
//! run per query against the snapshot the query loaded at entry, so one
//! customer's block rules can never leak into another customer's answers
//! through a shared cache entry.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use ipnetwork::IpNetwork;
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::SOA;
use trust_dns_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use uuid::Uuid;

use crate::cache::{CacheKey, Coalescer, MessageCache};
use crate::config::{CacheMode, SharedConfig};
use crate::deviceid::{extract_device_id, DeviceId};
use crate::dnsmsg::{self, ecs::EcsOption};
use crate::errcoll::ErrorCollector;
use crate::error::Error;
use crate::filter::{Action, FilterContext, FilterEngine, Rewrite};
use crate::geoip::GeoIp;
use crate::profile::{Device, Profile, ProfileDb};
use crate::querylog::{self, QueryLog};
use crate::ratelimit::{Admission, RateLimiter};
use crate::server::{ddr_name, ClientInfo, Protocol, ServerGroup};
use crate::upstream::Upstream;

/// An opaque 128-bit request identifier, unique per process run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.simple().fmt(f)
    }
}

/// Everything known about one query while it is in flight. Exclusive to
/// the handling task; never shared across queries.
pub struct RequestInfo {
    pub id: RequestId,
    pub remote_addr: std::net::SocketAddr,
    pub proto: Protocol,
    /// The question name, lowercased, fully qualified.
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub ecs: Option<EcsOption>,
    /// The client subnet: the ECS subnet when present, else the peer
    /// address masked by the configured key prefix lengths.
    pub client_subnet: IpNetwork,
    /// The device ID extracted from the TLS server name or DoH path.
    pub device_id: Option<DeviceId>,
    pub device: Option<Arc<Device>>,
    pub profile: Option<Arc<Profile>>,
    pub dnssec_ok: bool,
    pub udp_size: u16,
    pub start: Instant,
}

impl RequestInfo {
    /// The address rate limiting and filtering treat as the client: the
    /// ECS address when present, the connection peer otherwise.
    pub fn effective_ip(&self) -> IpAddr {
        match &self.ecs {
            Some(ecs) => ecs.subnet.ip(),
            None => self.remote_addr.ip(),
        }
    }

    /// The question host: lowercased, no trailing dot.
    pub fn host(&self) -> String {
        let name = self.qname.to_string();
        name.trim_end_matches('.').to_string()
    }
}

/// A finished response: the message and its canonical wire encoding.
/// Datagram transports re-encode with truncation when `wire` exceeds the
/// client's advertised size.
pub struct Response {
    pub msg: Message,
    pub wire: Vec<u8>,
}

/// What the transport should do with the query.
pub enum Outcome {
    Respond(Response),
    /// Say nothing: drop the datagram or close the stream.
    Drop,
}

/// The shared query-handling pipeline.
pub struct Pipeline {
    conf: SharedConfig,
    ratelimiter: Arc<RateLimiter>,
    cache: Arc<MessageCache>,
    coalescer: Coalescer,
    engine: Arc<FilterEngine>,
    upstream: Arc<Upstream>,
    profiles: Arc<dyn ProfileDb>,
    geoip: Arc<dyn GeoIp>,
    querylog: Arc<dyn QueryLog>,
    errcoll: Arc<dyn ErrorCollector>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conf: SharedConfig,
        ratelimiter: Arc<RateLimiter>,
        cache: Arc<MessageCache>,
        engine: Arc<FilterEngine>,
        upstream: Arc<Upstream>,
        profiles: Arc<dyn ProfileDb>,
        geoip: Arc<dyn GeoIp>,
        querylog: Arc<dyn QueryLog>,
        errcoll: Arc<dyn ErrorCollector>,
    ) -> Self {
        Self {
            conf,
            ratelimiter,
            cache,
            coalescer: Coalescer::default(),
            engine,
            upstream,
            profiles,
            geoip,
            querylog,
            errcoll,
        }
    }

    /// Handles one raw DNS message from `client`.
    pub async fn handle(
        &self,
        raw: &[u8],
        client: &ClientInfo,
        group: &ServerGroup,
        proto: Protocol,
    ) -> Outcome {
        let req = match dnsmsg::decode(raw) {
            Ok(req) => req,
            Err(err) => {
                // Not even the header parsed; there is nothing to answer.
                self.errcoll.collect(&err);
                return Outcome::Drop;
            }
        };

        if req.op_code() != OpCode::Query || req.message_type() != MessageType::Query {
            return self.respond(dnsmsg::response_with_code(&req, ResponseCode::NotImp), None);
        }

        let Some(query) = req.queries().first().cloned() else {
            return self.respond(dnsmsg::formerr(&req), None);
        };

        let device_id = match extract_device_id(
            proto,
            client.tls_server_name.as_deref(),
            client.url_path.as_deref(),
            &group.device_id_wildcards,
        ) {
            Ok(device_id) => device_id,
            Err(err) => {
                let err = Error::BadDeviceId(err);
                self.errcoll.collect(&err);
                return self.respond(dnsmsg::formerr(&req), None);
            }
        };

        let ecs = match dnsmsg::ecs::ecs_from_msg(&req) {
            Ok(ecs) => ecs,
            Err(err) => {
                self.errcoll.collect(&err);
                return self.respond(dnsmsg::formerr(&req), None);
            }
        };

        let info = self.build_request_info(&req, client, proto, &query, ecs, device_id);

        match self.ratelimiter.admit(info.effective_ip(), info.qtype) {
            Admission::Allow => {}
            Admission::RefuseAny => {
                return self.respond(dnsmsg::refused(&req), Some(&info));
            }
            Admission::Deny { jailed } => {
                let err = Error::RateLimited { jailed };
                self.errcoll.collect_for_request(info.id, &err);
                return Outcome::Drop;
            }
        }

        if info.qname == ddr_name() {
            return self.respond(self.ddr_response(&req, &info, group), Some(&info));
        }

        // Both filtering phases run against the snapshot loaded here.
        let snapshot = self.engine.snapshot();
        let custom = info
            .profile
            .as_deref()
            .and_then(|profile| self.engine.custom_rules_for(profile));
        let host = info.host();
        let ctx = FilterContext {
            host: &host,
            qtype: info.qtype,
            client: Some(info.effective_ip()),
            device: info.device.as_deref(),
            profile: info.profile.as_deref(),
            group: &group.filtering_group,
        };

        let request_action = snapshot.filter_request(&ctx, custom.as_deref());
        match &request_action {
            Action::Block { .. } => {
                let resp = self.block_response(&req, &info);
                return self.finish(resp, &info, &request_action, &Action::Pass);
            }
            Action::Rewrite { rewrite, .. } => {
                let resp = self.rewrite_response(&req, &info, rewrite);
                return self.finish(resp, &info, &request_action, &Action::Pass);
            }
            Action::Allow { .. } | Action::Pass => {}
        }

        let key = match (self.cache.mode(), &info.ecs) {
            (CacheMode::Ecs, Some(ecs)) => {
                CacheKey::with_subnet(&info.qname, info.qtype, info.qclass, ecs.subnet)
            }
            _ => CacheKey::simple(&info.qname, info.qtype, info.qclass),
        };

        let upstream = Arc::clone(&self.upstream);
        let upstream_req = req.clone();
        let resolved = self
            .coalescer
            .resolve(&self.cache, key, move || async move {
                upstream.resolve(&upstream_req).await
            })
            .await;

        let mut resp = match resolved {
            Ok((resp, _from_cache)) => resp,
            Err(err) => {
                self.errcoll.collect_for_request(info.id, &err);
                let resp = dnsmsg::servfail(&req);
                return self.finish(resp, &info, &request_action, &Action::Pass);
            }
        };

        // A cache hit was inserted under another query's id and question
        // case; restore this client's view.
        resp.set_id(req.id());
        resp.take_queries();
        resp.add_query(query);

        // An explicit exception skips the response phase too.
        let response_action = if matches!(request_action, Action::Allow { .. }) {
            Action::Pass
        } else {
            snapshot.filter_response(&resp, &ctx, custom.as_deref())
        };
        match &response_action {
            Action::Block { .. } => {
                let resp = self.block_response(&req, &info);
                return self.finish(resp, &info, &request_action, &response_action);
            }
            Action::Rewrite { rewrite, .. } => {
                let resp = self.rewrite_response(&req, &info, rewrite);
                return self.finish(resp, &info, &request_action, &response_action);
            }
            Action::Allow { .. } | Action::Pass => {}
        }

        self.finish(resp, &info, &request_action, &response_action)
    }

    fn build_request_info(
        &self,
        req: &Message,
        client: &ClientInfo,
        proto: Protocol,
        query: &trust_dns_proto::op::Query,
        ecs: Option<EcsOption>,
        device_id: Option<DeviceId>,
    ) -> RequestInfo {
        let looked_up = match &device_id {
            Some(id) => self.profiles.by_device_id(id),
            None => self.profiles.by_linked_ip(client.addr.ip()),
        };
        let (profile, device) = match looked_up {
            Some((profile, device)) => (Some(profile), Some(device)),
            None => (None, None),
        };

        let rl_conf = &self.conf.ratelimit;
        let client_subnet = match &ecs {
            Some(ecs) => ecs.subnet,
            None => dnsmsg::ecs::subnet_for_addr(
                client.addr.ip(),
                rl_conf.ipv4_subnet_key_len,
                rl_conf.ipv6_subnet_key_len,
            ),
        };

        RequestInfo {
            id: RequestId::new(),
            remote_addr: client.addr,
            proto,
            qname: query.name().to_lowercase(),
            qtype: query.query_type(),
            qclass: query.query_class(),
            ecs,
            client_subnet,
            device_id,
            device,
            profile,
            dnssec_ok: dnsmsg::is_do(req),
            udp_size: dnsmsg::client_udp_size(req),
            start: Instant::now(),
        }
    }

    /// Answers a `_dns.resolver.arpa` query from the group's DDR templates.
    fn ddr_response(&self, req: &Message, info: &RequestInfo, group: &ServerGroup) -> Message {
        if !group.ddr.enabled {
            return dnsmsg::nxdomain(req);
        }

        let mut resp = dnsmsg::response_from(req);
        if info.qtype != RecordType::SVCB {
            return resp;
        }

        let templates = if info.device.is_some() {
            &group.ddr.device_records
        } else {
            &group.ddr.public_records
        };
        for svcb in templates {
            resp.add_answer(Record::from_rdata(
                info.qname.clone(),
                group.ddr.record_ttl,
                RData::SVCB(svcb.clone()),
            ));
        }

        resp
    }

    /// The synthesized response for a blocked query: NOERROR with the
    /// configured block address for address queries, a minimal SOA
    /// otherwise, all bounded by `filters.response_ttl`.
    fn block_response(&self, req: &Message, info: &RequestInfo) -> Message {
        let ttl = self.conf.filters.response_ttl.as_duration().as_secs() as u32;
        let mut resp = dnsmsg::response_from(req);

        match info.qtype {
            RecordType::A => {
                resp.add_answer(Record::from_rdata(
                    info.qname.clone(),
                    ttl,
                    RData::A(self.conf.filters.block_ipv4),
                ));
            }
            RecordType::AAAA => {
                resp.add_answer(Record::from_rdata(
                    info.qname.clone(),
                    ttl,
                    RData::AAAA(self.conf.filters.block_ipv6),
                ));
            }
            _ => {
                resp.add_name_server(self.negative_soa(info, ttl));
            }
        }

        self.echo_ecs(&mut resp, info);
        resp
    }

    /// The synthesized response for a rewritten query (safe search, safe
    /// browsing): a CNAME to the replacement host, or the replacement
    /// addresses directly.
    fn rewrite_response(&self, req: &Message, info: &RequestInfo, rewrite: &Rewrite) -> Message {
        let ttl = self.conf.filters.response_ttl.as_duration().as_secs() as u32;
        let mut resp = dnsmsg::response_from(req);

        match rewrite {
            Rewrite::Host(host) => match Name::from_ascii(host) {
                Ok(mut target) => {
                    target.set_fqdn(true);
                    resp.add_answer(Record::from_rdata(
                        info.qname.clone(),
                        ttl,
                        RData::CNAME(target),
                    ));
                }
                Err(err) => {
                    self.errcoll.collect_for_request(
                        info.id,
                        &Error::Internal(format!("bad rewrite host {host:?}: {err}")),
                    );
                    resp.set_response_code(ResponseCode::ServFail);
                }
            },
            Rewrite::Addrs(addrs) => {
                for addr in addrs {
                    let rdata = match (info.qtype, addr) {
                        (RecordType::A, IpAddr::V4(ip)) => RData::A(*ip),
                        (RecordType::AAAA, IpAddr::V6(ip)) => RData::AAAA(*ip),
                        _ => continue,
                    };
                    resp.add_answer(Record::from_rdata(info.qname.clone(), ttl, rdata));
                }
            }
        }

        self.echo_ecs(&mut resp, info);
        resp
    }

    fn negative_soa(&self, info: &RequestInfo, ttl: u32) -> Record {
        let mname = info.qname.clone();
        let rname = Name::from_ascii("hostmaster")
            .and_then(|host| host.append_domain(&info.qname))
            .unwrap_or_else(|_| info.qname.clone());

        Record::from_rdata(
            info.qname.clone(),
            ttl,
            RData::SOA(SOA::new(mname, rname, 1, 10_800, 3_600, 604_800, ttl)),
        )
    }

    /// Synthesized responses echo the client's ECS subnet with its scope.
    fn echo_ecs(&self, resp: &mut Message, info: &RequestInfo) {
        if let Some(ecs) = &info.ecs {
            dnsmsg::ecs::set_ecs(resp, ecs.subnet, ecs.scope);
        }
    }

    /// Responses that never touched filtering or the limiter accounting.
    fn respond(&self, msg: Message, info: Option<&RequestInfo>) -> Outcome {
        match info {
            Some(info) => self.finish(msg, info, &Action::Pass, &Action::Pass),
            None => match dnsmsg::encode(&msg) {
                Ok(wire) => Outcome::Respond(Response { msg, wire }),
                Err(err) => {
                    self.errcoll.collect(&err);
                    Outcome::Drop
                }
            },
        }
    }

    /// Encodes the response, settles the rate-limit charge, and writes the
    /// query log entry.
    fn finish(
        &self,
        msg: Message,
        info: &RequestInfo,
        request_action: &Action,
        response_action: &Action,
    ) -> Outcome {
        let wire = match dnsmsg::encode(&msg) {
            Ok(wire) => wire,
            Err(err) => {
                self.errcoll.collect_for_request(info.id, &err);
                return Outcome::Drop;
            }
        };

        self.ratelimiter.charge_response(info.effective_ip(), wire.len());
        self.write_querylog(&msg, info, request_action, response_action);

        Outcome::Respond(Response { msg, wire })
    }

    fn write_querylog(
        &self,
        msg: &Message,
        info: &RequestInfo,
        request_action: &Action,
        response_action: &Action,
    ) {
        let decisive = if request_action.is_pass() {
            response_action
        } else {
            request_action
        };
        let (result_code, list, rule) = match decisive {
            Action::Pass => (querylog::ResultCode::NotFiltered, String::new(), String::new()),
            Action::Allow { list, rule } => {
                (querylog::ResultCode::Allowed, list.0.clone(), rule.clone())
            }
            Action::Block { list, rule } => {
                (querylog::ResultCode::Blocked, list.0.clone(), rule.clone())
            }
            Action::Rewrite { list, rule, .. } => {
                (querylog::ResultCode::Modified, list.0.clone(), rule.clone())
            }
        };

        let response_ip = msg.answers().iter().find_map(|rec| match rec.data() {
            Some(RData::A(ip)) => Some(IpAddr::V4(*ip)),
            Some(RData::AAAA(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });

        let client_ip = info.remote_addr.ip();
        let entry = querylog::Entry {
            request_id: info.id.to_string(),
            profile_id: info
                .profile
                .as_ref()
                .map(|p| p.id.0.clone())
                .unwrap_or_default(),
            device_id: info
                .device_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            client_country: self.geoip.country_for_addr(client_ip).unwrap_or_default(),
            response_country: response_ip
                .and_then(|ip| self.geoip.country_for_addr(ip))
                .unwrap_or_default(),
            domain_fqdn: info.qname.to_string(),
            filter_list_id: list,
            filter_rule: rule,
            timestamp: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
                as i64,
            client_asn: self.geoip.asn_for_addr(client_ip).unwrap_or_default(),
            elapsed: info.start.elapsed().as_millis() as u64,
            request_type: info.qtype.to_string(),
            dnssec: u8::from(info.dnssec_ok),
            protocol: info.proto.to_string(),
            result_code,
            response_code: u16::from(msg.response_code()),
        };

        let querylog = Arc::clone(&self.querylog);
        let errcoll = Arc::clone(&self.errcoll);
        let request_id = info.id;
        tokio::spawn(async move {
            if let Err(err) = querylog.write(&entry).await {
                errcoll.collect_for_request(request_id, &err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;

    use tokio::net::UdpSocket;
    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::rdata::svcb::SvcParamValue;

    use crate::config::Config;
    use crate::errcoll::StderrErrorCollector;
    use crate::filter::{RuleList, Snapshot};
    use crate::geoip::EmptyGeoIp;
    use crate::profile::{FilterListId, InMemoryProfileDb};
    use crate::querylog::EmptyQueryLog;

    use super::*;

    const CLIENT_ADDR: &str = "1.2.3.4:5355";

    /// A fake upstream answering every A query with `93.184.216.34`.
    async fn spawn_fake_upstream() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0; 4096];
            while let Ok((len, peer)) = sock.recv_from(&mut buf).await {
                let Ok(req) = dnsmsg::decode(&buf[..len]) else {
                    continue;
                };
                let mut resp = dnsmsg::response_from(&req);
                if let Some(query) = req.queries().first() {
                    if query.query_type() == RecordType::A {
                        resp.add_answer(Record::from_rdata(
                            query.name().clone(),
                            300,
                            RData::A(Ipv4Addr::new(93, 184, 216, 34)),
                        ));
                    }
                }
                let bytes = dnsmsg::encode(&resp).unwrap();
                let _ = sock.send_to(&bytes, peer).await;
            }
        });

        addr
    }

    fn test_config(upstream: SocketAddr) -> SharedConfig {
        let yaml = format!(
            r#"
ratelimit:
  rps: 100
  response_size_estimate: 1KB
  back_off_count: 1000
  back_off_period: 10m
  back_off_duration: 30m
  refuseany: true
cache:
  size: 1024
upstream:
  server: {upstream}
  timeout: 1s
filters:
  response_ttl: 10s
  custom_filter_cache_size: 16
  refresh_interval: 1h
  refresh_timeout: 5m
  block_ipv4: 6.6.6.13
  block_ipv6: "::1"
filtering_groups:
  - id: default
    rule_lists: [base]
    general_safe_search: true
server_groups:
  - name: main
    filtering_group: default
    ddr:
      enabled: true
      public_records:
        - priority: 1
          target: dns.example.com
          alpns: [h2, h3]
          port: 443
          ipv4_hints: [94.140.14.14]
    servers:
      - name: plain_dns
        protocol: dns-udp
        bind_addresses:
          - 127.0.0.1:0
"#,
        );
        Arc::new(serde_yaml::from_str::<Config>(&yaml).unwrap())
    }

    fn test_snapshot() -> Snapshot {
        let mut rule_lists = HashMap::new();
        rule_lists.insert(
            FilterListId("base".to_string()),
            Arc::new(
                RuleList::compile(
                    FilterListId("base".to_string()),
                    "||blocked.example.com^\n",
                )
                .unwrap(),
            ),
        );

        Snapshot {
            rule_lists,
            general_safe_search: crate::filter::SafeSearch::parse(
                "duckduckgo.com,safe.duckduckgo.com\n",
            ),
            ..Snapshot::default()
        }
    }

    struct TestEnv {
        pipeline: Pipeline,
        group: ServerGroup,
    }

    async fn test_env() -> TestEnv {
        let upstream_addr = spawn_fake_upstream().await;
        let conf = test_config(upstream_addr);

        let engine = Arc::new(FilterEngine::new(16));
        engine.publish(test_snapshot());

        let group =
            ServerGroup::from_config(&conf.server_groups[0], &conf.filtering_groups).unwrap();

        let pipeline = Pipeline::new(
            Arc::clone(&conf),
            Arc::new(RateLimiter::new(&conf.ratelimit)),
            Arc::new(MessageCache::new(&conf.cache)),
            engine,
            Arc::new(Upstream::new(&conf.upstream)),
            Arc::new(InMemoryProfileDb::default()),
            Arc::new(EmptyGeoIp),
            Arc::new(EmptyQueryLog),
            Arc::new(StderrErrorCollector),
        );

        TestEnv { pipeline, group }
    }

    fn query_bytes(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        dnsmsg::encode(&msg).unwrap()
    }

    fn client() -> ClientInfo {
        ClientInfo::plain(CLIENT_ADDR.parse().unwrap())
    }

    async fn expect_response(env: &TestEnv, raw: &[u8]) -> Message {
        match env
            .pipeline
            .handle(raw, &client(), &env.group, Protocol::DnsUdp)
            .await
        {
            Outcome::Respond(resp) => resp.msg,
            Outcome::Drop => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn forwards_and_caches() {
        let env = test_env().await;

        let resp = expect_response(&env, &query_bytes(0x1111, "example.org.", RecordType::A)).await;
        assert_eq!(resp.id(), 0x1111);
        assert_eq!(resp.queries()[0].name().to_string(), "example.org.");
        assert_eq!(
            resp.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(93, 184, 216, 34))),
        );
        let first_ttl = resp.answers()[0].ttl();

        // The second query is answered from cache under its own id, with a
        // TTL that has not grown.
        let resp = expect_response(&env, &query_bytes(0x2222, "example.org.", RecordType::A)).await;
        assert_eq!(resp.id(), 0x2222);
        assert_eq!(
            resp.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(93, 184, 216, 34))),
        );
        assert!(resp.answers()[0].ttl() <= first_ttl);
    }

    #[tokio::test]
    async fn blocked_host_gets_block_address() {
        let env = test_env().await;

        let resp =
            expect_response(&env, &query_bytes(7, "blocked.example.com.", RecordType::A)).await;
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(
            resp.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(6, 6, 6, 13))),
        );
        assert_eq!(resp.answers()[0].ttl(), 10);
    }

    #[tokio::test]
    async fn any_refused_without_upstream() {
        let env = test_env().await;

        let resp = expect_response(&env, &query_bytes(8, "example.org.", RecordType::ANY)).await;
        assert_eq!(resp.response_code(), ResponseCode::Refused);
        assert!(resp.answers().is_empty());
    }

    #[tokio::test]
    async fn ddr_public_records() {
        let env = test_env().await;

        let resp =
            expect_response(&env, &query_bytes(9, "_dns.resolver.arpa.", RecordType::SVCB)).await;
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);

        let Some(RData::SVCB(svcb)) = resp.answers()[0].data() else {
            panic!("want an svcb answer");
        };
        assert_eq!(svcb.svc_priority(), 1);
        assert!(svcb
            .svc_params()
            .iter()
            .any(|(_, v)| matches!(v, SvcParamValue::Port(443))));
    }

    #[tokio::test]
    async fn ddr_disabled_is_nxdomain() {
        let mut env = test_env().await;
        env.group.ddr.enabled = false;

        let resp =
            expect_response(&env, &query_bytes(10, "_dns.resolver.arpa.", RecordType::SVCB)).await;
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn malformed_ecs_is_formerr() {
        use trust_dns_proto::op::Edns;
        use trust_dns_proto::rr::rdata::opt::EdnsOption;

        let env = test_env().await;

        let mut msg = Message::new();
        msg.set_id(11);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(
            Name::from_str("example.org.").unwrap(),
            RecordType::A,
        ));
        // 1.2.3.4/24 has bits beyond the prefix.
        let mut edns = Edns::new();
        edns.options_mut()
            .insert(EdnsOption::Unknown(8, vec![0, 1, 24, 0, 1, 2, 3, 4]));
        msg.set_edns(edns);

        let resp = expect_response(&env, &dnsmsg::encode(&msg).unwrap()).await;
        assert_eq!(resp.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn safe_search_rewrites_to_cname() {
        let env = test_env().await;

        let resp = expect_response(&env, &query_bytes(12, "duckduckgo.com.", RecordType::A)).await;
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        let Some(RData::CNAME(target)) = resp.answers()[0].data() else {
            panic!("want a cname answer");
        };
        assert_eq!(target.to_string(), "safe.duckduckgo.com.");
    }
}
