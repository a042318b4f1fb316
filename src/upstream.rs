//! The upstream client: a primary resolver with ordered fallbacks.
//!
//! Queries go to the primary while it is healthy; a timeout or network
//! error marks it unhealthy for `backoff_duration` and the fallbacks are
//! tried in order. An unhealthy primary is never probed on the query path;
//! only the background health checker does that, with an A query for
//! `${RANDOM}.domain_template` so caches along the way cannot answer it.
//!
//! Transport is plain DNS: UDP first, with a TCP retry when the answer
//! comes back truncated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use trust_dns_proto::op::{Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::{Name, RecordType};

use crate::config::UpstreamConfig;
use crate::dnsmsg;
use crate::error::Error;

struct Target {
    addr: SocketAddr,
    /// Milliseconds since `start` until which the target is unhealthy;
    /// zero means healthy.
    unhealthy_until: AtomicU64,
}

/// The primary-plus-fallbacks upstream client.
pub struct Upstream {
    targets: Vec<Target>,
    timeout: Duration,
    backoff: Duration,
    start: Instant,
}

impl Upstream {
    pub fn new(conf: &UpstreamConfig) -> Self {
        let mut targets = vec![Target {
            addr: conf.server,
            unhealthy_until: AtomicU64::new(0),
        }];
        targets.extend(conf.fallback.iter().map(|&addr| Target {
            addr,
            unhealthy_until: AtomicU64::new(0),
        }));

        Self {
            targets,
            timeout: conf.timeout.as_duration(),
            backoff: conf.healthcheck.backoff_duration.as_duration(),
            start: Instant::now(),
        }
    }

    pub fn primary_addr(&self) -> SocketAddr {
        self.targets[0].addr
    }

    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn is_healthy(&self, idx: usize) -> bool {
        let until = self.targets[idx].unhealthy_until.load(Ordering::Relaxed);
        until == 0 || self.now_millis() >= until
    }

    fn mark_unhealthy(&self, idx: usize) {
        let until = self.now_millis() + self.backoff.as_millis() as u64;
        self.targets[idx].unhealthy_until.store(until, Ordering::Relaxed);
        tracing::warn!(
            upstream = %self.targets[idx].addr,
            backoff = ?self.backoff,
            "upstream marked unhealthy",
        );
    }

    fn mark_healthy(&self, idx: usize) {
        let was = self.targets[idx].unhealthy_until.swap(0, Ordering::Relaxed);
        if was != 0 {
            tracing::info!(upstream = %self.targets[idx].addr, "upstream healthy again");
        }
    }

    /// Resolves `req` against the first healthy target that answers.
    ///
    /// # Errors
    ///
    /// Returns the last target's [`Error::UpstreamTimeout`] or
    /// [`Error::UpstreamNetwork`] once every target has failed.
    pub async fn resolve(&self, req: &Message) -> Result<Message, Error> {
        let bytes = dnsmsg::encode(req)?;

        let mut last_err = Error::UpstreamTimeout {
            upstream: self.targets[0].addr,
        };
        for (idx, target) in self.targets.iter().enumerate() {
            if !self.is_healthy(idx) {
                continue;
            }

            match self.exchange(target.addr, &bytes, req.id()).await {
                Ok(resp) => {
                    self.mark_healthy(idx);
                    return Ok(resp);
                }
                Err(err) => {
                    self.mark_unhealthy(idx);
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    /// One UDP exchange with a TCP retry on truncation.
    async fn exchange(
        &self,
        addr: SocketAddr,
        bytes: &[u8],
        id: u16,
    ) -> Result<Message, Error> {
        let resp = self.exchange_udp(addr, bytes, id).await?;
        if !resp.truncated() {
            return Ok(resp);
        }

        tracing::debug!(upstream = %addr, "truncated answer, retrying over tcp");
        self.exchange_tcp(addr, bytes, id).await
    }

    async fn exchange_udp(
        &self,
        addr: SocketAddr,
        bytes: &[u8],
        id: u16,
    ) -> Result<Message, Error> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let sock = UdpSocket::bind(bind_addr).await.map_err(Error::UpstreamNetwork)?;
        sock.connect(addr).await.map_err(Error::UpstreamNetwork)?;
        sock.send(bytes).await.map_err(Error::UpstreamNetwork)?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0; dnsmsg::DEFAULT_EDNS_UDP_SIZE as usize];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::UpstreamTimeout { upstream: addr })?;

            let len = tokio::time::timeout(remaining, sock.recv(&mut buf))
                .await
                .map_err(|_| Error::UpstreamTimeout { upstream: addr })?
                .map_err(Error::UpstreamNetwork)?;

            match dnsmsg::decode(&buf[..len]) {
                Ok(resp) if resp.id() == id => return Ok(resp),
                // A stray or mismatched datagram; keep listening until the
                // deadline.
                Ok(_) | Err(_) => continue,
            }
        }
    }

    async fn exchange_tcp(
        &self,
        addr: SocketAddr,
        bytes: &[u8],
        id: u16,
    ) -> Result<Message, Error> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(bytes).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let resp_len = usize::from(u16::from_be_bytes(len_buf));
            let mut resp_buf = vec![0; resp_len];
            stream.read_exact(&mut resp_buf).await?;
            Ok::<Vec<u8>, std::io::Error>(resp_buf)
        };

        let resp_bytes = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::UpstreamTimeout { upstream: addr })?
            .map_err(Error::UpstreamNetwork)?;

        let resp = dnsmsg::decode(&resp_bytes)?;
        if resp.id() != id {
            return Err(Error::UpstreamNetwork(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response id mismatch",
            )));
        }

        Ok(resp)
    }
}

/// The background health checker for the primary target.
pub struct HealthChecker {
    upstream: Arc<Upstream>,
    domain_template: String,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(upstream: Arc<Upstream>, conf: &UpstreamConfig) -> Self {
        Self {
            upstream,
            domain_template: conf.healthcheck.domain_template.clone(),
            interval: conf.healthcheck.interval.as_duration(),
            timeout: conf.healthcheck.timeout.as_duration(),
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe().await;
        }
    }

    async fn probe(&self) {
        let probe = match self.build_probe() {
            Ok(probe) => probe,
            Err(err) => {
                tracing::error!(error = %err, "building health check probe");
                return;
            }
        };

        let bytes = match dnsmsg::encode(&probe) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "encoding health check probe");
                return;
            }
        };

        let addr = self.upstream.primary_addr();
        let result = tokio::time::timeout(
            self.timeout,
            self.upstream.exchange_udp(addr, &bytes, probe.id()),
        )
        .await;

        match result {
            Ok(Ok(_)) => self.upstream.mark_healthy(0),
            Ok(Err(_)) | Err(_) => self.upstream.mark_unhealthy(0),
        }
    }

    /// An A query for the template domain with `${RANDOM}` replaced by a
    /// fresh 8-hex-char token.
    fn build_probe(&self) -> Result<Message, Error> {
        let token: u32 = rand::thread_rng().gen();
        let domain = self
            .domain_template
            .replace("${RANDOM}", &format!("{token:08x}"));
        let name = Name::from_ascii(&domain)
            .map_err(|err| Error::Internal(format!("bad domain template: {err}")))?;

        let mut probe = Message::new();
        probe.set_id(rand::thread_rng().gen());
        probe.set_message_type(MessageType::Query);
        probe.set_op_code(OpCode::Query);
        probe.set_recursion_desired(true);
        probe.add_query(Query::query(name, RecordType::A));
        Ok(probe)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use trust_dns_proto::rr::{RData, Record};

    use crate::config::{GoDuration, HealthcheckConfig};

    use super::*;

    /// A tiny UDP resolver answering every A query with one fixed address.
    async fn spawn_fake_upstream(answer: Ipv4Addr) -> SocketAddr {
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
                    resp.add_answer(Record::from_rdata(
                        query.name().clone(),
                        300,
                        RData::A(answer),
                    ));
                }
                let bytes = dnsmsg::encode(&resp).unwrap();
                let _ = sock.send_to(&bytes, peer).await;
            }
        });

        addr
    }

    fn test_query() -> Message {
        let mut msg = Message::new();
        msg.set_id(0x77aa);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_str("example.org.").unwrap(),
            RecordType::A,
        ));
        msg
    }

    fn conf(server: SocketAddr, fallback: Vec<SocketAddr>) -> UpstreamConfig {
        UpstreamConfig {
            server,
            timeout: GoDuration(Duration::from_millis(500)),
            fallback,
            healthcheck: HealthcheckConfig::default(),
        }
    }

    #[tokio::test]
    async fn resolves_against_primary() {
        let primary = spawn_fake_upstream(Ipv4Addr::new(93, 184, 216, 34)).await;
        let upstream = Upstream::new(&conf(primary, vec![]));

        let resp = upstream.resolve(&test_query()).await.unwrap();
        assert_eq!(resp.id(), 0x77aa);
        assert_eq!(
            resp.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(93, 184, 216, 34))),
        );
    }

    #[tokio::test]
    async fn fails_over_to_fallback() {
        // A bound-then-dropped socket leaves a port nothing listens on.
        let dead_addr = {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sock.local_addr().unwrap()
        };
        let fallback = spawn_fake_upstream(Ipv4Addr::new(1, 2, 3, 4)).await;

        let upstream = Upstream::new(&conf(dead_addr, vec![fallback]));
        let resp = upstream.resolve(&test_query()).await.unwrap();
        assert_eq!(
            resp.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(1, 2, 3, 4))),
        );

        // The failure marked the primary unhealthy; the next query skips it.
        assert!(!upstream.is_healthy(0));
        let resp = upstream.resolve(&test_query()).await.unwrap();
        assert_eq!(
            resp.answers()[0].data(),
            Some(&RData::A(Ipv4Addr::new(1, 2, 3, 4))),
        );
    }

    #[tokio::test]
    async fn all_targets_failing_is_an_error() {
        let dead_addr = {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sock.local_addr().unwrap()
        };

        let upstream = Upstream::new(&conf(dead_addr, vec![]));
        let err = upstream.resolve(&test_query()).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::UpstreamTimeout { .. } | Error::UpstreamNetwork(_),
            ),
            "got: {err}",
        );
    }

    #[test]
    fn probe_replaces_random_token() {
        let upstream = Arc::new(Upstream::new(&conf(
            "127.0.0.1:53".parse().unwrap(),
            vec![],
        )));
        let mut hc_conf = conf("127.0.0.1:53".parse().unwrap(), vec![]);
        hc_conf.healthcheck.domain_template = "${RANDOM}.check.example.net".to_string();

        let checker = HealthChecker::new(upstream, &hc_conf);
        let probe = checker.build_probe().unwrap();

        let qname = probe.queries()[0].name().to_string();
        assert!(!qname.contains("${RANDOM}"), "got: {qname}");
        assert_eq!(qname.split('.').next().unwrap().len(), 8);
    }
}
