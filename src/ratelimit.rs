//! Per-subnet rate limiting with back-off.
//!
//! Each client subnet (IPv4 /24, IPv6 /48 by default) owns a token bucket
//! refilled at `rps` tokens per second up to a capacity of `rps`. A query
//! costs one token up front; once the response size is known the remainder
//! of `ceil(size / response_size_estimate)` is charged, so large answers
//! drain the budget faster than small ones. Subnets that keep querying over
//! budget collect hits, and more than `back_off_count` hits within
//! `back_off_period` puts the subnet in jail for `back_off_duration`:
//! unconditional denial, cleared lazily on the next access after expiry.
//!
//! Buckets live in a sharded concurrent map; there is no global lock on the
//! admission path.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use trust_dns_proto::rr::RecordType;

use crate::config::RatelimitConfig;
use crate::dnsmsg::ecs;
use crate::errcoll::ErrorCollector;
use crate::error::Error;

/// The admission decision for one query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    Allow,
    /// Deny the query: drop on UDP, close the stream elsewhere.
    Deny { jailed: bool },
    /// Respond REFUSED immediately; no tokens were consumed.
    RefuseAny,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
    /// Timestamps of over-budget hits within the back-off window.
    hits: VecDeque<Instant>,
    jailed_until: Option<Instant>,
}

pub struct RateLimiter {
    rps: f64,
    response_size_estimate: f64,
    back_off_count: usize,
    back_off_period: Duration,
    back_off_duration: Duration,
    refuseany: bool,
    ipv4_subnet_key_len: u8,
    ipv6_subnet_key_len: u8,
    buckets: DashMap<IpNetwork, Bucket>,
    allowlist: parking_lot::RwLock<Vec<IpNetwork>>,
}

impl RateLimiter {
    pub fn new(conf: &RatelimitConfig) -> Self {
        Self {
            rps: f64::from(conf.rps),
            response_size_estimate: conf.response_size_estimate.0 as f64,
            back_off_count: conf.back_off_count as usize,
            back_off_period: conf.back_off_period.as_duration(),
            back_off_duration: conf.back_off_duration.as_duration(),
            refuseany: conf.refuseany,
            ipv4_subnet_key_len: conf.ipv4_subnet_key_len,
            ipv6_subnet_key_len: conf.ipv6_subnet_key_len,
            buckets: DashMap::new(),
            allowlist: parking_lot::RwLock::new(
                conf.allowlist.list.iter().map(|c| c.0).collect(),
            ),
        }
    }

    /// The bucket key for a client address.
    pub fn subnet_key(&self, addr: IpAddr) -> IpNetwork {
        ecs::subnet_for_addr(addr, self.ipv4_subnet_key_len, self.ipv6_subnet_key_len)
    }

    /// Admits or denies one query from `addr`.
    pub fn admit(&self, addr: IpAddr, qtype: RecordType) -> Admission {
        self.admit_at(addr, qtype, Instant::now())
    }

    fn admit_at(&self, addr: IpAddr, qtype: RecordType, now: Instant) -> Admission {
        if self.is_allowlisted(addr) {
            return Admission::Allow;
        }

        if self.refuseany && qtype == RecordType::ANY {
            return Admission::RefuseAny;
        }

        let key = self.subnet_key(addr);
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: self.rps,
            refilled_at: now,
            hits: VecDeque::new(),
            jailed_until: None,
        });

        if let Some(until) = bucket.jailed_until {
            if now < until {
                return Admission::Deny { jailed: true };
            }

            bucket.jailed_until = None;
            bucket.hits.clear();
        }

        self.refill(&mut bucket, now);

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            return Admission::Allow;
        }

        // Over budget: the query is denied and does not carry debt forward.
        bucket.tokens = 0.0;

        let window_start = now - self.back_off_period;
        while bucket.hits.front().is_some_and(|&hit| hit < window_start) {
            bucket.hits.pop_front();
        }
        bucket.hits.push_back(now);

        if bucket.hits.len() > self.back_off_count {
            bucket.jailed_until = Some(now + self.back_off_duration);
            bucket.hits.clear();
            return Admission::Deny { jailed: true };
        }

        Admission::Deny { jailed: false }
    }

    /// Charges the remainder of the response cost once its size is known.
    /// The one token paid at admission is already subtracted. Never denies;
    /// an oversized answer only drains the budget for subsequent queries.
    pub fn charge_response(&self, addr: IpAddr, response_size: usize) {
        if self.is_allowlisted(addr) {
            return;
        }

        let cost = (response_size as f64 / self.response_size_estimate).ceil();
        let extra = cost - 1.0;
        if extra <= 0.0 {
            return;
        }

        let key = self.subnet_key(addr);
        if let Some(mut bucket) = self.buckets.get_mut(&key) {
            bucket.tokens -= extra;
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.rps);
        bucket.refilled_at = now;
    }

    fn is_allowlisted(&self, addr: IpAddr) -> bool {
        self.allowlist.read().iter().any(|net| net.contains(addr))
    }

    /// Replaces the allowlist wholesale; used by the refresher.
    pub fn set_allowlist(&self, nets: Vec<IpNetwork>) {
        *self.allowlist.write() = nets;
    }
}

/// One service entry of the Consul catalog answer backing the allowlist.
#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "Address")]
    address: IpAddr,
}

/// Pulls the rate-limit allowlist from a Consul catalog URL on an interval.
/// A fetch or parse failure leaves the previous list in place and goes to
/// the error collector.
pub struct AllowlistUpdater {
    url: String,
    static_list: Vec<IpNetwork>,
    client: reqwest::Client,
    limiter: std::sync::Arc<RateLimiter>,
    errcoll: std::sync::Arc<dyn ErrorCollector>,
}

impl AllowlistUpdater {
    pub fn new(
        url: String,
        static_list: Vec<IpNetwork>,
        limiter: std::sync::Arc<RateLimiter>,
        errcoll: std::sync::Arc<dyn ErrorCollector>,
    ) -> Self {
        Self {
            url,
            static_list,
            client: reqwest::Client::new(),
            limiter,
            errcoll,
        }
    }

    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                self.errcoll.collect(&err);
            }
        }
    }

    async fn refresh(&self) -> Result<(), Error> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| Error::FilterFetch {
                url: self.url.clone(),
                source: err,
            })?;

        let services: Vec<ConsulService> =
            resp.json().await.map_err(|err| Error::FilterFetch {
                url: self.url.clone(),
                source: err,
            })?;

        let mut nets = self.static_list.clone();
        nets.extend(services.iter().map(|s| IpNetwork::from(s.address)));
        tracing::debug!(count = nets.len(), "allowlist refreshed");
        self.limiter.set_allowlist(nets);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use crate::config::{AllowlistConfig, ByteSize, CidrOrIp, GoDuration};

    use super::*;

    fn test_conf(rps: u32, back_off_count: u32) -> RatelimitConfig {
        RatelimitConfig {
            rps,
            response_size_estimate: ByteSize(1024),
            back_off_count,
            back_off_period: GoDuration(Duration::from_secs(600)),
            back_off_duration: GoDuration(Duration::from_secs(1800)),
            refuseany: true,
            ipv4_subnet_key_len: 24,
            ipv6_subnet_key_len: 48,
            allowlist: AllowlistConfig::default(),
        }
    }

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn denies_over_budget() {
        let rl = RateLimiter::new(&test_conf(2, 1000));
        let now = Instant::now();

        assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
        assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now),
            Admission::Deny { jailed: false },
        );
    }

    #[test]
    fn tokens_refill_over_time() {
        let rl = RateLimiter::new(&test_conf(1, 1000));
        let now = Instant::now();

        assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now),
            Admission::Deny { jailed: false },
        );
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now + Duration::from_secs(2)),
            Admission::Allow,
        );
    }

    #[test]
    fn same_subnet_shares_bucket() {
        let rl = RateLimiter::new(&test_conf(1, 1000));
        let now = Instant::now();

        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));

        assert_eq!(rl.admit_at(a, RecordType::A, now), Admission::Allow);
        assert_eq!(
            rl.admit_at(b, RecordType::A, now),
            Admission::Deny { jailed: false },
        );
        assert_eq!(rl.admit_at(other, RecordType::A, now), Admission::Allow);
    }

    #[test]
    fn jails_after_back_off_count() {
        let rl = RateLimiter::new(&test_conf(1, 3));
        let now = Instant::now();

        assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
        for _ in 0..3 {
            assert_eq!(
                rl.admit_at(CLIENT, RecordType::A, now),
                Admission::Deny { jailed: false },
            );
        }

        // The fourth hit exceeds back_off_count and jails the subnet.
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now),
            Admission::Deny { jailed: true },
        );

        // Jailed even after the bucket would have refilled.
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now + Duration::from_secs(60)),
            Admission::Deny { jailed: true },
        );

        // Lazily released once the jail expires.
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now + Duration::from_secs(1801)),
            Admission::Allow,
        );
    }

    #[test]
    fn refuseany_consumes_nothing() {
        let rl = RateLimiter::new(&test_conf(1, 1000));
        let now = Instant::now();

        assert_eq!(
            rl.admit_at(CLIENT, RecordType::ANY, now),
            Admission::RefuseAny,
        );
        // The full budget is still there.
        assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
    }

    #[test]
    fn allowlist_bypasses() {
        let mut conf = test_conf(1, 1);
        conf.allowlist = AllowlistConfig {
            list: vec![CidrOrIp::from_str("10.0.0.0/8").unwrap()],
            refresh_interval: None,
        };
        let rl = RateLimiter::new(&conf);
        let now = Instant::now();

        for _ in 0..100 {
            assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
        }
    }

    #[test]
    fn response_size_charge_drains_budget() {
        let rl = RateLimiter::new(&test_conf(3, 1000));
        let now = Instant::now();

        assert_eq!(rl.admit_at(CLIENT, RecordType::A, now), Admission::Allow);
        // A 3 KB answer costs ceil(3072/1024) = 3 tokens, 1 already paid.
        rl.charge_response(CLIENT, 3072);
        assert_eq!(
            rl.admit_at(CLIENT, RecordType::A, now),
            Admission::Deny { jailed: false },
        );
    }
}
