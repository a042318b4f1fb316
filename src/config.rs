//! Configuration: the YAML file and the environment.
//!
//! The file holds everything operators tune (`ratelimit`, `cache`,
//! `upstream`, `filters`, `filtering_groups`, `server_groups`, ...); the
//! environment holds deployment-specific endpoints and paths. Durations are
//! Go-style strings (`30s`, `10m`, `1h`), sizes are `<n>{B,KB,MB}`, and
//! CIDRs accept a bare IP as an implicit `/32` or `/128`.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

use crate::error::Error;
use crate::profile::FilteringGroup;

pub type SharedConfig = Arc<Config>;

/// A duration parsed from a Go-style string such as `100ms`, `30s`, `10m`,
/// `1h`, or a concatenation like `1h30m`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct GoDuration(pub Duration);

impl GoDuration {
    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for GoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty duration".into());
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let num_len = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
            if num_len == 0 {
                return Err(format!("bad duration {s:?}"));
            }

            let value: f64 = rest[..num_len]
                .parse()
                .map_err(|_| format!("bad number in duration {s:?}"))?;
            rest = &rest[num_len..];

            let (unit_len, unit_nanos) = if rest.starts_with("ms") {
                (2, 1_000_000.0)
            } else if rest.starts_with("us") {
                (2, 1_000.0)
            } else if rest.starts_with("ns") {
                (2, 1.0)
            } else if rest.starts_with('s') {
                (1, 1_000_000_000.0)
            } else if rest.starts_with('m') {
                (1, 60.0 * 1_000_000_000.0)
            } else if rest.starts_with('h') {
                (1, 3600.0 * 1_000_000_000.0)
            } else {
                return Err(format!("bad unit in duration {s:?}"));
            };
            rest = &rest[unit_len..];

            total += Duration::from_nanos((value * unit_nanos) as u64);
        }

        Ok(Self(total))
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs > 0 && secs % 3600 == 0 && self.0.subsec_nanos() == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 && self.0.subsec_nanos() == 0 {
            write!(f, "{}m", secs / 60)
        } else if self.0.subsec_nanos() == 0 {
            write!(f, "{secs}s")
        } else {
            write!(f, "{}ms", self.0.as_millis())
        }
    }
}

/// A size parsed from `<n>{B,KB,MB}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ByteSize(pub usize);

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, mult) = if let Some(num) = s.strip_suffix("MB") {
            (num, 1024 * 1024)
        } else if let Some(num) = s.strip_suffix("KB") {
            (num, 1024)
        } else if let Some(num) = s.strip_suffix('B') {
            (num, 1)
        } else {
            return Err(format!("bad size {s:?}: missing B/KB/MB suffix"));
        };

        let value: usize = num
            .trim()
            .parse()
            .map_err(|_| format!("bad size {s:?}"))?;
        Ok(Self(value * mult))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

/// A CIDR accepting a bare IP as an implicit `/32` or `/128`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CidrOrIp(pub IpNetwork);

impl FromStr for CidrOrIp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(net) = IpNetwork::from_str(s) {
            return Ok(Self(net));
        }

        let addr: IpAddr = s.parse().map_err(|_| format!("bad cidr or ip {s:?}"))?;
        Ok(Self(IpNetwork::from(addr)))
    }
}

impl fmt::Display for CidrOrIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub ratelimit: RatelimitConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub filters: FiltersConfig,
    #[serde(default)]
    pub filtering_groups: Vec<FilteringGroup>,
    pub server_groups: Vec<ServerGroupConfig>,
    #[serde(default)]
    pub query_log: QueryLogConfig,
    #[serde(default)]
    pub safe_browsing: SafeCategoryConfig,
    #[serde(default)]
    pub adult_blocking: SafeCategoryConfig,
    // Collaborator sections: their shapes are accepted and validated here,
    // the services behind them live outside this crate.
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub connectivity_check: ConnectivityCheckConfig,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct RatelimitConfig {
    /// Sustained queries per second per subnet; also the bucket capacity.
    pub rps: u32,
    /// Divisor for translating response sizes into token costs.
    #[serde_as(as = "DisplayFromStr")]
    pub response_size_estimate: ByteSize,
    /// Hits over budget tolerated within `back_off_period` before jailing.
    pub back_off_count: u32,
    #[serde_as(as = "DisplayFromStr")]
    pub back_off_period: GoDuration,
    #[serde_as(as = "DisplayFromStr")]
    pub back_off_duration: GoDuration,
    /// Respond REFUSED to ANY queries without consuming tokens.
    #[serde(default)]
    pub refuseany: bool,
    #[serde(default = "default_ipv4_subnet_key_len")]
    pub ipv4_subnet_key_len: u8,
    #[serde(default = "default_ipv6_subnet_key_len")]
    pub ipv6_subnet_key_len: u8,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
}

fn default_ipv4_subnet_key_len() -> u8 {
    24
}

fn default_ipv6_subnet_key_len() -> u8 {
    48
}

#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AllowlistConfig {
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    pub list: Vec<CidrOrIp>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub refresh_interval: Option<GoDuration>,
}

/// Cache mode: a plain LRU or one additionally keyed by the client's ECS
/// subnet.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Simple,
    Ecs,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(rename = "type", default)]
    pub mode: CacheMode,
    /// Entry capacity of the subnet-agnostic cache.
    pub size: usize,
    /// Entry capacity of the ECS-keyed cache; only used in `ecs` mode.
    #[serde(default)]
    pub ecs_size: usize,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    /// The primary upstream, `ip:port`.
    pub server: SocketAddr,
    #[serde_as(as = "DisplayFromStr")]
    pub timeout: GoDuration,
    /// Ordered fallbacks tried when the primary is unhealthy or fails.
    #[serde(default)]
    pub fallback: Vec<SocketAddr>,
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Probe query template; the literal `${RANDOM}` is replaced with a
    /// fresh token on every probe to bypass caches.
    #[serde(default = "default_domain_template")]
    pub domain_template: String,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_healthcheck_interval")]
    pub interval: GoDuration,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_healthcheck_timeout")]
    pub timeout: GoDuration,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_backoff_duration")]
    pub backoff_duration: GoDuration,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain_template: default_domain_template(),
            interval: default_healthcheck_interval(),
            timeout: default_healthcheck_timeout(),
            backoff_duration: default_backoff_duration(),
        }
    }
}

fn default_domain_template() -> String {
    "${RANDOM}.neverssl.com".to_string()
}

fn default_healthcheck_interval() -> GoDuration {
    GoDuration(Duration::from_secs(2))
}

fn default_healthcheck_timeout() -> GoDuration {
    GoDuration(Duration::from_secs(1))
}

fn default_backoff_duration() -> GoDuration {
    GoDuration(Duration::from_secs(30))
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct FiltersConfig {
    /// TTL of the synthesized records in blocked responses.
    #[serde_as(as = "DisplayFromStr")]
    pub response_ttl: GoDuration,
    /// Size of the LRU of compiled engines for profiles with custom rules.
    pub custom_filter_cache_size: usize,
    #[serde_as(as = "DisplayFromStr")]
    pub refresh_interval: GoDuration,
    /// Deadline for one whole refresh; each individual fetch is further
    /// capped at 30s.
    #[serde_as(as = "DisplayFromStr")]
    pub refresh_timeout: GoDuration,
    /// Run one final refresh when shutting down.
    #[serde(default)]
    pub refresh_on_shutdown: bool,
    /// Addresses synthesized into blocked responses.
    #[serde(default = "default_block_ipv4")]
    pub block_ipv4: Ipv4Addr,
    #[serde(default = "default_block_ipv6")]
    pub block_ipv6: Ipv6Addr,
}

fn default_block_ipv4() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_block_ipv6() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryLogConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Safe-browsing style category: the hosts come from a filter list, matches
/// are rewritten to `block_host`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SafeCategoryConfig {
    #[serde(default)]
    pub block_host: String,
    #[serde(default)]
    pub cache_size: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default)]
    pub host_cache_size: usize,
    #[serde(default)]
    pub ip_cache_size: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub linked_ip_enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CheckConfig {
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectivityCheckConfig {
    #[serde(default)]
    pub probe_ipv4: Option<SocketAddr>,
    #[serde(default)]
    pub probe_ipv6: Option<SocketAddr>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerGroupConfig {
    pub name: String,
    pub filtering_group: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub ddr: DdrConfig,
    pub servers: Vec<ServerConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certificates: Vec<CertificatePair>,
    #[serde(default)]
    pub device_id_wildcards: Vec<String>,
    #[serde(default)]
    pub session_keys: Vec<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CertificatePair {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DdrConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Domains whose subdomains are checked for DDR queries carrying device
    /// IDs.
    #[serde(default)]
    pub device_domains: Vec<String>,
    /// Public resolver domains answered for DDR queries without device IDs.
    #[serde(default)]
    pub public_domains: Vec<String>,
    #[serde(default)]
    pub device_records: Vec<DdrRecordTemplate>,
    #[serde(default)]
    pub public_records: Vec<DdrRecordTemplate>,
}

/// One SVCB answer template for `_dns.resolver.arpa` queries.
#[derive(Clone, Debug, Deserialize)]
pub struct DdrRecordTemplate {
    pub priority: u16,
    pub target: String,
    #[serde(default)]
    pub alpns: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ipv4_hints: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ipv6_hints: Vec<Ipv6Addr>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub protocol: crate::server::Protocol,
    pub bind_addresses: Vec<SocketAddr>,
    #[serde(default)]
    pub linked_ip_enabled: bool,
    #[serde(default)]
    pub dnscrypt: Option<DnsCryptConfig>,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct DnsCryptConfig {
    pub provider_name: String,
    /// Hex-encoded 32-byte seed of the provider's long-term Ed25519 signing
    /// key.
    pub provider_key: String,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_certificate_ttl")]
    pub certificate_ttl: GoDuration,
}

fn default_certificate_ttl() -> GoDuration {
    GoDuration(Duration::from_secs(24 * 3600))
}

impl Config {
    /// Loads and validates the configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or
    /// [`Error::Config`] if it does not parse or fails validation.
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_yaml::from_reader(reader)
            .map_err(|err| Error::Config(format!("parsing config: {err}")))?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<(), Error> {
        must_be_positive("ratelimit.rps", u64::from(self.ratelimit.rps))?;
        must_be_positive(
            "ratelimit.response_size_estimate",
            self.ratelimit.response_size_estimate.0 as u64,
        )?;
        must_be_positive_duration("ratelimit.back_off_period", self.ratelimit.back_off_period)?;
        must_be_positive_duration(
            "ratelimit.back_off_duration",
            self.ratelimit.back_off_duration,
        )?;
        if self.ratelimit.ipv4_subnet_key_len > 32 {
            return Err(Error::Config("ratelimit.ipv4_subnet_key_len > 32".into()));
        }
        if self.ratelimit.ipv6_subnet_key_len > 128 {
            return Err(Error::Config("ratelimit.ipv6_subnet_key_len > 128".into()));
        }

        must_be_positive("cache.size", self.cache.size as u64)?;
        if self.cache.mode == CacheMode::Ecs {
            must_be_positive("cache.ecs_size", self.cache.ecs_size as u64)?;
        }

        must_be_positive_duration("upstream.timeout", self.upstream.timeout)?;

        must_be_positive_duration("filters.response_ttl", self.filters.response_ttl)?;
        must_be_positive_duration("filters.refresh_interval", self.filters.refresh_interval)?;
        must_be_positive_duration("filters.refresh_timeout", self.filters.refresh_timeout)?;

        let group_ids: Vec<&str> = self
            .filtering_groups
            .iter()
            .map(|g| g.id.0.as_str())
            .collect();
        for sg in &self.server_groups {
            if !group_ids.contains(&sg.filtering_group.as_str()) {
                return Err(Error::Config(format!(
                    "server group {:?}: unknown filtering group {:?}",
                    sg.name, sg.filtering_group,
                )));
            }

            for srv in &sg.servers {
                if srv.bind_addresses.is_empty() {
                    return Err(Error::Config(format!(
                        "server {:?}: no bind addresses",
                        srv.name,
                    )));
                }
                if srv.protocol == crate::server::Protocol::DnsCrypt && srv.dnscrypt.is_none() {
                    return Err(Error::Config(format!(
                        "server {:?}: dnscrypt protocol requires a dnscrypt section",
                        srv.name,
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn filtering_group(&self, id: &str) -> Option<&FilteringGroup> {
        self.filtering_groups.iter().find(|g| g.id.0 == id)
    }
}

fn must_be_positive(name: &str, value: u64) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::Config(format!("{name} must be positive")));
    }

    Ok(())
}

fn must_be_positive_duration(name: &str, value: GoDuration) -> Result<(), Error> {
    if value.is_zero() {
        return Err(Error::Config(format!("{name} must be positive")));
    }

    Ok(())
}

/// The configuration kept in the environment: deployment endpoints, paths,
/// and the log switches. Boolean variables are strict: only `"0"` and `"1"`
/// are accepted.
#[derive(Clone, Debug)]
pub struct Env {
    pub backend_endpoint: Option<String>,
    pub blocked_service_index_url: String,
    pub consul_allowlist_url: Option<String>,
    pub consul_dnscheck_kv_url: Option<String>,
    pub consul_dnscheck_session_url: Option<String>,
    pub filter_index_url: String,
    pub general_safe_search_url: String,
    pub youtube_safe_search_url: String,
    pub rulestat_url: Option<String>,

    pub config_path: PathBuf,
    pub dnsdb_path: PathBuf,
    pub filter_cache_path: PathBuf,
    pub geoip_asn_path: PathBuf,
    pub geoip_country_path: PathBuf,
    pub querylog_path: PathBuf,
    pub sentry_dsn: String,
    pub ssl_key_log_file: Option<PathBuf>,

    pub listen_addr: IpAddr,
    pub listen_port: u16,

    pub log_timestamp: bool,
    pub verbose: bool,
}

impl Env {
    /// Reads the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required variable is missing or a
    /// value does not parse.
    pub fn read() -> Result<Self, Error> {
        Ok(Self {
            backend_endpoint: optional("BACKEND_ENDPOINT"),
            blocked_service_index_url: required("BLOCKED_SERVICE_INDEX_URL")?,
            consul_allowlist_url: optional("CONSUL_ALLOWLIST_URL"),
            consul_dnscheck_kv_url: optional("CONSUL_DNSCHECK_KV_URL"),
            consul_dnscheck_session_url: optional("CONSUL_DNSCHECK_SESSION_URL"),
            filter_index_url: required("FILTER_INDEX_URL")?,
            general_safe_search_url: required("GENERAL_SAFE_SEARCH_URL")?,
            youtube_safe_search_url: required("YOUTUBE_SAFE_SEARCH_URL")?,
            rulestat_url: optional("RULESTAT_URL"),

            config_path: path_or("CONFIG_PATH", "./config.yml"),
            dnsdb_path: path_or("DNSDB_PATH", "./dnsdb.bolt"),
            filter_cache_path: path_or("FILTER_CACHE_PATH", "./filters/"),
            geoip_asn_path: path_or("GEOIP_ASN_PATH", "./asn.mmdb"),
            geoip_country_path: path_or("GEOIP_COUNTRY_PATH", "./country.mmdb"),
            querylog_path: path_or("QUERYLOG_PATH", "./querylog.jsonl"),
            sentry_dsn: optional("SENTRY_DSN").unwrap_or_else(|| "stderr".to_string()),
            ssl_key_log_file: optional("SSL_KEY_LOG_FILE").map(PathBuf::from),

            listen_addr: parse_or("LISTEN_ADDR", IpAddr::V4(Ipv4Addr::LOCALHOST))?,
            listen_port: parse_or("LISTEN_PORT", 8181)?,

            log_timestamp: strict_bool("LOG_TIMESTAMP", true)?,
            verbose: strict_bool("VERBOSE", false)?,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn required(name: &str) -> Result<String, Error> {
    optional(name).ok_or_else(|| Error::Config(format!("env {name} must be set")))
}

fn path_or(name: &str, default: &str) -> PathBuf {
    optional(name).map_or_else(|| PathBuf::from(default), PathBuf::from)
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, Error> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("env {name}: bad value {raw:?}"))),
    }
}

/// Strictly parses `"0"`/`"1"`; anything else is a configuration error.
fn strict_bool(name: &str, default: bool) -> Result<bool, Error> {
    match optional(name).as_deref() {
        None => Ok(default),
        Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(raw) => Err(Error::Config(format!(
            "env {name}: bad value {raw:?}, want \"0\" or \"1\"",
        ))),
    }
}
