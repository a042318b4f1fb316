//! Transport servers.
//!
//! One server binds one protocol to a list of addresses and feeds decoded
//! queries into the shared pipeline. Every accepted query runs in its own
//! task: one per UDP datagram, one per framed TCP/TLS message, one per
//! QUIC stream, one per HTTP request, one per DNSCrypt datagram.

pub mod dnscrypt;
pub mod https;
pub mod quic;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use trust_dns_proto::rr::rdata::svcb::{Alpn, IpHint, SvcParamKey, SvcParamValue, SVCB};
use trust_dns_proto::rr::Name;

use crate::config::{CertificatePair, DdrConfig, DdrRecordTemplate, ServerGroupConfig};
use crate::error::Error;
use crate::profile::FilteringGroup;

/// The protocol tag of a server, also the wire name used in configuration
/// and the query log.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
pub enum Protocol {
    #[serde(rename = "dns-udp")]
    DnsUdp,
    #[serde(rename = "dns-tcp")]
    DnsTcp,
    #[serde(rename = "tls")]
    Tls,
    #[serde(rename = "https")]
    Https,
    #[serde(rename = "quic")]
    Quic,
    #[serde(rename = "dnscrypt")]
    DnsCrypt,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::DnsUdp => "dns-udp",
            Self::DnsTcp => "dns-tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Quic => "quic",
            Self::DnsCrypt => "dnscrypt",
        };
        f.write_str(tag)
    }
}

/// What a transport learned about the client before the pipeline runs.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    /// The SNI of the TLS handshake, for DoT/DoQ/DoH.
    pub tls_server_name: Option<String>,
    /// The URL path of the request, for DoH.
    pub url_path: Option<String>,
}

impl ClientInfo {
    pub fn plain(addr: SocketAddr) -> Self {
        Self {
            addr,
            tls_server_name: None,
            url_path: None,
        }
    }
}

/// Discovery of Designated Resolvers state, with the SVCB answers prebuilt
/// from the configured templates.
pub struct DdrRuntime {
    pub enabled: bool,
    pub device_records: Vec<SVCB>,
    pub public_records: Vec<SVCB>,
    pub record_ttl: u32,
}

impl DdrRuntime {
    fn from_config(conf: &DdrConfig) -> Result<Self, Error> {
        Ok(Self {
            enabled: conf.enabled,
            device_records: build_svcb_templates(&conf.device_records)?,
            public_records: build_svcb_templates(&conf.public_records)?,
            record_ttl: 60,
        })
    }
}

fn build_svcb_templates(templates: &[DdrRecordTemplate]) -> Result<Vec<SVCB>, Error> {
    templates
        .iter()
        .map(|tmpl| {
            let mut target = Name::from_ascii(&tmpl.target)
                .map_err(|err| Error::Config(format!("ddr target {:?}: {err}", tmpl.target)))?;
            target.set_fqdn(true);

            let mut params = Vec::new();
            if !tmpl.alpns.is_empty() {
                params.push((
                    SvcParamKey::Alpn,
                    SvcParamValue::Alpn(Alpn(tmpl.alpns.clone())),
                ));
            }
            if let Some(port) = tmpl.port {
                params.push((SvcParamKey::Port, SvcParamValue::Port(port)));
            }
            if !tmpl.ipv4_hints.is_empty() {
                params.push((
                    SvcParamKey::Ipv4Hint,
                    SvcParamValue::Ipv4Hint(IpHint(tmpl.ipv4_hints.clone())),
                ));
            }
            if !tmpl.ipv6_hints.is_empty() {
                params.push((
                    SvcParamKey::Ipv6Hint,
                    SvcParamValue::Ipv6Hint(IpHint(tmpl.ipv6_hints.clone())),
                ));
            }

            Ok(SVCB::new(tmpl.priority, target, params))
        })
        .collect()
}

/// A server group resolved for runtime: its filtering group inlined, DDR
/// answers prebuilt, and TLS material loadable per protocol.
pub struct ServerGroup {
    pub name: String,
    pub filtering_group: FilteringGroup,
    pub device_id_wildcards: Vec<String>,
    pub ddr: DdrRuntime,
    certificates: Vec<CertificatePair>,
    pub servers: Vec<crate::config::ServerConfig>,
}

impl ServerGroup {
    /// Resolves a configured group against the filtering groups.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for dangling references or bad DDR
    /// templates.
    pub fn from_config(
        conf: &ServerGroupConfig,
        groups: &[FilteringGroup],
    ) -> Result<Self, Error> {
        let filtering_group = groups
            .iter()
            .find(|g| g.id.0 == conf.filtering_group)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "server group {:?}: unknown filtering group {:?}",
                    conf.name, conf.filtering_group,
                ))
            })?;

        let (device_id_wildcards, certificates) = match &conf.tls {
            Some(tls) => (tls.device_id_wildcards.clone(), tls.certificates.clone()),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            name: conf.name.clone(),
            filtering_group,
            device_id_wildcards,
            ddr: DdrRuntime::from_config(&conf.ddr)?,
            certificates,
            servers: conf.servers.clone(),
        })
    }

    /// True when the group carries TLS certificates.
    pub fn has_tls(&self) -> bool {
        !self.certificates.is_empty()
    }

    /// Builds a rustls server configuration with the group's certificates
    /// and the given ALPN protocols.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the group has no TLS material or it
    /// does not load.
    pub fn tls_config(&self, alpn: &[&[u8]]) -> Result<Arc<rustls::ServerConfig>, Error> {
        let pair = self.certificates.first().ok_or_else(|| {
            Error::Config(format!("server group {:?}: no tls certificates", self.name))
        })?;
        if self.certificates.len() > 1 {
            tracing::warn!(
                group = %self.name,
                "multiple certificate pairs configured, using the first",
            );
        }

        let certs = load_certs(pair)?;
        let key = load_key(pair)?;

        let mut config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| Error::Config(format!("tls for group {:?}: {err}", self.name)))?;
        config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
        config.key_log = Arc::new(rustls::KeyLogFile::new());

        Ok(Arc::new(config))
    }
}

fn load_certs(pair: &CertificatePair) -> Result<Vec<rustls::Certificate>, Error> {
    let mut reader = BufReader::new(File::open(&pair.certificate)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates in {}",
            pair.certificate.display(),
        )));
    }

    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_key(pair: &CertificatePair) -> Result<rustls::PrivateKey, Error> {
    let mut reader = BufReader::new(File::open(&pair.key)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(&pair.key)?);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    }

    keys.pop()
        .map(rustls::PrivateKey)
        .ok_or_else(|| Error::Config(format!("no private key in {}", pair.key.display())))
}

/// The DDR query name.
pub fn ddr_name() -> Name {
    // NB: unwrap is safe: the name is a constant.
    Name::from_str("_dns.resolver.arpa.").unwrap()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn protocol_tags_roundtrip() {
        for (tag, proto) in [
            ("dns-udp", Protocol::DnsUdp),
            ("dns-tcp", Protocol::DnsTcp),
            ("tls", Protocol::Tls),
            ("https", Protocol::Https),
            ("quic", Protocol::Quic),
            ("dnscrypt", Protocol::DnsCrypt),
        ] {
            let parsed: Protocol = serde_yaml::from_str(tag).unwrap();
            assert_eq!(parsed, proto);
            assert_eq!(proto.to_string(), tag);
        }
    }

    #[test]
    fn ddr_templates_build() {
        let conf = DdrConfig {
            enabled: true,
            device_domains: vec!["d.dns.example.com".to_string()],
            public_domains: vec!["dns.example.com".to_string()],
            device_records: vec![],
            public_records: vec![DdrRecordTemplate {
                priority: 1,
                target: "dns.example.com".to_string(),
                alpns: vec!["h2".to_string(), "h3".to_string()],
                port: Some(443),
                ipv4_hints: vec![Ipv4Addr::new(94, 140, 14, 14)],
                ipv6_hints: vec![],
            }],
        };

        let ddr = DdrRuntime::from_config(&conf).unwrap();
        assert!(ddr.enabled);
        assert_eq!(ddr.public_records.len(), 1);

        let record = &ddr.public_records[0];
        assert_eq!(record.svc_priority(), 1);
        assert_eq!(record.target_name().to_string(), "dns.example.com.");
        assert_eq!(record.svc_params().len(), 3);
    }
}
