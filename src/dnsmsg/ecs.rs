//! EDNS Client Subnet (ECS) handling.
//!
//! The ECS option is parsed and validated strictly at this boundary: only
//! the IPv4 and IPv6 address families are accepted, and the supplied address
//! must not have any bits set beyond `source_netmask`. Sloppy ECS payloads
//! are a known amplification vector, so violations are rejected as FORMERR
//! instead of being silently masked.
//!
//! See <https://datatracker.ietf.org/doc/html/rfc7871>.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use trust_dns_proto::op::{Edns, Message};
use trust_dns_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

use crate::error::Error;

/// The EDNS option code of the Client Subnet option.
const ECS_OPTION_CODE: u16 = 8;

const FAMILY_IPV4: u16 = 1;
const FAMILY_IPV6: u16 = 2;

/// A parsed EDNS Client Subnet option.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EcsOption {
    /// The client subnet, already masked.
    pub subnet: IpNetwork,
    /// The scope prefix length, echoed back to the client unchanged unless
    /// the pipeline rewrites the answer.
    pub scope: u8,
}

/// Returns the ECS option of `msg`, if any.
///
/// # Errors
///
/// Returns [`Error::MalformedEcs`] if the option is present but violates
/// RFC 7871: unsupported address family, bad netmask, or address bits set
/// beyond the prefix.
pub fn ecs_from_msg(msg: &Message) -> Result<Option<EcsOption>, Error> {
    let opt = match msg.edns() {
        Some(edns) => edns.options(),
        None => return Ok(None),
    };

    let data = match opt.get(EdnsCode::Subnet) {
        Some(EdnsOption::Unknown(ECS_OPTION_CODE, data)) => data.as_slice(),
        Some(_) | None => return Ok(None),
    };

    parse_ecs_data(data).map(Some)
}

fn parse_ecs_data(data: &[u8]) -> Result<EcsOption, Error> {
    if data.len() < 4 {
        return Err(Error::MalformedEcs(format!(
            "option too short: {} bytes",
            data.len(),
        )));
    }

    let family = u16::from_be_bytes([data[0], data[1]]);
    let source_netmask = data[2];
    let scope = data[3];
    let addr_bytes = &data[4..];

    let (addr, max_prefix) = match family {
        FAMILY_IPV4 => {
            if addr_bytes.len() > 4 {
                return Err(Error::MalformedEcs("bad ecs ip addr".into()));
            }

            let mut octets = [0; 4];
            octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
            (IpAddr::V4(Ipv4Addr::from(octets)), 32)
        }
        FAMILY_IPV6 => {
            if addr_bytes.len() > 16 {
                return Err(Error::MalformedEcs("bad ecs ip addr".into()));
            }

            let mut octets = [0; 16];
            octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
            (IpAddr::V6(Ipv6Addr::from(octets)), 128)
        }
        fam => {
            return Err(Error::MalformedEcs(format!(
                "unsupported addr family number {fam}",
            )));
        }
    };

    if source_netmask > max_prefix {
        return Err(Error::MalformedEcs(format!(
            "bad src netmask {source_netmask} for addr family {family}",
        )));
    }

    let masked = mask_addr(addr, source_netmask);
    if masked.ip() != addr {
        return Err(Error::MalformedEcs(format!(
            "ip {addr} has non-zero bits beyond prefix {source_netmask}",
        )));
    }

    Ok(EcsOption {
        subnet: masked,
        scope,
    })
}

/// Inserts or replaces the ECS option of `msg` with `subnet` and `scope`,
/// creating the EDNS pseudosection if needed. The address field is encoded
/// in the minimal `ceil(prefix / 8)` bytes per RFC 7871.
pub fn set_ecs(msg: &mut Message, subnet: IpNetwork, scope: u8) {
    let prefix = subnet.prefix();
    let addr_len = usize::from(prefix).div_ceil(8);

    let mut data = Vec::with_capacity(4 + addr_len);
    let family = match subnet {
        IpNetwork::V4(_) => FAMILY_IPV4,
        IpNetwork::V6(_) => FAMILY_IPV6,
    };
    data.extend_from_slice(&family.to_be_bytes());
    data.push(prefix);
    data.push(scope);
    match subnet.ip() {
        IpAddr::V4(ip) => data.extend_from_slice(&ip.octets()[..addr_len]),
        IpAddr::V6(ip) => data.extend_from_slice(&ip.octets()[..addr_len]),
    }

    let mut edns = msg.edns().cloned().unwrap_or_else(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(super::DEFAULT_EDNS_UDP_SIZE);
        edns
    });
    edns.options_mut()
        .insert(EdnsOption::Unknown(ECS_OPTION_CODE, data));
    msg.set_edns(edns);
}

/// Masks `addr` down to `prefix` bits, yielding the canonical subnet used as
/// a rate-limiter or cache key. The prefix is clamped to the family maximum.
pub fn mask_addr(addr: IpAddr, prefix: u8) -> IpNetwork {
    match addr {
        IpAddr::V4(ip) => {
            let prefix = prefix.min(32);
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            let masked = Ipv4Addr::from(u32::from(ip) & mask);
            // NB: unwrap is safe: the prefix is clamped to 32 above.
            IpNetwork::V4(Ipv4Network::new(masked, prefix).unwrap())
        }
        IpAddr::V6(ip) => {
            let prefix = prefix.min(128);
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            let masked = Ipv6Addr::from(u128::from(ip) & mask);
            // NB: unwrap is safe: the prefix is clamped to 128 above.
            IpNetwork::V6(Ipv6Network::new(masked, prefix).unwrap())
        }
    }
}

/// The subnet key for a client address: the address masked by the
/// per-family key prefix length.
pub fn subnet_for_addr(addr: IpAddr, v4_prefix: u8, v6_prefix: u8) -> IpNetwork {
    match addr {
        IpAddr::V4(_) => mask_addr(addr, v4_prefix),
        IpAddr::V6(_) => mask_addr(addr, v6_prefix),
    }
}
