//! Error types.

use std::net::SocketAddr;

use trust_dns_proto::error::ProtoError;

use crate::deviceid::DeviceIdError;

/// Error enumerates the failure states of the query-handling data plane and
/// the services around it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when an inbound packet cannot be decoded as a DNS message.
    /// Mapped to FORMERR by the pipeline.
    #[error("malformed message: {0}")]
    MalformedMessage(#[source] ProtoError),

    /// Returned when a message carries an EDNS Client Subnet option that
    /// violates RFC 7871, e.g. an unsupported address family or address bits
    /// set beyond the source netmask. Mapped to FORMERR.
    #[error("bad ecs: {0}")]
    MalformedEcs(String),

    /// Returned when the TLS server name or DoH URL path carries something
    /// that is not a valid device ID. Mapped to FORMERR.
    #[error(transparent)]
    BadDeviceId(#[from] DeviceIdError),

    /// Returned when the client's subnet is over its query budget. `jailed`
    /// is true once the subnet has entered back-off. Rate-limited queries
    /// are dropped on UDP and close the stream on TCP/TLS/QUIC.
    #[error("rate limited (jailed: {jailed})")]
    RateLimited { jailed: bool },

    /// Returned when the upstream (and every fallback) failed to answer
    /// within its timeout. Mapped to SERVFAIL.
    #[error("upstream timeout: {upstream}")]
    UpstreamTimeout { upstream: SocketAddr },

    /// Returned on a network-level upstream failure, after fallbacks are
    /// exhausted. Mapped to SERVFAIL.
    #[error("upstream network error: {0}")]
    UpstreamNetwork(#[source] std::io::Error),

    /// Returned when a downloaded filter list cannot be compiled. Refreshes
    /// keep the previous compiled version of the offending list.
    #[error("compiling filter list {id:?}: {reason}")]
    FilterCompile { id: String, reason: String },

    /// Returned when a filter list, safe-search table, or service index
    /// cannot be fetched. Refreshes keep the previous snapshot.
    #[error("fetching {url}: {source}")]
    FilterFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Returned when configuration is structurally valid but semantically
    /// wrong, e.g. a non-positive refresh interval.
    #[error("configuration: {0}")]
    Config(String),

    /// Returned when a DNSCrypt query fails to decrypt or is otherwise not
    /// a valid DNSCrypt packet. Such datagrams are dropped.
    #[error("dnscrypt: {0}")]
    DnsCrypt(String),

    /// Returned for a generic IO failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else. Mapped to SERVFAIL; the collector payload carries the
    /// request ID.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// True if the error should be reported at debug level rather than
    /// warn/error: client-induced malformed input is routine on a public
    /// resolver.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::MalformedEcs(_)
                | Error::BadDeviceId(_)
                | Error::DnsCrypt(_)
        )
    }
}
