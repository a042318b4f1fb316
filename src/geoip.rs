//! GeoIP resolution interface.
//!
//! The MMDB-backed implementation lives outside the data plane; queries
//! only depend on this trait to tag query-log entries with countries and
//! ASNs.

use std::net::IpAddr;

/// An ISO 3166-1 alpha-2 country code.
pub type Country = String;

/// An autonomous system number.
pub type Asn = u32;

/// Resolves addresses and hostnames to location data. Implementations must
/// be cheap and non-blocking; lookups sit on the query-log path.
pub trait GeoIp: Send + Sync {
    fn country_for_addr(&self, addr: IpAddr) -> Option<Country>;

    fn asn_for_addr(&self, addr: IpAddr) -> Option<Asn>;
}

/// A GeoIP resolver that knows nothing; used when the MMDB files are not
/// configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyGeoIp;

impl GeoIp for EmptyGeoIp {
    fn country_for_addr(&self, _addr: IpAddr) -> Option<Country> {
        None
    }

    fn asn_for_addr(&self, _addr: IpAddr) -> Option<Asn> {
        None
    }
}
