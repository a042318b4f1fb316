//! Device ID detection.
//!
//! Clients of the encrypted protocols can tag their queries with a device ID,
//! either as the first label of the TLS server name (`dev.dns.example.com`
//! matched against the wildcard `*.dns.example.com`) or as a path component
//! of a DoH request (`/dns-query/dev`). The ID selects a [`Device`] record
//! and through it the profile to filter with.
//!
//! [`Device`]: crate::profile::Device

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::server::Protocol;

/// Maximum length of a device ID in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 8;

/// A short label identifying a client installation.
///
/// At most [`MAX_DEVICE_ID_LEN`] bytes, each an ASCII letter, a digit, or a
/// hyphen.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validates and wraps a device ID string.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError`] if the string is longer than
    /// [`MAX_DEVICE_ID_LEN`] bytes or contains a rune outside the DNS label
    /// grammar.
    pub fn new(s: &str) -> Result<Self, LabelError> {
        if s.len() > MAX_DEVICE_ID_LEN {
            return Err(LabelError::TooLong { got: s.len() });
        }

        for c in s.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' {
                return Err(LabelError::BadRune(c));
            }
        }

        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A violation of the device-ID label grammar.
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
pub enum LabelError {
    #[error("bad domain name label rune {0:?}")]
    BadRune(char),

    #[error("too long: got {got} bytes, max {max}", max = MAX_DEVICE_ID_LEN)]
    TooLong { got: usize },
}

/// Where the offending device ID came from, for error messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceIdSource {
    TlsServerName,
    HttpUrl,
}

impl fmt::Display for DeviceIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TlsServerName => f.write_str("tls server name"),
            Self::HttpUrl => f.write_str("http url"),
        }
    }
}

/// A failed device-ID check. Mapped to FORMERR by the pipeline.
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
#[error("{source_kind} device id check: {kind}")]
pub struct DeviceIdError {
    source_kind: DeviceIdSource,
    kind: DeviceIdErrorKind,
}

#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
enum DeviceIdErrorKind {
    #[error("bad device id {id:?}: {source}")]
    BadDeviceId { id: String, source: LabelError },

    #[error("bad path {path:?}")]
    BadPath { path: String },

    #[error("bad path {path:?}: extra parts")]
    ExtraParts { path: String },
}

/// Extracts the device ID for a query, if any.
///
/// For DoH the URL path is checked first and the TLS server name second; if
/// both carry an ID the path wins. For DoT and DoQ only the server name is
/// checked. Plain DNS and DNSCrypt never carry a device ID.
///
/// `wildcards` are the `*.<suffix>` patterns from the server group's TLS
/// configuration.
pub fn extract_device_id(
    proto: Protocol,
    tls_server_name: Option<&str>,
    url_path: Option<&str>,
    wildcards: &[String],
) -> Result<Option<DeviceId>, DeviceIdError> {
    if proto == Protocol::Https {
        if let Some(path) = url_path {
            if let Some(id) = device_id_from_path(path)? {
                if let Some(srv_name) = tls_server_name {
                    if let Ok(Some(sni_id)) = device_id_from_server_name(srv_name, wildcards) {
                        if sni_id != id {
                            tracing::debug!(
                                url_id = %id,
                                sni_id = %sni_id,
                                "device id mismatch between url and server name; using url",
                            );
                        }
                    }
                }

                return Ok(Some(id));
            }
        }
    }

    if !matches!(proto, Protocol::Tls | Protocol::Quic | Protocol::Https) {
        return Ok(None);
    }

    match tls_server_name {
        Some(srv_name) => device_id_from_server_name(srv_name, wildcards),
        None => Ok(None),
    }
}

/// Checks a DoH URL path for a device ID: `/dns-query/<id>[/]`. Bare
/// `/dns-query` and `/dns-query/` carry no ID.
fn device_id_from_path(path: &str) -> Result<Option<DeviceId>, DeviceIdError> {
    let bad_path = |kind| DeviceIdError {
        source_kind: DeviceIdSource::HttpUrl,
        kind,
    };

    let rest = match path.strip_prefix("/dns-query") {
        Some(rest) => rest,
        None => {
            return Err(bad_path(DeviceIdErrorKind::BadPath {
                path: path.to_string(),
            }));
        }
    };

    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let id = match parts.next() {
        Some(id) => id,
        None => return Ok(None),
    };

    if parts.next().is_some() {
        return Err(bad_path(DeviceIdErrorKind::ExtraParts {
            path: path.to_string(),
        }));
    }

    match DeviceId::new(id) {
        Ok(device_id) => Ok(Some(device_id)),
        Err(err) => Err(bad_path(DeviceIdErrorKind::BadDeviceId {
            id: id.to_string(),
            source: err,
        })),
    }
}

/// Checks a TLS server name against the device-ID wildcards. The server name
/// must consist of exactly one label prepended to a wildcard's suffix; a
/// deeper subdomain only yields an ID if a more specific wildcard matches it.
fn device_id_from_server_name(
    srv_name: &str,
    wildcards: &[String],
) -> Result<Option<DeviceId>, DeviceIdError> {
    let srv_name = srv_name.trim_end_matches('.').to_ascii_lowercase();

    for wildcard in wildcards {
        let suffix = match wildcard.strip_prefix('*') {
            // `*.dns.example.com` keeps the leading dot, so a bare
            // `dns.example.com` never matches.
            Some(suffix) => suffix,
            None => continue,
        };

        let label = match srv_name.strip_suffix(suffix) {
            Some(label) => label,
            None => continue,
        };

        if label.is_empty() || label.contains('.') {
            continue;
        }

        return match DeviceId::new(label) {
            Ok(id) => Ok(Some(id)),
            Err(err) => Err(DeviceIdError {
                source_kind: DeviceIdSource::TlsServerName,
                kind: DeviceIdErrorKind::BadDeviceId {
                    id: label.to_string(),
                    source: err,
                },
            }),
        };
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcards(ws: &[&str]) -> Vec<String> {
        ws.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn server_name_cases() {
        let cases: &[(&str, &[&str], Option<&str>, Option<&str>)] = &[
            // (server name, wildcards, want id, want error)
            ("", &["*.dns.example.com"], None, None),
            ("dns.example.com", &["*.dns.example.com"], None, None),
            ("dev.dns.example.com", &["*.dns.example.com"], Some("dev"), None),
            ("abc.def.dns.example.com", &["*.dns.example.com"], None, None),
            ("dev.mydns.example.com", &["*.dns.example.com"], None, None),
            (
                "!!!.dns.example.com",
                &["*.dns.example.com"],
                None,
                Some(
                    "tls server name device id check: bad device id \"!!!\": \
                     bad domain name label rune '!'",
                ),
            ),
            (
                "dev.sub.dns.example.com",
                &["*.dns.example.com", "*.sub.dns.example.com"],
                Some("dev"),
                None,
            ),
        ];

        for &(srv_name, ws, want_id, want_err) in cases {
            let got = extract_device_id(Protocol::Tls, Some(srv_name), None, &wildcards(ws));
            match want_err {
                Some(msg) => {
                    assert_eq!(got.unwrap_err().to_string(), msg, "server name {srv_name:?}");
                }
                None => {
                    let got = got.unwrap();
                    assert_eq!(
                        got.as_ref().map(DeviceId::as_str),
                        want_id,
                        "server name {srv_name:?}",
                    );
                }
            }
        }
    }

    #[test]
    fn server_name_too_long() {
        let long_id = "abcdefghijklmnopqrstuvwxyz0123456789\
                       abcdefghijklmnopqrstuvwxyz0123456789";
        let srv_name = format!("{long_id}.dns.example.com");

        let err = extract_device_id(
            Protocol::Tls,
            Some(&srv_name),
            None,
            &wildcards(&["*.dns.example.com"]),
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            format!(
                "tls server name device id check: bad device id {long_id:?}: \
                 too long: got 72 bytes, max 8",
            ),
        );
    }

    #[test]
    fn udp_has_no_device_id() {
        let got = extract_device_id(Protocol::DnsUdp, Some("dev.dns.example.com"), None, &[]);
        assert_eq!(got.unwrap(), None);
    }

    #[test]
    fn https_path_cases() {
        let cases: &[(&str, Option<&str>, Option<&str>)] = &[
            ("/dns-query", None, None),
            ("/dns-query/", None, None),
            ("/dns-query/cli", Some("cli"), None),
            ("/dns-query/cli/", Some("cli"), None),
            ("/foo", None, Some("http url device id check: bad path \"/foo\"")),
            (
                "/dns-query/cli/foo",
                None,
                Some("http url device id check: bad path \"/dns-query/cli/foo\": extra parts"),
            ),
            (
                "/dns-query/!!!",
                None,
                Some(
                    "http url device id check: bad device id \"!!!\": \
                     bad domain name label rune '!'",
                ),
            ),
        ];

        for &(path, want_id, want_err) in cases {
            let got = extract_device_id(Protocol::Https, None, Some(path), &[]);
            match want_err {
                Some(msg) => assert_eq!(got.unwrap_err().to_string(), msg, "path {path:?}"),
                None => assert_eq!(
                    got.unwrap().as_ref().map(DeviceId::as_str),
                    want_id,
                    "path {path:?}",
                ),
            }
        }
    }

    #[test]
    fn https_falls_back_to_server_name() {
        let got = extract_device_id(
            Protocol::Https,
            Some("dev.dns.example.com"),
            Some("/dns-query"),
            &wildcards(&["*.dns.example.com"]),
        );
        assert_eq!(got.unwrap().unwrap().as_str(), "dev");
    }

    #[test]
    fn exactly_max_len_accepted() {
        assert!(DeviceId::new("abcd1234").is_ok());
        let err = DeviceId::new("abcd12345").unwrap_err();
        assert_eq!(err.to_string(), "too long: got 9 bytes, max 8");
    }
}
