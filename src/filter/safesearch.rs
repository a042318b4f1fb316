//! Safe-search rewrite tables.
//!
//! Sourced from CSV files of `host,replacement` pairs. A replacement that
//! parses as an IP address becomes a synthesized A/AAAA answer; otherwise
//! the response carries a CNAME to the replacement host and the client
//! re-resolves. One table exists for general search engines and one for
//! YouTube.

use std::collections::HashMap;
use std::net::IpAddr;

/// Where a rewritten query should point instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Rewrite {
    /// Answer with a CNAME to this host.
    Host(String),
    /// Answer with these addresses directly.
    Addrs(Vec<IpAddr>),
}

/// A compiled safe-search table.
#[derive(Debug, Default)]
pub struct SafeSearch {
    hosts: HashMap<String, String>,
    addrs: HashMap<String, Vec<IpAddr>>,
}

impl SafeSearch {
    /// Parses the CSV source. Unparseable lines are skipped with a log
    /// line; an imperfect upstream table should not take safe search down.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((host, replacement)) = line.split_once(',') else {
                tracing::debug!(line, "skipping bad safe search line");
                continue;
            };
            let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
            let replacement = replacement.trim().trim_end_matches('.');

            if let Ok(addr) = replacement.parse::<IpAddr>() {
                table.addrs.entry(host).or_default().push(addr);
            } else {
                table
                    .hosts
                    .insert(host, replacement.to_ascii_lowercase());
            }
        }

        table
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.addrs.is_empty()
    }

    /// The rewrite for `host`, if the table covers it or a parent domain.
    pub fn rewrite_for(&self, host: &str) -> Option<Rewrite> {
        let mut suffix = host;
        loop {
            if let Some(addrs) = self.addrs.get(suffix) {
                return Some(Rewrite::Addrs(addrs.clone()));
            }
            if let Some(replacement) = self.hosts.get(suffix) {
                return Some(Rewrite::Host(replacement.clone()));
            }

            match suffix.find('.') {
                Some(pos) => suffix = &suffix[pos + 1..],
                None => return None,
            }
        }
    }
}
