//! Rule-list parsing and matching.
//!
//! The accepted syntax is the common ad-block subset:
//!
//! * `||host^` blocks `host` and its subdomains.
//! * `@@||host^` is the matching exception form.
//! * `/regex/` blocks hosts matching the regular expression.
//! * Bare `host` lines (hosts-list style) behave like `||host^`.
//! * `$client=<cidr>[|<cidr>...]` restricts a rule to client subnets.
//! * `$denyallow=<domain>[|<domain>...]` exempts domains from a rule.
//! * Lines starting with `!` or `#` are comments.
//!
//! Evaluation order is the file order, with exception rules taking
//! precedence over block rules whenever both match.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::error::Error;
use crate::profile::FilterListId;

/// One parsed rule.
#[derive(Debug)]
pub struct Rule {
    /// The original rule text, recalled in logs and the query log.
    pub text: String,
    pub exception: bool,
    pattern: Pattern,
    /// Client subnets the rule is restricted to; empty means everyone.
    clients: Vec<IpNetwork>,
    /// Domains exempted from the rule.
    deny_allow: Vec<String>,
}

#[derive(Debug)]
enum Pattern {
    /// `host` and any subdomain of it.
    Domain(String),
    Regex(regex::Regex),
}

impl Rule {
    /// Parses one line. Returns `None` for comments and blanks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilterCompile`] for lines that look like rules but
    /// do not parse, e.g. a broken regex or a bad `$client` CIDR.
    pub fn parse(list_id: &FilterListId, line: &str) -> Result<Option<Self>, Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
            return Ok(None);
        }

        let text = line.to_string();
        let (line, exception) = match line.strip_prefix("@@") {
            Some(rest) => (rest, true),
            None => (line, false),
        };

        let (body, modifiers) = match line.rsplit_once('$') {
            // A `$` inside a regex body is not a modifier separator.
            Some((body, modifiers)) if !line.starts_with('/') => (body, Some(modifiers)),
            _ => (line, None),
        };

        let mut clients = Vec::new();
        let mut deny_allow = Vec::new();
        if let Some(modifiers) = modifiers {
            for modifier in modifiers.split(',') {
                if let Some(value) = modifier.strip_prefix("client=") {
                    for part in value.split('|') {
                        let net = parse_client_cidr(part).map_err(|reason| {
                            Error::FilterCompile {
                                id: list_id.0.clone(),
                                reason: format!("rule {text:?}: {reason}"),
                            }
                        })?;
                        clients.push(net);
                    }
                } else if let Some(value) = modifier.strip_prefix("denyallow=") {
                    deny_allow.extend(
                        value
                            .split('|')
                            .map(|d| d.trim_matches('.').to_ascii_lowercase()),
                    );
                } else {
                    // Unknown modifiers are tolerated so a list with a few
                    // exotic rules still loads.
                    tracing::debug!(rule = %text, modifier, "ignoring unknown rule modifier");
                }
            }
        }

        let pattern = if let Some(re) = body.strip_prefix('/').and_then(|b| b.strip_suffix('/')) {
            let re = regex::Regex::new(re).map_err(|err| Error::FilterCompile {
                id: list_id.0.clone(),
                reason: format!("rule {text:?}: bad regex: {err}"),
            })?;
            Pattern::Regex(re)
        } else {
            let anchored = body.strip_prefix("||").unwrap_or(body);
            let host = anchored.strip_suffix('^').unwrap_or(anchored);
            let host = host.trim_matches('.').to_ascii_lowercase();
            if host.is_empty() {
                return Err(Error::FilterCompile {
                    id: list_id.0.clone(),
                    reason: format!("rule {text:?}: empty host"),
                });
            }

            Pattern::Domain(host)
        };

        Ok(Some(Self {
            text,
            exception,
            pattern,
            clients,
            deny_allow,
        }))
    }

    /// True if the rule applies to `host` queried by `client`.
    fn matches(&self, host: &str, client: Option<IpAddr>) -> bool {
        if !self.clients.is_empty() {
            let Some(client) = client else { return false };
            if !self.clients.iter().any(|net| net.contains(client)) {
                return false;
            }
        }

        if self
            .deny_allow
            .iter()
            .any(|domain| host_in_domain(host, domain))
        {
            return false;
        }

        match &self.pattern {
            Pattern::Domain(domain) => host_in_domain(host, domain),
            Pattern::Regex(re) => re.is_match(host),
        }
    }
}

fn parse_client_cidr(s: &str) -> Result<IpNetwork, String> {
    if let Ok(net) = IpNetwork::from_str(s) {
        return Ok(net);
    }

    s.parse::<IpAddr>()
        .map(IpNetwork::from)
        .map_err(|_| format!("bad client cidr {s:?}"))
}

/// True if `host` equals `domain` or is a subdomain of it.
pub fn host_in_domain(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// A compiled rule list. Domain rules are indexed for the subdomain walk;
/// regex rules are scanned linearly.
#[derive(Debug)]
pub struct RuleList {
    pub id: FilterListId,
    rules: Vec<Rule>,
    domain_index: HashMap<String, Vec<usize>>,
    regex_rules: Vec<usize>,
}

impl RuleList {
    /// Compiles `text` into a rule list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilterCompile`] on the first unparseable rule; a
    /// list either compiles whole or keeps its previous compiled version.
    pub fn compile(id: FilterListId, text: &str) -> Result<Self, Error> {
        let mut rules = Vec::new();
        for line in text.lines() {
            if let Some(rule) = Rule::parse(&id, line)? {
                rules.push(rule);
            }
        }

        Ok(Self::from_parsed(id, rules))
    }

    /// Builds a list from already parsed rules; used for profiles' custom
    /// rules where bad lines are skipped instead of failing the compile.
    pub fn from_parsed(id: FilterListId, rules: Vec<Rule>) -> Self {
        let mut domain_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut regex_rules = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            match &rule.pattern {
                Pattern::Domain(domain) => domain_index.entry(domain.clone()).or_default().push(i),
                Pattern::Regex(_) => regex_rules.push(i),
            }
        }

        Self {
            id,
            rules,
            domain_index,
            regex_rules,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first rule deciding `host`, with exceptions beating blocks.
    ///
    /// Candidates are gathered from the domain index by walking the host's
    /// parent domains, plus any matching regex rules; among them the
    /// earliest exception wins, then the earliest block.
    pub fn match_host(&self, host: &str, client: Option<IpAddr>) -> Option<&Rule> {
        let mut candidates: Vec<usize> = Vec::new();

        let mut suffix = host;
        loop {
            if let Some(idxs) = self.domain_index.get(suffix) {
                candidates.extend(idxs.iter().copied());
            }
            match suffix.find('.') {
                Some(pos) => suffix = &suffix[pos + 1..],
                None => break,
            }
        }
        candidates.extend(self.regex_rules.iter().copied());

        candidates.sort_unstable();

        let mut block: Option<&Rule> = None;
        for idx in candidates {
            let rule = &self.rules[idx];
            if !rule.matches(host, client) {
                continue;
            }

            if rule.exception {
                return Some(rule);
            }
            if block.is_none() {
                block = Some(rule);
            }
        }

        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(text: &str) -> RuleList {
        RuleList::compile(FilterListId("test".to_string()), text).unwrap()
    }

    #[test]
    fn domain_rule_blocks_subdomains() {
        let rl = list("||blocked.example.com^\n");

        assert!(rl.match_host("blocked.example.com", None).is_some());
        assert!(rl.match_host("sub.blocked.example.com", None).is_some());
        assert!(rl.match_host("example.com", None).is_none());
        assert!(rl.match_host("notblocked.example.com", None).is_none());
    }

    #[test]
    fn bare_host_behaves_like_domain_rule() {
        let rl = list("ads.example.net\n");

        assert!(rl.match_host("ads.example.net", None).is_some());
        assert!(rl.match_host("x.ads.example.net", None).is_some());
    }

    #[test]
    fn exception_beats_block() {
        let rl = list("||example.com^\n@@||allowed.example.com^\n");

        let blocked = rl.match_host("example.com", None).unwrap();
        assert!(!blocked.exception);

        let allowed = rl.match_host("allowed.example.com", None).unwrap();
        assert!(allowed.exception);
        assert_eq!(allowed.text, "@@||allowed.example.com^");
    }

    #[test]
    fn exception_wins_regardless_of_order() {
        let rl = list("@@||allowed.example.com^\n||example.com^\n");
        assert!(rl.match_host("allowed.example.com", None).unwrap().exception);
    }

    #[test]
    fn regex_rule() {
        let rl = list("/^ads[0-9]+\\./\n");

        assert!(rl.match_host("ads1.example.com", None).is_some());
        assert!(rl.match_host("ads.example.com", None).is_none());
    }

    #[test]
    fn bad_regex_fails_compile() {
        let err = RuleList::compile(FilterListId("test".to_string()), "/[/\n").unwrap_err();
        assert!(matches!(err, Error::FilterCompile { .. }));
    }

    #[test]
    fn client_modifier_restricts() {
        let rl = list("||blocked-client.example.com^$client=1.2.3.0/24\n");

        let in_net: IpAddr = "1.2.3.4".parse().unwrap();
        let out_net: IpAddr = "5.6.7.8".parse().unwrap();

        assert!(rl
            .match_host("blocked-client.example.com", Some(in_net))
            .is_some());
        assert!(rl
            .match_host("blocked-client.example.com", Some(out_net))
            .is_none());
        assert!(rl.match_host("blocked-client.example.com", None).is_none());
    }

    #[test]
    fn denyallow_exempts() {
        let rl = list("||example.com^$denyallow=ok.example.com\n");

        assert!(rl.match_host("bad.example.com", None).is_some());
        assert!(rl.match_host("ok.example.com", None).is_none());
        assert!(rl.match_host("sub.ok.example.com", None).is_none());
    }

    #[test]
    fn comments_are_skipped() {
        let rl = list("! a comment\n# another\n\n||x.example.com^\n");
        assert_eq!(rl.len(), 1);
    }
}
