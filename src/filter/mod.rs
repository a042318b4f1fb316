//! The filtering engine.
//!
//! All compiled rule state lives in an immutable [`Snapshot`] behind an
//! atomic pointer. The storage refresher builds a whole new snapshot and
//! publishes it with one swap; queries load the pointer once and keep their
//! snapshot for the query's duration, so readers never observe a half-built
//! matcher and evaluation is idempotent per snapshot.
//!
//! Request evaluation order:
//!
//! 1. devices with filtering disabled pass everything through;
//! 2. the profile's custom rules;
//! 3. blocked services (and Private Relay, when the group blocks it);
//! 4. YouTube safe search, then general safe search;
//! 5. safe browsing and adult blocking;
//! 6. the filtering group's rule lists, in configured order.
//!
//! Exception (`@@`) rules beat block rules at every step, and an exception
//! ends the evaluation: a host explicitly allowed by the profile's custom
//! rules is not re-blocked by a group list.

pub mod rules;
pub mod safesearch;
pub mod storage;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use arc_swap::ArcSwap;
use lru::LruCache;
use parking_lot::Mutex;
use trust_dns_proto::op::Message;
use trust_dns_proto::rr::{RData, RecordType};

use crate::profile::{Device, FilterListId, FilteringGroup, Profile};

pub use rules::RuleList;
pub use safesearch::{Rewrite, SafeSearch};

/// List IDs for the built-in filters, used in logs and the query log.
pub const CUSTOM_LIST_ID: &str = "custom";
pub const BLOCKED_SERVICE_LIST_ID: &str = "blocked_service";
pub const PRIVATE_RELAY_LIST_ID: &str = "block_private_relay";
pub const GENERAL_SAFE_SEARCH_LIST_ID: &str = "general_safe_search";
pub const YOUTUBE_SAFE_SEARCH_LIST_ID: &str = "youtube_safe_search";
pub const SAFE_BROWSING_LIST_ID: &str = "safe_browsing";
pub const ADULT_BLOCKING_LIST_ID: &str = "adult_blocking";

/// Domains used by iCloud Private Relay; blocking them disables the relay.
const PRIVATE_RELAY_DOMAINS: &[&str] = &["mask.icloud.com", "mask-h2.icloud.com"];

/// The filtering verdict for a request or response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// No rule matched.
    Pass,
    /// An exception rule explicitly allowed the query.
    Allow { list: FilterListId, rule: String },
    /// A block rule matched; synthesize a blocked response.
    Block { list: FilterListId, rule: String },
    /// Rewrite the answer (safe search, safe browsing, adult blocking).
    Rewrite {
        list: FilterListId,
        rule: String,
        rewrite: Rewrite,
    },
}

impl Action {
    pub fn is_pass(&self) -> bool {
        matches!(self, Action::Pass)
    }
}

/// Everything the engine needs to know about one query.
#[derive(Clone, Copy)]
pub struct FilterContext<'a> {
    /// Lowercased host without the trailing dot.
    pub host: &'a str,
    pub qtype: RecordType,
    pub client: Option<IpAddr>,
    pub device: Option<&'a Device>,
    pub profile: Option<&'a Profile>,
    pub group: &'a FilteringGroup,
}

impl<'a> FilterContext<'a> {
    fn flag(&self, profile_flag: impl Fn(&Profile) -> Option<bool>, group_flag: bool) -> bool {
        self.profile.and_then(profile_flag).unwrap_or(group_flag)
    }
}

/// An immutable compiled view of all current filter rules.
#[derive(Default)]
pub struct Snapshot {
    pub rule_lists: HashMap<FilterListId, Arc<RuleList>>,
    pub blocked_services: HashMap<crate::profile::BlockedServiceId, Arc<RuleList>>,
    pub general_safe_search: SafeSearch,
    pub youtube_safe_search: SafeSearch,
    pub safe_browsing: Option<Arc<RuleList>>,
    pub adult_blocking: Option<Arc<RuleList>>,
    pub safe_browsing_block_host: String,
    pub adult_blocking_block_host: String,
}

impl Snapshot {
    /// Filters the request phase of a query.
    ///
    /// `custom` is the profile's compiled custom rule list, resolved by the
    /// engine outside the snapshot because profiles change independently of
    /// list refreshes.
    pub fn filter_request(&self, ctx: &FilterContext<'_>, custom: Option<&RuleList>) -> Action {
        if ctx.device.is_some_and(|d| !d.filtering_enabled) {
            return Action::Pass;
        }

        if let Some(custom) = custom {
            if let Some(action) = decide(custom, ctx.host, ctx.client) {
                return action;
            }
        }

        if let Some(action) = self.match_blocked_services(ctx) {
            return action;
        }

        if ctx.group.block_private_relay {
            for domain in PRIVATE_RELAY_DOMAINS {
                if rules::host_in_domain(ctx.host, domain) {
                    return Action::Block {
                        list: FilterListId(PRIVATE_RELAY_LIST_ID.to_string()),
                        rule: format!("||{domain}^"),
                    };
                }
            }
        }

        if ctx.flag(|p| p.youtube_safe_search, ctx.group.youtube_safe_search) {
            if let Some(rewrite) = self.youtube_safe_search.rewrite_for(ctx.host) {
                return Action::Rewrite {
                    list: FilterListId(YOUTUBE_SAFE_SEARCH_LIST_ID.to_string()),
                    rule: ctx.host.to_string(),
                    rewrite,
                };
            }
        }

        if ctx.flag(|p| p.general_safe_search, ctx.group.general_safe_search) {
            if let Some(rewrite) = self.general_safe_search.rewrite_for(ctx.host) {
                return Action::Rewrite {
                    list: FilterListId(GENERAL_SAFE_SEARCH_LIST_ID.to_string()),
                    rule: ctx.host.to_string(),
                    rewrite,
                };
            }
        }

        if ctx.group.safe_browsing {
            if let Some(action) = self.match_safe_category(
                self.safe_browsing.as_deref(),
                &self.safe_browsing_block_host,
                SAFE_BROWSING_LIST_ID,
                ctx,
            ) {
                return action;
            }
        }

        if ctx.flag(|p| p.block_adult, ctx.group.block_adult) {
            if let Some(action) = self.match_safe_category(
                self.adult_blocking.as_deref(),
                &self.adult_blocking_block_host,
                ADULT_BLOCKING_LIST_ID,
                ctx,
            ) {
                return action;
            }
        }

        for list_id in &ctx.group.rule_lists {
            let Some(list) = self.rule_lists.get(list_id) else {
                continue;
            };
            if let Some(action) = decide(list, ctx.host, ctx.client) {
                return action;
            }
        }

        Action::Pass
    }

    /// Filters the response phase: every A/AAAA answer address and every
    /// CNAME/HTTPS target is checked against the custom rules and the
    /// group's rule lists.
    pub fn filter_response(
        &self,
        resp: &Message,
        ctx: &FilterContext<'_>,
        custom: Option<&RuleList>,
    ) -> Action {
        if ctx.device.is_some_and(|d| !d.filtering_enabled) {
            return Action::Pass;
        }

        for rec in resp.answers() {
            let target = match rec.data() {
                Some(RData::A(ip)) => ip.to_string(),
                Some(RData::AAAA(ip)) => ip.to_string(),
                Some(RData::CNAME(name)) => {
                    name.to_lowercase().to_string().trim_end_matches('.').to_string()
                }
                Some(RData::HTTPS(svcb)) => svcb
                    .target_name()
                    .to_lowercase()
                    .to_string()
                    .trim_end_matches('.')
                    .to_string(),
                _ => continue,
            };
            if target.is_empty() {
                continue;
            }

            if let Some(custom) = custom {
                if let Some(action) = decide(custom, &target, ctx.client) {
                    return action;
                }
            }

            for list_id in &ctx.group.rule_lists {
                let Some(list) = self.rule_lists.get(list_id) else {
                    continue;
                };
                if let Some(action) = decide(list, &target, ctx.client) {
                    return action;
                }
            }
        }

        Action::Pass
    }

    fn match_blocked_services(&self, ctx: &FilterContext<'_>) -> Option<Action> {
        let profile = ctx.profile?;
        for svc_id in &profile.blocked_services {
            let Some(list) = self.blocked_services.get(svc_id) else {
                continue;
            };
            if let Some(rule) = list.match_host(ctx.host, ctx.client) {
                if rule.exception {
                    continue;
                }

                return Some(Action::Block {
                    list: FilterListId(format!("{BLOCKED_SERVICE_LIST_ID}:{}", svc_id.0)),
                    rule: rule.text.clone(),
                });
            }
        }

        None
    }

    fn match_safe_category(
        &self,
        list: Option<&RuleList>,
        block_host: &str,
        list_id: &str,
        ctx: &FilterContext<'_>,
    ) -> Option<Action> {
        let rule = list?.match_host(ctx.host, ctx.client)?;
        if rule.exception || block_host.is_empty() {
            return None;
        }

        Some(Action::Rewrite {
            list: FilterListId(list_id.to_string()),
            rule: rule.text.clone(),
            rewrite: Rewrite::Host(block_host.to_string()),
        })
    }
}

/// Turns a rule-list match into an action, if any.
fn decide(list: &RuleList, host: &str, client: Option<IpAddr>) -> Option<Action> {
    let rule = list.match_host(host, client)?;
    let action = if rule.exception {
        Action::Allow {
            list: list.id.clone(),
            rule: rule.text.clone(),
        }
    } else {
        Action::Block {
            list: list.id.clone(),
            rule: rule.text.clone(),
        }
    };

    Some(action)
}

/// The engine: the current snapshot pointer plus the per-profile custom
/// rule cache.
pub struct FilterEngine {
    current: ArcSwap<Snapshot>,
    custom_cache: Mutex<LruCache<(crate::profile::ProfileId, u64), Arc<RuleList>>>,
}

impl FilterEngine {
    pub fn new(custom_cache_size: usize) -> Self {
        // NB: unwrap is safe: the size is validated positive in config.
        let cap = NonZeroUsize::new(custom_cache_size.max(1)).unwrap();
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            custom_cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// The current snapshot. Hold it for the whole query so both filtering
    /// phases see the same rules.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Atomically publishes a freshly built snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// The compiled custom rules for a profile, cached by profile ID and a
    /// hash of the rule text so edits invalidate naturally. Unparseable
    /// custom rules are skipped one by one; a customer typo must not drop
    /// the rest of their rules.
    pub fn custom_rules_for(&self, profile: &Profile) -> Option<Arc<RuleList>> {
        if profile.custom_rules.is_empty() {
            return None;
        }

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        profile.custom_rules.hash(&mut hasher);
        let key = (profile.id.clone(), hasher.finish());

        let mut cache = self.custom_cache.lock();
        if let Some(list) = cache.get(&key) {
            return Some(Arc::clone(list));
        }

        let id = FilterListId(CUSTOM_LIST_ID.to_string());
        let mut parsed = Vec::new();
        for line in &profile.custom_rules {
            match rules::Rule::parse(&id, line) {
                Ok(Some(rule)) => parsed.push(rule),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(profile = %profile.id.0, error = %err, "bad custom rule");
                }
            }
        }

        let list = Arc::new(RuleList::from_parsed(id, parsed));
        cache.put(key, Arc::clone(&list));
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use crate::profile::{BlockedServiceId, FilteringGroupId, ProfileId};

    use super::*;

    fn group() -> FilteringGroup {
        FilteringGroup {
            id: FilteringGroupId("default".to_string()),
            rule_lists: vec![FilterListId("base".to_string())],
            block_adult: false,
            general_safe_search: true,
            youtube_safe_search: false,
            safe_browsing: true,
            block_private_relay: false,
        }
    }

    fn snapshot() -> Snapshot {
        let mut rule_lists = HashMap::new();
        rule_lists.insert(
            FilterListId("base".to_string()),
            Arc::new(
                RuleList::compile(
                    FilterListId("base".to_string()),
                    "||blocked.example.com^\n@@||allowed.example.com^\n",
                )
                .unwrap(),
            ),
        );

        let mut blocked_services = HashMap::new();
        blocked_services.insert(
            BlockedServiceId("video_service".to_string()),
            Arc::new(
                RuleList::compile(
                    FilterListId("blocked_service:video_service".to_string()),
                    "||video.example.com^\n",
                )
                .unwrap(),
            ),
        );

        Snapshot {
            rule_lists,
            blocked_services,
            general_safe_search: SafeSearch::parse("duckduckgo.com,safe.duckduckgo.com\n"),
            youtube_safe_search: SafeSearch::default(),
            safe_browsing: Some(Arc::new(
                RuleList::compile(
                    FilterListId(SAFE_BROWSING_LIST_ID.to_string()),
                    "||scam.example.net^\n",
                )
                .unwrap(),
            )),
            adult_blocking: None,
            safe_browsing_block_host: "safe.dns.example.net".to_string(),
            adult_blocking_block_host: String::new(),
        }
    }

    fn ctx<'a>(host: &'a str, group: &'a FilteringGroup) -> FilterContext<'a> {
        FilterContext {
            host,
            qtype: RecordType::A,
            client: None,
            device: None,
            profile: None,
            group,
        }
    }

    #[test]
    fn rule_list_blocks() {
        let snap = snapshot();
        let group = group();

        let action = snap.filter_request(&ctx("blocked.example.com", &group), None);
        let Action::Block { list, rule } = action else {
            panic!("want block, got {action:?}");
        };
        assert_eq!(list.0, "base");
        assert_eq!(rule, "||blocked.example.com^");

        assert!(snap
            .filter_request(&ctx("example.org", &group), None)
            .is_pass());
    }

    #[test]
    fn exception_allows() {
        let snap = snapshot();
        let group = group();

        let action = snap.filter_request(&ctx("allowed.example.com", &group), None);
        assert!(matches!(action, Action::Allow { .. }), "got {action:?}");
    }

    #[test]
    fn filtering_disabled_device_passes() {
        let snap = snapshot();
        let group = group();
        let device = Device {
            id: crate::deviceid::DeviceId::new("dev").unwrap(),
            name: "My Device".to_string(),
            filtering_enabled: false,
        };

        let mut c = ctx("blocked.example.com", &group);
        c.device = Some(&device);
        assert!(snap.filter_request(&c, None).is_pass());
    }

    #[test]
    fn custom_rules_beat_group_lists() {
        let snap = snapshot();
        let group = group();
        let engine = FilterEngine::new(8);

        let profile = Profile {
            id: ProfileId("prof1".to_string()),
            custom_rules: vec!["@@||blocked.example.com^".to_string()],
            block_adult: None,
            general_safe_search: None,
            youtube_safe_search: None,
            blocked_services: vec![],
        };
        let custom = engine.custom_rules_for(&profile).unwrap();

        let mut c = ctx("blocked.example.com", &group);
        c.profile = Some(&profile);
        let action = snap.filter_request(&c, Some(&custom));
        assert!(matches!(action, Action::Allow { .. }), "got {action:?}");
    }

    #[test]
    fn blocked_service_blocks() {
        let snap = snapshot();
        let group = group();

        let profile = Profile {
            id: ProfileId("prof1".to_string()),
            custom_rules: vec![],
            block_adult: None,
            general_safe_search: None,
            youtube_safe_search: None,
            blocked_services: vec![BlockedServiceId("video_service".to_string())],
        };

        let mut c = ctx("clips.video.example.com", &group);
        c.profile = Some(&profile);
        let Action::Block { list, .. } = snap.filter_request(&c, None) else {
            panic!("want block");
        };
        assert_eq!(list.0, "blocked_service:video_service");
    }

    #[test]
    fn safe_search_rewrites() {
        let snap = snapshot();
        let group = group();

        let action = snap.filter_request(&ctx("duckduckgo.com", &group), None);
        let Action::Rewrite { list, rewrite, .. } = action else {
            panic!("want rewrite");
        };
        assert_eq!(list.0, GENERAL_SAFE_SEARCH_LIST_ID);
        assert_eq!(rewrite, Rewrite::Host("safe.duckduckgo.com".to_string()));
    }

    #[test]
    fn safe_browsing_rewrites_subdomains() {
        let snap = snapshot();
        let group = group();

        let action = snap.filter_request(&ctx("subsub.sub.scam.example.net", &group), None);
        let Action::Rewrite { list, rewrite, .. } = action else {
            panic!("want rewrite");
        };
        assert_eq!(list.0, SAFE_BROWSING_LIST_ID);
        assert_eq!(rewrite, Rewrite::Host("safe.dns.example.net".to_string()));
    }

    #[test]
    fn private_relay_blocked_when_enabled() {
        let snap = snapshot();
        let mut group = group();
        group.block_private_relay = true;

        let action = snap.filter_request(&ctx("mask.icloud.com", &group), None);
        assert!(matches!(action, Action::Block { .. }), "got {action:?}");

        group.block_private_relay = false;
        assert!(snap
            .filter_request(&ctx("mask.icloud.com", &group), None)
            .is_pass());
    }

    #[test]
    fn evaluation_is_idempotent() {
        let snap = snapshot();
        let group = group();

        let first = snap.filter_request(&ctx("blocked.example.com", &group), None);
        let second = snap.filter_request(&ctx("blocked.example.com", &group), None);
        assert_eq!(first, second);
    }

    #[test]
    fn response_phase_blocks_cname_target() {
        use std::str::FromStr;
        use trust_dns_proto::rr::{Name, Record};

        let snap = snapshot();
        let group = group();

        let mut resp = Message::new();
        resp.add_answer(Record::from_rdata(
            Name::from_str("innocent.example.org.").unwrap(),
            300,
            RData::CNAME(Name::from_str("blocked.example.com.").unwrap()),
        ));

        let action = snap.filter_response(&resp, &ctx("innocent.example.org", &group), None);
        assert!(matches!(action, Action::Block { .. }), "got {action:?}");
    }

    #[test]
    fn engine_publish_swaps_snapshot() {
        let engine = FilterEngine::new(8);
        assert!(engine.snapshot().rule_lists.is_empty());

        engine.publish(snapshot());
        assert_eq!(engine.snapshot().rule_lists.len(), 1);
    }
}
