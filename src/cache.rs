//! The response cache.
//!
//! Responses are cached under `(lowercased name, type, class)`, or under the
//! same tuple plus the masked client subnet for queries that carried an ECS
//! option when the cache runs in ECS mode. The two caches are independent
//! LRUs with their own capacities, each sharded under short mutexes so the
//! hot path never holds a lock across I/O.
//!
//! An entry lives for the minimum record TTL observed at insertion; expired
//! entries are treated as misses and evicted on access. TTLs handed back
//! shrink by the entry's age, so successive hits observe monotonically
//! non-increasing TTLs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use lru::LruCache;
use parking_lot::Mutex;
use trust_dns_proto::op::{Message, ResponseCode};
use trust_dns_proto::rr::{DNSClass, Name, RecordType};

use crate::config::{CacheConfig, CacheMode};
use crate::dnsmsg;
use crate::error::Error;

const SHARD_COUNT: usize = 16;

/// A cache key. `subnet` is set only for ECS-keyed entries.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    name: Name,
    rtype: RecordType,
    class: DNSClass,
    subnet: Option<IpNetwork>,
}

impl CacheKey {
    /// Builds the subnet-agnostic key. The name is lowercased here so that
    /// `Example.ORG` and `example.org` share an entry.
    pub fn simple(name: &Name, rtype: RecordType, class: DNSClass) -> Self {
        Self {
            name: name.to_lowercase(),
            rtype,
            class,
            subnet: None,
        }
    }

    /// Builds the ECS-aware key from an already masked client subnet.
    pub fn with_subnet(
        name: &Name,
        rtype: RecordType,
        class: DNSClass,
        subnet: IpNetwork,
    ) -> Self {
        Self {
            name: name.to_lowercase(),
            rtype,
            class,
            subnet: Some(subnet),
        }
    }

    fn shard_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }
}

struct CacheEntry {
    response: Message,
    stored_at: Instant,
    min_ttl: u32,
}

struct Shards {
    shards: Vec<Mutex<LruCache<CacheKey, CacheEntry>>>,
}

impl Shards {
    fn new(capacity: usize) -> Self {
        let per_shard = (capacity / SHARD_COUNT).max(1);
        // NB: unwrap is safe: per_shard is at least 1.
        let per_shard = NonZeroUsize::new(per_shard).unwrap();
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn lookup(&self, key: &CacheKey, now: Instant) -> Option<Message> {
        let mut shard = self.shards[key.shard_index()].lock();
        let entry = shard.get(key)?;

        let elapsed = now.duration_since(entry.stored_at).as_secs();
        let fresh = elapsed < u64::from(entry.min_ttl);
        let response = fresh.then(|| entry.response.clone());

        let Some(mut response) = response else {
            shard.pop(key);
            return None;
        };
        drop(shard);

        dnsmsg::decrement_ttls(&mut response, elapsed as u32);
        Some(response)
    }

    fn insert(&self, key: CacheKey, response: Message, min_ttl: u32, now: Instant) {
        let mut shard = self.shards[key.shard_index()].lock();
        shard.put(
            key,
            CacheEntry {
                response,
                stored_at: now,
                min_ttl,
            },
        );
    }
}

/// The ECS-aware LRU response cache.
pub struct MessageCache {
    mode: CacheMode,
    simple: Shards,
    ecs: Option<Shards>,
}

impl MessageCache {
    pub fn new(conf: &CacheConfig) -> Self {
        let ecs = match conf.mode {
            CacheMode::Simple => None,
            CacheMode::Ecs => Some(Shards::new(conf.ecs_size)),
        };

        Self {
            mode: conf.mode,
            simple: Shards::new(conf.size),
            ecs,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Message> {
        self.lookup_at(key, Instant::now())
    }

    fn lookup_at(&self, key: &CacheKey, now: Instant) -> Option<Message> {
        match (&key.subnet, &self.ecs) {
            (Some(_), Some(ecs)) => ecs.lookup(key, now),
            (Some(_), None) => None,
            (None, _) => self.simple.lookup(key, now),
        }
    }

    /// Inserts a response unless it is uncacheable: TC-bit responses,
    /// response codes other than NOERROR and NXDOMAIN, and responses with
    /// no TTL-bearing records are never stored.
    pub fn insert(&self, key: CacheKey, response: &Message) {
        self.insert_at(key, response, Instant::now());
    }

    fn insert_at(&self, key: CacheKey, response: &Message, now: Instant) {
        if response.truncated() {
            return;
        }
        if !matches!(
            response.response_code(),
            ResponseCode::NoError | ResponseCode::NXDomain,
        ) {
            return;
        }

        let Some(min_ttl) = dnsmsg::min_ttl(response) else {
            return;
        };
        if min_ttl == 0 {
            return;
        }

        match (&key.subnet, &self.ecs) {
            (Some(_), Some(ecs)) => ecs.insert(key, response.clone(), min_ttl, now),
            (Some(_), None) => {}
            (None, _) => self.simple.insert(key, response.clone(), min_ttl, now),
        }
    }
}

/// Coalesces concurrent misses for one key onto a single upstream call.
///
/// The first task through takes the per-key gate and resolves; tasks that
/// arrive while it is in flight wait on the gate and then re-check the
/// cache instead of dispatching their own upstream query.
pub struct Coalescer {
    gates: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }
}

impl Coalescer {
    /// Looks `key` up in `cache`, falling back to `resolve` on a miss, with
    /// concurrent misses for the same key waiting on the in-flight call.
    pub async fn resolve<F, Fut>(
        &self,
        cache: &MessageCache,
        key: CacheKey,
        resolve: F,
    ) -> Result<(Message, bool), Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Message, Error>>,
    {
        if let Some(hit) = cache.lookup(&key) {
            return Ok((hit, true));
        }

        let gate = self
            .gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        // Someone may have filled the cache while this task waited.
        if let Some(hit) = cache.lookup(&key) {
            return Ok((hit, true));
        }

        let response = resolve().await?;
        cache.insert(key.clone(), &response);

        drop(guard);
        self.gates.remove(&key);

        Ok((response, false))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    use trust_dns_proto::op::{MessageType, Query};
    use trust_dns_proto::rr::{RData, Record};

    use super::*;

    fn response(name: &str, ttl: u32) -> Message {
        let name = Name::from_str(name).unwrap();
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(
            name,
            ttl,
            RData::A(Ipv4Addr::new(93, 184, 216, 34)),
        ));
        msg
    }

    fn test_cache(mode: CacheMode) -> MessageCache {
        MessageCache::new(&CacheConfig {
            mode,
            size: 128,
            ecs_size: 128,
        })
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::simple(
            &Name::from_str(name).unwrap(),
            RecordType::A,
            DNSClass::IN,
        )
    }

    #[test]
    fn hit_decrements_ttl() {
        let cache = test_cache(CacheMode::Simple);
        let now = Instant::now();

        cache.insert_at(key("example.org."), &response("example.org.", 300), now);

        let hit = cache
            .lookup_at(&key("example.org."), now + Duration::from_secs(10))
            .unwrap();
        assert_eq!(hit.answers()[0].ttl(), 290);

        let later = cache
            .lookup_at(&key("example.org."), now + Duration::from_secs(20))
            .unwrap();
        assert_eq!(later.answers()[0].ttl(), 280);
    }

    #[test]
    fn key_name_is_case_insensitive() {
        let cache = test_cache(CacheMode::Simple);
        let now = Instant::now();

        cache.insert_at(key("Example.ORG."), &response("example.org.", 300), now);
        assert!(cache.lookup_at(&key("example.org."), now).is_some());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = test_cache(CacheMode::Simple);
        let now = Instant::now();

        cache.insert_at(key("example.org."), &response("example.org.", 30), now);
        assert!(cache
            .lookup_at(&key("example.org."), now + Duration::from_secs(30))
            .is_none());
    }

    #[test]
    fn truncated_and_failed_responses_not_stored() {
        let cache = test_cache(CacheMode::Simple);
        let now = Instant::now();

        let mut truncated = response("example.org.", 300);
        truncated.set_truncated(true);
        cache.insert_at(key("example.org."), &truncated, now);
        assert!(cache.lookup_at(&key("example.org."), now).is_none());

        let mut servfail = response("example.org.", 300);
        servfail.set_response_code(ResponseCode::ServFail);
        cache.insert_at(key("example.org."), &servfail, now);
        assert!(cache.lookup_at(&key("example.org."), now).is_none());
    }

    #[test]
    fn ecs_entries_are_keyed_by_subnet() {
        let cache = test_cache(CacheMode::Ecs);
        let now = Instant::now();
        let name = Name::from_str("example.org.").unwrap();

        let net_a = IpNetwork::from_str("1.2.3.0/24").unwrap();
        let net_b = IpNetwork::from_str("5.6.7.0/24").unwrap();

        let key_a = CacheKey::with_subnet(&name, RecordType::A, DNSClass::IN, net_a);
        let key_b = CacheKey::with_subnet(&name, RecordType::A, DNSClass::IN, net_b);

        cache.insert_at(key_a.clone(), &response("example.org.", 300), now);
        assert!(cache.lookup_at(&key_a, now).is_some());
        assert!(cache.lookup_at(&key_b, now).is_none());
        // The plain key does not see ECS entries either.
        assert!(cache.lookup_at(&key("example.org."), now).is_none());
    }

    #[tokio::test]
    async fn coalescer_dispatches_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache = Arc::new(test_cache(CacheMode::Simple));
        let coalescer = Arc::new(Coalescer::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                coalescer
                    .resolve(&cache, key("example.org."), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(response("example.org.", 300))
                    })
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            let (msg, _) = task.await.unwrap();
            assert_eq!(msg.answers().len(), 1);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
