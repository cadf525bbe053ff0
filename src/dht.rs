//! DHT control: the object applications talk to. Owns the routing table,
//! the three key-value stores, the lookup engine, and the maintenance
//! timers that keep the network healthy while the process is idle.

use crate::config::PeerConfig;
use crate::contact::{now, Contact, Endpoint, Timestamp};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::node::Node;
use crate::protocol::{RequestBody, RequestEnvelope, ResponseBody, Transport};
use crate::router::{LookupKind, ParallelRouter, Router, SequentialRouter};
use crate::routing::{BucketList, ContactPinger, EvictionSink};
use crate::storage::Storage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub struct Dht {
    config: PeerConfig,
    our_contact: Contact,
    bucket_list: Arc<BucketList>,
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    router: Arc<dyn Router>,
    originator: Arc<dyn Storage>,
    republish: Arc<dyn Storage>,
    cache: Arc<dyn Storage>,
    eviction_attempts: Mutex<HashMap<Id, u32>>,
    pending: Mutex<Vec<Contact>>,
    bucket_touched_at: Mutex<HashMap<(Id, Id), Timestamp>>,
}

impl Dht {
    /// Builds a peer with the parallel router. `originator`/`republish` are
    /// typically [`crate::storage::DurableStorage`]; `cache` is always
    /// [`crate::storage::MemoryStorage`] since cache entries never persist.
    pub fn new(
        config: PeerConfig,
        our_contact: Contact,
        transport: Arc<dyn Transport>,
        originator: Arc<dyn Storage>,
        republish: Arc<dyn Storage>,
        cache: Arc<dyn Storage>,
    ) -> Arc<Self> {
        Self::new_with_router(config, our_contact, transport, originator, republish, cache, true)
    }

    pub fn new_with_router(
        config: PeerConfig,
        our_contact: Contact,
        transport: Arc<dyn Transport>,
        originator: Arc<dyn Storage>,
        republish: Arc<dyn Storage>,
        cache: Arc<dyn Storage>,
        use_parallel_router: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Dht>| {
            let bucket_list = Arc::new(BucketList::new(our_contact.id, config.k, config.b_shared));

            let pinger: Weak<dyn ContactPinger> = weak.clone() as Weak<dyn ContactPinger>;
            let eviction: Weak<dyn EvictionSink> = weak.clone() as Weak<dyn EvictionSink>;

            let node = Arc::new(Node::new(
                our_contact.clone(),
                bucket_list.clone(),
                originator.clone(),
                republish.clone(),
                cache.clone(),
                pinger,
                eviction,
                config.clone(),
            ));

            let router: Arc<dyn Router> = if use_parallel_router {
                Arc::new(ParallelRouter::new(
                    our_contact.clone(),
                    bucket_list.clone(),
                    transport.clone(),
                    config.clone(),
                ))
            } else {
                Arc::new(SequentialRouter::new(
                    our_contact.clone(),
                    bucket_list.clone(),
                    transport.clone(),
                    config.clone(),
                ))
            };

            Dht {
                config,
                our_contact,
                bucket_list,
                node,
                transport,
                router,
                originator,
                republish,
                cache,
                eviction_attempts: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                bucket_touched_at: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn our_contact(&self) -> &Contact {
        &self.our_contact
    }

    /// Renders this peer's own contact for display/CLI purposes.
    pub fn local_contact_summary(&self) -> String {
        match self.our_contact.endpoint {
            Endpoint::Tcp(addr) => format!("{} @ {}", self.our_contact.id, addr),
            Endpoint::Channel(c) => format!("{} @ channel:{}", self.our_contact.id, c),
        }
    }

    /// The RPC dispatch target for a transport server: every inbound
    /// request is handled by the same `Node`.
    pub fn request_handler(&self) -> Arc<Node> {
        self.node.clone()
    }

    async fn learn_many(&self, contacts: Vec<Contact>) {
        for contact in contacts {
            if contact.id == self.our_contact.id {
                continue;
            }
            let _ = self.bucket_list.add_contact(contact, self, self).await;
        }
    }

    fn bucket_recently_refreshed(&self, range: (Id, Id)) -> bool {
        match self.bucket_touched_at.lock().get(&range) {
            Some(t) => now().saturating_sub(*t) < self.config.bucket_refresh_interval.as_secs(),
            None => false,
        }
    }

    /// Number of contacts in the routing table strictly between us and
    /// `contact`, measured over every contact sorted by ID value. Used to
    /// halve a cached value's TTL once per separating hop.
    fn separating_nodes_count(&self, contact: &Contact) -> u32 {
        let all = self.bucket_list.all_contacts_sorted_by_id();
        let our_pos = all.partition_point(|c| c.id < self.our_contact.id);
        let target_pos = all.partition_point(|c| c.id < contact.id);
        (our_pos as i64 - target_pos as i64).unsigned_abs() as u32
    }

    async fn send_ping(&self, to: &Contact) -> Result<()> {
        let request = RequestEnvelope {
            sender: self.our_contact.clone(),
            random_id: Id::random(),
            body: RequestBody::Ping,
        };
        match self.transport.send(to, request).await?.body {
            ResponseBody::Ack => Ok(()),
            ResponseBody::Error { error_message } => Err(Error::PeerError(error_message)),
            _ => Err(Error::ProtocolError("unexpected response to ping".to_string())),
        }
    }

    async fn send_store(
        &self,
        to: &Contact,
        key: Id,
        value: Vec<u8>,
        is_cached: bool,
        ttl: u64,
    ) -> Result<()> {
        let request = RequestEnvelope {
            sender: self.our_contact.clone(),
            random_id: Id::random(),
            body: RequestBody::Store {
                key,
                value,
                is_cached,
                expiration_time_sec: ttl,
            },
        };
        match self.transport.send(to, request).await?.body {
            ResponseBody::Ack => Ok(()),
            ResponseBody::Error { error_message } => Err(Error::PeerError(error_message)),
            _ => Err(Error::ProtocolError("unexpected response to store".to_string())),
        }
    }

    async fn send_find_node(&self, to: &Contact, key: Id) -> Result<Vec<Contact>> {
        let request = RequestEnvelope {
            sender: self.our_contact.clone(),
            random_id: Id::random(),
            body: RequestBody::FindNode { key },
        };
        match self.transport.send(to, request).await?.body {
            ResponseBody::Nodes { contacts } => Ok(contacts),
            ResponseBody::Error { error_message } => Err(Error::PeerError(error_message)),
            _ => Err(Error::ProtocolError("unexpected response to find_node".to_string())),
        }
    }

    /// Every RPC failure funnels through here: bump the contact's failure
    /// count and, past the eviction limit, free its slot for a pending
    /// replacement.
    async fn handle_error(&self, contact: &Contact) {
        let range = self.bucket_list.bucket_range_for(&contact.id);
        self.bump_and_maybe_evict(contact.id, range);
    }

    fn bump_and_maybe_evict(&self, victim_id: Id, range: (Id, Id)) {
        let hit_limit = {
            let mut attempts = self.eviction_attempts.lock();
            let count = attempts.entry(victim_id).or_insert(0);
            *count += 1;
            let over = *count >= self.config.eviction_limit;
            if over {
                attempts.remove(&victim_id);
            }
            over
        };
        if hit_limit {
            self.replace_with_pending(victim_id, range);
        }
    }

    fn push_pending(&self, candidate: Contact) {
        let mut pending = self.pending.lock();
        if let Some(slot) = pending.iter_mut().find(|c| c.id == candidate.id) {
            *slot = candidate;
        } else {
            pending.push(candidate);
        }
    }

    /// Evicts `victim_id` and promotes the most-recently-seen pending
    /// contact whose ID falls in the freed bucket's range.
    fn replace_with_pending(&self, victim_id: Id, range: (Id, Id)) {
        let _ = self.bucket_list.evict(&victim_id);
        let mut pending = self.pending.lock();
        let mut candidates: Vec<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, c)| c.id >= range.0 && c.id <= range.1)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| pending[i].last_seen);
        if let Some(&idx) = candidates.last() {
            let promoted = pending.remove(idx);
            drop(pending);
            let _ = self.bucket_list.add_plain(promoted);
        }
    }

    /// Writes `value` under `key`, running a fresh `FIND_NODE` lookup for
    /// `key` and replicating to the `k` nodes it finds closest. Always
    /// performs the lookup, even if the key's bucket was refreshed a moment
    /// ago — that recency cache is for the periodic bucket-refresh timer, an
    /// unrelated concern, and must not short-circuit replication here.
    pub async fn store(&self, key: Id, value: Vec<u8>) -> Result<()> {
        self.originator
            .set(key, value.clone(), self.config.expiration_ttl_secs)
            .await?;
        let result = self.router.lookup(key, LookupKind::FindNode).await;
        self.learn_many(result.discovered).await;
        for contact in result.contacts {
            if let Err(_err) = self
                .send_store(&contact, key, value.clone(), false, self.config.expiration_ttl_secs)
                .await
            {
                self.handle_error(&contact).await;
            }
        }
        Ok(())
    }

    /// Used by the republish timer, which re-announces values it already
    /// holds and can cheaply reuse a recently-refreshed bucket's contacts
    /// instead of paying for a full lookup every tick.
    async fn store_on_closer_contacts(&self, key: Id) -> Vec<Contact> {
        let range = self.bucket_list.bucket_range_for(&key);
        if self.bucket_recently_refreshed(range) {
            self.bucket_list.closest_k(&key, Some(&self.our_contact.id))
        } else {
            let result = self.router.lookup(key, LookupKind::FindNode).await;
            self.learn_many(result.discovered).await;
            result.contacts
        }
    }

    /// Looks up `key`: first the three local stores, then the network. A
    /// value found on the network is opportunistically cached on the
    /// closest responder that did not already hold it, with its TTL halved
    /// once per separating hop.
    pub async fn find_value(&self, key: Id) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.originator.try_get(&key).await {
            return Ok(Some(v));
        }
        if let Some(v) = self.republish.try_get(&key).await {
            return Ok(Some(v));
        }
        if let Some(v) = self.cache.try_get(&key).await {
            return Ok(Some(v));
        }

        let result = self.router.lookup(key, LookupKind::FindValue).await;
        self.learn_many(result.discovered.clone()).await;

        if !result.found {
            return Ok(None);
        }
        if let Some(value) = &result.value {
            if let Some(cache_target) = result.contacts.first() {
                let d = self.separating_nodes_count(cache_target);
                let ttl = (self.config.expiration_ttl_secs >> d.min(63)).max(1);
                let _ = self
                    .send_store(cache_target, key, value.clone(), true, ttl)
                    .await;
            }
        }
        Ok(result.value)
    }

    /// Seeds the routing table from `known_peer`, then refreshes every
    /// other bucket with a random lookup so the table fills out quickly.
    pub async fn bootstrap(&self, known_peer: Contact) -> Result<()> {
        let _ = self.bucket_list.add_plain(known_peer.clone());
        let discovered = self.send_find_node(&known_peer, self.our_contact.id).await?;
        self.learn_many(discovered).await;

        let known_range = self.bucket_list.bucket_range_for(&known_peer.id);
        for range in self.bucket_list.bucket_ranges() {
            if range == known_range {
                continue;
            }
            self.refresh_bucket(range).await;
        }
        Ok(())
    }

    async fn refresh_bucket(&self, (low, high): (Id, Id)) {
        self.bucket_touched_at.lock().insert((low, high), now());
        let random_id = Id::random_in_range(low, high);
        let result = self.router.lookup(random_id, LookupKind::FindNode).await;
        self.learn_many(result.discovered).await;
    }

    /// Writes `{our_id, buckets, originator, republish}` to `path` as a
    /// single atomically-written JSON snapshot. The cache store is never
    /// persisted.
    pub async fn save(&self, path: &std::path::Path) -> Result<()> {
        let snapshot = Snapshot {
            our_id: self.our_contact.id,
            buckets: self.bucket_list.bucket_ranges(),
            contacts: self.bucket_list.all_contacts_sorted_by_id(),
            originator_keys: self.originator.keys().await,
            republish_keys: self.republish.keys().await,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Restores contacts recorded by a prior [`Dht::save`] into this peer's
    /// routing table. The originator/republish values themselves are
    /// reloaded separately through each store's own `open`.
    pub async fn load(&self, path: &std::path::Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        self.learn_many(snapshot.contacts).await;
        Ok(())
    }

    /// A point-in-time snapshot of routing-table and store sizes, for the
    /// CLI's `Stats` command and for diagnostics.
    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            our_id: self.our_contact.id,
            bucket_count: self.bucket_list.bucket_count(),
            contact_count: self.bucket_list.all_contacts_sorted_by_id().len(),
            originator_count: self.originator.keys().await.len(),
            republish_count: self.republish.keys().await.len(),
            cache_count: self.cache.keys().await.len(),
        }
    }

    /// Spawns the four independent maintenance timers. Returns their join
    /// handles so the caller can await or abort them on shutdown.
    pub fn spawn_maintenance_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.clone().spawn_bucket_refresh_timer(),
            self.clone().spawn_republish_timer(),
            self.clone().spawn_originator_republish_timer(),
            self.clone().spawn_expiration_timer(),
        ]
    }

    fn spawn_bucket_refresh_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.bucket_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::debug!("bucket refresh tick");
                for range in self.bucket_list.bucket_ranges() {
                    if !self.bucket_recently_refreshed(range) {
                        self.refresh_bucket(range).await;
                    }
                }
            }
        })
    }

    fn spawn_republish_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.republish_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::debug!("republish tick");
                for key in self.republish.keys().await {
                    if let Ok(value) = self.republish.get(&key).await {
                        let closest = self.store_on_closer_contacts(key).await;
                        for contact in closest {
                            let _ = self
                                .send_store(
                                    &contact,
                                    key,
                                    value.clone(),
                                    false,
                                    self.config.expiration_ttl_secs,
                                )
                                .await;
                        }
                    }
                }
            }
        })
    }

    fn spawn_originator_republish_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.originator_republish_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::debug!("originator republish tick");
                for key in self.originator.keys().await {
                    if let Ok(value) = self.originator.get(&key).await {
                        let _ = self.store(key, value).await;
                    }
                }
            }
        })
    }

    fn spawn_expiration_timer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.expire_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired_republish = self.republish.remove_expired().await;
                let expired_cache = self.cache.remove_expired().await;
                tracing::debug!(
                    expired_republish = expired_republish.len(),
                    expired_cache = expired_cache.len(),
                    "expiration tick"
                );
            }
        })
    }
}

#[async_trait]
impl ContactPinger for Dht {
    async fn ping(&self, contact: &Contact) -> bool {
        self.send_ping(contact).await.is_ok()
    }
}

impl EvictionSink for Dht {
    fn delay_eviction(&self, victim: Contact, replacement: Contact) {
        let range = self.bucket_list.bucket_range_for(&victim.id);
        self.push_pending(replacement);
        self.bump_and_maybe_evict(victim.id, range);
    }

    fn add_pending(&self, low: Id, high: Id, replacement: Contact) {
        let _ = (low, high);
        self.push_pending(replacement);
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    our_id: Id,
    buckets: Vec<(Id, Id)>,
    contacts: Vec<Contact>,
    originator_keys: Vec<Id>,
    republish_keys: Vec<Id>,
}

/// Routing-table and store occupancy, rendered by the CLI's `Stats` command.
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub our_id: Id,
    pub bucket_count: usize,
    pub contact_count: usize,
    pub originator_count: usize,
    pub republish_count: usize,
    pub cache_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::subnet::{Subnet, SubnetTransport};
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn test_config() -> PeerConfig {
        let mut cfg = PeerConfig::test_defaults();
        cfg.request_timeout = Duration::from_millis(200);
        cfg
    }

    async fn make_peer(subnet: Arc<Subnet>, channel: u64) -> Arc<Dht> {
        let id = Id::random();
        let contact = Contact::new(id, Endpoint::Channel(channel));
        let transport: Arc<dyn Transport> =
            Arc::new(SubnetTransport::new(subnet.clone(), test_config().request_timeout));
        let dht = Dht::new(
            test_config(),
            contact,
            transport,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        );
        subnet.register(channel, dht.request_handler());
        dht
    }

    #[tokio::test]
    async fn store_then_find_value_round_trips_across_peers() {
        let subnet = Subnet::new();
        let a = make_peer(subnet.clone(), 1).await;
        let b = make_peer(subnet.clone(), 2).await;

        a.bootstrap(b.our_contact().clone()).await.unwrap();
        b.bootstrap(a.our_contact().clone()).await.unwrap();

        let key = Id::random();
        a.store(key, b"hello dht".to_vec()).await.unwrap();

        let found = b.find_value(key).await.unwrap();
        assert_eq!(found, Some(b"hello dht".to_vec()));
    }

    #[tokio::test]
    async fn find_value_on_unknown_key_returns_none() {
        let subnet = Subnet::new();
        let a = make_peer(subnet.clone(), 1).await;
        assert_eq!(a.find_value(Id::random()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_and_load_round_trips_contacts() {
        let subnet = Subnet::new();
        let a = make_peer(subnet.clone(), 1).await;
        let b = make_peer(subnet.clone(), 2).await;
        a.bootstrap(b.our_contact().clone()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        a.save(&path).await.unwrap();

        let c = make_peer(subnet.clone(), 3).await;
        c.load(&path).await.unwrap();
        assert!(c
            .bucket_list
            .all_contacts_sorted_by_id()
            .iter()
            .any(|contact| contact.id == b.our_contact().id));
    }

    /// A one-contact-capacity bucket on the far side of our own id (so it
    /// can never satisfy `is_in_range(our_id)`) with `b_shared = 1` (so
    /// `depth() % b_shared` is always zero) can never split. Five
    /// consecutive failed pings against its sole occupant must evict it and
    /// promote the most recently queued pending replacement.
    #[tokio::test]
    async fn five_failed_pings_evict_victim_and_promote_latest_pending() {
        fn far_id(low_byte: u8) -> Id {
            let mut bytes = [0u8; crate::id::ID_BYTES];
            bytes[0] = 0x80;
            bytes[crate::id::ID_BYTES - 1] = low_byte;
            Id::from_bytes(bytes)
        }
        fn near_id(low_byte: u8) -> Id {
            let mut bytes = [0u8; crate::id::ID_BYTES];
            bytes[crate::id::ID_BYTES - 1] = low_byte;
            Id::from_bytes(bytes)
        }

        let subnet = Subnet::new();
        let mut cfg = test_config();
        cfg.k = 1;
        cfg.b_shared = 1;
        cfg.eviction_limit = 5;
        let our_contact = Contact::new(Id::ZERO, Endpoint::Channel(0));
        let transport: Arc<dyn Transport> =
            Arc::new(SubnetTransport::new(subnet.clone(), cfg.request_timeout));
        let dht = Dht::new(
            cfg,
            our_contact,
            transport,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        );
        // dht is deliberately never registered on the subnet: every ping
        // against the far bucket's occupant must time out.

        // Seed the far bucket with its sole, permanent occupant.
        let victim = Contact::new(far_id(0), Endpoint::Channel(200));
        dht.bucket_list
            .add_contact(victim.clone(), dht.as_ref(), dht.as_ref())
            .await
            .unwrap();

        // Force the initial split: our own id's bucket is always
        // splittable, so a second contact on the near side pushes the far
        // contact into its own, now-full, unsplittable bucket.
        let near = Contact::new(near_id(1), Endpoint::Channel(201));
        dht.bucket_list
            .add_contact(near.clone(), dht.as_ref(), dht.as_ref())
            .await
            .unwrap();
        assert_eq!(dht.bucket_list.bucket_count(), 2);

        // Five more far-side contacts, each triggering a failed ping
        // against the unreachable victim and queueing themselves as a
        // pending replacement.
        let mut last_candidate = None;
        for low_byte in 1..=5u8 {
            let candidate = Contact::new(far_id(low_byte), Endpoint::Channel(202 + low_byte as u64));
            dht.bucket_list
                .add_contact(candidate.clone(), dht.as_ref(), dht.as_ref())
                .await
                .unwrap();
            last_candidate = Some(candidate);
        }
        let last_candidate = last_candidate.unwrap();

        let contacts = dht.bucket_list.all_contacts_sorted_by_id();
        assert!(
            !contacts.iter().any(|c| c.id == victim.id),
            "victim should have been evicted after the eviction limit was reached"
        );
        assert!(
            contacts.iter().any(|c| c.id == last_candidate.id),
            "the most recently queued pending replacement should take the freed slot"
        );
        assert!(!dht.eviction_attempts.lock().contains_key(&victim.id));
    }
}
