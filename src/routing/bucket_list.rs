//! The full routing table: an ordered sequence of k-buckets covering
//! `[0, 2^160)`, growing only by splitting.

use super::kbucket::KBucket;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::Id;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Collaborator asked to verify whether a contact is still reachable before
/// it is evicted from a full, unsplittable bucket.
#[async_trait]
pub trait ContactPinger: Send + Sync {
    async fn ping(&self, contact: &Contact) -> bool;
}

/// Collaborator that owns the eviction-attempt counters and the
/// pending-replacement list. `BucketList` never mutates this state directly
/// (see the design note on avoiding a strong `BucketList -> Dht` cycle).
pub trait EvictionSink: Send + Sync {
    /// The bucket is full and `victim` did not respond to a ping;
    /// `replacement` is queued for promotion once `victim` accumulates
    /// enough failures.
    fn delay_eviction(&self, victim: Contact, replacement: Contact);
    /// The bucket is full but `victim` is still alive; `replacement` is
    /// queued in case a slot frees up later.
    fn add_pending(&self, bucket_low: Id, bucket_high: Id, replacement: Contact);
}

pub struct BucketList {
    our_id: Id,
    k: usize,
    b_shared: usize,
    buckets: Mutex<Vec<KBucket>>,
}

enum Step {
    Done,
    Retry,
    NeedPing { victim: Contact, low: Id, high: Id },
}

impl BucketList {
    pub fn new(our_id: Id, k: usize, b_shared: usize) -> Self {
        BucketList {
            our_id,
            k,
            b_shared,
            buckets: Mutex::new(vec![KBucket::new(Id::ZERO, Id::MAX, k)]),
        }
    }

    pub fn our_id(&self) -> Id {
        self.our_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    fn bucket_index_for(buckets: &[KBucket], id: &Id) -> usize {
        buckets
            .iter()
            .position(|b| b.is_in_range(id))
            .expect("bucket ranges partition the id space")
    }

    fn can_split(&self, bucket: &KBucket) -> bool {
        bucket.is_in_range(&self.our_id) || (bucket.depth() % self.b_shared != 0)
    }

    /// Inserts or refreshes `contact`. Mirrors the original recursive
    /// algorithm: touch, locate the bucket, replace if present, add if
    /// there's room, split if the bucket may grow, otherwise ping the
    /// least-recently-seen occupant and hand the outcome to `eviction`.
    pub async fn add_contact(
        &self,
        mut contact: Contact,
        pinger: &dyn ContactPinger,
        eviction: &dyn EvictionSink,
    ) -> Result<()> {
        if contact.id == self.our_id {
            return Err(Error::SelfContact);
        }
        contact.touch();

        loop {
            let step = {
                let mut buckets = self.buckets.lock();
                let idx = Self::bucket_index_for(&buckets, &contact.id);
                if buckets[idx].contains(&contact.id) {
                    buckets[idx].replace(contact.clone())?;
                    Step::Done
                } else if !buckets[idx].is_full() {
                    buckets[idx].add(contact.clone())?;
                    Step::Done
                } else if self.can_split(&buckets[idx]) {
                    let bucket = buckets.remove(idx);
                    let (lower, upper) = bucket.split();
                    buckets.insert(idx, upper);
                    buckets.insert(idx, lower);
                    Step::Retry
                } else {
                    let victim = buckets[idx]
                        .least_recently_seen()
                        .cloned()
                        .expect("full bucket has at least one contact");
                    Step::NeedPing {
                        victim,
                        low: buckets[idx].low,
                        high: buckets[idx].high,
                    }
                }
            };

            match step {
                Step::Done => return Ok(()),
                Step::Retry => continue,
                Step::NeedPing { victim, low, high } => {
                    let alive = pinger.ping(&victim).await;
                    if alive {
                        eviction.add_pending(low, high, contact);
                    } else {
                        eviction.delay_eviction(victim, contact);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Removes a contact from whichever bucket holds it (used once an
    /// eviction is finalised).
    pub fn evict(&self, id: &Id) -> Result<Contact> {
        let mut buckets = self.buckets.lock();
        let idx = Self::bucket_index_for(&buckets, id);
        buckets[idx].evict(id)
    }

    pub fn bucket_range_for(&self, id: &Id) -> (Id, Id) {
        let buckets = self.buckets.lock();
        let idx = Self::bucket_index_for(&buckets, id);
        (buckets[idx].low, buckets[idx].high)
    }

    pub fn add_plain(&self, contact: Contact) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let idx = Self::bucket_index_for(&buckets, &contact.id);
        buckets[idx].add(contact)
    }

    /// The `k` contacts closest to `key` by XOR distance, excluding `exclude`
    /// (typically the requester, so a peer never learns about itself).
    pub fn closest_k(&self, key: &Id, exclude: Option<&Id>) -> Vec<Contact> {
        let buckets = self.buckets.lock();
        let mut all: Vec<Contact> = buckets
            .iter()
            .flat_map(|b| b.contacts().iter().cloned())
            .filter(|c| exclude.map(|ex| c.id != *ex).unwrap_or(true))
            .collect();
        all.sort_by_key(|c| c.id.xor(key));
        all.truncate(self.k);
        all
    }

    /// Every contact in the routing table, sorted by ID value. Used by the
    /// DHT control loop's separating-nodes-count calculation for
    /// opportunistic-cache TTL halving.
    pub fn all_contacts_sorted_by_id(&self) -> Vec<Contact> {
        let buckets = self.buckets.lock();
        let mut all: Vec<Contact> = buckets
            .iter()
            .flat_map(|b| b.contacts().iter().cloned())
            .collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Ranges of every bucket, in order, for bucket-refresh iteration.
    pub fn bucket_ranges(&self) -> Vec<(Id, Id)> {
        self.buckets.lock().iter().map(|b| (b.low, b.high)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Endpoint;

    struct AlwaysAlive;
    #[async_trait]
    impl ContactPinger for AlwaysAlive {
        async fn ping(&self, _contact: &Contact) -> bool {
            true
        }
    }
    struct AlwaysDead;
    #[async_trait]
    impl ContactPinger for AlwaysDead {
        async fn ping(&self, _contact: &Contact) -> bool {
            false
        }
    }
    #[derive(Default)]
    struct RecordingEviction {
        delayed: Mutex<Vec<(Contact, Contact)>>,
        pending: Mutex<Vec<Contact>>,
    }
    impl EvictionSink for RecordingEviction {
        fn delay_eviction(&self, victim: Contact, replacement: Contact) {
            self.delayed.lock().push((victim, replacement));
        }
        fn add_pending(&self, _low: Id, _high: Id, replacement: Contact) {
            self.pending.lock().push(replacement);
        }
    }

    fn contact(id: Id) -> Contact {
        Contact::new(id, Endpoint::Channel(0))
    }

    #[tokio::test]
    async fn rejects_self() {
        let our_id = Id::random();
        let list = BucketList::new(our_id, 20, 5);
        let eviction = RecordingEviction::default();
        let result = list.add_contact(contact(our_id), &AlwaysAlive, &eviction).await;
        assert!(matches!(result, Err(Error::SelfContact)));
    }

    #[tokio::test]
    async fn inserts_unique_contacts() {
        let our_id = Id::ZERO;
        let list = BucketList::new(our_id, 20, 5);
        let eviction = RecordingEviction::default();
        for _ in 0..5 {
            list.add_contact(contact(Id::random()), &AlwaysAlive, &eviction)
                .await
                .unwrap();
        }
        assert_eq!(list.closest_k(&Id::random(), None).len(), 5);
    }

    #[tokio::test]
    async fn duplicate_insertion_updates_in_place() {
        let our_id = Id::ZERO;
        let list = BucketList::new(our_id, 20, 5);
        let eviction = RecordingEviction::default();
        let id = Id::random();
        list.add_contact(contact(id), &AlwaysAlive, &eviction)
            .await
            .unwrap();
        list.add_contact(contact(id), &AlwaysAlive, &eviction)
            .await
            .unwrap();
        assert_eq!(list.closest_k(&id, None).len(), 1);
    }

    #[tokio::test]
    async fn full_unsplittable_bucket_pings_then_delays_eviction_on_failure() {
        // A bucket far from our own id never satisfies is_in_range(our_id),
        // so once its depth is a multiple of b_shared it cannot split.
        let our_id = Id::ZERO;
        let list = BucketList::new(our_id, 1, 1);
        let eviction = RecordingEviction::default();
        let mut far_bytes = [0xffu8; crate::id::ID_BYTES];
        far_bytes[0] = 0x80;
        let first = Id::from_bytes(far_bytes);
        list.add_contact(contact(first), &AlwaysAlive, &eviction)
            .await
            .unwrap();
        let second = Id::MAX;
        list.add_contact(contact(second), &AlwaysDead, &eviction)
            .await
            .unwrap();
        assert_eq!(eviction.delayed.lock().len() + eviction.pending.lock().len(), 1);
    }
}
