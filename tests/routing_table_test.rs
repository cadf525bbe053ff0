//! End-to-end scenarios for the splitting routing table: unique insertion,
//! duplicate collapsing, and forced splits along the path to our own ID.

use async_trait::async_trait;
use kadepeer::contact::{Contact, Endpoint};
use kadepeer::id::{Id, ID_BYTES};
use kadepeer::routing::{BucketList, ContactPinger, EvictionSink};

struct AlwaysAlive;
#[async_trait]
impl ContactPinger for AlwaysAlive {
    async fn ping(&self, _contact: &Contact) -> bool {
        true
    }
}

#[derive(Default)]
struct NoopEviction;
impl EvictionSink for NoopEviction {
    fn delay_eviction(&self, _victim: Contact, _replacement: Contact) {}
    fn add_pending(&self, _low: Id, _high: Id, _replacement: Contact) {}
}

fn id_from_u64(n: u64) -> Id {
    let mut bytes = [0u8; ID_BYTES];
    bytes[ID_BYTES - 8..].copy_from_slice(&n.to_be_bytes());
    Id::from_bytes(bytes)
}

fn contact(id: Id) -> Contact {
    Contact::new(id, Endpoint::Channel(0))
}

#[tokio::test]
async fn unique_id_insertion_stays_in_one_bucket() {
    let our_id = id_from_u64(1);
    let list = BucketList::new(our_id, 20, 5);
    let pinger = AlwaysAlive;
    let eviction = NoopEviction;

    for _ in 0..20 {
        list.add_contact(contact(Id::random()), &pinger, &eviction)
            .await
            .unwrap();
    }

    assert_eq!(list.bucket_count(), 1);
    assert_eq!(list.all_contacts_sorted_by_id().len(), 20);
}

#[tokio::test]
async fn duplicate_insertion_collapses_to_one_contact() {
    let our_id = id_from_u64(1);
    let list = BucketList::new(our_id, 20, 5);
    let pinger = AlwaysAlive;
    let eviction = NoopEviction;
    let id = Id::random();

    list.add_contact(contact(id), &pinger, &eviction).await.unwrap();
    list.add_contact(contact(id), &pinger, &eviction).await.unwrap();

    assert_eq!(list.bucket_count(), 1);
    assert_eq!(list.all_contacts_sorted_by_id().len(), 1);
}

/// A random id strictly below `2^159`, i.e. with the top bit clear.
fn low_half_random() -> Id {
    let mut bytes = Id::random().0;
    bytes[0] &= 0x7f;
    Id::from_bytes(bytes)
}

fn two_pow_159() -> Id {
    let mut bytes = [0u8; ID_BYTES];
    bytes[0] = 0x80;
    Id::from_bytes(bytes)
}

#[tokio::test]
async fn twenty_one_contacts_along_our_path_force_a_split() {
    // our_id = 1 lives in the low half, so the bucket covering it is
    // always splittable once full, regardless of depth.
    let our_id = id_from_u64(1);
    let list = BucketList::new(our_id, 20, 5);
    let pinger = AlwaysAlive;
    let eviction = NoopEviction;

    for _ in 0..20 {
        list.add_contact(contact(low_half_random()), &pinger, &eviction)
            .await
            .unwrap();
    }
    assert_eq!(list.bucket_count(), 1);

    list.add_contact(contact(two_pow_159()), &pinger, &eviction)
        .await
        .unwrap();

    let mut ranges = list.bucket_ranges();
    ranges.sort_by_key(|(low, _)| *low);
    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0], (Id::ZERO, {
        let mut high = two_pow_159().0;
        for b in high.iter_mut().rev() {
            if *b == 0 { *b = 0xff; } else { *b -= 1; break; }
        }
        Id::from_bytes(high)
    }));
    assert_eq!(ranges[1].1, Id::MAX);
    assert_eq!(list.all_contacts_sorted_by_id().len(), 21);
}

#[tokio::test]
async fn bucket_ranges_partition_the_id_space_with_no_gaps_or_overlap() {
    let our_id = id_from_u64(1);
    let list = BucketList::new(our_id, 4, 5);
    let pinger = AlwaysAlive;
    let eviction = NoopEviction;

    for _ in 0..64 {
        list.add_contact(contact(Id::random()), &pinger, &eviction)
            .await
            .unwrap();
    }

    let mut ranges = list.bucket_ranges();
    ranges.sort_by_key(|(low, _)| *low);
    assert_eq!(ranges[0].0, Id::ZERO);
    assert_eq!(ranges.last().unwrap().1, Id::MAX);
    for pair in ranges.windows(2) {
        let (_, high) = pair[0];
        let (next_low, _) = pair[1];
        // Each bucket's high bound is immediately followed by the next
        // bucket's low bound: no gap, no overlap.
        assert!(next_low > high);
    }
}

#[tokio::test]
async fn every_contact_stays_within_its_buckets_range() {
    let our_id = Id::random();
    let list = BucketList::new(our_id, 3, 5);
    let pinger = AlwaysAlive;
    let eviction = NoopEviction;

    for _ in 0..80 {
        list.add_contact(contact(Id::random()), &pinger, &eviction)
            .await
            .unwrap();
    }

    for (low, high) in list.bucket_ranges() {
        let in_range: Vec<Contact> = list
            .all_contacts_sorted_by_id()
            .into_iter()
            .filter(|c| c.id >= low && c.id <= high)
            .collect();
        assert!(in_range.iter().all(|c| c.id >= low && c.id <= high));
    }
}
