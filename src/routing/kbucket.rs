//! A single k-bucket: a contiguous range of ID space holding up to `K`
//! contacts, ordered by recency of first insertion.

use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::Id;

#[derive(Clone, Debug)]
pub struct KBucket {
    pub low: Id,
    pub high: Id,
    contacts: Vec<Contact>,
    capacity: usize,
}

impl KBucket {
    pub fn new(low: Id, high: Id, capacity: usize) -> Self {
        KBucket {
            low,
            high,
            contacts: Vec::new(),
            capacity,
        }
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn is_in_range(&self, id: &Id) -> bool {
        *id >= self.low && *id <= self.high
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|c| c.id == *id)
    }

    /// Appends a new contact. Fails if the bucket is full or the contact's
    /// ID falls outside this bucket's range.
    pub fn add(&mut self, contact: Contact) -> Result<()> {
        if !self.is_in_range(&contact.id) {
            return Err(Error::OutOfRange);
        }
        if self.is_full() {
            return Err(Error::BucketFull);
        }
        if !self.contains(&contact.id) {
            self.contacts.push(contact);
        }
        Ok(())
    }

    /// Updates an existing contact in place and touches it.
    pub fn replace(&mut self, mut contact: Contact) -> Result<()> {
        contact.touch();
        match self.contacts.iter_mut().find(|c| c.id == contact.id) {
            Some(slot) => {
                *slot = contact;
                Ok(())
            }
            None => Err(Error::NotPresent),
        }
    }

    pub fn evict(&mut self, id: &Id) -> Result<Contact> {
        let idx = self
            .contacts
            .iter()
            .position(|c| c.id == *id)
            .ok_or(Error::NotPresent)?;
        Ok(self.contacts.remove(idx))
    }

    /// The contact least recently heard from, a candidate for eviction.
    pub fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.iter().min_by_key(|c| c.last_seen)
    }

    /// Length of the longest common binary prefix shared by every contact's
    /// ID, used by `BucketList::can_split`. An empty bucket has depth 0.
    pub fn depth(&self) -> usize {
        let mut ids = self.contacts.iter().map(|c| &c.id);
        let first = match ids.next() {
            Some(id) => id,
            None => return 0,
        };
        let mut common = crate::id::ID_BITS;
        for id in ids {
            let shared = shared_prefix_len(first, id);
            common = common.min(shared);
        }
        common
    }

    /// Splits into two halves at the midpoint of `[low, high]`, preserving
    /// per-half insertion order.
    pub fn split(self) -> (KBucket, KBucket) {
        let mid = Id::midpoint(self.low, self.high);
        let mut lower = KBucket::new(self.low, mid, self.capacity);
        let mut upper = KBucket::new(
            Id::from_bytes(increment(&mid)),
            self.high,
            self.capacity,
        );
        for c in self.contacts {
            if c.id <= mid {
                let _ = lower.add(c);
            } else {
                let _ = upper.add(c);
            }
        }
        (lower, upper)
    }
}

fn shared_prefix_len(a: &Id, b: &Id) -> usize {
    a.xor(b).leading_zero_bits()
}

fn increment(id: &Id) -> [u8; crate::id::ID_BYTES] {
    let mut bytes = id.0;
    for b in bytes.iter_mut().rev() {
        if *b == 0xff {
            *b = 0;
        } else {
            *b += 1;
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Endpoint;

    fn contact_with_id(id: Id) -> Contact {
        Contact::new(id, Endpoint::Channel(0))
    }

    #[test]
    fn add_rejects_out_of_range() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 20);
        bucket.high = {
            let mut bytes = [0u8; crate::id::ID_BYTES];
            bytes[0] = 1;
            Id::from_bytes(bytes)
        };
        let far = Id::MAX;
        assert!(matches!(
            bucket.add(contact_with_id(far)),
            Err(Error::OutOfRange)
        ));
    }

    #[test]
    fn add_rejects_when_full() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 1);
        bucket.add(contact_with_id(Id::ZERO)).unwrap();
        let second = Id::from_bytes({
            let mut b = [0u8; crate::id::ID_BYTES];
            b[crate::id::ID_BYTES - 1] = 1;
            b
        });
        assert!(matches!(bucket.add(contact_with_id(second)), Err(Error::BucketFull)));
    }

    #[test]
    fn split_partitions_by_midpoint() {
        let mut bucket = KBucket::new(Id::ZERO, Id::MAX, 20);
        bucket.add(contact_with_id(Id::ZERO)).unwrap();
        bucket.add(contact_with_id(Id::MAX)).unwrap();
        let (lower, upper) = bucket.split();
        assert_eq!(lower.contacts().len(), 1);
        assert_eq!(upper.contacts().len(), 1);
        assert_eq!(lower.contacts()[0].id, Id::ZERO);
        assert_eq!(upper.contacts()[0].id, Id::MAX);
    }

    #[test]
    fn depth_of_empty_bucket_is_zero() {
        let bucket = KBucket::new(Id::ZERO, Id::MAX, 20);
        assert_eq!(bucket.depth(), 0);
    }
}
