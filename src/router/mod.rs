//! The lookup engine: given a target key, discover the `K` nodes closest to
//! it (or the value stored under it), querying the network iteratively.
//!
//! Both router variants share the same frontier-narrowing state machine;
//! they differ only in how many outstanding RPCs they allow at once and
//! how they wait for responses (see [`sequential`] and [`parallel`]).

pub mod parallel;
pub mod sequential;

use crate::config::PeerConfig;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::protocol::{RequestBody, RequestEnvelope, ResponseBody, Transport};
use async_trait::async_trait;
use std::collections::HashSet;

pub use parallel::ParallelRouter;
pub use sequential::SequentialRouter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

#[derive(Clone, Debug)]
pub struct LookupResult {
    pub found: bool,
    pub value: Option<Vec<u8>>,
    pub found_by: Option<Contact>,
    /// Top-K contacts that actually responded during the lookup, sorted by
    /// XOR distance to the target key, ascending.
    pub contacts: Vec<Contact>,
    /// Every contact the lookup classified, seed or learned from a
    /// response, regardless of whether it was ever queried. The DHT control
    /// loop folds these back into its own routing table.
    pub discovered: Vec<Contact>,
}

#[async_trait]
pub trait Router: Send + Sync {
    async fn lookup(&self, key: Id, kind: LookupKind) -> LookupResult;
}

pub(crate) enum QueryOutcome {
    Value(Vec<u8>),
    Nodes(Vec<Contact>),
}

pub(crate) async fn query_one(
    transport: &dyn Transport,
    our_contact: &Contact,
    target: &Contact,
    key: Id,
    kind: LookupKind,
) -> Result<QueryOutcome> {
    let body = match kind {
        LookupKind::FindNode => RequestBody::FindNode { key },
        LookupKind::FindValue => RequestBody::FindValue { key },
    };
    let request = RequestEnvelope {
        sender: our_contact.clone(),
        random_id: Id::random(),
        body,
    };
    let response = transport.send(target, request).await?;
    match response.body {
        ResponseBody::Nodes { contacts } => Ok(QueryOutcome::Nodes(contacts)),
        ResponseBody::Value { contacts, value } => match value {
            Some(v) => Ok(QueryOutcome::Value(v)),
            None => Ok(QueryOutcome::Nodes(contacts)),
        },
        ResponseBody::Error { error_message } => Err(Error::PeerError(error_message)),
        ResponseBody::Ack => Err(Error::ProtocolError(
            "ping response received for a lookup rpc".to_string(),
        )),
    }
}

/// Tracks which contacts have been queried and partitions everyone else
/// into `closer`/`further` relative to the target key, exactly as the
/// common router contract in the design requires.
pub(crate) struct Frontier {
    key: Id,
    our_id: Id,
    contacted: HashSet<Id>,
    closer: Vec<Contact>,
    further: Vec<Contact>,
    responded: Vec<Contact>,
    /// Every contact this lookup has ever classified, seed or learned,
    /// so the caller can feed them back into its own routing table.
    discovered: Vec<Contact>,
}

impl Frontier {
    pub(crate) fn seed(our_id: Id, key: Id, seeds: Vec<Contact>) -> Self {
        let mut frontier = Frontier {
            key,
            our_id,
            contacted: HashSet::new(),
            closer: Vec::new(),
            further: Vec::new(),
            responded: Vec::new(),
            discovered: Vec::new(),
        };
        let our_distance = our_id.xor(&key);
        for contact in seeds {
            frontier.discovered.push(contact.clone());
            if contact.id.xor(&key) < our_distance {
                frontier.closer.push(contact);
            } else {
                frontier.further.push(contact);
            }
        }
        frontier
    }

    pub(crate) fn has_uncontacted(&self) -> bool {
        !self.closer.is_empty() || !self.further.is_empty()
    }

    /// Pulls up to `n` uncontacted contacts, preferring `closer` over
    /// `further`.
    pub(crate) fn take_next(&mut self, n: usize) -> Vec<Contact> {
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n && !self.closer.is_empty() {
            batch.push(self.closer.remove(0));
        }
        while batch.len() < n && !self.further.is_empty() {
            batch.push(self.further.remove(0));
        }
        for c in &batch {
            self.contacted.insert(c.id);
        }
        batch
    }

    /// Records that `queried` responded with `candidates`, classifying each
    /// new candidate relative to `queried`'s own distance to the key.
    pub(crate) fn record_response(&mut self, queried: Contact, candidates: Vec<Contact>) {
        let nearest_node_distance = queried.id.xor(&self.key);
        self.responded.push(queried.clone());
        for p in candidates {
            if p.id == self.our_id || p.id == queried.id {
                continue;
            }
            if self.contacted.contains(&p.id)
                || self.closer.iter().any(|c| c.id == p.id)
                || self.further.iter().any(|c| c.id == p.id)
            {
                continue;
            }
            let d = p.id.xor(&queried.id);
            self.discovered.push(p.clone());
            if d < nearest_node_distance {
                self.closer.push(p);
            } else {
                self.further.push(p);
            }
        }
        self.closer.sort_by_key(|c| c.id.xor(&self.key));
        self.further.sort_by_key(|c| c.id.xor(&self.key));
    }

    /// Lookup is done once we've heard from the `k` closest contacts ever
    /// observed, or there's nothing left to contact.
    pub(crate) fn is_complete(&self, k: usize) -> bool {
        if !self.has_uncontacted() {
            return true;
        }
        let mut all: Vec<&Contact> = self
            .closer
            .iter()
            .chain(self.further.iter())
            .chain(self.responded.iter())
            .collect();
        all.sort_by_key(|c| c.id.xor(&self.key));
        all.truncate(k);
        all.iter().all(|c| self.responded.iter().any(|r| r.id == c.id))
    }

    pub(crate) fn top_k(&self, k: usize) -> Vec<Contact> {
        let mut responded = self.responded.clone();
        responded.sort_by_key(|c| c.id.xor(&self.key));
        responded.truncate(k);
        responded
    }

    pub(crate) fn discovered(&self) -> Vec<Contact> {
        self.discovered.clone()
    }
}

pub(crate) fn config_k(config: &PeerConfig) -> usize {
    config.k
}

pub(crate) async fn query_one_with_timeout(
    transport: &dyn Transport,
    our_contact: &Contact,
    target: &Contact,
    key: Id,
    kind: LookupKind,
    timeout: std::time::Duration,
) -> Result<QueryOutcome> {
    match tokio::time::timeout(timeout, query_one(transport, our_contact, target, key, kind)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(target.id.to_hex())),
    }
}
