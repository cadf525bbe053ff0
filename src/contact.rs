//! A routing-table entry: a peer's identity plus how to reach it.

use crate::id::Id;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch. Used instead of `SystemTime` on the wire
/// and in snapshots so persisted state is portable and trivially comparable.
pub type Timestamp = u64;

pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// How to reach a contact over the network. `Tcp` is used by real peers;
/// `Channel` addresses an in-process peer registered with the subnet test
/// transport and never appears outside test code.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Channel(u64),
}

/// A known peer: its ID, how to reach it, and when it was last heard from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub id: Id,
    pub endpoint: Endpoint,
    pub last_seen: Timestamp,
}

impl Contact {
    pub fn new(id: Id, endpoint: Endpoint) -> Self {
        Contact {
            id,
            endpoint,
            last_seen: now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = now();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Contact {}
