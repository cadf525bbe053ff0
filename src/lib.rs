//! kadepeer - a standalone Kademlia distributed hash table peer.
//!
//! Implements the routing table, iterative lookup, and storage machinery
//! described in Maymounkov & Mazieres, addressable over TCP or, for tests,
//! an in-process channel transport.

pub mod config;
pub mod contact;
pub mod dht;
pub mod error;
pub mod id;
pub mod node;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod storage;

pub use contact::{Contact, Endpoint};
pub use dht::Dht;
pub use error::{Error, Result};
pub use id::Id;
