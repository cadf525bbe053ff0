//! Error types for the Kademlia peer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors a peer can encounter, covering RPC failures, local routing-table
/// invariant violations, and the ambient I/O/config/serialization surface.
#[derive(Error, Debug)]
pub enum Error {
    /// No response arrived within the request timeout.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// A peer's response did not match the expected shape for the RPC.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The `random_id` echoed in a response did not match the one sent.
    #[error("response random_id mismatch")]
    IdMismatch,

    /// The remote peer returned an explicit error payload.
    #[error("peer error: {0}")]
    PeerError(String),

    /// A k-bucket already holds `K` contacts and cannot accept another.
    #[error("bucket is full")]
    BucketFull,

    /// An ID falls outside a bucket's `[low, high]` range.
    #[error("id out of bucket range")]
    OutOfRange,

    /// An operation would have added this node's own ID as a contact.
    #[error("cannot add self as a contact")]
    SelfContact,

    /// A lookup by ID found no matching entry.
    #[error("contact or key not present")]
    NotPresent,

    /// A store was expected to contain a key that a prior check found.
    #[error("value unexpectedly absent from storage")]
    ValueUnexpectedlyAbsent,

    /// A message arrived with no handler for its RPC kind.
    #[error("unknown request kind")]
    UnknownRequest,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
