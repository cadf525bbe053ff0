//! Wire protocol: message shapes, framing, and the `Transport` trait that
//! lets the router and bucket list send RPCs without caring whether the
//! peer on the other end is reached over TCP or an in-process channel.

pub mod subnet;
pub mod tcp;

use crate::contact::Contact;
use crate::error::Result;
use crate::id::Id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Every request carries the sender's own contact (so the receiver can
/// learn about it) and a random correlation ID the response must echo.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestEnvelope {
    pub sender: Contact,
    pub random_id: Id,
    pub body: RequestBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", deny_unknown_fields)]
pub enum RequestBody {
    Ping,
    Store {
        key: Id,
        value: Vec<u8>,
        is_cached: bool,
        expiration_time_sec: u64,
    },
    FindNode {
        key: Id,
    },
    FindValue {
        key: Id,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseEnvelope {
    pub random_id: Id,
    pub body: ResponseBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", deny_unknown_fields)]
pub enum ResponseBody {
    Ack,
    Nodes {
        contacts: Vec<Contact>,
    },
    Value {
        contacts: Vec<Contact>,
        value: Option<Vec<u8>>,
    },
    Error {
        error_message: String,
    },
}

/// Implemented by whatever owns RPC dispatch locally (the `Node`). Kept
/// separate from `Transport` so a transport never needs to know about
/// routing-table or storage internals.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, sender: Contact, body: RequestBody) -> ResponseBody;
}

/// The client side of an RPC: deliver a request to `to` and await its
/// response, or fail with `Error::Timeout`/`Error::ProtocolError`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &Contact, request: RequestEnvelope) -> Result<ResponseEnvelope>;
}
