//! An in-process "subnet": a shared registry of peers addressed by channel
//! ID instead of a socket, so multi-peer tests exercise the real router and
//! RPC dispatch code without binding any ports. This variant never leaks
//! into core types — it is just another `Transport` implementation.

use super::{RequestEnvelope, RequestHandler, ResponseEnvelope, Transport};
use crate::contact::{Contact, Endpoint};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct Subnet {
    peers: DashMap<u64, Arc<dyn RequestHandler>>,
}

impl Subnet {
    pub fn new() -> Arc<Self> {
        Arc::new(Subnet::default())
    }

    pub fn register(&self, channel: u64, handler: Arc<dyn RequestHandler>) {
        self.peers.insert(channel, handler);
    }

    pub fn unregister(&self, channel: u64) {
        self.peers.remove(&channel);
    }
}

pub struct SubnetTransport {
    subnet: Arc<Subnet>,
    /// Simulates RPC latency/unreachability in failure-injection tests.
    unreachable: std::sync::atomic::AtomicBool,
    timeout: Duration,
}

impl SubnetTransport {
    pub fn new(subnet: Arc<Subnet>, timeout: Duration) -> Self {
        SubnetTransport {
            subnet,
            unreachable: std::sync::atomic::AtomicBool::new(false),
            timeout,
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SubnetTransport {
    async fn send(&self, to: &Contact, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Timeout(to.id.to_hex()));
        }
        let channel = match to.endpoint {
            Endpoint::Channel(c) => c,
            Endpoint::Tcp(_) => {
                return Err(Error::ProtocolError(
                    "subnet transport cannot reach a tcp endpoint".to_string(),
                ))
            }
        };
        let handler = self
            .subnet
            .peers
            .get(&channel)
            .map(|r| r.clone())
            .ok_or_else(|| Error::Timeout(to.id.to_hex()))?;
        let random_id = request.random_id;
        let body = tokio::time::timeout(self.timeout, handler.handle(request.sender, request.body))
            .await
            .map_err(|_| Error::Timeout(to.id.to_hex()))?;
        Ok(ResponseEnvelope { random_id, body })
    }
}
