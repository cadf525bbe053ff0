//! TCP transport: one connection per RPC, each message framed with a
//! 4-byte big-endian length prefix followed by a JSON payload that rejects
//! unknown fields. This closed schema replaces the insecure
//! arbitrary-object wire format the source implementation used.

use super::{RequestEnvelope, RequestHandler, ResponseEnvelope, Transport};
use crate::contact::{Contact, Endpoint};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_MESSAGE_BYTES: u32 = 1024 * 1024;

async fn write_framed<W: AsyncWriteExt + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_framed<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_BYTES {
        return Err(Error::ProtocolError("message exceeds size limit".to_string()));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        TcpTransport { timeout }
    }

    /// Binds `listen_addr` and dispatches every inbound request to
    /// `handler`, replying on the same connection. Runs until the listener
    /// itself errors; intended to be spawned as a background task.
    pub async fn serve(listen_addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let listener = TcpListener::bind(listen_addr).await?;
        loop {
            let (stream, _peer) = listener.accept().await?;
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(err) = Self::handle_connection(stream, handler).await {
                    tracing::debug!(?err, "rpc connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let bytes = read_framed(&mut stream).await?;
        let request: RequestEnvelope = serde_json::from_slice(&bytes)?;
        let body = handler.handle(request.sender, request.body).await;
        let response = ResponseEnvelope {
            random_id: request.random_id,
            body,
        };
        let out = serde_json::to_vec(&response)?;
        write_framed(&mut stream, &out).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: &Contact, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        let addr = match to.endpoint {
            Endpoint::Tcp(addr) => addr,
            Endpoint::Channel(_) => {
                return Err(Error::ProtocolError(
                    "tcp transport cannot reach a channel endpoint".to_string(),
                ))
            }
        };
        let random_id = request.random_id;
        tokio::time::timeout(self.timeout, Self::roundtrip(addr, request))
            .await
            .map_err(|_| Error::Timeout(to.id.to_hex()))?
            .and_then(|response| {
                if response.random_id != random_id {
                    Err(Error::IdMismatch)
                } else {
                    Ok(response)
                }
            })
    }
}

impl TcpTransport {
    async fn roundtrip(addr: SocketAddr, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        let mut stream = TcpStream::connect(addr).await?;
        let bytes = serde_json::to_vec(&request)?;
        write_framed(&mut stream, &bytes).await?;
        let response_bytes = read_framed(&mut stream).await?;
        let response: ResponseEnvelope = serde_json::from_slice(&response_bytes)?;
        Ok(response)
    }
}
