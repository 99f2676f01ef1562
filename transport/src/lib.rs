//! # Summary
//!
//! Point-to-point request/response transport shared by every protocol
//! node in this workspace. One TCP connection carries exactly one
//! `Envelope` followed by exactly one `Reply`; there is no persistent
//! peer session, no ordering guarantee across connections, and no retry
//! beyond what a caller performs explicitly. This mirrors the "per-request
//! with bounded timeout" contract every protocol in this workspace is
//! built against.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A request sent to a node's well-known port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new(method: impl Into<String>, body: serde_json::Value) -> Self {
        Envelope { method: method.into(), body }
    }
}

/// The response to an `Envelope`. `status` follows HTTP-style conventions
/// (`200` success, `400` malformed request) since every protocol here was
/// distilled from a Flask application that spoke in those terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Reply {
    pub fn ok(body: serde_json::Value) -> Self {
        Reply { status: 200, body }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Reply { status: 400, body: serde_json::json!({ "error": message.into() }) }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("peer closed connection before replying")]
    Closed,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::new()
}

/// Dials `addr`, sends `envelope`, and waits up to `timeout` for a single
/// `Reply` frame. The connection is torn down immediately afterward; this
/// is a one-shot call, not a session.
pub async fn call(
    addr: SocketAddr,
    envelope: Envelope,
    timeout: Duration,
) -> Result<Reply, Error> {
    tokio::time::timeout(timeout, call_inner(addr, envelope))
        .await
        .unwrap_or(Err(Error::Timeout))
}

async fn call_inner(addr: SocketAddr, envelope: Envelope) -> Result<Reply, Error> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, codec());
    let encoded = serde_json::to_vec(&envelope)?;
    framed.send(Bytes::from(encoded)).await?;
    let frame = framed.next().await.ok_or(Error::Closed)??;
    let reply: Reply = serde_json::from_slice(&frame)?;
    Ok(reply)
}

/// Callback invoked once per accepted connection with the decoded
/// `Envelope`; returns the `Reply` to frame back to the caller. Handlers
/// never see protocol state directly -- they close over whatever shared
/// state (behind a mutex) the node needs.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Reply;
}

/// Binds `addr` and serves `handler` forever, one task per connection.
/// Each connection is expected to carry exactly one request/response
/// pair; a connection that sends a second frame before closing is simply
/// never read again (the task exits after the first reply).
pub async fn serve<H: Handler>(addr: SocketAddr, handler: Arc<H>) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on {}", addr);
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(error) = serve_one(stream, handler).await {
                log::debug!("connection from {} ended: {}", peer, error);
            }
        });
    }
}

async fn serve_one<H: Handler>(stream: TcpStream, handler: Arc<H>) -> Result<(), Error> {
    let mut framed = Framed::new(stream, codec());
    let frame = match framed.next().await {
        Some(frame) => frame?,
        None => return Ok(()),
    };
    let reply = match serde_json::from_slice::<Envelope>(&frame) {
        Ok(envelope) => handler.handle(envelope).await,
        Err(error) => Reply::bad_request(format!("malformed envelope: {}", error)),
    };
    let encoded: BytesMut = serde_json::to_vec(&reply)?.into();
    framed.send(encoded.freeze()).await?;
    Ok(())
}

/// Derives the well-known port a node listens on from its id, following
/// every protocol's `base_port + id` convention.
pub fn node_addr(base_port: u16, id: usize) -> SocketAddr {
    format!("127.0.0.1:{}", base_port + id as u16)
        .parse()
        .expect("[INTERNAL ERROR]: node_addr produced an unparseable socket address")
}

/// Default per-request timeout used by every protocol driver unless a
/// caller overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
