//! # Summary
//!
//! Wires [`Transport`] up to the shared request/response transport:
//! forwarding a Byzantine message is just a `POST order` to the target
//! peer's well-known port.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Serialize;
use transport::Envelope;

use crate::{Path, Transport};

pub struct NetTransport {
    pub peers: Vec<SocketAddr>,
    pub round_id: Option<usize>,
}

impl NetTransport {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        NetTransport { peers, round_id: None }
    }

    pub fn for_round(peers: Vec<SocketAddr>, round_id: usize) -> Self {
        NetTransport { peers, round_id: Some(round_id) }
    }
}

#[async_trait]
impl<V: Serialize + Send + Sync> Transport<V> for NetTransport {
    async fn send(&self, to: usize, path: Path, value: V) {
        let mut body = serde_json::json!({ "path": path, "value": value });
        if let Some(round_id) = self.round_id {
            body["round_id"] = serde_json::json!(round_id);
        }
        if let Err(error) = transport::call(self.peers[to], Envelope::new("order", body), transport::DEFAULT_TIMEOUT).await {
            log::debug!("forward to peer {} failed: {}", to, error);
        }
    }
}
