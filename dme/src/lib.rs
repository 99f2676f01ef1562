//! # Summary
//!
//! Ricart-Agrawala distributed mutual exclusion. A node wanting the
//! critical section timestamps its request with a Lamport clock and
//! broadcasts to every peer; a peer replies immediately unless it is
//! itself requesting with a strictly smaller `(timestamp, id)` pair, in
//! which case the reply is deferred until that peer's own release.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use transport::{Envelope, Handler, Reply};

#[derive(Debug, Default)]
struct MutexState {
    clock: u64,
    requesting: bool,
    request_ts: u64,
    replies_needed: usize,
    deferred: HashSet<usize>,
}

pub struct RaNode {
    pub id: usize,
    pub peers: Vec<SocketAddr>,
    pub counter_addr: SocketAddr,
    state: Mutex<MutexState>,
    done: AtomicBool,
}

impl RaNode {
    pub fn new(id: usize, peers: Vec<SocketAddr>, counter_addr: SocketAddr) -> Self {
        RaNode { id, peers, counter_addr, state: Mutex::new(MutexState::default()), done: AtomicBool::new(false) }
    }

    fn bump_clock(state: &mut MutexState, ts: u64) {
        state.clock = state.clock.max(ts) + 1;
    }

    /// Handles an inbound `request(id, ts)`: grants immediately by
    /// returning `granted: true`, or records the peer as deferred.
    fn on_request(&self, peer: usize, ts: u64) -> bool {
        let mut state = self.state.lock();
        Self::bump_clock(&mut state, ts);
        let grant = !state.requesting || (ts, peer) < (state.request_ts, self.id);
        if !grant {
            state.deferred.insert(peer);
        }
        grant
    }

    fn on_reply(&self, ts: u64) {
        let mut state = self.state.lock();
        Self::bump_clock(&mut state, ts);
        state.replies_needed = state.replies_needed.saturating_sub(1);
    }

    async fn send_request(&self, peer: usize, ts: u64) {
        let body = serde_json::json!({ "id": self.id, "ts": ts });
        if let Ok(reply) = transport::call(self.peers[peer], Envelope::new("request", body), transport::DEFAULT_TIMEOUT).await {
            if reply.body.get("granted").and_then(|v| v.as_bool()).unwrap_or(false) {
                self.on_reply(reply.body.get("ts").and_then(|v| v.as_u64()).unwrap_or(0));
            }
        }
    }

    async fn send_reply(&self, peer: usize) {
        let ts = self.state.lock().clock;
        let body = serde_json::json!({ "id": self.id, "ts": ts });
        let _ = transport::call(self.peers[peer], Envelope::new("reply", body), transport::DEFAULT_TIMEOUT).await;
    }

    pub async fn lock(&self) {
        let ts = {
            let mut state = self.state.lock();
            state.requesting = true;
            state.clock += 1;
            state.request_ts = state.clock;
            state.replies_needed = self.peers.len() - 1;
            state.request_ts
        };
        for peer in 0..self.peers.len() {
            if peer != self.id {
                self.send_request(peer, ts).await;
            }
        }
        loop {
            if self.state.lock().replies_needed == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn unlock(&self) {
        let deferred: Vec<usize> = {
            let mut state = self.state.lock();
            state.requesting = false;
            state.deferred.drain().collect()
        };
        for peer in deferred {
            self.send_reply(peer).await;
        }
    }

    async fn critical_section(&self) {
        let value = match transport::call(self.counter_addr, Envelope::new("get", serde_json::Value::Null), transport::DEFAULT_TIMEOUT).await {
            Ok(reply) => reply.body.get("value").and_then(|v| v.as_i64()).unwrap_or(0),
            Err(error) => {
                log::warn!("[{}] could not read counter: {}", self.id, error);
                return;
            }
        };
        let body = serde_json::json!({ "value": value + 1 });
        if let Err(error) = transport::call(self.counter_addr, Envelope::new("set", body), transport::DEFAULT_TIMEOUT).await {
            log::warn!("[{}] could not write counter: {}", self.id, error);
        }
    }

    pub async fn run_worker(&self, num_loops: usize) {
        for _ in 0..num_loops {
            self.lock().await;
            self.critical_section().await;
            self.unlock().await;
        }
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RaNode {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match envelope.method.as_str() {
            "request" => {
                let peer = match envelope.body.get("id").and_then(|v| v.as_u64()) {
                    Some(id) => id as usize,
                    None => return Reply::bad_request("missing 'id' field"),
                };
                let ts = match envelope.body.get("ts").and_then(|v| v.as_u64()) {
                    Some(ts) => ts,
                    None => return Reply::bad_request("missing 'ts' field"),
                };
                let granted = self.on_request(peer, ts);
                let reply_ts = self.state.lock().clock;
                Reply::ok(serde_json::json!({ "granted": granted, "ts": reply_ts }))
            }
            "reply" => {
                let ts = match envelope.body.get("ts").and_then(|v| v.as_u64()) {
                    Some(ts) => ts,
                    None => return Reply::bad_request("missing 'ts' field"),
                };
                self.on_reply(ts);
                Reply::ok(serde_json::json!({ "ok": true }))
            }
            "status" => Reply::ok(serde_json::json!({ "done": self.is_done() })),
            other => Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

pub struct Service {
    pub node: Arc<RaNode>,
    pub num_loops: usize,
}

#[async_trait]
impl Handler for Service {
    async fn handle(&self, envelope: Envelope) -> Reply {
        if envelope.method == "start" {
            let node = Arc::clone(&self.node);
            let num_loops = self.num_loops;
            tokio::spawn(async move { node.run_worker(num_loops).await });
            return Reply::ok(serde_json::json!({ "started": true }));
        }
        self.node.handle(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferral_decision_follows_lamport_order() {
        let node = RaNode::new(1, vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()], "127.0.0.1:3".parse().unwrap());
        {
            let mut state = node.state.lock();
            state.requesting = true;
            state.request_ts = 5;
        }
        assert!(node.on_request(0, 3), "a smaller (ts, id) than ours must be granted immediately");
        assert!(!node.on_request(0, 9), "a larger (ts, id) than ours must be deferred");
        assert!(node.state.lock().deferred.contains(&0));
    }
}
