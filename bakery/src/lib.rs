//! # Summary
//!
//! Lamport's bakery algorithm: N-process mutual exclusion by ticket
//! number. Each node announces intent by reading every peer's current
//! ticket, then waits for peers holding a lower `(ticket, id)` pair to
//! finish before entering its critical section.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use transport::{Envelope, Handler, Reply};

#[derive(Debug, Default, Clone, Copy)]
struct Ticket {
    choosing: bool,
    value: u64,
}

pub struct BakeryNode {
    pub id: usize,
    pub peers: Vec<SocketAddr>,
    pub counter_addr: SocketAddr,
    state: RwLock<Ticket>,
    done: AtomicBool,
}

impl BakeryNode {
    pub fn new(id: usize, peers: Vec<SocketAddr>, counter_addr: SocketAddr) -> Self {
        BakeryNode { id, peers, counter_addr, state: RwLock::new(Ticket::default()), done: AtomicBool::new(false) }
    }

    fn choosing(&self) -> bool {
        self.state.read().choosing
    }

    fn ticket(&self) -> u64 {
        self.state.read().value
    }

    async fn peer_choosing(&self, peer: usize) -> bool {
        match transport::call(self.peers[peer], Envelope::new("choosing", serde_json::Value::Null), transport::DEFAULT_TIMEOUT).await {
            Ok(reply) => reply.body.get("choosing").and_then(|v| v.as_bool()).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn peer_ticket(&self, peer: usize) -> u64 {
        match transport::call(self.peers[peer], Envelope::new("ticket", serde_json::Value::Null), transport::DEFAULT_TIMEOUT).await {
            Ok(reply) => reply.body.get("ticket").and_then(|v| v.as_u64()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Announces intent to enter the critical section: sets `choosing`,
    /// samples every peer's current ticket, takes one more than the max,
    /// then clears `choosing`.
    pub async fn announce_intent(&self) {
        self.state.write().choosing = true;
        let mut max = 0u64;
        for peer in 0..self.peers.len() {
            if peer == self.id {
                continue;
            }
            max = max.max(self.peer_ticket(peer).await);
        }
        let mut state = self.state.write();
        state.value = max + 1;
        state.choosing = false;
    }

    /// Waits until every peer with a smaller `(ticket, id)` pair has
    /// released (or is not contending).
    pub async fn wait_acquire(&self) {
        let my_ticket = self.ticket();
        for peer in 0..self.peers.len() {
            if peer == self.id {
                continue;
            }
            loop {
                if !self.peer_choosing(peer).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            loop {
                let their_ticket = self.peer_ticket(peer).await;
                if their_ticket == 0 || (their_ticket, peer) > (my_ticket, self.id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    pub fn release(&self) {
        self.state.write().value = 0;
    }

    pub async fn lock(&self) {
        self.announce_intent().await;
        self.wait_acquire().await;
    }

    pub fn unlock(&self) {
        self.release();
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
            self.unlock();
        }
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for BakeryNode {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match envelope.method.as_str() {
            "choosing" => Reply::ok(serde_json::json!({ "choosing": self.choosing() })),
            "ticket" => Reply::ok(serde_json::json!({ "ticket": self.ticket() })),
            "status" => Reply::ok(serde_json::json!({ "done": self.is_done() })),
            other => Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

/// Wraps a node behind an `Arc` so that a `start` request can spawn its
/// worker loop as an independent task instead of blocking the reply.
pub struct Service {
    pub node: Arc<BakeryNode>,
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
    fn ticket_starts_at_zero_and_resets_on_release() {
        let node = BakeryNode::new(0, vec!["127.0.0.1:1".parse().unwrap()], "127.0.0.1:2".parse().unwrap());
        assert_eq!(node.ticket(), 0);
        node.state.write().value = 7;
        node.release();
        assert_eq!(node.ticket(), 0);
    }

    #[test]
    fn tie_break_favors_lower_id() {
        let a = (3u64, 1usize);
        let b = (3u64, 2usize);
        assert!(a < b);
    }
}
