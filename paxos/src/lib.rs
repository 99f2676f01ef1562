//! # Summary
//!
//! Single-decree Paxos: one acceptor, one proposer, one learner per node,
//! deciding a single opaque value among `n` peers. [`multi`] and [`lease`]
//! build on the same [`Acceptor`]/[`Learner`] core to give a replicated
//! command log and a short-lived distributed lease, respectively.

pub mod command;
pub mod lease;
pub mod multi;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use transport::{Envelope, Handler, Reply};

/// Spaces proposal ids by this stride so that `node_id + k*stride` never
/// collides across distinct nodes.
pub const PROPOSAL_STRIDE: u64 = 256;

/// The smallest proposal id of the form `node_id + k*STRIDE` strictly
/// greater than `seen`. `seen = None` means "nothing observed yet",
/// in which case the node's own first id (`node_id`) is returned.
pub fn next_proposal_id_after(node_id: u64, seen: Option<u64>) -> u64 {
    let seen = match seen {
        Some(seen) => seen,
        None => return node_id,
    };
    let seen = seen as i64;
    let node_id = node_id as i64;
    let stride = PROPOSAL_STRIDE as i64;
    let k = (seen - node_id).div_euclid(stride) + 1;
    let mut candidate = k * stride + node_id;
    if candidate <= seen {
        candidate += stride;
    }
    candidate as u64
}

pub(crate) fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// A snapshot of [`Acceptor`] state, serialized verbatim into `status`
/// and `prepare`/`propose` replies, matching the originals' `state.__dict__`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptorSnapshot<V> {
    pub promised_n: Option<u64>,
    pub accepted_n: Option<u64>,
    pub accepted_value: Option<V>,
}

/// The classical Paxos acceptor: `on_prepare` promises not to accept any
/// proposal below `n`; `on_propose` accepts `(n, v)` iff no higher prepare
/// has been promised since. Note the asymmetric `>` vs `>=`: a proposer
/// holding a matching promise may propose without re-preparing.
pub struct Acceptor<V> {
    state: Mutex<AcceptorSnapshot<V>>,
}

impl<V: Clone> Default for Acceptor<V> {
    fn default() -> Self {
        Acceptor { state: Mutex::new(AcceptorSnapshot::default()) }
    }
}

impl<V: Clone> Acceptor<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_prepare(&self, n: u64) -> (bool, AcceptorSnapshot<V>) {
        let mut state = self.state.lock();
        let success = match state.promised_n {
            None => true,
            Some(promised) => n > promised,
        };
        if success {
            state.promised_n = Some(n);
        }
        (success, state.clone())
    }

    pub fn on_propose(&self, n: u64, value: V) -> (bool, AcceptorSnapshot<V>) {
        let mut state = self.state.lock();
        let success = match state.promised_n {
            None => true,
            Some(promised) => n >= promised,
        };
        if success {
            state.promised_n = Some(n);
            state.accepted_n = Some(n);
            state.accepted_value = Some(value);
        }
        (success, state.clone())
    }

    pub fn snapshot(&self) -> AcceptorSnapshot<V> {
        self.state.lock().clone()
    }

    /// Forgets any accepted value without touching `promised_n` -- used
    /// by PaxosLease's per-acceptor expiry timer to let a stale promise
    /// lapse without a further protocol round.
    pub fn clear_accepted(&self) {
        let mut state = self.state.lock();
        state.accepted_n = None;
        state.accepted_value = None;
    }
}

/// Records the single chosen value for a slot. A second, differing
/// `learn` is a safety violation (two learners agreeing to disagree) and
/// is fatal: assert-and-abort, rather than a swallowed error.
pub struct Learner<V> {
    chosen: Mutex<Option<V>>,
}

impl<V: Clone + PartialEq + std::fmt::Debug> Default for Learner<V> {
    fn default() -> Self {
        Learner { chosen: Mutex::new(None) }
    }
}

impl<V: Clone + PartialEq + std::fmt::Debug> Learner<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` as chosen. Returns `true` the first time a value
    /// is learned for this instance, `false` on a repeat (already-equal)
    /// learn -- callers use this to apply a command exactly once.
    pub fn learn(&self, value: V) -> bool {
        let mut chosen = self.chosen.lock();
        match &*chosen {
            Some(existing) => {
                assert_eq!(*existing, value, "learner observed two different chosen values for one slot");
                false
            }
            None => {
                *chosen = Some(value);
                true
            }
        }
    }

    pub fn chosen(&self) -> Option<V> {
        self.chosen.lock().clone()
    }
}

/// The outcome of one Paxos round, returned to the caller as a typed
/// result rather than a bare `Result<_, String>`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome<V> {
    Success { proposal_id: u64, value: V },
    FailedPrepare { proposal_id: u64, reason: String },
    FailedPropose { proposal_id: u64, value: V, reason: String },
}

impl<V> RoundOutcome<V> {
    pub fn is_success(&self) -> bool {
        matches!(self, RoundOutcome::Success { .. })
    }
}

async fn send_prepare(peer: SocketAddr, proposal_id: u64) -> Option<(bool, AcceptorSnapshot<Value>)> {
    let body = serde_json::json!({ "proposal_id": proposal_id });
    let reply = transport::call(peer, Envelope::new("prepare", body), transport::DEFAULT_TIMEOUT).await.ok()?;
    if !reply.is_ok() {
        return None;
    }
    let success = reply.body.get("success")?.as_bool()?;
    let state: AcceptorSnapshot<Value> = serde_json::from_value(reply.body.get("acceptor_state")?.clone()).ok()?;
    Some((success, state))
}

async fn send_propose(peer: SocketAddr, proposal_id: u64, value: &Value) -> bool {
    let body = serde_json::json!({ "proposal_id": proposal_id, "value": value });
    match transport::call(peer, Envelope::new("propose", body), transport::DEFAULT_TIMEOUT).await {
        Ok(reply) if reply.is_ok() => reply.body.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
        _ => false,
    }
}

async fn broadcast_learn(peers: &[SocketAddr], value: &Value) {
    for peer in peers {
        let body = serde_json::json!({ "value": value });
        let _ = transport::call(*peer, Envelope::new("learn", body), transport::DEFAULT_TIMEOUT).await;
    }
}

/// One node's single-slot Paxos triple. Proposing is self-inclusive: a
/// node sends `prepare`/`propose` to itself over the same transport as
/// every other peer, matching the originals' "peers includes self" loop.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Node {
    pub id: usize,
    pub peers: Vec<SocketAddr>,
    #[derivative(Debug = "ignore")]
    pub acceptor: Acceptor<Value>,
    #[derivative(Debug = "ignore")]
    pub learner: Learner<Value>,
    proposal_id: Mutex<u64>,
}

impl Node {
    pub fn new(id: usize, peers: Vec<SocketAddr>) -> Self {
        Node { id, peers, acceptor: Acceptor::new(), learner: Learner::new(), proposal_id: Mutex::new(id as u64) }
    }

    fn bump_proposal_id(&self) -> u64 {
        let mut id = self.proposal_id.lock();
        *id += PROPOSAL_STRIDE;
        *id
    }

    /// Runs one full prepare/propose/learn round, retrying exactly once
    /// (jumping past the highest `promised_n` observed) on prepare failure.
    pub async fn run_round(&self, initial_value: Value) -> RoundOutcome<Value> {
        self.run_round_inner(initial_value, true).await
    }

    async fn run_round_inner(&self, initial_value: Value, retry_on_prepare_fail: bool) -> RoundOutcome<Value> {
        let proposal_id = self.bump_proposal_id();
        let majority_needed = majority(self.peers.len());

        let mut promises = Vec::new();
        let mut max_seen_promised = None;
        for peer in &self.peers {
            match send_prepare(*peer, proposal_id).await {
                Some((true, state)) => {
                    max_seen_promised = std::cmp::max(max_seen_promised, state.promised_n);
                    promises.push(state);
                }
                Some((false, state)) => {
                    max_seen_promised = std::cmp::max(max_seen_promised, state.promised_n);
                }
                None => {}
            }
        }

        if promises.len() < majority_needed {
            if retry_on_prepare_fail {
                let next_id = next_proposal_id_after(self.id as u64, max_seen_promised);
                *self.proposal_id.lock() = next_id - PROPOSAL_STRIDE;
                return Box::pin(self.run_round_inner(initial_value, false)).await;
            }
            return RoundOutcome::FailedPrepare {
                proposal_id,
                reason: format!("only got {} promises, need {}", promises.len(), majority_needed),
            };
        }

        let mut chosen_value = initial_value;
        let mut highest_accepted_n = None;
        for promise in &promises {
            if let (Some(n), Some(value)) = (promise.accepted_n, &promise.accepted_value) {
                if highest_accepted_n.map_or(true, |highest| n > highest) {
                    highest_accepted_n = Some(n);
                    chosen_value = value.clone();
                }
            }
        }

        let mut accepts = 0;
        for peer in &self.peers {
            if send_propose(*peer, proposal_id, &chosen_value).await {
                accepts += 1;
            }
        }

        if accepts < majority_needed {
            return RoundOutcome::FailedPropose {
                proposal_id,
                value: chosen_value,
                reason: format!("only got {} accepts, need {}", accepts, majority_needed),
            };
        }

        broadcast_learn(&self.peers, &chosen_value).await;
        RoundOutcome::Success { proposal_id, value: chosen_value }
    }
}

#[async_trait]
impl Handler for Node {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match envelope.method.as_str() {
            "start" => {
                let value = match envelope.body.get("value") {
                    Some(value) => value.clone(),
                    None => return Reply::bad_request("missing 'value' field"),
                };
                let outcome = self.run_round(value).await;
                Reply::ok(serde_json::to_value(&outcome).expect("[INTERNAL ERROR]: RoundOutcome must serialize"))
            }
            "prepare" => {
                let proposal_id = match envelope.body.get("proposal_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'proposal_id' field"),
                };
                let (success, state) = self.acceptor.on_prepare(proposal_id);
                Reply::ok(serde_json::json!({ "success": success, "acceptor_state": state }))
            }
            "propose" => {
                let proposal_id = match envelope.body.get("proposal_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'proposal_id' field"),
                };
                let value = match envelope.body.get("value") {
                    Some(value) => value.clone(),
                    None => return Reply::bad_request("missing 'value' field"),
                };
                let (success, state) = self.acceptor.on_propose(proposal_id, value);
                Reply::ok(serde_json::json!({ "success": success, "acceptor_state": state }))
            }
            "learn" => {
                let value = match envelope.body.get("value") {
                    Some(value) => value.clone(),
                    None => return Reply::bad_request("missing 'value' field"),
                };
                self.learner.learn(value);
                Reply::ok(serde_json::json!({ "success": true }))
            }
            "status" => Reply::ok(serde_json::json!({
                "node_id": self.id,
                "proposer_state": { "proposal_id": *self.proposal_id.lock() },
                "acceptor_state": self.acceptor.snapshot(),
                "learner_state": { "chosen_value": self.learner.chosen() },
            })),
            other => Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

pub type SharedNode = Arc<Node>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_proposal_id_with_nothing_seen_is_own_id() {
        assert_eq!(next_proposal_id_after(2, None), 2);
    }

    #[test]
    fn next_proposal_id_skips_past_higher_seen_id() {
        // node 1's ids are 1, 257, 513, ...; after seeing 300 the next must
        // be the smallest node-1 id strictly greater than 300, i.e. 513.
        assert_eq!(next_proposal_id_after(1, Some(300)), 513);
    }

    #[test]
    fn next_proposal_id_past_own_earlier_id_is_next_stride() {
        assert_eq!(next_proposal_id_after(1, Some(1)), 257);
    }

    #[test]
    fn acceptor_promises_are_monotone() {
        let acceptor: Acceptor<Value> = Acceptor::new();
        let (first, _) = acceptor.on_prepare(5);
        assert!(first);
        let (second, _) = acceptor.on_prepare(5);
        assert!(!second, "an equal proposal id must not be re-promised");
        let (third, _) = acceptor.on_prepare(6);
        assert!(third);
    }

    #[test]
    fn acceptor_propose_accepts_proposal_matching_promise() {
        let acceptor: Acceptor<Value> = Acceptor::new();
        acceptor.on_prepare(10);
        let (success, state) = acceptor.on_propose(10, Value::from("A"));
        assert!(success, "propose with n == promised_n must be accepted (asymmetric >=)");
        assert_eq!(state.accepted_value, Some(Value::from("A")));
    }

    #[test]
    fn acceptor_propose_rejects_below_promise() {
        let acceptor: Acceptor<Value> = Acceptor::new();
        acceptor.on_prepare(10);
        let (success, _) = acceptor.on_propose(9, Value::from("A"));
        assert!(!success);
    }

    #[test]
    fn learner_accepts_repeated_identical_value() {
        let learner: Learner<Value> = Learner::new();
        learner.learn(Value::from("A"));
        learner.learn(Value::from("A"));
        assert_eq!(learner.chosen(), Some(Value::from("A")));
    }

    #[test]
    #[should_panic(expected = "two different chosen values")]
    fn learner_panics_on_conflicting_learn() {
        let learner: Learner<Value> = Learner::new();
        learner.learn(Value::from("A"));
        learner.learn(Value::from("B"));
    }
}
