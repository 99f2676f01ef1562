//! # Summary
//!
//! Multi-Paxos: one independent single-decree Paxos instance per slot
//! (`round_id`), plus a monotone `current_round` cursor and a background
//! catch-up loop that pulls chosen values a node missed from whichever
//! peer is further ahead. Learned commands are applied, in slot order,
//! to a local [`command::Database`] through the pure [`command::apply`]
//! interpreter -- never by evaluating the command as source.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derivative::Derivative;
use parking_lot::Mutex;
use transport::{Envelope, Handler, Reply};

use crate::command::{self, Command, Database};
use crate::{majority, next_proposal_id_after, Acceptor, AcceptorSnapshot, Learner, RoundOutcome, PROPOSAL_STRIDE};

/// Per-round acceptor table. Entries are created lazily on first touch
/// and never garbage-collected, matching the original's unbounded
/// `self.rounds` dict.
#[derive(Default)]
pub struct AcceptorTable {
    rounds: Mutex<HashMap<u64, Arc<Acceptor<Command>>>>,
}

impl AcceptorTable {
    fn get_or_create(&self, round_id: u64) -> Arc<Acceptor<Command>> {
        Arc::clone(self.rounds.lock().entry(round_id).or_insert_with(|| Arc::new(Acceptor::new())))
    }

    fn snapshot(&self) -> HashMap<u64, AcceptorSnapshot<Command>> {
        self.rounds.lock().iter().map(|(round, acceptor)| (*round, acceptor.snapshot())).collect()
    }
}

/// Per-round learner table, backed by the shared [`Database`] that
/// learned commands are applied into.
#[derive(Default)]
pub struct LearnerTable {
    rounds: Mutex<HashMap<u64, Arc<Learner<Command>>>>,
    db: Mutex<Database>,
}

impl LearnerTable {
    fn get_or_create(&self, round_id: u64) -> Arc<Learner<Command>> {
        Arc::clone(self.rounds.lock().entry(round_id).or_insert_with(|| Arc::new(Learner::new())))
    }

    /// Learns `value` for `round_id`; applies it to the database exactly
    /// once, the first time this round is learned (repeats are asserted
    /// equal by [`Learner::learn`] but not re-applied).
    fn learn(&self, round_id: u64, value: Command) {
        let learner = self.get_or_create(round_id);
        if learner.learn(value.clone()) {
            command::apply(&mut self.db.lock(), &value);
        }
    }

    fn fetch(&self, round_id: u64) -> Option<Command> {
        self.rounds.lock().get(&round_id).and_then(|learner| learner.chosen())
    }

    fn db_snapshot(&self) -> Database {
        self.db.lock().clone()
    }

    fn snapshot(&self) -> HashMap<u64, Option<Command>> {
        self.rounds.lock().iter().map(|(round, learner)| (*round, learner.chosen())).collect()
    }
}

async fn send_prepare(peer: SocketAddr, round_id: u64, proposal_id: u64) -> Option<(bool, AcceptorSnapshot<Command>)> {
    let body = serde_json::json!({ "round_id": round_id, "proposal_id": proposal_id });
    let reply = transport::call(peer, Envelope::new("prepare", body), transport::DEFAULT_TIMEOUT).await.ok()?;
    if !reply.is_ok() {
        return None;
    }
    let success = reply.body.get("success")?.as_bool()?;
    let state: AcceptorSnapshot<Command> = serde_json::from_value(reply.body.get("acceptor_state")?.clone()).ok()?;
    Some((success, state))
}

async fn send_propose(peer: SocketAddr, round_id: u64, proposal_id: u64, value: &Command) -> bool {
    let body = serde_json::json!({ "round_id": round_id, "proposal_id": proposal_id, "value": value });
    match transport::call(peer, Envelope::new("propose", body), transport::DEFAULT_TIMEOUT).await {
        Ok(reply) if reply.is_ok() => reply.body.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
        _ => false,
    }
}

async fn broadcast_learn(peers: &[SocketAddr], round_id: u64, value: &Command) {
    for peer in peers {
        let body = serde_json::json!({ "round_id": round_id, "value": value });
        let _ = transport::call(*peer, Envelope::new("learn", body), transport::DEFAULT_TIMEOUT).await;
    }
}

/// One Multi-Paxos replica: the slot-keyed acceptor/learner tables above,
/// a monotone `current_round` cursor, and the proposer's own `proposal_id`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MultiNode {
    pub id: usize,
    pub peers: Vec<SocketAddr>,
    #[derivative(Debug = "ignore")]
    pub acceptors: AcceptorTable,
    #[derivative(Debug = "ignore")]
    pub learners: LearnerTable,
    proposal_id: Mutex<u64>,
    current_round: AtomicU64,
}

impl MultiNode {
    pub fn new(id: usize, peers: Vec<SocketAddr>) -> Self {
        MultiNode {
            id,
            peers,
            acceptors: AcceptorTable::default(),
            learners: LearnerTable::default(),
            proposal_id: Mutex::new(id as u64),
            current_round: AtomicU64::new(0),
        }
    }

    pub fn current_round(&self) -> u64 {
        self.current_round.load(Ordering::SeqCst)
    }

    /// Advances `current_round` to `candidate` if it is ahead; never
    /// moves it backwards (learned commands must apply in slot order,
    /// and a stale catch-up response must not regress the cursor).
    fn advance_round(&self, candidate: u64) {
        self.current_round.fetch_max(candidate, Ordering::SeqCst);
    }

    fn bump_proposal_id(&self) -> u64 {
        let mut id = self.proposal_id.lock();
        *id += PROPOSAL_STRIDE;
        *id
    }

    pub async fn run_round(&self, round_id: u64, initial_value: Command) -> RoundOutcome<Command> {
        self.run_round_inner(round_id, initial_value, true).await
    }

    fn run_round_inner<'a>(
        &'a self,
        round_id: u64,
        initial_value: Command,
        retry_on_prepare_fail: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RoundOutcome<Command>> + Send + 'a>> {
        Box::pin(async move {
            let proposal_id = self.bump_proposal_id();
            let majority_needed = majority(self.peers.len());

            let mut promises = Vec::new();
            let mut max_seen_promised = None;
            for peer in &self.peers {
                match send_prepare(*peer, round_id, proposal_id).await {
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
                    return self.run_round_inner(round_id, initial_value, false).await;
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
                if send_propose(*peer, round_id, proposal_id, &chosen_value).await {
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

            broadcast_learn(&self.peers, round_id, &chosen_value).await;
            RoundOutcome::Success { proposal_id, value: chosen_value }
        })
    }
}

#[async_trait]
impl Handler for MultiNode {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match envelope.method.as_str() {
            "command" => {
                let command: Command = match serde_json::from_value(envelope.body.get("command").cloned().unwrap_or_default()) {
                    Ok(command) => command,
                    Err(_) => return Reply::bad_request("missing or malformed 'command' field"),
                };
                let round_id = self.current_round();
                let outcome = self.run_round(round_id, command).await;
                if outcome.is_success() {
                    self.advance_round(round_id + 1);
                }
                Reply::ok(serde_json::to_value(&outcome).expect("[INTERNAL ERROR]: RoundOutcome must serialize"))
            }
            "prepare" => {
                let round_id = match envelope.body.get("round_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'round_id' field"),
                };
                let proposal_id = match envelope.body.get("proposal_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'proposal_id' field"),
                };
                let (success, state) = self.acceptors.get_or_create(round_id).on_prepare(proposal_id);
                Reply::ok(serde_json::json!({ "success": success, "acceptor_state": state }))
            }
            "propose" => {
                let round_id = match envelope.body.get("round_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'round_id' field"),
                };
                let proposal_id = match envelope.body.get("proposal_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'proposal_id' field"),
                };
                let value: Command = match serde_json::from_value(envelope.body.get("value").cloned().unwrap_or_default()) {
                    Ok(value) => value,
                    Err(_) => return Reply::bad_request("missing or malformed 'value' field"),
                };
                let (success, state) = self.acceptors.get_or_create(round_id).on_propose(proposal_id, value);
                Reply::ok(serde_json::json!({ "success": success, "acceptor_state": state }))
            }
            "learn" => {
                let round_id = match envelope.body.get("round_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'round_id' field"),
                };
                let value: Command = match serde_json::from_value(envelope.body.get("value").cloned().unwrap_or_default()) {
                    Ok(value) => value,
                    Err(_) => return Reply::bad_request("missing or malformed 'value' field"),
                };
                self.learners.learn(round_id, value);
                Reply::ok(serde_json::json!({ "success": true }))
            }
            "current" => Reply::ok(serde_json::json!({ "round_id": self.current_round() })),
            "fetch" => {
                let round_id = match envelope.body.get("round_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'round_id' field"),
                };
                match self.learners.fetch(round_id) {
                    Some(value) => Reply::ok(serde_json::json!({ "success": true, "round_id": round_id, "value": value })),
                    None => Reply { status: 404, body: serde_json::json!({ "success": false, "error": "no value for this round" }) },
                }
            }
            "db" => Reply::ok(serde_json::json!({
                "current_round": self.current_round(),
                "db": self.learners.db_snapshot(),
            })),
            "status" => Reply::ok(serde_json::json!({
                "node_id": self.id,
                "current_round": self.current_round(),
                "db": self.learners.db_snapshot(),
                "proposer_state": { "proposal_id": *self.proposal_id.lock() },
                "acceptor_state": self.acceptors.snapshot(),
                "learner_state": self.learners.snapshot(),
            })),
            other => Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

/// Background sync loop: every second, asks each peer for its
/// `current_round` and, if ahead, fetches and learns each missing slot
/// in order. Trusts the fetched value outright (no re-running consensus)
/// because the peer's own [`Learner::learn`] has already enforced the
/// single-value invariant for that slot.
pub async fn run_catchup_loop(node: Arc<MultiNode>) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        for (peer_id, peer) in node.peers.iter().enumerate() {
            if peer_id == node.id {
                continue;
            }
            let current = match transport::call(*peer, Envelope::new("current", serde_json::Value::Null), transport::DEFAULT_TIMEOUT).await {
                Ok(reply) if reply.is_ok() => reply.body.get("round_id").and_then(|v| v.as_u64()),
                _ => None,
            };
            let peer_round = match current {
                Some(round) if round > node.current_round() => round,
                _ => continue,
            };
            for round_id in node.current_round()..peer_round {
                let body = serde_json::json!({ "round_id": round_id });
                let fetched = transport::call(*peer, Envelope::new("fetch", body), transport::DEFAULT_TIMEOUT).await;
                let value = match fetched {
                    Ok(reply) if reply.is_ok() => reply.body.get("value").cloned().and_then(|v| serde_json::from_value::<Command>(v).ok()),
                    _ => None,
                };
                if let Some(value) = value {
                    node.learners.learn(round_id, value);
                }
            }
            node.advance_round(peer_round);
        }
    }
}
