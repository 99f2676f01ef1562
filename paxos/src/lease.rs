//! # Summary
//!
//! PaxosLease: a short-lived distributed lease layered on the same
//! acceptor core as single-decree Paxos, plus a per-acceptor expiry
//! timer that forgets a stale promise without any further protocol
//! round, and a proposer-side expiry timer whose ordering (started
//! *before* propose is sent) is what makes two simultaneous owners
//! impossible. The proactive half-lease extension is a configuration
//! flag (`extend`) rather than a separate implementation, since it is
//! the same acquire path re-entered with `extend_existing`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use transport::{Envelope, Handler, Reply};

use crate::{majority, next_proposal_id_after, Acceptor, AcceptorSnapshot, PROPOSAL_STRIDE};

/// Seconds since the Unix epoch, as an acceptor-local wallclock reading.
/// Never compared across nodes; only used to compute a remaining-time
/// hint returned to the caller.
fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// The value a PaxosLease acceptor accepts: an exclusive ownership claim
/// good for `lease_seconds`, expiring at the acceptor's own `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseValue {
    pub owner: usize,
    pub lease_seconds: f64,
    pub expires_at: f64,
}

/// The outcome of one lease acquire/extend/release attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeaseOutcome {
    Success { proposal_id: u64, lease_owner: usize, lease_seconds: f64, lease_expires_at: f64 },
    FailedPrepare { proposal_id: u64, reason: String },
    FailedPropose { proposal_id: u64, reason: String },
    LeaseBusy { proposal_id: u64, reason: String },
    NoLease,
    Released { proposal_id: u64 },
}

/// The acceptor half: a normal [`Acceptor<LeaseValue>`] plus a timer,
/// private to this module, that clears `accepted_n`/`accepted_value`
/// `lease_seconds` after a successful propose -- independent of, and not
/// synchronized with, the proposer's own expiry timer.
pub struct LeaseAcceptor {
    acceptor: Arc<Acceptor<LeaseValue>>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for LeaseAcceptor {
    fn default() -> Self {
        LeaseAcceptor { acceptor: Arc::new(Acceptor::new()), timer: Mutex::new(None) }
    }
}

impl LeaseAcceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_prepare(&self, n: u64) -> (bool, AcceptorSnapshot<LeaseValue>) {
        self.acceptor.on_prepare(n)
    }

    /// Accepts `(n, {owner, lease_seconds})` and, on success, (re)starts
    /// the expiry timer: cancel-then-schedule, always, on every accepted
    /// propose.
    pub fn on_propose(&self, n: u64, owner: usize, lease_seconds: f64) -> (bool, AcceptorSnapshot<LeaseValue>) {
        let value = LeaseValue { owner, lease_seconds, expires_at: now_unix() + lease_seconds };
        let (success, state) = self.acceptor.on_propose(n, value);
        if success {
            self.restart_timer(lease_seconds);
        }
        (success, state)
    }

    fn restart_timer(&self, lease_seconds: f64) {
        let mut guard = self.timer.lock();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let acceptor = Arc::clone(&self.acceptor);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(lease_seconds)).await;
            acceptor.clear_accepted();
        }));
    }

    /// Clears the accepted lease iff `proposal_id` is still the accepted
    /// proposal -- an explicit release from a proposer that no longer
    /// believes itself the owner is a no-op here.
    pub fn on_release(&self, proposal_id: u64) -> (bool, AcceptorSnapshot<LeaseValue>) {
        let current = self.acceptor.snapshot();
        if current.accepted_n == Some(proposal_id) {
            if let Some(handle) = self.timer.lock().take() {
                handle.abort();
            }
            self.acceptor.clear_accepted();
            (true, self.acceptor.snapshot())
        } else {
            (false, current)
        }
    }

    pub fn snapshot(&self) -> AcceptorSnapshot<LeaseValue> {
        self.acceptor.snapshot()
    }
}

async fn send_prepare(peer: SocketAddr, proposal_id: u64) -> Option<AcceptorSnapshot<LeaseValue>> {
    let body = serde_json::json!({ "proposal_id": proposal_id });
    let reply = transport::call(peer, Envelope::new("prepare", body), transport::DEFAULT_TIMEOUT).await.ok()?;
    if !reply.is_ok() {
        return None;
    }
    serde_json::from_value(reply.body.get("acceptor_state")?.clone()).ok()
}

async fn send_propose(peer: SocketAddr, proposal_id: u64, owner: usize, lease_seconds: f64) -> bool {
    let body = serde_json::json!({ "proposal_id": proposal_id, "lease_owner": owner, "lease_seconds": lease_seconds });
    match transport::call(peer, Envelope::new("propose", body), transport::DEFAULT_TIMEOUT).await {
        Ok(reply) if reply.is_ok() => reply.body.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
        _ => false,
    }
}

async fn send_release(peer: SocketAddr, proposal_id: u64) {
    let body = serde_json::json!({ "proposal_id": proposal_id });
    let _ = transport::call(peer, Envelope::new("release", body), transport::DEFAULT_TIMEOUT).await;
}

/// The proposer half. Held behind `Arc` because a successful acquire, in
/// the extension variant, spawns a task that re-enters `acquire` on
/// itself at the halfway mark -- the core needs to hand out references
/// to itself across an `.await` boundary.
pub struct LeaseProposer {
    node_id: usize,
    peers: Vec<SocketAddr>,
    lease_seconds: f64,
    /// Whether a successful acquire schedules a halfway extension.
    extend: bool,
    proposal_id: Mutex<u64>,
    lease_owner: AtomicBool,
    lease_expires_at: Mutex<Option<f64>>,
    lease_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    extend_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LeaseProposer {
    pub fn new(node_id: usize, peers: Vec<SocketAddr>, lease_seconds: f64, extend: bool) -> Self {
        LeaseProposer {
            node_id,
            peers,
            lease_seconds,
            extend,
            proposal_id: Mutex::new(node_id as u64),
            lease_owner: AtomicBool::new(false),
            lease_expires_at: Mutex::new(None),
            lease_timer: Mutex::new(None),
            extend_timer: Mutex::new(None),
        }
    }

    pub fn is_lease_owner(&self) -> bool {
        self.lease_owner.load(Ordering::SeqCst)
    }

    pub fn proposal_id(&self) -> u64 {
        *self.proposal_id.lock()
    }

    pub fn lease_expires_at(&self) -> Option<f64> {
        *self.lease_expires_at.lock()
    }

    fn bump_proposal_id(&self) -> u64 {
        let mut id = self.proposal_id.lock();
        *id += PROPOSAL_STRIDE;
        *id
    }

    fn cancel_lease_timer(&self) {
        if let Some(handle) = self.lease_timer.lock().take() {
            handle.abort();
        }
    }

    fn cancel_extend_timer(&self) {
        if let Some(handle) = self.extend_timer.lock().take() {
            handle.abort();
        }
    }

    /// Starts (replacing any prior) the local expiry timer *before* the
    /// caller sends propose -- this ordering is the crux of PaxosLease's
    /// mutual-exclusion argument. In the extension variant, also arms a
    /// timer at half the remaining lease that re-enters `acquire` with
    /// `extend_existing`.
    fn start_local_lease_timer(self: &Arc<Self>, lease_seconds: f64) {
        self.cancel_lease_timer();
        let expires_at = now_unix() + lease_seconds;
        *self.lease_expires_at.lock() = Some(expires_at);

        let this = Arc::clone(self);
        *self.lease_timer.lock() = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(lease_seconds)).await;
            this.lease_owner.store(false, Ordering::SeqCst);
            *this.lease_expires_at.lock() = None;
            this.cancel_extend_timer();
        }));

        self.cancel_extend_timer();
        if self.extend {
            let this = Arc::clone(self);
            let extend_after = lease_seconds / 2.0;
            *self.extend_timer.lock() = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(extend_after)).await;
                if !this.is_lease_owner() {
                    return;
                }
                let _ = this.acquire(false, true).await;
            }));
        }
    }

    /// Runs one acquire (or, with `extend_existing`, extend) attempt.
    /// Retries exactly once on prepare failure (jumping past the highest
    /// `promised_n` observed), matching the general proposer retry rule.
    pub async fn acquire(self: &Arc<Self>, retry_on_prepare_fail: bool, extend_existing: bool) -> LeaseOutcome {
        let proposal_id = self.bump_proposal_id();
        let majority_needed = majority(self.peers.len());

        let mut responses = Vec::new();
        for peer in &self.peers {
            responses.push(send_prepare(*peer, proposal_id).await);
        }
        let max_seen_promised = responses.iter().flatten().filter_map(|state| state.promised_n).max();
        let promises: Vec<&AcceptorSnapshot<LeaseValue>> = responses.iter().flatten().collect();

        if promises.len() < majority_needed {
            if retry_on_prepare_fail {
                let next_id = next_proposal_id_after(self.node_id as u64, max_seen_promised);
                *self.proposal_id.lock() = next_id - PROPOSAL_STRIDE;
                return Box::pin(self.acquire(false, extend_existing)).await;
            }
            return LeaseOutcome::FailedPrepare {
                proposal_id,
                reason: format!("only got {} promises, need {}", promises.len(), majority_needed),
            };
        }

        let open_promises = promises
            .iter()
            .filter(|state| match &state.accepted_value {
                None => true,
                Some(lease) => extend_existing && lease.owner == self.node_id,
            })
            .count();
        if open_promises < majority_needed {
            return LeaseOutcome::LeaseBusy {
                proposal_id,
                reason: "a majority of acceptors already hold some other lease".to_string(),
            };
        }

        self.start_local_lease_timer(self.lease_seconds);
        let mut accepts = 0;
        for peer in &self.peers {
            if send_propose(*peer, proposal_id, self.node_id, self.lease_seconds).await {
                accepts += 1;
            }
        }

        if accepts < majority_needed {
            self.cancel_lease_timer();
            self.cancel_extend_timer();
            self.lease_owner.store(false, Ordering::SeqCst);
            *self.lease_expires_at.lock() = None;
            return LeaseOutcome::FailedPropose {
                proposal_id,
                reason: format!("only got {} accepts, need {}", accepts, majority_needed),
            };
        }

        self.lease_owner.store(true, Ordering::SeqCst);
        LeaseOutcome::Success {
            proposal_id,
            lease_owner: self.node_id,
            lease_seconds: self.lease_seconds,
            lease_expires_at: self.lease_expires_at().unwrap_or(0.0),
        }
    }

    /// Explicit early release: drop local ownership, cancel timers, tell
    /// every acceptor to forget this proposal if it is still the
    /// accepted one.
    pub async fn release(self: &Arc<Self>) -> LeaseOutcome {
        if !self.is_lease_owner() {
            return LeaseOutcome::NoLease;
        }
        let proposal_id = self.proposal_id();
        self.lease_owner.store(false, Ordering::SeqCst);
        *self.lease_expires_at.lock() = None;
        self.cancel_lease_timer();
        self.cancel_extend_timer();
        for peer in &self.peers {
            send_release(*peer, proposal_id).await;
        }
        LeaseOutcome::Released { proposal_id }
    }
}

/// Serves the lease protocol endpoints. `proposer.extend` controls
/// whether `/start` schedules proactive extension; `/stop` is always
/// exposed (harmless when unused) so a single binary covers both the
/// plain and extension variants.
pub struct NodeService {
    pub id: usize,
    pub acceptor: LeaseAcceptor,
    pub proposer: Arc<LeaseProposer>,
}

#[async_trait]
impl Handler for NodeService {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match envelope.method.as_str() {
            "start" => {
                let outcome = self.proposer.acquire(true, false).await;
                Reply::ok(serde_json::to_value(&outcome).expect("[INTERNAL ERROR]: LeaseOutcome must serialize"))
            }
            "stop" => {
                let outcome = self.proposer.release().await;
                Reply::ok(serde_json::to_value(&outcome).expect("[INTERNAL ERROR]: LeaseOutcome must serialize"))
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
                let owner = match envelope.body.get("lease_owner").and_then(|v| v.as_u64()) {
                    Some(owner) => owner as usize,
                    None => return Reply::bad_request("missing 'lease_owner' field"),
                };
                let lease_seconds = match envelope.body.get("lease_seconds").and_then(|v| v.as_f64()) {
                    Some(seconds) => seconds,
                    None => return Reply::bad_request("missing 'lease_seconds' field"),
                };
                let (success, state) = self.acceptor.on_propose(proposal_id, owner, lease_seconds);
                Reply::ok(serde_json::json!({ "success": success, "acceptor_state": state }))
            }
            "release" => {
                let proposal_id = match envelope.body.get("proposal_id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => return Reply::bad_request("missing 'proposal_id' field"),
                };
                let (success, state) = self.acceptor.on_release(proposal_id);
                Reply::ok(serde_json::json!({ "success": success, "acceptor_state": state }))
            }
            "status" => Reply::ok(serde_json::json!({
                "node_id": self.id,
                "proposer_state": {
                    "proposal_id": self.proposer.proposal_id(),
                    "lease_owner": self.proposer.is_lease_owner(),
                    "lease_expires_at": self.proposer.lease_expires_at(),
                },
                "acceptor_state": self.acceptor.snapshot(),
            })),
            other => Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_propose_sets_lease_value_and_expiry() {
        let acceptor = LeaseAcceptor::new();
        let (success, state) = acceptor.on_propose(256, 0, 5.0);
        assert!(success);
        let lease = state.accepted_value.expect("lease value must be set");
        assert_eq!(lease.owner, 0);
        assert_eq!(lease.lease_seconds, 5.0);
        assert!(lease.expires_at > now_unix());
    }

    #[test]
    fn on_release_clears_only_matching_proposal() {
        let acceptor = LeaseAcceptor::new();
        acceptor.on_propose(256, 0, 5.0);
        let (released, _) = acceptor.on_release(999);
        assert!(!released, "a release for a different proposal id must be a no-op");
        let (released, state) = acceptor.on_release(256);
        assert!(released);
        assert!(state.accepted_value.is_none());
    }
}
