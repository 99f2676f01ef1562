//! # Summary
//!
//! The recursive Oral Messages algorithm (`OM(m)`) at the heart of every
//! Byzantine-agreement variant in this workspace. [`ByzantineConsensus`]
//! is deliberately transport-agnostic: it records received `(path,
//! value)` pairs and computes the recursive majority decision, while the
//! actual sending of forwarded messages is injected through the
//! [`Transport`] trait so the plain, king-rotation, and signed variants
//! can each wire it up differently.

pub mod net;
pub mod sign;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use derivative::Derivative;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The forwarding chain a message has traveled, used directly as a map
/// key. Treated as an immutable tuple -- never mutated after a path is
/// first constructed and handed off.
pub type Path = Vec<usize>;

/// The order a Byzantine general is agreeing on. Generalizes the
/// original's free-form strings to the two values every scenario in this
/// workspace actually exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    Attack,
    Retreat,
}

impl Order {
    pub fn flip(self) -> Self {
        match self {
            Order::Attack => Order::Retreat,
            Order::Retreat => Order::Attack,
        }
    }
}

/// Returns the falling factorial `n * (n-1) * ... * (n-k+1)`, i.e. the
/// number of ordered ways to pick `k` items from `n`. Used to compute the
/// expected Byzantine message cascade size.
fn falling_factorial(n: usize, k: usize) -> usize {
    if k == 0 || k > n {
        return if k == 0 { 1 } else { 0 };
    }
    (n - k + 1..=n).product()
}

/// The majority value among `values`, breaking ties with `tie_breaker`
/// (called with the full slice) when no value has a strict plurality.
pub fn majority<V: Eq + Hash + Clone>(values: &[V], tie_breaker: impl Fn(&[V]) -> V) -> V {
    let mut counts: HashMap<&V, usize> = HashMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    let mut winners = counts.into_iter().filter(|(_, count)| *count == max).map(|(v, _)| v.clone());
    let first = winners.next();
    match (first, winners.next()) {
        (Some(value), None) => value,
        _ => tie_breaker(values),
    }
}

/// Injected send capability: deliver `value` along `path` to peer `to`.
/// Kept separate from [`ByzantineConsensus`] so the core has no
/// back-edge to the transport, per the no-self-reference design note.
#[async_trait]
pub trait Transport<V: Send>: Send + Sync {
    async fn send(&self, to: usize, path: Path, value: V);
}

/// Decides what value (if any) this node forwards on behalf of a
/// message it just received. An honest node forwards the value
/// unchanged; a traitor may alter it or return `None` to drop the
/// message outright (simulating a message that never arrives).
pub trait NextValue<V>: Send + Sync {
    fn next_value(&self, path: &Path, value: &V) -> Option<V>;
}

impl<V, T: NextValue<V> + ?Sized> NextValue<V> for Box<T> {
    fn next_value(&self, path: &Path, value: &V) -> Option<V> {
        (**self).next_value(path, value)
    }
}

impl<V, T: NextValue<V> + ?Sized> NextValue<V> for std::sync::Arc<T> {
    fn next_value(&self, path: &Path, value: &V) -> Option<V> {
        (**self).next_value(path, value)
    }
}

pub struct Honest;

impl<V: Clone> NextValue<V> for Honest {
    fn next_value(&self, _path: &Path, value: &V) -> Option<V> {
        Some(value.clone())
    }
}

/// Flips every other forwarded value; the conventional "traitor" used in
/// the reference scenarios.
pub struct Faulty {
    count: Mutex<usize>,
}

impl Default for Faulty {
    fn default() -> Self {
        Faulty { count: Mutex::new(0) }
    }
}

impl NextValue<Order> for Faulty {
    fn next_value(&self, _path: &Path, value: &Order) -> Option<Order> {
        let mut count = self.count.lock();
        *count += 1;
        Some(if *count % 2 == 0 { *value } else { value.flip() })
    }
}

/// One running instance of `OM(m)` among `n = 3m+1` nodes. A multi-round
/// general keeps one of these per `round_id`; a single-round general
/// keeps exactly one.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ByzantineConsensus<V> {
    id: usize,
    n: usize,
    m: usize,
    #[derivative(Debug = "ignore")]
    received: Mutex<HashMap<Path, V>>,
    done: AtomicBool,
    #[derivative(Debug = "ignore")]
    value: Mutex<Option<V>>,
}

impl<V: Clone + Send + Sync + 'static> ByzantineConsensus<V> {
    pub fn new(id: usize, n: usize, m: usize) -> Self {
        ByzantineConsensus {
            id,
            n,
            m,
            received: Mutex::new(HashMap::new()),
            done: AtomicBool::new(false),
            value: Mutex::new(None),
        }
    }

    /// Total number of distinct paths this node expects to receive
    /// before it is done, matching the recursive cascade's path count.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn expected_total(&self) -> usize {
        (0..=self.m).map(|k| falling_factorial(self.n.saturating_sub(2), self.m - k)).sum()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// The king's own entry point: records its own order under its
    /// one-element path, caches it as the decided value, and marks
    /// itself done immediately, since a king never receives a message
    /// about its own order from anyone else. Mirrors the reference
    /// `start()`, which sets `self._value` and `self._done = True`
    /// before any broadcast goes out.
    pub fn start(&self, order: V) {
        self.received.lock().insert(vec![self.id], order.clone());
        *self.value.lock() = Some(order);
        self.done.store(true, Ordering::SeqCst);
    }

    /// Records an inbound `(path, value)` and forwards it onward to every
    /// peer not already on the path, provided there are rounds left
    /// (`k = 1 + m - path.len() > 0`) and `next_value` doesn't drop it.
    pub async fn on_message<T, N>(&self, path: Path, value: V, transport: &T, next_value: &N)
    where
        T: Transport<V>,
        N: NextValue<V>,
    {
        {
            let mut received = self.received.lock();
            received.insert(path.clone(), value.clone());
        }
        let k = (1 + self.m).saturating_sub(path.len());
        if k > 0 {
            if let Some(forwarded) = next_value.next_value(&path, &value) {
                for peer in 0..self.n {
                    if peer == self.id || path.contains(&peer) {
                        continue;
                    }
                    let mut next_path = path.clone();
                    next_path.push(self.id);
                    transport.send(peer, next_path, forwarded.clone()).await;
                }
            }
        }
        if self.received_count() >= self.expected_total() {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    /// Computes this node's decision by recursively applying `OM` over
    /// the messages received so far, starting from the king's own path.
    /// A king returns its own cached order directly without recursing
    /// (it never receives its own broadcast back, so `om` would wrongly
    /// dilute it with defaults); any other node returns `default` if
    /// nothing has been received yet (e.g. the driver forced an early
    /// decision).
    pub fn decide(&self, default: V, majority_fn: impl Fn(&[V]) -> V) -> V
    where
        V: Eq + Hash,
    {
        if let Some(value) = self.value.lock().clone() {
            return value;
        }
        let received = self.received.lock();
        let root = received.keys().find(|path| path.len() == 1).cloned();
        let decided = match root {
            None => default,
            Some(root) => self.om(&root, &default, &received, &majority_fn),
        };
        drop(received);
        *self.value.lock() = Some(decided.clone());
        decided
    }

    fn om(&self, path: &Path, default: &V, received: &HashMap<Path, V>, majority_fn: &impl Fn(&[V]) -> V) -> V
    where
        V: Eq + Hash,
    {
        let k = (1 + self.m).saturating_sub(path.len());
        let own_value = received.get(path).cloned().unwrap_or_else(|| default.clone());
        if k == 0 {
            return own_value;
        }
        let mut values = vec![own_value];
        for peer in 0..self.n {
            if peer == self.id || path.contains(&peer) {
                continue;
            }
            let mut child = path.clone();
            child.push(peer);
            values.push(self.om(&child, default, received, majority_fn));
        }
        majority_fn(&values)
    }
}

/// Drives one single-round `OM(m)` instance over the network: receives
/// forwarded `order` messages, lets the king `start` a broadcast, and
/// answers `status`/`decide` queries.
pub struct NodeService {
    pub consensus: std::sync::Arc<ByzantineConsensus<Order>>,
    pub transport: net::NetTransport,
    pub next_value: Box<dyn NextValue<Order> + Send + Sync>,
    pub default: Order,
}

#[async_trait]
impl transport::Handler for NodeService {
    async fn handle(&self, envelope: transport::Envelope) -> transport::Reply {
        match envelope.method.as_str() {
            "order" => {
                let path: Path = match serde_json::from_value(envelope.body["path"].clone()) {
                    Ok(path) => path,
                    Err(_) => return transport::Reply::bad_request("missing 'path' field"),
                };
                let value: Order = match serde_json::from_value(envelope.body["value"].clone()) {
                    Ok(value) => value,
                    Err(_) => return transport::Reply::bad_request("missing 'value' field"),
                };
                self.consensus.on_message(path, value, &self.transport, &self.next_value).await;
                transport::Reply::ok(serde_json::json!({ "ok": true }))
            }
            "start" => {
                let value: Order = match serde_json::from_value(envelope.body["value"].clone()) {
                    Ok(value) => value,
                    Err(_) => return transport::Reply::bad_request("missing 'value' field"),
                };
                let king = self.consensus.id();
                self.consensus.start(value);
                for peer in 0..self.transport.peers.len() {
                    if peer != king {
                        self.transport.send(peer, vec![king], value).await;
                    }
                }
                transport::Reply::ok(serde_json::json!({ "started": true }))
            }
            "status" => transport::Reply::ok(serde_json::json!({ "done": self.consensus.is_done() })),
            "decide" => {
                let default = envelope
                    .body
                    .get("default")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(self.default);
                let decided = self.consensus.decide(default, |values| majority(values, |_| Order::Retreat));
                transport::Reply::ok(serde_json::json!({ "value": decided }))
            }
            other => transport::Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

/// Per-`round_id` table of [`ByzantineConsensus`] instances, used by the
/// multi-round king-rotation variant where each round is independent and
/// may be in flight concurrently with others.
pub struct RoundTable {
    n: usize,
    m: usize,
    id: usize,
    rounds: Mutex<HashMap<usize, std::sync::Arc<ByzantineConsensus<Order>>>>,
    faulty_rounds: Mutex<HashMap<usize, std::sync::Arc<Faulty>>>,
}

impl RoundTable {
    pub fn new(id: usize, n: usize, m: usize) -> Self {
        RoundTable { n, m, id, rounds: Mutex::new(HashMap::new()), faulty_rounds: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, round_id: usize) -> std::sync::Arc<ByzantineConsensus<Order>> {
        std::sync::Arc::clone(
            self.rounds
                .lock()
                .entry(round_id)
                .or_insert_with(|| std::sync::Arc::new(ByzantineConsensus::new(self.id, self.n, self.m))),
        )
    }

    /// Returns this round's forwarding policy: a shared `Honest` when
    /// this node is not a traitor, or a per-round `Faulty` (so the
    /// "flip every other message" behavior tracks across the messages
    /// of one round) when it is.
    pub fn next_value_for(&self, round_id: usize, faulty: bool) -> std::sync::Arc<dyn NextValue<Order> + Send + Sync> {
        if !faulty {
            let honest: std::sync::Arc<dyn NextValue<Order> + Send + Sync> = std::sync::Arc::new(Honest);
            return honest;
        }
        let entry: std::sync::Arc<dyn NextValue<Order> + Send + Sync> = std::sync::Arc::clone(
            self.faulty_rounds
                .lock()
                .entry(round_id)
                .or_insert_with(|| std::sync::Arc::new(Faulty::default())),
        );
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falling_factorial_matches_permutation_count() {
        assert_eq!(falling_factorial(4, 0), 1);
        assert_eq!(falling_factorial(4, 2), 12);
        assert_eq!(falling_factorial(4, 4), 24);
    }

    #[test]
    fn majority_breaks_ties_with_supplied_rule() {
        let values = vec![Order::Attack, Order::Retreat];
        let decided = majority(&values, |_| Order::Retreat);
        assert_eq!(decided, Order::Retreat);
    }

    #[test]
    fn majority_picks_strict_plurality() {
        let values = vec![Order::Attack, Order::Attack, Order::Retreat];
        let decided = majority(&values, |_| Order::Retreat);
        assert_eq!(decided, Order::Attack);
    }

    #[test]
    fn expected_total_for_n4_m1_matches_hand_count() {
        // n=4, m=1: k=0 contributes P(2,1)=2, k=1 contributes P(2,0)=1 -> 3
        let consensus = ByzantineConsensus::<Order>::new(1, 4, 1);
        assert_eq!(consensus.expected_total(), 3);
    }
}
