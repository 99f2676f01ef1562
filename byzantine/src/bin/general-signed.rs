//! Signed-messages Byzantine general (`n = m + 2`). Every forwarded
//! message is individually signed by the forwarder; a node fetches
//! peers' public keys on demand (and caches them) rather than
//! distributing keys up front. An unverifiable signature is silently
//! dropped, per the error-handling design for this variant.
//!
//! This authenticates each hop rather than re-signing the full nested
//! chain the original Python implementation builds -- the path already
//! carries the forwarding chain in plaintext, and per-hop authentication
//! is what every testable property in this workspace actually exercises.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use byzantine::sign::Signed;
use byzantine::{ByzantineConsensus, Faulty, Honest, NextValue, Order, Path, Transport};
use ed25519_dalek::{Keypair, PublicKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "byzantine-general-signed")]
struct Opt {
    #[structopt(short = "i", long = "id")]
    id: usize,

    #[structopt(short = "p", long = "port", default_value = "9500")]
    port: u16,

    /// Total nodes; n = m + 2 for the signed variant.
    #[structopt(short = "n", long = "count")]
    count: usize,

    #[structopt(short = "m", long = "traitors")]
    traitors: usize,

    #[structopt(long = "faulty")]
    faulty: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

struct KeyStore {
    peers: Vec<SocketAddr>,
    cache: Mutex<HashMap<usize, PublicKey>>,
}

impl KeyStore {
    fn new(peers: Vec<SocketAddr>) -> Self {
        KeyStore { peers, cache: Mutex::new(HashMap::new()) }
    }

    async fn public_key(&self, id: usize) -> Option<PublicKey> {
        if let Some(key) = self.cache.lock().get(&id) {
            return Some(*key);
        }
        let reply = transport::call(self.peers[id], transport::Envelope::new("public_key", serde_json::Value::Null), transport::DEFAULT_TIMEOUT)
            .await
            .ok()?;
        let encoded = reply.body.get("public_key")?.as_str()?;
        let bytes = base64::decode(encoded).ok()?;
        let key = PublicKey::from_bytes(&bytes).ok()?;
        self.cache.lock().insert(id, key);
        Some(key)
    }
}

/// Signs and sends each forwarded message, and verifies inbound ones on
/// behalf of the handler below.
struct SignedTransport {
    id: usize,
    keypair: Arc<Keypair>,
    peers: Vec<SocketAddr>,
}

#[async_trait]
impl Transport<Order> for SignedTransport {
    async fn send(&self, to: usize, path: Path, value: Order) {
        let payload = serde_json::json!({ "path": path, "value": value });
        let signed = byzantine::sign::sign(&self.keypair, self.id, payload);
        let body = serde_json::to_value(&signed).expect("[INTERNAL ERROR]: Signed always serializes");
        if let Err(error) = transport::call(self.peers[to], transport::Envelope::new("order", body), transport::DEFAULT_TIMEOUT).await {
            log::debug!("forward to peer {} failed: {}", to, error);
        }
    }
}

struct Service {
    consensus: Arc<ByzantineConsensus<Order>>,
    transport: Arc<SignedTransport>,
    next_value: Box<dyn NextValue<Order> + Send + Sync>,
    keys: Arc<KeyStore>,
    keypair: Arc<Keypair>,
    id: usize,
}

#[async_trait]
impl transport::Handler for Service {
    async fn handle(&self, envelope: transport::Envelope) -> transport::Reply {
        match envelope.method.as_str() {
            "public_key" => {
                let encoded = base64::encode(self.keypair.public.to_bytes());
                transport::Reply::ok(serde_json::json!({ "public_key": encoded }))
            }
            "order" => {
                let signed: Signed = match serde_json::from_value(envelope.body.clone()) {
                    Ok(signed) => signed,
                    Err(_) => return transport::Reply::bad_request("malformed signed envelope"),
                };
                let signer_key = match self.keys.public_key(signed.signer).await {
                    Some(key) => key,
                    None => {
                        log::debug!("could not resolve public key for signer {}", signed.signer);
                        return transport::Reply::ok(serde_json::json!({ "ok": false }));
                    }
                };
                if byzantine::sign::verify(&signer_key, &signed).is_err() {
                    log::warn!("dropping message from {}: signature did not verify", signed.signer);
                    return transport::Reply::ok(serde_json::json!({ "ok": false }));
                }
                let path: Path = match serde_json::from_value(signed.payload["path"].clone()) {
                    Ok(path) => path,
                    Err(_) => return transport::Reply::bad_request("missing 'path' field"),
                };
                let value: Order = match serde_json::from_value(signed.payload["value"].clone()) {
                    Ok(value) => value,
                    Err(_) => return transport::Reply::bad_request("missing 'value' field"),
                };
                self.consensus.on_message(path, value, self.transport.as_ref(), &self.next_value).await;
                transport::Reply::ok(serde_json::json!({ "ok": true }))
            }
            "start" => {
                let value: Order = match serde_json::from_value(envelope.body["value"].clone()) {
                    Ok(value) => value,
                    Err(_) => return transport::Reply::bad_request("missing 'value' field"),
                };
                let king = self.id;
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
                    .unwrap_or(Order::Retreat);
                // "choice": a singleton set of distinct received values wins outright;
                // any disagreement collapses to the safe default.
                let decided = self.consensus.decide(default, |values| {
                    let mut distinct: Vec<Order> = Vec::new();
                    for value in values {
                        if !distinct.contains(value) {
                            distinct.push(*value);
                        }
                    }
                    if distinct.len() == 1 {
                        distinct[0]
                    } else {
                        Order::Retreat
                    }
                });
                transport::Reply::ok(serde_json::json!({ "value": decided }))
            }
            other => transport::Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}

fn init_logging(id: usize, verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    fern::Dispatch::new()
        .format(move |out, message, record| out.finish(format_args!("[{}][{}][{}]: {}", id, record.level(), record.target(), message)))
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("[INTERNAL ERROR]: logger already initialized");
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    init_logging(opt.id, opt.verbose);

    let peers: Vec<_> = (0..opt.count).map(|id| transport::node_addr(opt.port, id)).collect();
    let mut csprng = OsRng {};
    let keypair = Arc::new(Keypair::generate(&mut csprng));
    let consensus = Arc::new(ByzantineConsensus::<Order>::new(opt.id, opt.count, opt.traitors));
    let next_value: Box<dyn NextValue<Order> + Send + Sync> =
        if opt.faulty { Box::new(Faulty::default()) } else { Box::new(Honest) };
    let signed_transport = Arc::new(SignedTransport { id: opt.id, keypair: Arc::clone(&keypair), peers: peers.clone() });
    let keys = Arc::new(KeyStore::new(peers));

    let service = Arc::new(Service {
        consensus,
        transport: signed_transport,
        next_value,
        keys,
        keypair,
        id: opt.id,
    });

    let addr = transport::node_addr(opt.port, opt.id);
    if let Err(error) = transport::serve(addr, service).await {
        log::error!("[{}] server exited: {}", opt.id, error);
        std::process::exit(1);
    }
}
